use thiserror::Error;

/// Failures of the partitioned key-value store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("failed to encode or decode value: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("store backend error: {0}")]
    Backend(String),

    /// Raised by fault-injecting stores in tests.
    #[error("injected fault: {0}")]
    Injected(String),
}

/// Why a ride could not begin. Returned as a value, never raised across stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RideRejection {
    #[error("vehicle or rider not found")]
    NotFound,
    #[error("vehicle battery too low")]
    LowBattery,
    #[error("rider too far from vehicle")]
    TooFar,
    #[error("vehicle already in a ride")]
    VehicleBusy,
    #[error("rider already in a ride")]
    RiderBusy,
}

/// Errors surfaced by [`FleetClient`](crate::client::FleetClient).
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("ride rejected: {0}")]
    Rejected(#[from] RideRejection),

    #[error("invalid email address")]
    InvalidEmail,

    /// Latitude or longitude is NaN or infinite.
    #[error("location is not finite")]
    InvalidLocation,

    /// Every generated vehicle id collided with an existing vehicle.
    #[error("could not allocate a unique vehicle id")]
    DuplicateIdentifier,

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// The owning partition has shut down.
    #[error("partition unavailable")]
    Unavailable,

    /// A follow-up read never observed the submitted write.
    #[error("write was not visible after {attempts} reads")]
    ConfirmationTimeout { attempts: u32 },
}
