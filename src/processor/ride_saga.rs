//! Ride reservation saga.
//!
//! Vehicle and rider state live on different partitions, so a ride begins in
//! two stages with no lock spanning them:
//!
//! 1. vehicle partition: validate, then reserve by writing the `ActiveRide` entry;
//! 2. rider partition: confirm by flipping the rider's active-ride flag, or
//!    roll back with [`Compensation::ReleaseVehicle`] if the rider is busy or
//!    the stage fails.
//!
//! ```text
//!   Idle --reserve--> Reserved --confirm--> Confirmed --finish--> Idle
//!                        |
//!                        +-----roll_back-----> Idle
//! ```

use crate::config::DispatchConfig;
use crate::error::RideRejection;
use crate::models::{ActiveRide, LatLng, RideBegin, VehicleRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SagaState {
    Idle,
    Reserved,
    Confirmed,
}

/// Undo action for a stage that already committed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Compensation {
    /// Clear the vehicle's `ActiveRide` entry if it still belongs to `ride_id`.
    ReleaseVehicle { vehicle_id: String, ride_id: String },
}

#[derive(Debug, Clone)]
pub struct RideSaga {
    pub ride_id: String,
    pub vehicle_id: String,
    pub rider_id: String,
    state: SagaState,
}

impl RideSaga {
    pub fn new(begin: &RideBegin) -> Self {
        Self {
            ride_id: begin.ride_id.clone(),
            vehicle_id: begin.vehicle_id.clone(),
            rider_id: begin.rider_id.clone(),
            state: SagaState::Idle,
        }
    }

    /// The saga of a ride that is already in progress.
    pub fn in_progress(vehicle_id: &str, ride: &ActiveRide) -> Self {
        Self {
            ride_id: ride.ride_id.clone(),
            vehicle_id: vehicle_id.to_string(),
            rider_id: ride.rider_id.clone(),
            state: SagaState::Confirmed,
        }
    }

    pub fn state(&self) -> SagaState {
        self.state
    }

    /// Builds the reservation to write on the vehicle partition.
    pub fn reserve(&mut self, start_location: LatLng, start_timestamp: i64) -> ActiveRide {
        debug_assert_eq!(self.state, SagaState::Idle);
        self.state = SagaState::Reserved;
        ActiveRide {
            ride_id: self.ride_id.clone(),
            rider_id: self.rider_id.clone(),
            start_location,
            start_timestamp,
        }
    }

    pub fn confirm(&mut self) {
        debug_assert_eq!(self.state, SagaState::Reserved);
        self.state = SagaState::Confirmed;
    }

    /// Abandons a reservation, returning the action that releases the vehicle.
    pub fn roll_back(&mut self) -> Compensation {
        debug_assert_eq!(self.state, SagaState::Reserved);
        self.state = SagaState::Idle;
        Compensation::ReleaseVehicle {
            vehicle_id: self.vehicle_id.clone(),
            ride_id: self.ride_id.clone(),
        }
    }

    pub fn finish(&mut self) {
        debug_assert_eq!(self.state, SagaState::Confirmed);
        self.state = SagaState::Idle;
    }
}

pub fn admits_battery(battery: u8, config: &DispatchConfig) -> bool {
    battery >= config.min_battery
}

pub fn admits_distance(distance_meters: f64, config: &DispatchConfig) -> bool {
    distance_meters <= config.max_pickup_distance_meters
}

/// Vehicle-stage validation, in order: existence, battery, distance, availability.
pub fn check_vehicle<'a>(
    vehicle: Option<&'a VehicleRecord>,
    active: Option<&ActiveRide>,
    rider_location: &LatLng,
    config: &DispatchConfig,
) -> Result<&'a VehicleRecord, RideRejection> {
    let vehicle = vehicle.ok_or(RideRejection::NotFound)?;
    if !admits_battery(vehicle.battery, config) {
        return Err(RideRejection::LowBattery);
    }
    if !admits_distance(vehicle.location.distance_to(rider_location), config) {
        return Err(RideRejection::TooFar);
    }
    if active.is_some() {
        return Err(RideRejection::VehicleBusy);
    }
    Ok(vehicle)
}
