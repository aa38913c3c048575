use serde::{Deserialize, Serialize};

use super::location::LatLng;

/// An in-progress ride, keyed by vehicle id. At most one per vehicle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActiveRide {
    pub ride_id: String,
    pub rider_id: String,
    pub start_location: LatLng,
    /// Milliseconds since the Unix epoch.
    pub start_timestamp: i64,
}

/// One entry of a vehicle's append-only location history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationSample {
    pub vehicle_id: String,
    pub timestamp: i64,
    pub location: LatLng,
}

/// Immutable ride-history record, written once per ride id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletedRide {
    pub rider_id: String,
    pub ride_id: String,
    pub vehicle_id: String,
    pub start_location: LatLng,
    pub end_location: LatLng,
    pub start_timestamp: i64,
    pub end_timestamp: i64,
    pub route: Vec<LatLng>,
}

/// Route of a ride: the start location followed by every sample taken in
/// `[start_timestamp, end_timestamp)`, in timestamp order.
///
/// A sample stamped exactly at `end_timestamp` belongs to the vehicle's next ride.
pub fn build_route(
    start_location: LatLng,
    start_timestamp: i64,
    end_timestamp: i64,
    samples: &[LocationSample],
) -> Vec<LatLng> {
    let mut in_window: Vec<&LocationSample> = samples
        .iter()
        .filter(|s| s.timestamp >= start_timestamp && s.timestamp < end_timestamp)
        .collect();
    in_window.sort_by_key(|s| s.timestamp);

    let mut route = Vec::with_capacity(in_window.len() + 1);
    route.push(start_location);
    route.extend(in_window.into_iter().map(|s| s.location));
    route
}
