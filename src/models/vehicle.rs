use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::location::LatLng;

/// Durable vehicle state, owned by the vehicle id's partition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VehicleRecord {
    pub vehicle_id: String,
    /// Charge level, 0-100.
    pub battery: u8,
    pub location: LatLng,
    pub creation_token: Uuid,
}

impl VehicleRecord {
    /// A freshly created vehicle: empty battery, parked at the origin.
    pub fn new(vehicle_id: &str, creation_token: Uuid) -> Self {
        Self {
            vehicle_id: vehicle_id.to_string(),
            battery: 0,
            location: LatLng::ORIGIN,
            creation_token,
        }
    }
}

/// A dispatch candidate returned by the nearby-vehicles query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NearbyVehicle {
    pub vehicle_id: String,
    pub battery: u8,
    pub location: LatLng,
    pub distance_meters: f64,
}
