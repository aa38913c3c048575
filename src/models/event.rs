use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::location::LatLng;
use super::rider::normalize_email;

/// Everything that enters the system through the intake queue.
///
/// Each event is routed to the partition that owns its [`routing_key`](Self::routing_key).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum IntakeEvent {
    VehicleCreate(VehicleCreate),
    VehicleUpdate(VehicleUpdate),
    RiderRegistration(RiderRegistration),
    Ride(RideEvent),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VehicleCreate {
    pub creation_token: Uuid,
    pub vehicle_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VehicleUpdate {
    pub vehicle_id: String,
    pub battery: u8,
    pub location: LatLng,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiderRegistration {
    pub creation_token: Uuid,
    pub email: String,
}

/// Ride begin and end share one stream, keyed by vehicle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RideEvent {
    Begin(RideBegin),
    End(RideEnd),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RideBegin {
    pub ride_id: String,
    pub rider_id: String,
    pub vehicle_id: String,
    pub rider_location: LatLng,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RideEnd {
    pub rider_id: String,
    pub vehicle_id: String,
}

impl IntakeEvent {
    pub fn routing_key(&self) -> String {
        match self {
            IntakeEvent::VehicleCreate(e) => e.vehicle_id.clone(),
            IntakeEvent::VehicleUpdate(e) => e.vehicle_id.clone(),
            IntakeEvent::RiderRegistration(e) => {
                normalize_email(&e.email).unwrap_or_else(|| e.email.clone())
            }
            IntakeEvent::Ride(RideEvent::Begin(e)) => e.vehicle_id.clone(),
            IntakeEvent::Ride(RideEvent::End(e)) => e.vehicle_id.clone(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            IntakeEvent::VehicleCreate(_) => "vehicle_create",
            IntakeEvent::VehicleUpdate(_) => "vehicle_update",
            IntakeEvent::RiderRegistration(_) => "rider_registration",
            IntakeEvent::Ride(RideEvent::Begin(_)) => "ride_begin",
            IntakeEvent::Ride(RideEvent::End(_)) => "ride_end",
        }
    }
}
