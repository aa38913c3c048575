use tracing::{debug, warn};

use crate::models::event::{IntakeEvent, RideEvent};
use crate::models::rider::normalize_email;

/// Decodes one intake payload. Malformed payloads are logged and dropped.
pub fn decode_event(payload: &[u8]) -> Option<IntakeEvent> {
    let event: IntakeEvent = match serde_json::from_slice(payload) {
        Ok(e) => e,
        Err(e) => {
            warn!("Failed to parse intake payload: {}", e);
            return None;
        }
    };

    if let Some(reason) = rejection_reason(&event) {
        warn!("Dropping {} event: {}", event.kind(), reason);
        return None;
    }

    debug!("Decoded {} event for key {}", event.kind(), event.routing_key());
    Some(event)
}

fn rejection_reason(event: &IntakeEvent) -> Option<&'static str> {
    match event {
        IntakeEvent::VehicleCreate(e) if e.vehicle_id.is_empty() => Some("empty vehicle id"),
        IntakeEvent::VehicleUpdate(e) if e.vehicle_id.is_empty() => Some("empty vehicle id"),
        IntakeEvent::VehicleUpdate(e) if e.battery > 100 => Some("battery above 100"),
        IntakeEvent::VehicleUpdate(e) if !e.location.is_finite() => Some("non-finite location"),
        IntakeEvent::Ride(RideEvent::Begin(e)) if !e.rider_location.is_finite() => {
            Some("non-finite location")
        }
        IntakeEvent::RiderRegistration(e) if normalize_email(&e.email).is_none() => {
            Some("invalid email")
        }
        IntakeEvent::Ride(RideEvent::Begin(e)) if e.vehicle_id.is_empty() || e.rider_id.is_empty() => {
            Some("missing vehicle or rider id")
        }
        IntakeEvent::Ride(RideEvent::End(e)) if e.vehicle_id.is_empty() || e.rider_id.is_empty() => {
            Some("missing vehicle or rider id")
        }
        _ => None,
    }
}
