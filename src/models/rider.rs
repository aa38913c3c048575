use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Durable rider state, owned by the rider id's partition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiderRecord {
    pub rider_id: String,
    pub email: String,
    pub creation_token: Uuid,
    pub active_ride: bool,
}

/// Trims and lowercases `email`, returning `None` unless it has exactly one
/// `@` with something on both sides.
pub fn normalize_email(email: &str) -> Option<String> {
    let email = email.trim().to_lowercase();
    let (local, domain) = email.split_once('@')?;
    if local.is_empty() || domain.is_empty() || domain.contains('@') {
        return None;
    }
    Some(email)
}

/// Rider ids are derived from the normalized email so every registration of
/// the same address names the same rider.
pub fn rider_id_for_email(normalized_email: &str) -> String {
    Uuid::new_v5(&Uuid::NAMESPACE_OID, normalized_email.as_bytes()).to_string()
}
