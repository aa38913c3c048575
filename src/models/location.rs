use serde::{Deserialize, Deserializer, Serialize};

use crate::spatial::haversine_meters;

/// A WGS84 coordinate in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LatLng {
    #[serde(deserialize_with = "parse_f64")]
    pub latitude: f64,
    #[serde(deserialize_with = "parse_f64")]
    pub longitude: f64,
}

impl LatLng {
    pub const ORIGIN: LatLng = LatLng {
        latitude: 0.0,
        longitude: 0.0,
    };

    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    pub fn is_finite(&self) -> bool {
        self.latitude.is_finite() && self.longitude.is_finite()
    }

    pub fn as_point(&self) -> [f64; 2] {
        [self.latitude, self.longitude]
    }

    /// Great-circle distance in meters.
    pub fn distance_to(&self, other: &LatLng) -> f64 {
        haversine_meters(self.as_point(), other.as_point())
    }
}

/// Devices report coordinates either as numbers or as signed strings ("+20.652494").
fn parse_f64<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum StringOrFloat {
        String(String),
        Float(f64),
    }

    let value = match StringOrFloat::deserialize(deserializer)? {
        StringOrFloat::Float(f) => f,
        StringOrFloat::String(s) => s.trim().parse::<f64>().map_err(serde::de::Error::custom)?,
    };
    if !value.is_finite() {
        return Err(serde::de::Error::custom(format!("non-finite coordinate {}", value)));
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parses_numeric_and_string_coordinates() {
        let numeric: LatLng = serde_json::from_str(r#"{"latitude": 1.5, "longitude": -2}"#).unwrap();
        assert_eq!(numeric, LatLng::new(1.5, -2.0));

        let strings: LatLng =
            serde_json::from_str(r#"{"latitude": "+20.652494", "longitude": " -100.391404"}"#).unwrap();
        assert_eq!(strings, LatLng::new(20.652494, -100.391404));
    }

    #[test]
    fn test_rejects_garbage_coordinates() {
        assert!(serde_json::from_str::<LatLng>(r#"{"latitude": "north", "longitude": 0}"#).is_err());
    }

    #[test]
    fn test_rejects_non_finite_coordinates() {
        for payload in [
            r#"{"latitude": "NaN", "longitude": 0}"#,
            r#"{"latitude": 0, "longitude": "inf"}"#,
            r#"{"latitude": "-infinity", "longitude": 0}"#,
        ] {
            assert!(serde_json::from_str::<LatLng>(payload).is_err(), "{payload}");
        }
        assert!(!LatLng::new(f64::NAN, 0.0).is_finite());
        assert!(LatLng::new(20.6, -100.3).is_finite());
    }
}
