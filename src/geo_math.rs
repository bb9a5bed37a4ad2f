use itertools::Itertools;
use serde::{Deserialize, Serialize};

pub const EARTH_RADIUS_KM: f64 = 6371.0;

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
    pub timestamp_ms: i64,
}

impl GeoPoint {
    pub fn new(latitude: f64, longitude: f64, timestamp_ms: i64) -> Self {
        GeoPoint {
            latitude,
            longitude,
            timestamp_ms,
        }
    }

    pub fn haversine_distance_km(&self, other: &GeoPoint) -> f64 {
        haversine_distance_km(
            self.latitude,
            self.longitude,
            other.latitude,
            other.longitude,
        )
    }
}

// Inputs are degrees. Out of range values are not rejected, they just give a
// meaningless (but finite) answer, same as a noisy GPS reading would.
pub fn haversine_distance_km(lat1: f64, lng1: f64, lat2: f64, lng2: f64) -> f64 {
    let d_lat = (lat2 - lat1).to_radians();
    let d_lng = (lng2 - lng1).to_radians();
    let a = (d_lat / 2.0).sin().powi(2)
        + lat1.to_radians().cos() * lat2.to_radians().cos() * (d_lng / 2.0).sin().powi(2);
    EARTH_RADIUS_KM * 2.0 * a.sqrt().atan2((1.0 - a).sqrt())
}

/// Sum of the haversine legs between consecutive points. Not rounded, callers
/// that display the value should go through `round_km`.
pub fn total_distance_km(points: &[GeoPoint]) -> f64 {
    points
        .iter()
        .tuple_windows()
        .map(|(a, b)| a.haversine_distance_km(b))
        .sum()
}

pub fn round_km(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
