//! The boundary to the platform location service. Everything in here is
//! implemented outside of this crate (the app shell, or a fake in tests); the
//! tracker only talks to the platform through `LocationProvider`.

use std::future::Future;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::geo_math::GeoPoint;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum LocationError {
    #[error("Location permission denied")]
    PermissionDenied,

    #[error("Location unavailable: {0}")]
    LocationUnavailable(String),

    #[error("Reverse geocoding unavailable: {0}")]
    GeocodeUnavailable(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct WatchOptions {
    pub min_interval_ms: u64,
    pub min_distance_meters: f64,
}

/// Called by the platform for every fix of a `watch`. Fixes are delivered one
/// at a time, but not necessarily on the thread that opened the watch.
pub type FixCallback = Box<dyn Fn(Result<GeoPoint, LocationError>) + Send + Sync>;

pub trait Subscription: Send + Sync + 'static {
    /// Stops delivery. Must be fine to call more than once, and after the
    /// producer is already gone.
    fn cancel(&self);
}

/// The futures are `Send` so a tracker can be started from a spawned task.
/// Implementations may still just write `async fn`.
pub trait LocationProvider: Send + Sync + 'static {
    type Subscription: Subscription;

    fn request_permission(&self) -> impl Future<Output = Result<(), LocationError>> + Send;

    /// Single shot, high accuracy.
    fn get_current_fix(&self) -> impl Future<Output = Result<GeoPoint, LocationError>> + Send;

    fn watch(
        &self,
        options: WatchOptions,
        on_fix: FixCallback,
    ) -> Result<Self::Subscription, LocationError>;

    fn reverse_geocode(
        &self,
        latitude: f64,
        longitude: f64,
    ) -> impl Future<Output = Result<String, LocationError>> + Send;
}

/// What a platform geocoder usually hands back. Providers can use
/// `short_description` to build the string for `reverse_geocode`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PlaceAddress {
    pub name: Option<String>,
    pub street: Option<String>,
    pub district: Option<String>,
    pub city: Option<String>,
    pub region: Option<String>,
}

impl PlaceAddress {
    pub fn short_description(&self) -> String {
        [
            &self.name,
            &self.street,
            &self.district,
            &self.city,
            &self.region,
        ]
        .into_iter()
        .filter_map(|part| part.as_deref())
        .filter(|part| !part.is_empty())
        .take(3)
        .collect::<Vec<_>>()
        .join(", ")
    }
}

pub fn format_coordinates(latitude: f64, longitude: f64) -> String {
    format!("{latitude:.4}, {longitude:.4}")
}

/// Best effort place name. Geocoding failures are never fatal, we fall back to
/// the raw coordinates.
pub async fn describe_location<P: LocationProvider>(
    provider: &P,
    latitude: f64,
    longitude: f64,
) -> String {
    match provider.reverse_geocode(latitude, longitude).await {
        Ok(description) if !description.trim().is_empty() => description,
        Ok(_) => format_coordinates(latitude, longitude),
        Err(e) => {
            warn!("[location] reverse geocode failed: {}", e);
            format_coordinates(latitude, longitude)
        }
    }
}
