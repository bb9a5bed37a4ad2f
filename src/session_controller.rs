use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::geo_math::GeoPoint;
use crate::location_provider::LocationProvider;
use crate::route_tracker::{
    RouteTracker, TrackerConfig, TrackerError, TrackingResult, TrackingSnapshot,
};
use crate::utils::{self, Clock, SystemClock};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Display, EnumString, Serialize, Deserialize)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum TrackingPhase {
    Ready,
    Tracking,
    Done,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Display, EnumString, Serialize, Deserialize)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum EcoAction {
    Walking,
    Cycling,
    Cleanup,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    pub tracker: TrackerConfig,
    pub tick_interval_ms: u64,
    pub action: EcoAction,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        ControllerConfig {
            tracker: TrackerConfig::default(),
            tick_interval_ms: 1000,
            action: EcoAction::Walking,
        }
    }
}

impl ControllerConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        let config: ControllerConfig = serde_json::from_str(json)?;
        config.tracker.validate()?;
        if config.tick_interval_ms == 0 {
            bail!("tick interval must be positive");
        }
        Ok(config)
    }
}

/// What the tracking screen shows.
#[derive(Clone, Debug, PartialEq)]
pub struct LiveMetrics {
    pub phase: TrackingPhase,
    pub distance_km: f64,
    pub duration_sec: i64,
    pub point_count: usize,
    pub coordinates: Vec<GeoPoint>,
    pub last_error: Option<String>,
}

impl LiveMetrics {
    fn new() -> Self {
        LiveMetrics {
            phase: TrackingPhase::Ready,
            distance_km: 0.0,
            duration_sec: 0,
            point_count: 0,
            coordinates: Vec::new(),
            last_error: None,
        }
    }

    pub fn formatted_distance(&self) -> String {
        format!("{:.2}", self.distance_km)
    }

    pub fn formatted_duration(&self) -> String {
        utils::format_duration(self.duration_sec)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RoutePoint {
    pub latitude: f64,
    pub longitude: f64,
    pub timestamp: i64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RouteData {
    pub coordinates: Vec<RoutePoint>,
}

/// The finished route in the shape the verification / submission step reads:
/// `routeData` travels as an embedded JSON string, distance in km under
/// `autoDistance` and seconds under `duration`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteSubmission {
    pub action: EcoAction,
    #[serde(with = "json_string")]
    pub route_data: RouteData,
    #[serde(rename = "autoDistance")]
    pub auto_distance_km: f64,
    #[serde(rename = "duration")]
    pub duration_sec: i64,
}

mod json_string {
    use serde::de::{self, DeserializeOwned};
    use serde::{ser, Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<T: Serialize, S: Serializer>(
        value: &T,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        let json = serde_json::to_string(value).map_err(ser::Error::custom)?;
        serializer.serialize_str(&json)
    }

    pub fn deserialize<'de, T: DeserializeOwned, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<T, D::Error> {
        let json = String::deserialize(deserializer)?;
        serde_json::from_str(&json).map_err(de::Error::custom)
    }
}

impl RouteSubmission {
    pub fn from_result(action: EcoAction, result: &TrackingResult) -> Self {
        RouteSubmission {
            action,
            route_data: RouteData {
                coordinates: result
                    .coordinates
                    .iter()
                    .map(|p| RoutePoint {
                        latitude: p.latitude,
                        longitude: p.longitude,
                        timestamp: p.timestamp_ms,
                    })
                    .collect(),
            },
            auto_distance_km: result.distance_km,
            duration_sec: result.duration_sec,
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Whatever comes after tracking (verification, upload). Lives outside of this
/// crate.
pub trait SubmissionSink: Send + Sync {
    fn submit(&self, submission: &RouteSubmission) -> Result<()>;
}

fn lock(metrics: &Mutex<LiveMetrics>) -> MutexGuard<'_, LiveMetrics> {
    metrics.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Drives one tracking screen: `ready -> tracking -> done`. Owns at most one
/// `RouteTracker` and the 1Hz display timer.
///
/// The displayed duration is the runtime time since `start`, refreshed on
/// every timer tick, and replaced by the tracker's own duration on `stop`.
pub struct TrackingSessionController<P: LocationProvider> {
    provider: Arc<P>,
    config: ControllerConfig,
    clock: Arc<dyn Clock>,
    sink: Arc<dyn SubmissionSink>,
    tracker: Option<RouteTracker<P>>,
    metrics: Arc<Mutex<LiveMetrics>>,
    timer: Option<JoinHandle<()>>,
}

impl<P: LocationProvider> TrackingSessionController<P> {
    pub fn new(provider: Arc<P>, config: ControllerConfig, sink: Arc<dyn SubmissionSink>) -> Self {
        Self::new_with_clock(provider, config, Arc::new(SystemClock), sink)
    }

    pub fn new_with_clock(
        provider: Arc<P>,
        config: ControllerConfig,
        clock: Arc<dyn Clock>,
        sink: Arc<dyn SubmissionSink>,
    ) -> Self {
        TrackingSessionController {
            provider,
            config,
            clock,
            sink,
            tracker: None,
            metrics: Arc::new(Mutex::new(LiveMetrics::new())),
            timer: None,
        }
    }

    pub fn metrics(&self) -> LiveMetrics {
        lock(&self.metrics).clone()
    }

    pub fn phase(&self) -> TrackingPhase {
        lock(&self.metrics).phase
    }

    pub fn tracker(&self) -> Option<&RouteTracker<P>> {
        self.tracker.as_ref()
    }

    pub async fn start(&mut self) -> Result<(), TrackerError> {
        if self.phase() == TrackingPhase::Tracking {
            return Err(TrackerError::AlreadyActive);
        }
        if let Some(old) = self.tracker.take() {
            old.destroy();
        }
        self.stop_timer();
        {
            let mut metrics = lock(&self.metrics);
            *metrics = LiveMetrics::new();
        }

        let metrics = self.metrics.clone();
        let tracker = RouteTracker::new_with_clock(
            self.provider.clone(),
            self.config.tracker,
            self.clock.clone(),
            move |snapshot: TrackingSnapshot| {
                let mut live = lock(&metrics);
                live.distance_km = snapshot.distance_km;
                live.point_count = snapshot.coordinates.len();
                live.coordinates = snapshot.coordinates;
            },
        );
        // keep the tracker even if `start` fails, teardown still has to see it
        let tracker = self.tracker.insert(tracker);
        let started = tracker.start().await;

        match started {
            Ok(()) => {
                lock(&self.metrics).phase = TrackingPhase::Tracking;
                self.start_timer();
                Ok(())
            }
            Err(e) => {
                warn!("[session_controller] failed to start tracking: {}", e);
                lock(&self.metrics).last_error = Some(e.to_string());
                Err(e)
            }
        }
    }

    fn start_timer(&mut self) {
        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                warn!("[session_controller] no tokio runtime, duration timer disabled");
                return;
            }
        };
        let metrics = self.metrics.clone();
        let period = Duration::from_millis(self.config.tick_interval_ms.max(1));
        self.timer = Some(handle.spawn(async move {
            let started = Instant::now();
            let mut interval = tokio::time::interval_at(started + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let mut live = lock(&metrics);
                if live.phase != TrackingPhase::Tracking {
                    break;
                }
                // the tick rate only decides how often the display refreshes
                live.duration_sec = started.elapsed().as_secs() as i64;
            }
        }));
    }

    fn stop_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }

    /// Finishes the session and forwards the route. Returns `None` if there
    /// was nothing to stop.
    pub fn stop(&mut self) -> Option<RouteSubmission> {
        self.stop_timer();
        let result = self.tracker.as_ref()?.stop()?;
        {
            let mut metrics = lock(&self.metrics);
            if metrics.phase == TrackingPhase::Done {
                // already submitted
                return None;
            }
            metrics.phase = TrackingPhase::Done;
            metrics.distance_km = result.distance_km;
            metrics.duration_sec = result.duration_sec;
            metrics.point_count = result.coordinates.len();
            metrics.coordinates = result.coordinates.clone();
        }

        let submission = RouteSubmission::from_result(self.config.action, &result);
        if let Err(e) = self.sink.submit(&submission) {
            error!("[session_controller] failed to submit route: {:?}", e);
            lock(&self.metrics).last_error = Some(e.to_string());
        }
        Some(submission)
    }

    /// Must run whenever the screen goes away, whatever the phase is. An
    /// abandoned session goes back to `ready`, nothing is submitted.
    pub fn teardown(&mut self) {
        self.stop_timer();
        if let Some(tracker) = &self.tracker {
            tracker.destroy();
        }
        let mut metrics = lock(&self.metrics);
        if metrics.phase == TrackingPhase::Tracking {
            metrics.phase = TrackingPhase::Ready;
        }
    }
}

impl<P: LocationProvider> Drop for TrackingSessionController<P> {
    fn drop(&mut self) {
        self.teardown();
    }
}
