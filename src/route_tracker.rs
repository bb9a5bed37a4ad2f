use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use anyhow::Result;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::geo_math::{self, GeoPoint};
use crate::location_provider::{
    FixCallback, LocationError, LocationProvider, Subscription, WatchOptions,
};
use crate::utils::{self, Clock, SystemClock};

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// Fixes closer than this to the last accepted point are treated as GPS
    /// jitter and dropped.
    pub jitter_threshold_km: f64,
    pub min_interval_ms: u64,
    pub min_distance_meters: f64,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        TrackerConfig {
            jitter_threshold_km: 0.002,
            min_interval_ms: 5000,
            min_distance_meters: 10.0,
        }
    }
}

impl TrackerConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        let config: TrackerConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !self.jitter_threshold_km.is_finite() || self.jitter_threshold_km < 0.0 {
            bail!(
                "invalid jitter threshold: {} km",
                self.jitter_threshold_km
            );
        }
        if !self.min_distance_meters.is_finite() || self.min_distance_meters < 0.0 {
            bail!(
                "invalid watch min distance: {} m",
                self.min_distance_meters
            );
        }
        Ok(())
    }

    pub fn watch_options(&self) -> WatchOptions {
        WatchOptions {
            min_interval_ms: self.min_interval_ms,
            min_distance_meters: self.min_distance_meters,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum TrackerError {
    #[error(transparent)]
    Location(#[from] LocationError),

    #[error("Tracking session already running")]
    AlreadyActive,

    #[error("Tracking session was cancelled while starting")]
    Cancelled,

    #[error("Tracker has been destroyed")]
    Destroyed,
}

impl TrackerError {
    pub fn is_permission_denied(&self) -> bool {
        matches!(self, TrackerError::Location(LocationError::PermissionDenied))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TrackerState {
    Idle,
    /// waiting on permission or the seed fix
    Starting,
    Active,
    Stopped,
    Destroyed,
}

/// Point in time copy of a session, handed to the update callback.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrackingSnapshot {
    pub coordinates: Vec<GeoPoint>,
    pub distance_km: f64,
    pub duration_sec: i64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrackingResult {
    pub coordinates: Vec<GeoPoint>,
    pub distance_km: f64,
    pub duration_sec: i64,
}

pub type UpdateCallback = Arc<dyn Fn(TrackingSnapshot) + Send + Sync>;

struct RouteSession {
    id: Uuid,
    points: Vec<GeoPoint>,
    // exact sum, only rounded when leaving the tracker
    distance_km: f64,
    start_timestamp_ms: i64,
    stopped_at_ms: Option<i64>,
}

impl RouteSession {
    fn empty() -> Self {
        RouteSession {
            id: Uuid::nil(),
            points: Vec::new(),
            distance_km: 0.0,
            start_timestamp_ms: 0,
            stopped_at_ms: None,
        }
    }

    fn duration_sec(&self, now_ms: i64) -> i64 {
        utils::elapsed_sec(self.start_timestamp_ms, self.stopped_at_ms.unwrap_or(now_ms))
    }

    fn snapshot(&self, duration_sec: i64) -> TrackingSnapshot {
        TrackingSnapshot {
            coordinates: self.points.clone(),
            distance_km: geo_math::round_km(self.distance_km),
            duration_sec,
        }
    }

    fn result(&self, now_ms: i64) -> TrackingResult {
        TrackingResult {
            coordinates: self.points.clone(),
            distance_km: geo_math::round_km(self.distance_km),
            duration_sec: self.duration_sec(now_ms),
        }
    }
}

struct Inner<S> {
    state: TrackerState,
    // bumped whenever a session begins or is torn down, a fix callback only
    // counts if it was created for the current epoch.
    epoch: u64,
    session: RouteSession,
    subscription: Option<S>,
}

fn lock<S>(inner: &Mutex<Inner<S>>) -> MutexGuard<'_, Inner<S>> {
    // the update callback runs outside of this lock, poisoning can't leave a
    // half updated session behind.
    inner.lock().unwrap_or_else(PoisonError::into_inner)
}

struct FixHandler<S> {
    inner: Weak<Mutex<Inner<S>>>,
    epoch: u64,
    jitter_threshold_km: f64,
    clock: Arc<dyn Clock>,
    on_update: UpdateCallback,
}

impl<S> FixHandler<S> {
    fn handle(&self, fix: Result<GeoPoint, LocationError>) {
        let fix = match fix {
            Ok(fix) => fix,
            Err(e) => {
                // keep the session going, the next fix may be fine
                warn!("[route_tracker] transient location error: {}", e);
                return;
            }
        };
        let Some(shared) = self.inner.upgrade() else {
            debug!("[route_tracker] fix arrived after tracker was dropped");
            return;
        };
        let mut inner = lock(&shared);
        if inner.epoch != self.epoch || inner.state != TrackerState::Active {
            debug!(
                "[route_tracker] dropping late fix (state = {:?})",
                inner.state
            );
            return;
        }
        let Some(last) = inner.session.points.last() else {
            return;
        };
        let d = last.haversine_distance_km(&fix);
        if d < self.jitter_threshold_km {
            return;
        }
        inner.session.distance_km += d;
        inner.session.points.push(fix);
        let duration_sec = inner.session.duration_sec(self.clock.now_ms());
        let snapshot = inner.session.snapshot(duration_sec);
        drop(inner);
        (self.on_update)(snapshot);
    }
}

/// Records one route at a time: seeds it with a single fix on `start`, then
/// accumulates every fix of the platform watch that moved far enough away
/// from the last accepted point.
pub struct RouteTracker<P: LocationProvider> {
    provider: Arc<P>,
    config: TrackerConfig,
    clock: Arc<dyn Clock>,
    on_update: UpdateCallback,
    inner: Arc<Mutex<Inner<P::Subscription>>>,
}

impl<P: LocationProvider> RouteTracker<P> {
    pub fn new(
        provider: Arc<P>,
        config: TrackerConfig,
        on_update: impl Fn(TrackingSnapshot) + Send + Sync + 'static,
    ) -> Self {
        Self::new_with_clock(provider, config, Arc::new(SystemClock), on_update)
    }

    pub fn new_with_clock(
        provider: Arc<P>,
        config: TrackerConfig,
        clock: Arc<dyn Clock>,
        on_update: impl Fn(TrackingSnapshot) + Send + Sync + 'static,
    ) -> Self {
        RouteTracker {
            provider,
            config,
            clock,
            on_update: Arc::new(on_update),
            inner: Arc::new(Mutex::new(Inner {
                state: TrackerState::Idle,
                epoch: 0,
                session: RouteSession::empty(),
                subscription: None,
            })),
        }
    }

    pub fn state(&self) -> TrackerState {
        lock(&self.inner).state
    }

    pub fn is_active(&self) -> bool {
        self.state() == TrackerState::Active
    }

    pub fn points(&self) -> Vec<GeoPoint> {
        lock(&self.inner).session.points.clone()
    }

    pub fn distance_km(&self) -> f64 {
        lock(&self.inner).session.distance_km
    }

    pub fn session_id(&self) -> Option<Uuid> {
        let inner = lock(&self.inner);
        if inner.session.id.is_nil() {
            None
        } else {
            Some(inner.session.id)
        }
    }

    pub async fn start(&self) -> Result<(), TrackerError> {
        let (epoch, previous_state) = {
            let mut inner = lock(&self.inner);
            match inner.state {
                TrackerState::Starting | TrackerState::Active => {
                    return Err(TrackerError::AlreadyActive)
                }
                TrackerState::Destroyed => return Err(TrackerError::Destroyed),
                TrackerState::Idle | TrackerState::Stopped => (),
            }
            let previous_state = inner.state;
            inner.epoch += 1;
            inner.state = TrackerState::Starting;
            (inner.epoch, previous_state)
        };

        let seed = match self.acquire_seed_fix().await {
            Ok(seed) => seed,
            Err(e) => {
                warn!("[route_tracker] failed to start: {}", e);
                let mut inner = lock(&self.inner);
                if inner.epoch == epoch {
                    inner.state = previous_state;
                    return Err(e.into());
                }
                // someone stopped or destroyed us in the meantime, report that
                return Err(Self::superseded(inner.state));
            }
        };

        let now_ms = self.clock.now_ms();
        let (session_id, snapshot) = {
            let mut inner = lock(&self.inner);
            if inner.epoch != epoch {
                return Err(Self::superseded(inner.state));
            }
            inner.session = RouteSession {
                id: Uuid::new_v4(),
                points: vec![seed],
                distance_km: 0.0,
                start_timestamp_ms: now_ms,
                stopped_at_ms: None,
            };
            inner.state = TrackerState::Active;
            (inner.session.id, inner.session.snapshot(0))
        };
        info!("[route_tracker] session {} started", session_id);
        (self.on_update)(snapshot);

        let handler = FixHandler {
            inner: Arc::downgrade(&self.inner),
            epoch,
            jitter_threshold_km: self.config.jitter_threshold_km,
            clock: self.clock.clone(),
            on_update: self.on_update.clone(),
        };
        let on_fix: FixCallback = Box::new(move |fix| handler.handle(fix));
        let watch_result = self.provider.watch(self.config.watch_options(), on_fix);

        let mut inner = lock(&self.inner);
        match watch_result {
            Ok(subscription) => {
                if inner.epoch == epoch && inner.state == TrackerState::Active {
                    inner.subscription = Some(subscription);
                    Ok(())
                } else {
                    // stopped from inside the seed update callback
                    drop(inner);
                    subscription.cancel();
                    Ok(())
                }
            }
            Err(e) => {
                warn!(
                    "[route_tracker] failed to watch position for session {}: {}",
                    session_id, e
                );
                if inner.epoch == epoch {
                    inner.epoch += 1;
                    inner.session = RouteSession::empty();
                    inner.state = previous_state;
                }
                Err(e.into())
            }
        }
    }

    async fn acquire_seed_fix(&self) -> Result<GeoPoint, LocationError> {
        self.provider.request_permission().await?;
        self.provider.get_current_fix().await
    }

    fn superseded(state: TrackerState) -> TrackerError {
        if state == TrackerState::Destroyed {
            TrackerError::Destroyed
        } else {
            TrackerError::Cancelled
        }
    }

    /// Ends the current session. Returns `None` when there is no session to
    /// stop, so it is fine to call it defensively.
    pub fn stop(&self) -> Option<TrackingResult> {
        let mut inner = lock(&self.inner);
        let now_ms = self.clock.now_ms();
        match inner.state {
            TrackerState::Active => {
                inner.state = TrackerState::Stopped;
                inner.session.stopped_at_ms = Some(now_ms);
                let subscription = inner.subscription.take();
                let result = inner.session.result(now_ms);
                let session_id = inner.session.id;
                drop(inner);
                if let Some(subscription) = subscription {
                    subscription.cancel();
                }
                info!(
                    "[route_tracker] session {} stopped: {} points, {} km, {} s",
                    session_id,
                    result.coordinates.len(),
                    result.distance_km,
                    result.duration_sec
                );
                Some(result)
            }
            TrackerState::Stopped => Some(inner.session.result(now_ms)),
            TrackerState::Starting => {
                // the pending `start` will notice the epoch change and bail out
                inner.epoch += 1;
                inner.state = TrackerState::Idle;
                None
            }
            TrackerState::Idle | TrackerState::Destroyed => None,
        }
    }

    /// Cancels everything and clears the recorded route. Always safe to call.
    pub fn destroy(&self) {
        let mut inner = lock(&self.inner);
        if inner.state != TrackerState::Destroyed {
            debug!("[route_tracker] destroying tracker (state = {:?})", inner.state);
        }
        inner.epoch += 1;
        inner.state = TrackerState::Destroyed;
        inner.session.points.clear();
        inner.session.distance_km = 0.0;
        let subscription = inner.subscription.take();
        drop(inner);
        if let Some(subscription) = subscription {
            subscription.cancel();
        }
    }
}

impl<P: LocationProvider> Drop for RouteTracker<P> {
    fn drop(&mut self) {
        // never leave a platform watch running for a tracker nobody can reach.
        // Fixes flushed by `cancel` still find the state alive, the epoch bump
        // turns them away.
        let subscription = {
            let mut inner = lock(&self.inner);
            inner.epoch += 1;
            inner.subscription.take()
        };
        if let Some(subscription) = subscription {
            subscription.cancel();
        }
    }
}
