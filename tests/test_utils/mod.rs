#![allow(dead_code)]

use anyhow::Result;
use ecotrack_core::geo_math::GeoPoint;
use ecotrack_core::location_provider::{
    FixCallback, LocationError, LocationProvider, Subscription, WatchOptions,
};
use ecotrack_core::route_tracker::TrackingSnapshot;
use ecotrack_core::session_controller::{RouteSubmission, SubmissionSink};
use ecotrack_core::utils::Clock;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

// Pune, the route used in most tests.
pub const PUNE_ROUTE: [(f64, f64); 3] = [
    (18.5204, 73.8567),
    (18.5208, 73.8559),
    (18.5212, 73.8552),
];

pub const START_MS: i64 = 1_700_000_000_000;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub struct ManualClock {
    now_ms: AtomicI64,
}

impl ManualClock {
    pub fn new(now_ms: i64) -> Arc<Self> {
        Arc::new(ManualClock {
            now_ms: AtomicI64::new(now_ms),
        })
    }

    pub fn advance_ms(&self, ms: i64) {
        self.now_ms.fetch_add(ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> i64 {
        self.now_ms.load(Ordering::SeqCst)
    }
}

type SharedFixCallback = Arc<dyn Fn(Result<GeoPoint, LocationError>) + Send + Sync>;

pub struct FakeSubscription {
    cancel_count: Arc<AtomicUsize>,
    // some platforms hand over the fix they were holding when cancelled
    flush: Option<(SharedFixCallback, GeoPoint)>,
}

impl Subscription for FakeSubscription {
    fn cancel(&self) {
        self.cancel_count.fetch_add(1, Ordering::SeqCst);
        if let Some((callback, fix)) = &self.flush {
            callback(Ok(*fix));
        }
    }
}

/// A location service driven by the test. `emit` keeps delivering to the last
/// watch callback even after it was cancelled, that is how we simulate fixes
/// that were already in flight.
pub struct FakeLocationProvider {
    permission: Mutex<Result<(), LocationError>>,
    seed_fix: Mutex<Result<GeoPoint, LocationError>>,
    watch_error: Mutex<Option<LocationError>>,
    geocode: Mutex<Result<String, LocationError>>,
    seed_gate: Mutex<Option<Arc<Notify>>>,
    callback: Mutex<Option<SharedFixCallback>>,
    last_watch_options: Mutex<Option<WatchOptions>>,
    flush_on_cancel: Mutex<Option<GeoPoint>>,
    watch_count: AtomicUsize,
    cancel_count: Arc<AtomicUsize>,
}

impl FakeLocationProvider {
    pub fn new(seed: GeoPoint) -> Arc<Self> {
        Arc::new(FakeLocationProvider {
            permission: Mutex::new(Ok(())),
            seed_fix: Mutex::new(Ok(seed)),
            watch_error: Mutex::new(None),
            geocode: Mutex::new(Err(LocationError::GeocodeUnavailable(
                "no geocoder".to_string(),
            ))),
            seed_gate: Mutex::new(None),
            callback: Mutex::new(None),
            last_watch_options: Mutex::new(None),
            flush_on_cancel: Mutex::new(None),
            watch_count: AtomicUsize::new(0),
            cancel_count: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn at_pune() -> Arc<Self> {
        let (lat, lng) = PUNE_ROUTE[0];
        Self::new(GeoPoint::new(lat, lng, START_MS))
    }

    pub fn deny_permission(&self) {
        *self.permission.lock().unwrap() = Err(LocationError::PermissionDenied);
    }

    pub fn grant_permission(&self) {
        *self.permission.lock().unwrap() = Ok(());
    }

    pub fn set_seed_fix(&self, seed: Result<GeoPoint, LocationError>) {
        *self.seed_fix.lock().unwrap() = seed;
    }

    pub fn fail_watch(&self, error: LocationError) {
        *self.watch_error.lock().unwrap() = Some(error);
    }

    pub fn set_geocode(&self, result: Result<String, LocationError>) {
        *self.geocode.lock().unwrap() = result;
    }

    /// Every later subscription delivers `fix` from inside `cancel`.
    pub fn flush_on_cancel(&self, fix: GeoPoint) {
        *self.flush_on_cancel.lock().unwrap() = Some(fix);
    }

    /// `get_current_fix` will wait until the returned `Notify` fires.
    pub fn gate_seed_fix(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.seed_gate.lock().unwrap() = Some(gate.clone());
        gate
    }

    pub fn emit(&self, fix: GeoPoint) {
        self.emit_result(Ok(fix));
    }

    pub fn emit_result(&self, fix: Result<GeoPoint, LocationError>) {
        let callback = self.callback.lock().unwrap().clone();
        if let Some(callback) = callback {
            callback(fix);
        }
    }

    pub fn watch_count(&self) -> usize {
        self.watch_count.load(Ordering::SeqCst)
    }

    pub fn cancel_count(&self) -> usize {
        self.cancel_count.load(Ordering::SeqCst)
    }

    pub fn last_watch_options(&self) -> Option<WatchOptions> {
        *self.last_watch_options.lock().unwrap()
    }
}

impl LocationProvider for FakeLocationProvider {
    type Subscription = FakeSubscription;

    async fn request_permission(&self) -> Result<(), LocationError> {
        tokio::task::yield_now().await;
        self.permission.lock().unwrap().clone()
    }

    async fn get_current_fix(&self) -> Result<GeoPoint, LocationError> {
        let gate = self.seed_gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        self.seed_fix.lock().unwrap().clone()
    }

    fn watch(
        &self,
        options: WatchOptions,
        on_fix: FixCallback,
    ) -> Result<FakeSubscription, LocationError> {
        if let Some(e) = self.watch_error.lock().unwrap().clone() {
            return Err(e);
        }
        self.watch_count.fetch_add(1, Ordering::SeqCst);
        *self.last_watch_options.lock().unwrap() = Some(options);
        let callback: SharedFixCallback = Arc::from(on_fix);
        *self.callback.lock().unwrap() = Some(callback.clone());
        let flush = self.flush_on_cancel.lock().unwrap().as_ref().map(|fix| (callback, *fix));
        Ok(FakeSubscription {
            cancel_count: self.cancel_count.clone(),
            flush,
        })
    }

    async fn reverse_geocode(
        &self,
        _latitude: f64,
        _longitude: f64,
    ) -> Result<String, LocationError> {
        self.geocode.lock().unwrap().clone()
    }
}

/// Collects every snapshot the tracker emits.
#[derive(Clone, Default)]
pub struct UpdateLog {
    snapshots: Arc<Mutex<Vec<TrackingSnapshot>>>,
}

impl UpdateLog {
    pub fn callback(&self) -> impl Fn(TrackingSnapshot) + Send + Sync + 'static {
        let snapshots = self.snapshots.clone();
        move |snapshot| snapshots.lock().unwrap().push(snapshot)
    }

    pub fn len(&self) -> usize {
        self.snapshots.lock().unwrap().len()
    }

    pub fn last(&self) -> Option<TrackingSnapshot> {
        self.snapshots.lock().unwrap().last().cloned()
    }

    pub fn all(&self) -> Vec<TrackingSnapshot> {
        self.snapshots.lock().unwrap().clone()
    }
}

#[derive(Default)]
pub struct RecordingSink {
    pub submissions: Mutex<Vec<RouteSubmission>>,
    pub fail: bool,
}

impl RecordingSink {
    pub fn failing() -> Self {
        RecordingSink {
            submissions: Mutex::new(Vec::new()),
            fail: true,
        }
    }
}

impl SubmissionSink for RecordingSink {
    fn submit(&self, submission: &RouteSubmission) -> Result<()> {
        self.submissions.lock().unwrap().push(submission.clone());
        if self.fail {
            anyhow::bail!("upload failed");
        }
        Ok(())
    }
}
