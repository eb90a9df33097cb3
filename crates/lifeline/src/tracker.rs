//! Continuous location tracking during an emergency.
//!
//! A session owns one position subscription. Each sample goes into a
//! bounded in-memory history, becomes the persisted last-known location,
//! and is logged remotely on a best-effort basis. Sensor errors are logged
//! and the session keeps waiting for the next sample.
//!
//! Stopping bumps a generation counter before anything else, so a sample
//! already in flight when `stop` is called is discarded on arrival.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::contacts::ContactCache;
use crate::dispatch::{DispatchReport, Dispatcher};
use crate::error::{Error, Result};
use crate::model::{GeoSample, TrackingSessionDescriptor};
use crate::remote::{
    LocationLogRecord, PositionEvent, PositionSource, RemoteRecord, RemoteStore, SessionEndRecord,
    WatchId, WatchOptions,
};
use crate::scheduler::{ScheduledTask, TickControl};
use crate::storage::{keys, Storage};

/// Called with every accepted sample.
pub type SampleListener = Arc<dyn Fn(&GeoSample) + Send + Sync>;

/// Fixed-capacity sample history; the oldest sample is evicted first.
#[derive(Debug, Clone)]
pub struct HistoryBuffer {
    samples: VecDeque<GeoSample>,
    capacity: usize,
}

impl HistoryBuffer {
    /// Create an empty buffer holding at most `capacity` samples.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append a sample, returning the one evicted to make room.
    pub fn push(&mut self, sample: GeoSample) -> Option<GeoSample> {
        let evicted = if self.samples.len() == self.capacity {
            self.samples.pop_front()
        } else {
            None
        };
        self.samples.push_back(sample);
        evicted
    }

    /// Most recent sample.
    #[must_use]
    pub fn latest(&self) -> Option<&GeoSample> {
        self.samples.back()
    }

    /// Samples, oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &GeoSample> {
        self.samples.iter()
    }

    /// Number of samples held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Whether the buffer is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Maximum number of samples held.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Remove every sample.
    pub fn clear(&mut self) {
        self.samples.clear();
    }
}

/// Tracker tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackerSettings {
    /// Options for the position subscription.
    pub watch: WatchOptions,
    /// History buffer capacity.
    pub history_capacity: usize,
    /// Deadline for each remote write.
    pub write_timeout: Duration,
}

impl TrackerSettings {
    /// Settings taken from the loaded configuration.
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            watch: WatchOptions {
                high_accuracy: config.tracking.high_accuracy,
                timeout: config.position_timeout(),
                maximum_age: Duration::from_millis(config.tracking.maximum_age_ms),
            },
            history_capacity: config.tracking.history_capacity,
            write_timeout: config.write_timeout(),
        }
    }
}

/// Snapshot of the active session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TrackingStatus {
    /// Session identifier.
    pub session_id: Uuid,
    /// User being tracked.
    pub owner_user_id: String,
    /// When tracking started.
    pub started_at: DateTime<Utc>,
    /// Samples accepted so far.
    pub samples: u64,
    /// Remote location-log writes that failed.
    pub log_failures: u64,
    /// Samples currently in the history buffer.
    pub buffered: usize,
}

struct ActiveSession {
    descriptor: TrackingSessionDescriptor,
    watch_id: WatchId,
    generation: u64,
    samples: u64,
    log_failures: u64,
}

struct TrackerState {
    session: Option<ActiveSession>,
    history: HistoryBuffer,
    auto_share: Option<ScheduledTask>,
}

struct TrackerInner {
    positions: Arc<dyn PositionSource>,
    storage: Arc<Storage>,
    remote: Arc<dyn RemoteStore>,
    contacts: Arc<ContactCache>,
    dispatcher: Arc<Dispatcher>,
    settings: TrackerSettings,
    generation: AtomicU64,
    state: Mutex<TrackerState>,
}

impl TrackerInner {
    fn lock(&self) -> MutexGuard<'_, TrackerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }
}

/// Location tracking for the emergency flow.
///
/// Cloning yields another handle to the same tracker.
#[derive(Clone)]
pub struct LocationTracker {
    inner: Arc<TrackerInner>,
}

impl std::fmt::Debug for LocationTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocationTracker")
            .field("settings", &self.inner.settings)
            .field("active", &self.is_active())
            .finish_non_exhaustive()
    }
}

impl LocationTracker {
    /// Create an idle tracker.
    pub fn new(
        positions: Arc<dyn PositionSource>,
        storage: Arc<Storage>,
        remote: Arc<dyn RemoteStore>,
        contacts: Arc<ContactCache>,
        dispatcher: Arc<Dispatcher>,
        settings: TrackerSettings,
    ) -> Self {
        Self {
            inner: Arc::new(TrackerInner {
                positions,
                storage,
                remote,
                contacts,
                dispatcher,
                settings,
                generation: AtomicU64::new(0),
                state: Mutex::new(TrackerState {
                    session: None,
                    history: HistoryBuffer::new(settings.history_capacity),
                    auto_share: None,
                }),
            }),
        }
    }

    /// Start tracking `owner_user_id` and return the session id.
    ///
    /// If a session is already running its id is returned unchanged.
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Position`] if the subscription cannot be opened,
    /// for example when location permission is denied.
    pub fn start(&self, owner_user_id: &str, on_sample: Option<SampleListener>) -> Result<Uuid> {
        let mut state = self.inner.lock();
        if let Some(session) = &state.session {
            debug!(session_id = %session.descriptor.session_id, "Tracking already active");
            return Ok(session.descriptor.session_id);
        }

        match self
            .inner
            .storage
            .get_json::<TrackingSessionDescriptor>(keys::TRACKING_SESSION)
        {
            Ok(Some(stale)) => {
                info!(session_id = %stale.session_id, "Replacing session left over from a previous run");
            }
            Ok(None) => {}
            Err(e) => warn!(error = %e, "Unreadable tracking session descriptor"),
        }

        let watch = self.inner.positions.watch(self.inner.settings.watch)?;
        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let descriptor = TrackingSessionDescriptor {
            session_id: Uuid::new_v4(),
            owner_user_id: owner_user_id.to_string(),
            started_at: Utc::now(),
            is_active: true,
        };
        if let Err(e) = self.inner.storage.put_json(keys::TRACKING_SESSION, &descriptor) {
            warn!(error = %e, "Failed to persist tracking session");
        }

        let session_id = descriptor.session_id;
        state.history.clear();
        state.session = Some(ActiveSession {
            descriptor,
            watch_id: watch.id,
            generation,
            samples: 0,
            log_failures: 0,
        });
        drop(state);

        tokio::spawn(pump(Arc::clone(&self.inner), generation, watch.events, on_sample));

        info!(%session_id, user_id = owner_user_id, "Tracking started");
        Ok(session_id)
    }

    /// End the active session. Does nothing if none is running.
    ///
    /// Samples arriving after this call begins are discarded. The remote
    /// session-end record is best effort.
    pub async fn stop(&self) {
        let (session, auto_share) = {
            let mut state = self.inner.lock();
            let Some(session) = state.session.take() else {
                debug!("Stop requested with no active session");
                return;
            };
            self.inner.generation.fetch_add(1, Ordering::SeqCst);
            state.history.clear();
            (session, state.auto_share.take())
        };

        drop(auto_share);
        self.inner.positions.clear_watch(session.watch_id);
        if let Err(e) = self.inner.storage.remove(keys::TRACKING_SESSION) {
            warn!(error = %e, "Failed to clear tracking session");
        }

        let descriptor = session.descriptor;
        info!(session_id = %descriptor.session_id, samples = session.samples, "Tracking stopped");

        let record = RemoteRecord::SessionEnd(SessionEndRecord {
            session_id: descriptor.session_id,
            user_id: descriptor.owner_user_id,
            ended_at: Utc::now(),
            samples: session.samples,
        });
        match tokio::time::timeout(self.inner.settings.write_timeout, self.inner.remote.insert(&record)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "Failed to record session end"),
            Err(_) => warn!("Timed out recording session end"),
        }
    }

    /// Whether a session is running.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.inner.lock().session.is_some()
    }

    /// Most recent sample of the active session.
    #[must_use]
    pub fn last_known_location(&self) -> Option<GeoSample> {
        self.inner.lock().history.latest().cloned()
    }

    /// Last location persisted by any session, including earlier runs.
    #[must_use]
    pub fn persisted_location(&self) -> Option<GeoSample> {
        match self.inner.storage.get_json(keys::LAST_KNOWN_LOCATION) {
            Ok(sample) => sample,
            Err(e) => {
                warn!(error = %e, "Unreadable last known location");
                None
            }
        }
    }

    /// Samples of the active session, oldest first.
    #[must_use]
    pub fn history(&self) -> Vec<GeoSample> {
        self.inner.lock().history.iter().cloned().collect()
    }

    /// Snapshot of the active session.
    #[must_use]
    pub fn status(&self) -> Option<TrackingStatus> {
        let state = self.inner.lock();
        state.session.as_ref().map(|session| TrackingStatus {
            session_id: session.descriptor.session_id,
            owner_user_id: session.descriptor.owner_user_id.clone(),
            started_at: session.descriptor.started_at,
            samples: session.samples,
            log_failures: session.log_failures,
            buffered: state.history.len(),
        })
    }

    /// Share the current location with the user's contacts every
    /// `interval_minutes`.
    ///
    /// Replaces any previous schedule. The schedule cancels itself on the
    /// first tick that finds no active session.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConfigValidation`] if the interval is zero.
    pub fn enable_auto_share(&self, owner_user_id: &str, interval_minutes: u32) -> Result<()> {
        if interval_minutes == 0 {
            return Err(Error::ConfigValidation {
                message: "auto-share interval must be at least one minute".to_string(),
            });
        }

        let weak: Weak<TrackerInner> = Arc::downgrade(&self.inner);
        let owner = owner_user_id.to_string();
        let period = Duration::from_secs(u64::from(interval_minutes) * 60);
        let task = ScheduledTask::every("auto-share", period, move || {
            let weak = weak.clone();
            let owner = owner.clone();
            async move {
                let Some(inner) = weak.upgrade() else {
                    return TickControl::Stop;
                };
                let tracker = LocationTracker { inner };
                if !tracker.is_active() {
                    debug!("No active session; auto-share stopping");
                    return TickControl::Stop;
                }
                tracker.share_now(&owner).await;
                TickControl::Continue
            }
        });

        self.inner.lock().auto_share = Some(task);
        info!(user_id = owner_user_id, interval_minutes, "Auto-share enabled");
        Ok(())
    }

    /// Whether an auto-share schedule is still running.
    #[must_use]
    pub fn auto_share_running(&self) -> bool {
        self.inner
            .lock()
            .auto_share
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    /// Send the latest location to the user's contacts now.
    ///
    /// Returns `None` if there is no location or no contact to send to.
    pub async fn share_now(&self, owner_user_id: &str) -> Option<DispatchReport> {
        let Some(location) = self.last_known_location().or_else(|| self.persisted_location()) else {
            warn!("No location to share");
            return None;
        };
        let contacts = self.inner.contacts.get(owner_user_id).await;
        if contacts.is_empty() {
            warn!(user_id = owner_user_id, "No contacts to share location with");
            return None;
        }
        Some(
            self.inner
                .dispatcher
                .share_location(owner_user_id, &contacts, &location)
                .await,
        )
    }
}

async fn pump(
    inner: Arc<TrackerInner>,
    generation: u64,
    mut events: mpsc::Receiver<PositionEvent>,
    on_sample: Option<SampleListener>,
) {
    while let Some(event) = events.recv().await {
        if !inner.is_current(generation) {
            debug!("Discarding position event from a stopped session");
            return;
        }
        match event {
            Ok(sample) => accept(&inner, generation, sample, on_sample.as_ref()),
            Err(e) => warn!(error = %e, "Position sensor error; waiting for next sample"),
        }
    }

    if inner.is_current(generation) {
        warn!("Position stream closed while the session is still active");
    }
}

fn accept(inner: &Arc<TrackerInner>, generation: u64, sample: GeoSample, on_sample: Option<&SampleListener>) {
    let (session_id, owner_user_id) = {
        let mut guard = inner.lock();
        let state = &mut *guard;
        let Some(session) = state.session.as_mut().filter(|s| s.generation == generation) else {
            return;
        };
        session.samples += 1;
        state.history.push(sample.clone());
        (
            session.descriptor.session_id,
            session.descriptor.owner_user_id.clone(),
        )
    };

    if let Err(e) = inner.storage.put_json(keys::LAST_KNOWN_LOCATION, &sample) {
        warn!(error = %e, "Failed to persist last known location");
    }
    if let Some(listener) = on_sample {
        listener(&sample);
    }

    let inner = Arc::clone(inner);
    tokio::spawn(async move {
        let record = RemoteRecord::LocationLog(LocationLogRecord {
            session_id,
            user_id: owner_user_id,
            sample,
        });
        let failure = match tokio::time::timeout(inner.settings.write_timeout, inner.remote.insert(&record)).await {
            Ok(Ok(())) => return,
            Ok(Err(e)) => e,
            Err(_) => Error::timeout("location log write"),
        };
        warn!(%session_id, error = %failure, "Failed to log location remotely");

        let mut state = inner.lock();
        if let Some(session) = state.session.as_mut().filter(|s| s.generation == generation) {
            session.log_failures += 1;
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PositionError;
    use crate::remote::NotificationGateway;
    use crate::testing::{contact, online_monitor, settle, FakeGateway, FakePositions, FakeRemote};
    use std::sync::atomic::AtomicUsize;

    struct Fixture {
        storage: Arc<Storage>,
        positions: Arc<FakePositions>,
        remote: Arc<FakeRemote>,
        gateway: Arc<FakeGateway>,
        contacts: Arc<ContactCache>,
        tracker: LocationTracker,
    }

    fn fixture() -> Fixture {
        let storage = Arc::new(Storage::open_in_memory().unwrap());
        let positions = Arc::new(FakePositions::default());
        let remote = Arc::new(FakeRemote::default());
        let gateway = Arc::new(FakeGateway::default());
        let (_, connectivity) = online_monitor(false, Arc::clone(&storage));
        let contacts = Arc::new(ContactCache::new(
            Arc::clone(&storage),
            Arc::clone(&remote) as Arc<dyn RemoteStore>,
            connectivity,
            chrono::Duration::days(7),
            Duration::from_secs(10),
        ));
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&gateway) as Arc<dyn NotificationGateway>,
            Arc::clone(&remote) as Arc<dyn RemoteStore>,
            Arc::clone(&storage),
            Duration::from_secs(12),
        ));
        let tracker = LocationTracker::new(
            Arc::clone(&positions) as Arc<dyn PositionSource>,
            Arc::clone(&storage),
            Arc::clone(&remote) as Arc<dyn RemoteStore>,
            Arc::clone(&contacts),
            dispatcher,
            TrackerSettings::from_config(&Config::default()),
        );
        Fixture {
            storage,
            positions,
            remote,
            gateway,
            contacts,
            tracker,
        }
    }

    fn sample(latitude: f64) -> GeoSample {
        GeoSample::new(latitude, 0.0, 5.0)
    }

    #[test]
    fn test_history_buffer_evicts_oldest() {
        let mut buffer = HistoryBuffer::new(2);
        assert!(buffer.push(sample(1.0)).is_none());
        assert!(buffer.push(sample(2.0)).is_none());

        let evicted = buffer.push(sample(3.0)).unwrap();
        assert!((evicted.latitude - 1.0).abs() < f64::EPSILON);
        assert_eq!(buffer.len(), 2);
        assert!((buffer.latest().unwrap().latitude - 3.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_history_buffer_zero_capacity_holds_one() {
        let mut buffer = HistoryBuffer::new(0);
        buffer.push(sample(1.0));
        buffer.push(sample(2.0));
        assert_eq!(buffer.capacity(), 1);
        assert_eq!(buffer.len(), 1);
    }

    #[tokio::test]
    async fn test_start_persists_descriptor() {
        let f = fixture();
        let id = f.tracker.start("u1", None).unwrap();

        assert!(f.tracker.is_active());
        let stored: TrackingSessionDescriptor =
            f.storage.get_json(keys::TRACKING_SESSION).unwrap().unwrap();
        assert_eq!(stored.session_id, id);
        assert_eq!(stored.owner_user_id, "u1");
        assert!(stored.is_active);
    }

    #[tokio::test]
    async fn test_second_start_keeps_session() {
        let f = fixture();
        let first = f.tracker.start("u1", None).unwrap();
        let second = f.tracker.start("u1", None).unwrap();
        assert_eq!(first, second);
        assert_eq!(f.positions.watch_calls(), 1);
    }

    #[tokio::test]
    async fn test_permission_denied_does_not_start() {
        let f = fixture();
        f.positions.deny_permission(true);

        let err = f.tracker.start("u1", None).unwrap_err();
        assert!(err.is_permission_error());
        assert!(!f.tracker.is_active());
        assert!(f
            .storage
            .get_raw(keys::TRACKING_SESSION)
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_samples_update_history_and_last_known() {
        let f = fixture();
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        let listener: SampleListener = Arc::new(move |_: &GeoSample| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        f.tracker.start("u1", Some(listener)).unwrap();

        f.positions.emit(Ok(sample(1.0))).await;
        f.positions.emit(Ok(sample(2.0))).await;
        settle().await;

        assert_eq!(f.tracker.history().len(), 2);
        let last = f.tracker.last_known_location().unwrap();
        assert!((last.latitude - 2.0).abs() < f64::EPSILON);
        assert_eq!(f.tracker.persisted_location(), Some(last));
        assert_eq!(seen.load(Ordering::SeqCst), 2);

        let kinds: Vec<&str> = f.remote.inserted().iter().map(RemoteRecord::kind).collect();
        assert_eq!(kinds, vec!["location_log", "location_log"]);
    }

    #[tokio::test]
    async fn test_sensor_errors_keep_session_alive() {
        let f = fixture();
        f.tracker.start("u1", None).unwrap();

        f.positions.emit(Ok(sample(1.0))).await;
        f.positions.emit(Err(PositionError::PositionUnavailable)).await;
        f.positions.emit(Err(PositionError::Timeout)).await;
        f.positions.emit(Ok(sample(2.0))).await;
        settle().await;

        assert!(f.tracker.is_active());
        assert_eq!(f.tracker.history().len(), 2);
        assert_eq!(f.tracker.status().unwrap().samples, 2);
    }

    #[tokio::test]
    async fn test_history_is_bounded() {
        let f = fixture();
        f.tracker.start("u1", None).unwrap();

        for i in 0..150 {
            f.positions.emit(Ok(sample(f64::from(i)))).await;
        }
        settle().await;

        let history = f.tracker.history();
        assert_eq!(history.len(), 100);
        assert!((history[0].latitude - 50.0).abs() < f64::EPSILON);
        assert!((history[99].latitude - 149.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_stop_discards_in_flight_samples() {
        let f = fixture();
        f.tracker.start("u1", None).unwrap();
        f.positions.emit(Ok(sample(1.0))).await;
        settle().await;

        let late_sender = f.positions.sender();
        f.tracker.stop().await;
        let _ = late_sender.send(Ok(sample(99.0))).await;
        settle().await;

        assert!(!f.tracker.is_active());
        assert!(f.tracker.history().is_empty());
        assert!(f.tracker.last_known_location().is_none());
        let persisted = f.tracker.persisted_location().unwrap();
        assert!((persisted.latitude - 1.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_stop_releases_subscription_and_records_end() {
        let f = fixture();
        f.tracker.start("u1", None).unwrap();
        f.positions.emit(Ok(sample(1.0))).await;
        settle().await;

        f.tracker.stop().await;

        assert_eq!(f.positions.cleared().len(), 1);
        assert!(f
            .storage
            .get_raw(keys::TRACKING_SESSION)
            .unwrap()
            .is_none());
        let ends: Vec<RemoteRecord> = f
            .remote
            .inserted()
            .into_iter()
            .filter(|r| r.kind() == "session_end")
            .collect();
        assert_eq!(ends.len(), 1);
        if let RemoteRecord::SessionEnd(end) = &ends[0] {
            assert_eq!(end.samples, 1);
        }
    }

    #[tokio::test]
    async fn test_stop_without_session_is_noop() {
        let f = fixture();
        f.tracker.stop().await;
        assert!(f.positions.cleared().is_empty());
        assert!(f.remote.inserted().is_empty());
    }

    #[tokio::test]
    async fn test_remote_log_failures_are_counted() {
        let f = fixture();
        f.remote.fail_next_inserts(u32::MAX);
        f.tracker.start("u1", None).unwrap();

        f.positions.emit(Ok(sample(1.0))).await;
        settle().await;

        let status = f.tracker.status().unwrap();
        assert_eq!(status.samples, 1);
        assert_eq!(status.log_failures, 1);
        assert!(f.tracker.is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn test_auto_share_sends_updates_until_stopped() {
        let f = fixture();
        f.contacts.put("u1", vec![contact("c1")]).unwrap();
        f.tracker.start("u1", None).unwrap();
        f.positions.emit(Ok(sample(1.0))).await;
        settle().await;

        f.tracker.enable_auto_share("u1", 5).unwrap();
        tokio::time::sleep(Duration::from_secs(5 * 60 + 1)).await;
        assert_eq!(f.gateway.sent_to(), vec!["c1".to_string()]);

        f.tracker.stop().await;
        tokio::time::sleep(Duration::from_secs(30 * 60)).await;
        assert_eq!(f.gateway.sent_to().len(), 1);
        assert!(!f.tracker.auto_share_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_auto_share_cancels_itself_without_session() {
        let f = fixture();
        f.tracker.enable_auto_share("u1", 1).unwrap();
        assert!(f.tracker.auto_share_running());

        tokio::time::sleep(Duration::from_secs(61)).await;
        settle().await;

        assert!(!f.tracker.auto_share_running());
        assert!(f.gateway.sent_to().is_empty());
    }

    #[tokio::test]
    async fn test_auto_share_rejects_zero_interval() {
        let f = fixture();
        assert!(f.tracker.enable_auto_share("u1", 0).is_err());
    }
}
