//! Replaying the outbox once connectivity returns.
//!
//! A replay takes a snapshot of the queue and sends each undelivered alert
//! in creation order. Only one replay runs at a time; a call that arrives
//! while another is in flight returns immediately.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::connectivity::ConnectivityMonitor;
use crate::dispatch::Dispatcher;
use crate::model::AlertStatus;
use crate::outbox::AlertOutbox;
use crate::storage::{keys, Storage};

/// Counters from one replay.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReplayReport {
    /// Alerts handed to the dispatcher.
    pub attempted: usize,
    /// Alerts that reached at least one recipient.
    pub sent: usize,
    /// Alerts that reached nobody.
    pub failed: usize,
    /// Alerts left untouched because the device went offline mid-replay.
    pub skipped: usize,
    /// Delivered alerts removed from the queue afterwards.
    pub removed: usize,
}

/// What a call to [`SyncCoordinator::replay`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayOutcome {
    /// The device was offline; nothing was attempted.
    Offline,
    /// Another replay was already running.
    AlreadyRunning,
    /// The replay ran.
    Completed(ReplayReport),
}

/// Clears the in-flight flag when dropped, even if the replay panics.
struct InFlightGuard<'a>(&'a AtomicBool);

impl<'a> InFlightGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Drains the outbox through the dispatcher.
#[derive(Debug)]
pub struct SyncCoordinator {
    outbox: Arc<AlertOutbox>,
    dispatcher: Arc<Dispatcher>,
    connectivity: Arc<ConnectivityMonitor>,
    storage: Arc<Storage>,
    in_flight: AtomicBool,
}

impl SyncCoordinator {
    /// Create a coordinator.
    pub fn new(
        outbox: Arc<AlertOutbox>,
        dispatcher: Arc<Dispatcher>,
        connectivity: Arc<ConnectivityMonitor>,
        storage: Arc<Storage>,
    ) -> Self {
        Self {
            outbox,
            dispatcher,
            connectivity,
            storage,
            in_flight: AtomicBool::new(false),
        }
    }

    /// Whether a replay is running right now.
    #[must_use]
    pub fn is_replaying(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Send every undelivered alert, oldest first.
    ///
    /// Delivered alerts are marked and then removed once the pass is over.
    /// If the device drops offline partway through, the rest stay queued
    /// for the next replay.
    pub async fn replay(&self) -> ReplayOutcome {
        if !self.connectivity.is_online() {
            debug!("Replay requested while offline");
            return ReplayOutcome::Offline;
        }
        let Some(_guard) = InFlightGuard::acquire(&self.in_flight) else {
            debug!("Replay already in flight");
            return ReplayOutcome::AlreadyRunning;
        };

        let snapshot: Vec<_> = match self.outbox.list() {
            Ok(queue) => queue
                .into_iter()
                .filter(|alert| alert.status != AlertStatus::Sent)
                .collect(),
            Err(e) => {
                warn!(error = %e, "Could not read outbox for replay");
                return ReplayOutcome::Completed(ReplayReport::default());
            }
        };

        let mut report = ReplayReport::default();
        if !snapshot.is_empty() {
            info!(queued = snapshot.len(), "Replaying outbox");
        }

        for (index, alert) in snapshot.iter().enumerate() {
            if !self.connectivity.is_online() {
                report.skipped = snapshot.len() - index;
                info!(skipped = report.skipped, "Went offline during replay");
                break;
            }

            report.attempted += 1;
            let status = if self.dispatcher.dispatch_alert(alert).await.delivered() {
                report.sent += 1;
                AlertStatus::Sent
            } else {
                report.failed += 1;
                AlertStatus::Failed
            };

            match self.outbox.mark(alert.id, status) {
                Ok(true) => {}
                Ok(false) => debug!(alert_id = %alert.id, "Alert left the queue during replay"),
                Err(e) => warn!(alert_id = %alert.id, error = %e, "Failed to update alert status"),
            }
        }

        match self.outbox.remove_sent() {
            Ok(removed) => report.removed = removed,
            Err(e) => warn!(error = %e, "Failed to remove delivered alerts"),
        }
        if let Err(e) = self.storage.put_json(keys::LAST_SYNC_AT, &Utc::now()) {
            warn!(error = %e, "Failed to record sync time");
        }

        if report.attempted > 0 {
            info!(
                sent = report.sent,
                failed = report.failed,
                skipped = report.skipped,
                "Replay finished"
            );
        }
        ReplayOutcome::Completed(report)
    }
}
