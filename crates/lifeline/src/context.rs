//! The emergency context: every component wired together.
//!
//! The application root builds one [`EmergencyContext`] at startup and
//! hands it to whatever needs it. There is no global state.

use std::sync::Arc;

use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::connectivity::{ConnectivityMonitor, ConnectivityProbe, Transition};
use crate::contacts::ContactCache;
use crate::dispatch::{DispatchReport, Dispatcher};
use crate::error::{Error, Result};
use crate::model::{GeoSample, QueuedAlert};
use crate::outbox::AlertOutbox;
use crate::remote::{
    IncidentRecord, NotificationGateway, PositionSource, ProfileRecord, RemoteRecord, RemoteStore,
};
use crate::retry::{RetryableWriter, WriteOutcome};
use crate::scheduler::{ScheduledTask, TickControl};
use crate::storage::Storage;
use crate::sync::SyncCoordinator;
use crate::tracker::{LocationTracker, TrackerSettings};

/// The external collaborators supplied by the application root.
pub struct Collaborators {
    /// Remote relational store.
    pub remote: Arc<dyn RemoteStore>,
    /// SMS/email gateway.
    pub gateway: Arc<dyn NotificationGateway>,
    /// Position sensor.
    pub positions: Arc<dyn PositionSource>,
    /// Link state probe.
    pub probe: Box<dyn ConnectivityProbe>,
}

impl std::fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collaborators").finish_non_exhaustive()
    }
}

/// Why an alert went to the outbox instead of out the door.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueReason {
    /// The device was offline.
    Offline,
    /// The device was online but no recipient was reached.
    DispatchFailed,
}

/// How an SOS was handled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "delivery", rename_all = "snake_case")]
pub enum Delivery {
    /// Sent immediately.
    Sent(DispatchReport),
    /// Queued for replay.
    Queued {
        /// Why it was queued.
        reason: QueueReason,
    },
}

/// Result of [`EmergencyContext::trigger_sos`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SosOutcome {
    /// Alert identifier.
    pub alert_id: Uuid,
    /// Sent or queued.
    pub delivery: Delivery,
    /// Location attached to the alert.
    pub location: Option<GeoSample>,
    /// Number of recipients.
    pub recipients: usize,
    /// Tracking could not start; shown to the user once.
    pub tracking_warning: Option<String>,
}

impl SosOutcome {
    /// One line for the user.
    #[must_use]
    pub fn summary(&self) -> String {
        let mut text = match &self.delivery {
            Delivery::Sent(report) => format!(
                "Alert sent to {} of {} contacts.",
                report.reached(),
                self.recipients
            ),
            Delivery::Queued {
                reason: QueueReason::Offline,
            } => "You are offline. The alert is saved and will be sent when you reconnect.".to_string(),
            Delivery::Queued {
                reason: QueueReason::DispatchFailed,
            } => "The alert could not be sent yet. It is saved and will be retried.".to_string(),
        };
        if let Some(warning) = &self.tracking_warning {
            text.push(' ');
            text.push_str(warning);
        }
        text
    }
}

/// Background work started by [`EmergencyContext::start_background`].
///
/// Dropping the handle stops all of it.
#[derive(Debug)]
pub struct BackgroundTasks {
    connectivity_poll: ScheduledTask,
    dead_letter_sweep: ScheduledTask,
    outbox_retry: ScheduledTask,
    reconnect_listener: JoinHandle<()>,
}

impl BackgroundTasks {
    /// Stop the background work and wait for any running tick to finish.
    pub async fn shutdown(mut self) {
        self.connectivity_poll.cancel();
        self.dead_letter_sweep.cancel();
        self.outbox_retry.cancel();
        self.reconnect_listener.abort();

        self.connectivity_poll.join().await;
        self.dead_letter_sweep.join().await;
        self.outbox_retry.join().await;
        debug!("Background tasks stopped");
    }
}

impl Drop for BackgroundTasks {
    fn drop(&mut self) {
        self.connectivity_poll.cancel();
        self.dead_letter_sweep.cancel();
        self.outbox_retry.cancel();
        self.reconnect_listener.abort();
    }
}

/// Everything the emergency flow needs, built once.
pub struct EmergencyContext {
    config: Config,
    storage: Arc<Storage>,
    connectivity: Arc<ConnectivityMonitor>,
    contacts: Arc<ContactCache>,
    outbox: Arc<AlertOutbox>,
    dispatcher: Arc<Dispatcher>,
    sync: Arc<SyncCoordinator>,
    tracker: LocationTracker,
    writer: Arc<RetryableWriter>,
    positions: Arc<dyn PositionSource>,
}

impl std::fmt::Debug for EmergencyContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmergencyContext")
            .field("storage", &self.storage.path())
            .field("connectivity", &self.connectivity)
            .field("tracker", &self.tracker)
            .finish_non_exhaustive()
    }
}

impl EmergencyContext {
    /// Wire the components together.
    pub fn new(config: Config, storage: Arc<Storage>, collaborators: Collaborators) -> Self {
        let Collaborators {
            remote,
            gateway,
            positions,
            probe,
        } = collaborators;

        let connectivity = Arc::new(ConnectivityMonitor::new(probe, Arc::clone(&storage)));
        let contacts = Arc::new(ContactCache::new(
            Arc::clone(&storage),
            Arc::clone(&remote),
            Arc::clone(&connectivity),
            config.cache_ttl(),
            config.fetch_timeout(),
        ));
        let outbox = Arc::new(AlertOutbox::new(
            Arc::clone(&storage),
            config.dead_letter_age(),
        ));
        let dispatcher = Arc::new(Dispatcher::new(
            gateway,
            Arc::clone(&remote),
            Arc::clone(&storage),
            config.write_timeout(),
        ));
        let sync = Arc::new(SyncCoordinator::new(
            Arc::clone(&outbox),
            Arc::clone(&dispatcher),
            Arc::clone(&connectivity),
            Arc::clone(&storage),
        ));
        let tracker = LocationTracker::new(
            Arc::clone(&positions),
            Arc::clone(&storage),
            Arc::clone(&remote),
            Arc::clone(&contacts),
            Arc::clone(&dispatcher),
            TrackerSettings::from_config(&config),
        );
        let writer = Arc::new(RetryableWriter::new(
            remote,
            config.retry.max_attempts,
            config.retry_base_delay(),
            config.write_timeout(),
        ));

        Self {
            config,
            storage,
            connectivity,
            contacts,
            outbox,
            dispatcher,
            sync,
            tracker,
            writer,
            positions,
        }
    }

    /// Loaded configuration.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Local state store.
    #[must_use]
    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    /// Connectivity monitor.
    #[must_use]
    pub fn connectivity(&self) -> &Arc<ConnectivityMonitor> {
        &self.connectivity
    }

    /// Contact cache.
    #[must_use]
    pub fn contacts(&self) -> &Arc<ContactCache> {
        &self.contacts
    }

    /// Alert outbox.
    #[must_use]
    pub fn outbox(&self) -> &Arc<AlertOutbox> {
        &self.outbox
    }

    /// Sync coordinator.
    #[must_use]
    pub fn sync(&self) -> &Arc<SyncCoordinator> {
        &self.sync
    }

    /// Location tracker.
    #[must_use]
    pub fn tracker(&self) -> &LocationTracker {
        &self.tracker
    }

    /// Raise an SOS for `user_id`.
    ///
    /// Sends immediately when online; otherwise, or if nobody could be
    /// reached, the alert is queued for replay. Tracking starts if it is
    /// not already running.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoContacts`] if the user has no contacts, or a
    /// storage error if the alert had to be queued and could not be.
    pub async fn trigger_sos(&self, user_id: &str, message: Option<String>) -> Result<SosOutcome> {
        let recipients = self.contacts.get(user_id).await;
        if recipients.is_empty() {
            return Err(Error::NoContacts {
                user_id: user_id.to_string(),
            });
        }

        let mut tracking_warning = None;
        let mut permission_denied = false;
        if !self.tracker.is_active() {
            match self.tracker.start(user_id, None) {
                Ok(_) => {
                    if let Err(e) = self
                        .tracker
                        .enable_auto_share(user_id, self.config.tracking.auto_share_interval_minutes)
                    {
                        warn!(error = %e, "Auto-share not enabled");
                    }
                }
                Err(e) => {
                    permission_denied = e.is_permission_error();
                    warn!(error = %e, "Tracking did not start");
                    tracking_warning = Some(if permission_denied {
                        "Location permission is denied, so your position will not be shared.".to_string()
                    } else {
                        "Live location tracking could not start.".to_string()
                    });
                }
            }
        }

        let location = self.resolve_location(permission_denied).await;
        let alert = QueuedAlert::new(user_id, location.clone(), recipients, message);
        let alert_id = alert.id;
        let recipient_count = alert.recipients.len();
        self.record_incident(&alert);

        let delivery = if self.connectivity.is_online() {
            let report = self.dispatcher.dispatch_alert(&alert).await;
            if report.delivered() {
                Delivery::Sent(report)
            } else {
                self.outbox.enqueue_alert(alert)?;
                Delivery::Queued {
                    reason: QueueReason::DispatchFailed,
                }
            }
        } else {
            self.outbox.enqueue_alert(alert)?;
            Delivery::Queued {
                reason: QueueReason::Offline,
            }
        };

        let outcome = SosOutcome {
            alert_id,
            delivery,
            location,
            recipients: recipient_count,
            tracking_warning,
        };
        info!(%alert_id, user_id, summary = %outcome.summary(), "SOS handled");
        Ok(outcome)
    }

    /// End the emergency: stop tracking and auto-share.
    pub async fn cancel_sos(&self) {
        self.tracker.stop().await;
        info!("SOS cancelled");
    }

    /// Create the user's remote profile row after signup.
    ///
    /// Returns a warning for the user if the row could not be written.
    /// Signup itself is never blocked by this.
    pub async fn register_profile(&self, profile: ProfileRecord) -> Option<String> {
        let user_id = profile.user_id.clone();
        let WriteOutcome {
            success,
            attempts,
            last_error,
        } = self.writer.create(&RemoteRecord::Profile(profile)).await;

        if success {
            debug!(user_id, attempts, "Profile created");
            None
        } else {
            warn!(user_id, attempts, error = ?last_error, "Profile creation failed");
            Some("Your account was created, but your profile could not be saved yet. Some features may be limited.".to_string())
        }
    }

    /// Start connectivity polling, replay on reconnect, the periodic
    /// outbox retry and the periodic dead-letter sweep.
    ///
    /// The retry drains alerts that failed while the device stayed online,
    /// which no reconnect edge would ever pick up.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start_background(&self) -> BackgroundTasks {
        let mut transitions = self.connectivity.subscribe();
        let sync = Arc::clone(&self.sync);
        let reconnect_listener = tokio::spawn(async move {
            while let Some(transition) = transitions.recv().await {
                if transition == Transition::WentOnline {
                    let sync = Arc::clone(&sync);
                    tokio::spawn(async move {
                        let outcome = sync.replay().await;
                        debug!(?outcome, "Reconnect replay");
                    });
                }
            }
        });

        match self.outbox.sweep_expired() {
            Ok(0) => {}
            Ok(dropped) => info!(dropped, "Dropped expired alerts at startup"),
            Err(e) => warn!(error = %e, "Startup dead-letter sweep failed"),
        }
        if self.connectivity.is_online() && !self.outbox.is_empty().unwrap_or(true) {
            let sync = Arc::clone(&self.sync);
            tokio::spawn(async move {
                let outcome = sync.replay().await;
                debug!(?outcome, "Startup replay");
            });
        }

        let outbox = Arc::clone(&self.outbox);
        let dead_letter_sweep = ScheduledTask::every("dead-letter-sweep", self.config.sweep_interval(), move || {
            if let Err(e) = outbox.sweep_expired() {
                warn!(error = %e, "Dead-letter sweep failed");
            }
            std::future::ready(TickControl::Continue)
        });

        let sync = Arc::clone(&self.sync);
        let outbox = Arc::clone(&self.outbox);
        let outbox_retry = ScheduledTask::every("outbox-retry", self.config.retry_interval(), move || {
            let sync = Arc::clone(&sync);
            let pending = !outbox.is_empty().unwrap_or(true);
            async move {
                if pending {
                    let outcome = sync.replay().await;
                    debug!(?outcome, "Periodic replay");
                }
                TickControl::Continue
            }
        });

        let connectivity_poll = self.connectivity.run(self.config.poll_interval());

        info!("Background tasks started");
        BackgroundTasks {
            connectivity_poll,
            dead_letter_sweep,
            outbox_retry,
            reconnect_listener,
        }
    }

    async fn resolve_location(&self, permission_denied: bool) -> Option<GeoSample> {
        if let Some(sample) = self.tracker.last_known_location() {
            return Some(sample);
        }
        if !permission_denied {
            let options = TrackerSettings::from_config(&self.config).watch;
            match tokio::time::timeout(options.timeout, self.positions.current_position(options)).await {
                Ok(Ok(sample)) => return Some(sample),
                Ok(Err(e)) => debug!(error = %e, "No fresh fix for alert"),
                Err(_) => debug!("Timed out waiting for a fix"),
            }
        }
        self.tracker.persisted_location()
    }

    fn record_incident(&self, alert: &QueuedAlert) {
        let writer = Arc::clone(&self.writer);
        let record = RemoteRecord::Incident(IncidentRecord {
            alert_id: alert.id,
            user_id: alert.owner_user_id.clone(),
            location: alert.location.clone(),
            message: alert.message.clone(),
            created_at: alert.created_at,
        });
        tokio::spawn(async move {
            let outcome = writer.create(&record).await;
            if !outcome.success {
                warn!(error = ?outcome.last_error, "Incident not recorded remotely");
            }
        });
    }
}
