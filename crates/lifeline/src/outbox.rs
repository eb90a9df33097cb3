//! Durable queue of emergency alerts awaiting delivery.
//!
//! The whole queue is one JSON document in local storage. Every mutation
//! goes through a single read-modify-write transaction, so concurrent
//! enqueues and status updates never lose each other's writes.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::Result;
use crate::model::{AlertStatus, Contact, GeoSample, QueuedAlert};
use crate::storage::{keys, Storage};

/// The persisted alert queue.
#[derive(Debug)]
pub struct AlertOutbox {
    storage: Arc<Storage>,
    dead_letter_age: chrono::Duration,
}

impl AlertOutbox {
    /// Create an outbox that drops entries older than `dead_letter_age`
    /// when swept.
    pub fn new(storage: Arc<Storage>, dead_letter_age: chrono::Duration) -> Self {
        Self {
            storage,
            dead_letter_age,
        }
    }

    /// Persist a new pending alert and return its id.
    ///
    /// The recipients are copied into the alert, so later contact edits do
    /// not affect it.
    ///
    /// # Errors
    ///
    /// Returns an error if the queue cannot be written. The alert is not
    /// queued in that case.
    pub fn enqueue(
        &self,
        owner_user_id: &str,
        location: Option<GeoSample>,
        recipients: &[Contact],
        message: Option<String>,
    ) -> Result<Uuid> {
        self.enqueue_alert(QueuedAlert::new(
            owner_user_id,
            location,
            recipients.to_vec(),
            message,
        ))
    }

    /// Persist an alert built elsewhere.
    ///
    /// # Errors
    ///
    /// Returns an error if the queue cannot be written.
    pub fn enqueue_alert(&self, alert: QueuedAlert) -> Result<Uuid> {
        let id = alert.id;
        let recipients = alert.recipients.len();
        let depth = self.storage.update_json(keys::QUEUED_ALERTS, |queue: &mut Vec<QueuedAlert>| {
            queue.push(alert);
            queue.len()
        })?;

        info!(alert_id = %id, recipients, depth, "Alert queued");
        Ok(id)
    }

    /// All queued alerts, oldest first.
    ///
    /// An unreadable queue reads as empty; the next write quarantines it.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be read.
    pub fn list(&self) -> Result<Vec<QueuedAlert>> {
        let mut queue = match self.storage.get_json::<Vec<QueuedAlert>>(keys::QUEUED_ALERTS) {
            Ok(queue) => queue.unwrap_or_default(),
            Err(crate::error::Error::Json(e)) => {
                warn!(error = %e, "Outbox document is malformed; reading as empty");
                Vec::new()
            }
            Err(e) => return Err(e),
        };
        queue.sort_by_key(|alert| alert.created_at);
        Ok(queue)
    }

    /// Number of queued alerts.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be read.
    pub fn len(&self) -> Result<usize> {
        Ok(self.list()?.len())
    }

    /// Whether the queue is empty.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be read.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Set the status of one alert.
    ///
    /// Returns `false` if the alert is no longer queued.
    ///
    /// # Errors
    ///
    /// Returns an error if the queue cannot be written.
    pub fn mark(&self, id: Uuid, status: AlertStatus) -> Result<bool> {
        let found = self.storage.update_json(keys::QUEUED_ALERTS, |queue: &mut Vec<QueuedAlert>| {
            match queue.iter_mut().find(|alert| alert.id == id) {
                Some(alert) => {
                    alert.status = status;
                    true
                }
                None => false,
            }
        })?;

        if found {
            debug!(alert_id = %id, %status, "Alert status updated");
        }
        Ok(found)
    }

    /// Remove every delivered alert. Returns how many were removed.
    ///
    /// # Errors
    ///
    /// Returns an error if the queue cannot be written.
    pub fn remove_sent(&self) -> Result<usize> {
        let removed = self.storage.update_json(keys::QUEUED_ALERTS, |queue: &mut Vec<QueuedAlert>| {
            let before = queue.len();
            queue.retain(|alert| alert.status != AlertStatus::Sent);
            before - queue.len()
        })?;

        if removed > 0 {
            debug!(removed, "Removed delivered alerts");
        }
        Ok(removed)
    }

    /// Drop alerts older than the dead-letter age, whatever their status.
    ///
    /// # Errors
    ///
    /// Returns an error if the queue cannot be written.
    pub fn sweep_expired(&self) -> Result<usize> {
        self.sweep_expired_at(Utc::now())
    }

    /// [`sweep_expired`](Self::sweep_expired) evaluated at `now`.
    ///
    /// # Errors
    ///
    /// Returns an error if the queue cannot be written.
    pub fn sweep_expired_at(&self, now: DateTime<Utc>) -> Result<usize> {
        let max_age = self.dead_letter_age;
        let dropped = self.storage.update_json(keys::QUEUED_ALERTS, |queue: &mut Vec<QueuedAlert>| {
            let mut dropped = Vec::new();
            queue.retain(|alert| {
                if alert.is_expired(now, max_age) {
                    dropped.push((alert.id, alert.status));
                    false
                } else {
                    true
                }
            });
            dropped
        })?;

        for (id, status) in &dropped {
            warn!(alert_id = %id, %status, "Dropping undelivered alert past dead-letter age");
        }
        Ok(dropped.len())
    }
}
