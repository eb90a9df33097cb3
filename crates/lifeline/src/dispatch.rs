//! Sending an alert to its recipients.
//!
//! Each recipient gets one gateway call with its own deadline. Outcomes go
//! to the local delivery log and, best effort, to the remote store.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::Error;
use crate::model::{Contact, GeoSample, QueuedAlert};
use crate::remote::{
    AlertRequest, ChannelResult, NotificationGateway, NotificationRecord, RemoteRecord, RemoteStore,
};
use crate::storage::{DeliveryLogEntry, Storage};

const DEFAULT_MESSAGE: &str = "I need help.";

/// Outcome for one recipient.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecipientOutcome {
    /// Recipient contact id.
    pub contact_id: String,
    /// Channels that accepted the message.
    pub channels: ChannelResult,
    /// Error text if the gateway call itself failed.
    pub error: Option<String>,
}

/// Outcome of one dispatch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DispatchReport {
    /// Alert (or share) id.
    pub alert_id: String,
    /// One entry per recipient, in recipient order.
    pub recipients: Vec<RecipientOutcome>,
}

impl DispatchReport {
    /// Whether at least one recipient was reached on at least one channel.
    #[must_use]
    pub fn delivered(&self) -> bool {
        self.reached() > 0
    }

    /// Number of recipients reached.
    #[must_use]
    pub fn reached(&self) -> usize {
        self.recipients.iter().filter(|r| r.channels.any()).count()
    }
}

/// Sends alerts and location shares through the gateway.
pub struct Dispatcher {
    gateway: Arc<dyn NotificationGateway>,
    remote: Arc<dyn RemoteStore>,
    storage: Arc<Storage>,
    send_timeout: Duration,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("send_timeout", &self.send_timeout)
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    /// Create a dispatcher whose gateway calls give up after `send_timeout`.
    pub fn new(
        gateway: Arc<dyn NotificationGateway>,
        remote: Arc<dyn RemoteStore>,
        storage: Arc<Storage>,
        send_timeout: Duration,
    ) -> Self {
        Self {
            gateway,
            remote,
            storage,
            send_timeout,
        }
    }

    /// Send a queued alert to its recipient snapshot.
    pub async fn dispatch_alert(&self, alert: &QueuedAlert) -> DispatchReport {
        let message = compose_alert_message(alert.message.as_deref(), alert.location.as_ref());
        let report = self
            .send(
                alert.id.to_string(),
                &alert.owner_user_id,
                &alert.recipients,
                alert.location.as_ref(),
                &message,
            )
            .await;

        info!(
            alert_id = %alert.id,
            reached = report.reached(),
            recipients = report.recipients.len(),
            "Alert dispatched"
        );
        report
    }

    /// Send a location update to `recipients`.
    pub async fn share_location(
        &self,
        user_id: &str,
        recipients: &[Contact],
        location: &GeoSample,
    ) -> DispatchReport {
        let share_id = format!("share-{}", Uuid::new_v4());
        let message = format!("Location update: {}", location.map_link());
        let report = self
            .send(share_id, user_id, recipients, Some(location), &message)
            .await;

        debug!(alert_id = %report.alert_id, reached = report.reached(), "Location shared");
        report
    }

    async fn send(
        &self,
        alert_id: String,
        sender_user_id: &str,
        recipients: &[Contact],
        location: Option<&GeoSample>,
        message: &str,
    ) -> DispatchReport {
        let mut outcomes = Vec::with_capacity(recipients.len());

        for recipient in recipients {
            let request = AlertRequest {
                sender_user_id: sender_user_id.to_string(),
                recipient: recipient.clone(),
                location: location.cloned(),
                message: message.to_string(),
            };

            let (channels, error) =
                match tokio::time::timeout(self.send_timeout, self.gateway.send_alert(&request)).await {
                    Ok(Ok(channels)) => (channels, None),
                    Ok(Err(e)) => (ChannelResult::default(), Some(e)),
                    Err(_) => (ChannelResult::default(), Some(Error::timeout("gateway send"))),
                };
            let error = error.map(|e| {
                warn!(%alert_id, contact_id = %recipient.id, error = %e, "Gateway call failed");
                e.to_string()
            });

            let entry = DeliveryLogEntry {
                id: None,
                alert_id: alert_id.clone(),
                contact_id: recipient.id.clone(),
                sms_ok: channels.sms,
                email_ok: channels.email,
                error: error.clone(),
                recorded_at: Utc::now(),
            };
            if let Err(e) = self.storage.record_delivery(&entry) {
                warn!(%alert_id, error = %e, "Failed to record delivery");
            }

            if error.is_none() {
                self.record_remote(NotificationRecord {
                    alert_id: alert_id.clone(),
                    contact_id: recipient.id.clone(),
                    sms_ok: channels.sms,
                    email_ok: channels.email,
                });
            }

            outcomes.push(RecipientOutcome {
                contact_id: recipient.id.clone(),
                channels,
                error,
            });
        }

        DispatchReport {
            alert_id,
            recipients: outcomes,
        }
    }

    fn record_remote(&self, record: NotificationRecord) {
        let remote = Arc::clone(&self.remote);
        let timeout = self.send_timeout;
        tokio::spawn(async move {
            let record = RemoteRecord::Notification(record);
            match tokio::time::timeout(timeout, remote.insert(&record)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(error = %e, "Failed to record notification remotely"),
                Err(_) => warn!("Timed out recording notification remotely"),
            }
        });
    }
}

/// Build the text of an emergency alert.
#[must_use]
pub fn compose_alert_message(message: Option<&str>, location: Option<&GeoSample>) -> String {
    let body = message
        .map(str::trim)
        .filter(|m| !m.is_empty())
        .unwrap_or(DEFAULT_MESSAGE);

    match location {
        Some(sample) => format!(
            "EMERGENCY: {body}\nMy location: {} (accuracy {:.0} m)",
            sample.map_link(),
            sample.accuracy
        ),
        None => format!("EMERGENCY: {body}\nLocation unavailable."),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{contact, settle, FakeGateway, FakeRemote};

    struct Fixture {
        storage: Arc<Storage>,
        gateway: Arc<FakeGateway>,
        remote: Arc<FakeRemote>,
        dispatcher: Dispatcher,
    }

    fn fixture() -> Fixture {
        let storage = Arc::new(Storage::open_in_memory().unwrap());
        let gateway = Arc::new(FakeGateway::default());
        let remote = Arc::new(FakeRemote::default());
        let dispatcher = Dispatcher::new(
            Arc::clone(&gateway) as Arc<dyn NotificationGateway>,
            Arc::clone(&remote) as Arc<dyn RemoteStore>,
            Arc::clone(&storage),
            Duration::from_secs(12),
        );
        Fixture {
            storage,
            gateway,
            remote,
            dispatcher,
        }
    }

    #[test]
    fn test_compose_with_location() {
        let sample = GeoSample::new(40.4168, -3.7038, 12.0);
        let text = compose_alert_message(Some("Car accident"), Some(&sample));
        assert!(text.starts_with("EMERGENCY: Car accident"));
        assert!(text.contains("https://maps.google.com/?q=40.416800,-3.703800"));
        assert!(text.contains("accuracy 12 m"));
    }

    #[test]
    fn test_compose_without_location_or_message() {
        let text = compose_alert_message(Some("   "), None);
        assert_eq!(text, "EMERGENCY: I need help.\nLocation unavailable.");
    }

    #[tokio::test]
    async fn test_dispatch_reaches_every_recipient() {
        let f = fixture();
        let alert = QueuedAlert::new("u1", None, vec![contact("c1"), contact("c2")], None);

        let report = f.dispatcher.dispatch_alert(&alert).await;
        assert!(report.delivered());
        assert_eq!(report.reached(), 2);
        assert_eq!(f.gateway.sent_to(), vec!["c1".to_string(), "c2".to_string()]);

        let log = f.storage.deliveries(Some(alert.id.to_string().as_str()), 10).unwrap();
        assert_eq!(log.len(), 2);
        assert!(log.iter().all(DeliveryLogEntry::reached));
    }

    #[tokio::test]
    async fn test_partial_delivery_counts_as_delivered() {
        let f = fixture();
        f.gateway.reject("c1");
        let alert = QueuedAlert::new("u1", None, vec![contact("c1"), contact("c2")], None);

        let report = f.dispatcher.dispatch_alert(&alert).await;
        assert!(report.delivered());
        assert_eq!(report.reached(), 1);
    }

    #[tokio::test]
    async fn test_unreachable_gateway_is_not_delivered() {
        let f = fixture();
        f.gateway.set_unreachable(true);
        let alert = QueuedAlert::new("u1", None, vec![contact("c1")], None);

        let report = f.dispatcher.dispatch_alert(&alert).await;
        assert!(!report.delivered());
        assert!(report.recipients[0].error.is_some());

        let log = f.storage.deliveries(None, 10).unwrap();
        assert_eq!(log.len(), 1);
        assert!(log[0].error.is_some());
    }

    #[tokio::test]
    async fn test_no_recipients_is_not_delivered() {
        let f = fixture();
        let alert = QueuedAlert::new("u1", None, Vec::new(), None);

        assert!(!f.dispatcher.dispatch_alert(&alert).await.delivered());
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_gateway_times_out() {
        let f = fixture();
        f.gateway.set_delay(Duration::from_secs(60));
        let alert = QueuedAlert::new("u1", None, vec![contact("c1")], None);

        let report = f.dispatcher.dispatch_alert(&alert).await;
        assert!(!report.delivered());
        assert!(report.recipients[0]
            .error
            .as_deref()
            .unwrap()
            .contains("timed out"));
    }

    #[tokio::test]
    async fn test_notifications_recorded_remotely() {
        let f = fixture();
        let alert = QueuedAlert::new("u1", None, vec![contact("c1")], None);
        f.dispatcher.dispatch_alert(&alert).await;
        settle().await;

        let kinds: Vec<&str> = f.remote.inserted().iter().map(RemoteRecord::kind).collect();
        assert_eq!(kinds, vec!["notification"]);
    }

    #[tokio::test]
    async fn test_share_location_uses_update_text() {
        let f = fixture();
        let sample = GeoSample::new(1.0, 2.0, 3.0);
        let report = f
            .dispatcher
            .share_location("u1", &[contact("c1")], &sample)
            .await;

        assert!(report.alert_id.starts_with("share-"));
        let messages = f.gateway.messages();
        assert!(messages[0].starts_with("Location update: https://maps.google.com/"));
    }
}
