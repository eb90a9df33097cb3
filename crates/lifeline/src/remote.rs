//! Seams to the external collaborators.
//!
//! The remote database, the notification gateway and the position sensor
//! live outside this crate. These traits describe exactly what lifeline
//! consumes from them; the application root supplies implementations.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::{PositionError, Result};
use crate::model::{Contact, ContactRecord, GeoSample};

/// A row written to the remote store.
///
/// Every write is one of these tagged variants; nothing untyped crosses
/// the boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RemoteRecord {
    /// A user profile created during signup.
    Profile(ProfileRecord),
    /// An SOS incident.
    Incident(IncidentRecord),
    /// One position sample from an active session.
    LocationLog(LocationLogRecord),
    /// End of a tracking session.
    SessionEnd(SessionEndRecord),
    /// Outcome of one notification to one recipient.
    Notification(NotificationRecord),
}

impl RemoteRecord {
    /// Short name of the variant, for logs.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Profile(_) => "profile",
            Self::Incident(_) => "incident",
            Self::LocationLog(_) => "location_log",
            Self::SessionEnd(_) => "session_end",
            Self::Notification(_) => "notification",
        }
    }
}

/// Profile row payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileRecord {
    /// Identity-provider user id.
    pub user_id: String,
    /// Display name.
    pub full_name: String,
    /// Phone number, if given at signup.
    pub phone_number: Option<String>,
}

/// Incident row payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncidentRecord {
    /// Local alert id.
    pub alert_id: Uuid,
    /// User who raised the SOS.
    pub user_id: String,
    /// Location at trigger time.
    pub location: Option<GeoSample>,
    /// User message.
    pub message: Option<String>,
    /// Trigger time.
    pub created_at: DateTime<Utc>,
}

/// Location log row payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationLogRecord {
    /// Tracking session id.
    pub session_id: Uuid,
    /// Tracked user.
    pub user_id: String,
    /// The sample.
    pub sample: GeoSample,
}

/// Session end row payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionEndRecord {
    /// Tracking session id.
    pub session_id: Uuid,
    /// Tracked user.
    pub user_id: String,
    /// When the session ended.
    pub ended_at: DateTime<Utc>,
    /// Samples processed during the session.
    pub samples: u64,
}

/// Notification row payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationRecord {
    /// Alert (or share) id.
    pub alert_id: String,
    /// Recipient contact id.
    pub contact_id: String,
    /// SMS accepted.
    pub sms_ok: bool,
    /// Email accepted.
    pub email_ok: bool,
}

/// The remote relational store.
#[async_trait::async_trait]
pub trait RemoteStore: Send + Sync {
    /// Fetch the raw contact rows of a user.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be reached or rejects the query.
    async fn fetch_contacts(&self, user_id: &str) -> Result<Vec<ContactRecord>>;

    /// Insert one record.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be reached or rejects the row.
    async fn insert(&self, record: &RemoteRecord) -> Result<()>;
}

/// One message to one recipient.
#[derive(Debug, Clone, PartialEq)]
pub struct AlertRequest {
    /// Who raised the alert.
    pub sender_user_id: String,
    /// Who receives it.
    pub recipient: Contact,
    /// Position to include, if any.
    pub location: Option<GeoSample>,
    /// Fully composed message text.
    pub message: String,
}

/// Per-channel outcome reported by the gateway.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelResult {
    /// SMS accepted.
    pub sms: bool,
    /// Email accepted.
    pub email: bool,
}

impl ChannelResult {
    /// Whether any channel accepted the message.
    #[must_use]
    pub fn any(&self) -> bool {
        self.sms || self.email
    }
}

/// The SMS/email notification gateway.
#[async_trait::async_trait]
pub trait NotificationGateway: Send + Sync {
    /// Send an alert to one recipient.
    ///
    /// The returned flags are taken as ground truth for delivery.
    ///
    /// # Errors
    ///
    /// Returns an error if the gateway could not be reached at all.
    async fn send_alert(&self, request: &AlertRequest) -> Result<ChannelResult>;
}

/// Options for a position request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchOptions {
    /// Ask for GPS-grade accuracy.
    pub high_accuracy: bool,
    /// Give up on a fix after this long.
    pub timeout: Duration,
    /// Accept a cached fix up to this old.
    pub maximum_age: Duration,
}

/// Identifier of a running position subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WatchId(pub u64);

/// Event delivered by a position subscription.
pub type PositionEvent = std::result::Result<GeoSample, PositionError>;

/// A running position subscription.
#[derive(Debug)]
pub struct PositionWatch {
    /// Id to pass to [`PositionSource::clear_watch`].
    pub id: WatchId,
    /// Samples and errors, in arrival order.
    pub events: mpsc::Receiver<PositionEvent>,
}

/// The platform position sensor.
#[async_trait::async_trait]
pub trait PositionSource: Send + Sync {
    /// Open a continuous subscription.
    ///
    /// # Errors
    ///
    /// Returns [`PositionError::PermissionDenied`] if location access is
    /// refused, or another error if the subscription cannot start.
    fn watch(&self, options: WatchOptions) -> std::result::Result<PositionWatch, PositionError>;

    /// Cancel a subscription. Unknown ids are ignored.
    fn clear_watch(&self, id: WatchId);

    /// Take a single fix.
    ///
    /// # Errors
    ///
    /// Returns the sensor's error if no fix can be taken.
    async fn current_position(
        &self,
        options: WatchOptions,
    ) -> std::result::Result<GeoSample, PositionError>;
}
