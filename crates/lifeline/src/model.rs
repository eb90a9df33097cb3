//! Core data types for lifeline.
//!
//! These are the records that live in local storage and flow between the
//! cache, the outbox and the tracker. Anything arriving from the remote
//! store is validated here before it is allowed in.

use std::sync::OnceLock;

use chrono::{DateTime, Duration, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

/// An emergency contact.
///
/// Queued alerts store their own copies, so later edits to the live
/// contact list never change an alert that is already waiting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contact {
    /// Remote identifier.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Phone number used for SMS.
    pub phone_number: String,
    /// Optional email address.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    /// Optional relationship label ("sister", "neighbour", ...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relationship: Option<String>,
}

/// A contact row as the remote store hands it over, before validation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContactRecord {
    /// Remote identifier.
    pub id: Option<String>,
    /// Display name.
    pub name: Option<String>,
    /// Phone number.
    pub phone_number: Option<String>,
    /// Email address.
    pub email: Option<String>,
    /// Relationship label.
    pub relationship: Option<String>,
}

fn phone_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^\+?[0-9][0-9 ()\-]{5,19}$").expect("Invalid regex pattern"))
}

fn email_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").expect("Invalid regex pattern"))
}

/// Trim a field and turn blanks into `None`.
fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

impl TryFrom<ContactRecord> for Contact {
    type Error = Error;

    fn try_from(record: ContactRecord) -> Result<Self> {
        let id = non_blank(record.id).ok_or_else(|| Error::invalid_record("contact", "missing id"))?;
        let name = non_blank(record.name)
            .ok_or_else(|| Error::invalid_record("contact", format!("{id}: missing name")))?;
        let phone_number = non_blank(record.phone_number).ok_or_else(|| {
            Error::invalid_record("contact", format!("{id}: missing phone number"))
        })?;
        if !phone_pattern().is_match(&phone_number) {
            return Err(Error::invalid_record(
                "contact",
                format!("{id}: malformed phone number"),
            ));
        }

        let email = non_blank(record.email);
        if let Some(email) = &email {
            if !email_pattern().is_match(email) {
                return Err(Error::invalid_record(
                    "contact",
                    format!("{id}: malformed email"),
                ));
            }
        }

        Ok(Self {
            id,
            name,
            phone_number,
            email,
            relationship: non_blank(record.relationship),
        })
    }
}

/// A single position fix.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeoSample {
    /// Latitude in degrees.
    pub latitude: f64,
    /// Longitude in degrees.
    pub longitude: f64,
    /// Horizontal accuracy in metres.
    pub accuracy: f64,
    /// When the fix was taken.
    pub captured_at: DateTime<Utc>,
    /// Ground speed in m/s, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed: Option<f64>,
    /// Heading in degrees from true north, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heading: Option<f64>,
}

impl GeoSample {
    /// Create a sample captured now, without speed or heading.
    #[must_use]
    pub fn new(latitude: f64, longitude: f64, accuracy: f64) -> Self {
        Self {
            latitude,
            longitude,
            accuracy,
            captured_at: Utc::now(),
            speed: None,
            heading: None,
        }
    }

    /// A map link recipients can open.
    #[must_use]
    pub fn map_link(&self) -> String {
        format!(
            "https://maps.google.com/?q={:.6},{:.6}",
            self.latitude, self.longitude
        )
    }
}

/// Delivery state of a queued alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertStatus {
    /// Not yet attempted, or skipped because the device went offline.
    Pending,
    /// Delivered; removed on the next sweep.
    Sent,
    /// Last attempt failed; retried on the next replay.
    Failed,
}

impl std::fmt::Display for AlertStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Sent => write!(f, "sent"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// An emergency alert waiting in the outbox.
///
/// Only `status` changes after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedAlert {
    /// Globally unique identifier.
    pub id: Uuid,
    /// When the alert was raised.
    pub created_at: DateTime<Utc>,
    /// User who raised it.
    pub owner_user_id: String,
    /// Where the user was, if known.
    pub location: Option<GeoSample>,
    /// Snapshot of recipients at enqueue time.
    pub recipients: Vec<Contact>,
    /// Free-text message from the user.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Delivery state.
    pub status: AlertStatus,
}

impl QueuedAlert {
    /// Create a pending alert stamped now with a fresh id.
    #[must_use]
    pub fn new(
        owner_user_id: impl Into<String>,
        location: Option<GeoSample>,
        recipients: Vec<Contact>,
        message: Option<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            created_at: Utc::now(),
            owner_user_id: owner_user_id.into(),
            location,
            recipients,
            message,
            status: AlertStatus::Pending,
        }
    }

    /// Whether the alert is older than `max_age` at `now`.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>, max_age: Duration) -> bool {
        now - self.created_at > max_age
    }
}

/// The locally cached contact list of one user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedContactSet {
    /// User the contacts belong to.
    pub owner_user_id: String,
    /// Contacts in remote order.
    pub contacts: Vec<Contact>,
    /// When the set was fetched.
    pub cached_at: DateTime<Utc>,
}

impl CachedContactSet {
    /// Whether this set may be served to `user_id` at `now`.
    #[must_use]
    pub fn is_valid_for(&self, user_id: &str, now: DateTime<Utc>, ttl: Duration) -> bool {
        self.owner_user_id == user_id && now - self.cached_at < ttl
    }
}

/// Persisted description of the active tracking session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackingSessionDescriptor {
    /// Session identifier.
    pub session_id: Uuid,
    /// User being tracked.
    pub owner_user_id: String,
    /// When tracking started.
    pub started_at: DateTime<Utc>,
    /// Whether the session is still running.
    pub is_active: bool,
}
