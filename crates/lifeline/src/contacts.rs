//! Offline-readable cache of a user's emergency contacts.
//!
//! Online reads go to the remote store and refresh the cache; offline
//! reads, and online reads whose fetch fails, are served from the cache
//! when it belongs to the same user and is younger than the TTL. Every
//! failure degrades to an empty list.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::connectivity::ConnectivityMonitor;
use crate::error::{Error, Result};
use crate::model::{CachedContactSet, Contact, ContactRecord};
use crate::remote::RemoteStore;
use crate::storage::{keys, Storage};

/// Contact reads with an offline fallback.
pub struct ContactCache {
    storage: Arc<Storage>,
    remote: Arc<dyn RemoteStore>,
    connectivity: Arc<ConnectivityMonitor>,
    ttl: chrono::Duration,
    fetch_timeout: Duration,
}

impl std::fmt::Debug for ContactCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContactCache")
            .field("ttl", &self.ttl)
            .field("fetch_timeout", &self.fetch_timeout)
            .finish_non_exhaustive()
    }
}

impl ContactCache {
    /// Create a cache.
    pub fn new(
        storage: Arc<Storage>,
        remote: Arc<dyn RemoteStore>,
        connectivity: Arc<ConnectivityMonitor>,
        ttl: chrono::Duration,
        fetch_timeout: Duration,
    ) -> Self {
        Self {
            storage,
            remote,
            connectivity,
            ttl,
            fetch_timeout,
        }
    }

    /// Contacts of `user_id`, or an empty list if none can be found.
    pub async fn get(&self, user_id: &str) -> Vec<Contact> {
        if self.connectivity.is_online() {
            match self.fetch_remote(user_id).await {
                Ok(contacts) => {
                    if let Err(e) = self.put(user_id, contacts.clone()) {
                        warn!(user_id, error = %e, "Failed to refresh contact cache");
                    }
                    return contacts;
                }
                Err(e) => {
                    warn!(user_id, error = %e, "Contact fetch failed; falling back to cache");
                }
            }
        } else {
            debug!(user_id, "Offline; serving contacts from cache");
        }

        self.cached(user_id)
    }

    /// Replace the cached contacts, stamped now.
    ///
    /// # Errors
    ///
    /// Returns an error if the cache cannot be written.
    pub fn put(&self, user_id: &str, contacts: Vec<Contact>) -> Result<()> {
        let set = CachedContactSet {
            owner_user_id: user_id.to_string(),
            contacts,
            cached_at: Utc::now(),
        };
        self.storage.put_json(keys::CONTACT_CACHE, &set)?;
        debug!(user_id, count = set.contacts.len(), "Contact cache updated");
        Ok(())
    }

    /// Cached contacts of `user_id`, without touching the network.
    #[must_use]
    pub fn cached(&self, user_id: &str) -> Vec<Contact> {
        match load_valid(&self.storage, user_id, self.ttl) {
            Ok(Some(set)) => set.contacts,
            Ok(None) => {
                debug!(user_id, "No usable cached contacts");
                Vec::new()
            }
            Err(e) => {
                warn!(user_id, error = %e, "Unreadable contact cache; treating as empty");
                Vec::new()
            }
        }
    }

    /// Drop the cached contacts. Called on sign-out.
    ///
    /// # Errors
    ///
    /// Returns an error if the cache cannot be removed.
    pub fn clear(&self) -> Result<()> {
        if self.storage.remove(keys::CONTACT_CACHE)? {
            info!("Contact cache cleared");
        }
        Ok(())
    }

    async fn fetch_remote(&self, user_id: &str) -> Result<Vec<Contact>> {
        let records = tokio::time::timeout(self.fetch_timeout, self.remote.fetch_contacts(user_id))
            .await
            .map_err(|_| Error::timeout("contact fetch"))??;
        Ok(validate_records(records))
    }
}

/// Read the cached set if it belongs to `user_id` and is within `ttl`.
///
/// # Errors
///
/// Returns an error if the cache is unreadable or malformed.
pub fn load_valid(
    storage: &Storage,
    user_id: &str,
    ttl: chrono::Duration,
) -> Result<Option<CachedContactSet>> {
    let set = storage.get_json::<CachedContactSet>(keys::CONTACT_CACHE)?;
    Ok(set.filter(|set| set.is_valid_for(user_id, Utc::now(), ttl)))
}

/// Keep the well-formed rows, logging the rest.
fn validate_records(records: Vec<ContactRecord>) -> Vec<Contact> {
    records
        .into_iter()
        .filter_map(|record| match Contact::try_from(record) {
            Ok(contact) => Some(contact),
            Err(e) => {
                warn!(error = %e, "Dropping invalid contact row");
                None
            }
        })
        .collect()
}
