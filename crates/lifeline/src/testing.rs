//! In-memory collaborators for tests.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;

use crate::connectivity::ConnectivityMonitor;
use crate::error::{Error, PositionError, Result};
use crate::model::{Contact, ContactRecord, GeoSample};
use crate::remote::{
    AlertRequest, ChannelResult, NotificationGateway, PositionEvent, PositionSource, PositionWatch,
    RemoteRecord, RemoteStore, WatchId, WatchOptions,
};
use crate::storage::Storage;

/// A valid contact with id `id`.
pub fn contact(id: &str) -> Contact {
    Contact {
        id: id.to_string(),
        name: format!("Contact {id}"),
        phone_number: "+15551234567".to_string(),
        email: Some(format!("{id}@example.com")),
        relationship: None,
    }
}

/// A valid raw contact row with id `id`.
pub fn contact_record(id: &str) -> ContactRecord {
    let contact = contact(id);
    ContactRecord {
        id: Some(contact.id),
        name: Some(contact.name),
        phone_number: Some(contact.phone_number),
        email: contact.email,
        relationship: None,
    }
}

/// A monitor whose link state follows the returned flag.
pub fn online_monitor(
    online: bool,
    storage: Arc<Storage>,
) -> (Arc<AtomicBool>, Arc<ConnectivityMonitor>) {
    let link = Arc::new(AtomicBool::new(online));
    let probe_link = Arc::clone(&link);
    let monitor = ConnectivityMonitor::new(
        Box::new(move || probe_link.load(Ordering::SeqCst)),
        storage,
    );
    (link, Arc::new(monitor))
}

/// Let spawned tasks run until they block.
pub async fn settle() {
    for _ in 0..50 {
        tokio::task::yield_now().await;
    }
}

#[derive(Default)]
pub struct FakeRemote {
    contacts: Mutex<HashMap<String, Vec<ContactRecord>>>,
    fail_fetches: AtomicBool,
    fetch_delay: Mutex<Option<Duration>>,
    fetch_calls: AtomicU32,
    inserted: Mutex<Vec<RemoteRecord>>,
    failing_inserts: AtomicU32,
    insert_delay: Mutex<Option<Duration>>,
    insert_calls: AtomicU32,
}

impl FakeRemote {
    pub fn set_contacts(&self, user_id: &str, records: Vec<ContactRecord>) {
        self.contacts
            .lock()
            .unwrap()
            .insert(user_id.to_string(), records);
    }

    pub fn fail_fetches(&self, fail: bool) {
        self.fail_fetches.store(fail, Ordering::SeqCst);
    }

    pub fn set_fetch_delay(&self, delay: Duration) {
        *self.fetch_delay.lock().unwrap() = Some(delay);
    }

    pub fn fetch_calls(&self) -> u32 {
        self.fetch_calls.load(Ordering::SeqCst)
    }

    /// Fail the next `count` inserts.
    pub fn fail_next_inserts(&self, count: u32) {
        self.failing_inserts.store(count, Ordering::SeqCst);
    }

    pub fn set_insert_delay(&self, delay: Duration) {
        *self.insert_delay.lock().unwrap() = Some(delay);
    }

    pub fn insert_calls(&self) -> u32 {
        self.insert_calls.load(Ordering::SeqCst)
    }

    /// Records that were successfully inserted, in order.
    pub fn inserted(&self) -> Vec<RemoteRecord> {
        self.inserted.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl RemoteStore for FakeRemote {
    async fn fetch_contacts(&self, user_id: &str) -> Result<Vec<ContactRecord>> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.fetch_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_fetches.load(Ordering::SeqCst) {
            return Err(Error::remote("fetch refused"));
        }
        Ok(self
            .contacts
            .lock()
            .unwrap()
            .get(user_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn insert(&self, record: &RemoteRecord) -> Result<()> {
        self.insert_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.insert_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let failing = self
            .failing_inserts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(Error::remote("insert refused"));
        }
        self.inserted.lock().unwrap().push(record.clone());
        Ok(())
    }
}

type SendHook = Box<dyn Fn() + Send + Sync>;

#[derive(Default)]
pub struct FakeGateway {
    requests: Mutex<Vec<AlertRequest>>,
    rejected: Mutex<HashSet<String>>,
    unreachable: AtomicBool,
    delay: Mutex<Option<Duration>>,
    hook: Mutex<Option<SendHook>>,
}

impl FakeGateway {
    /// Report both channels as failed for `contact_id`.
    pub fn reject(&self, contact_id: &str) {
        self.rejected.lock().unwrap().insert(contact_id.to_string());
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    /// Run `hook` after every send.
    pub fn on_send(&self, hook: impl Fn() + Send + Sync + 'static) {
        *self.hook.lock().unwrap() = Some(Box::new(hook));
    }

    /// Recipient ids of every request, in order.
    pub fn sent_to(&self) -> Vec<String> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .map(|r| r.recipient.id.clone())
            .collect()
    }

    /// Message text of every request, in order.
    pub fn messages(&self) -> Vec<String> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .map(|r| r.message.clone())
            .collect()
    }
}

#[async_trait::async_trait]
impl NotificationGateway for FakeGateway {
    async fn send_alert(&self, request: &AlertRequest) -> Result<ChannelResult> {
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(Error::gateway("gateway unreachable"));
        }

        self.requests.lock().unwrap().push(request.clone());
        if let Some(hook) = self.hook.lock().unwrap().as_ref() {
            hook();
        }

        if self.rejected.lock().unwrap().contains(&request.recipient.id) {
            Ok(ChannelResult::default())
        } else {
            Ok(ChannelResult {
                sms: true,
                email: request.recipient.email.is_some(),
            })
        }
    }
}

#[derive(Default)]
pub struct FakePositions {
    sender: Mutex<Option<mpsc::Sender<PositionEvent>>>,
    deny: AtomicBool,
    next_id: AtomicU64,
    watch_calls: AtomicU32,
    cleared: Mutex<Vec<WatchId>>,
    fix: Mutex<Option<PositionEvent>>,
}

impl FakePositions {
    pub fn deny_permission(&self, deny: bool) {
        self.deny.store(deny, Ordering::SeqCst);
    }

    /// What `current_position` returns. Unset means unavailable.
    pub fn set_fix(&self, fix: PositionEvent) {
        *self.fix.lock().unwrap() = Some(fix);
    }

    /// Sender of the open watch.
    pub fn sender(&self) -> mpsc::Sender<PositionEvent> {
        self.sender
            .lock()
            .unwrap()
            .clone()
            .expect("no open watch")
    }

    /// Deliver one event on the open watch.
    pub async fn emit(&self, event: PositionEvent) {
        self.sender().send(event).await.expect("watch receiver dropped");
    }

    pub fn watch_calls(&self) -> u32 {
        self.watch_calls.load(Ordering::SeqCst)
    }

    pub fn cleared(&self) -> Vec<WatchId> {
        self.cleared.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl PositionSource for FakePositions {
    fn watch(&self, _options: WatchOptions) -> std::result::Result<PositionWatch, PositionError> {
        self.watch_calls.fetch_add(1, Ordering::SeqCst);
        if self.deny.load(Ordering::SeqCst) {
            return Err(PositionError::PermissionDenied);
        }
        let (tx, rx) = mpsc::channel(256);
        *self.sender.lock().unwrap() = Some(tx);
        Ok(PositionWatch {
            id: WatchId(self.next_id.fetch_add(1, Ordering::SeqCst)),
            events: rx,
        })
    }

    fn clear_watch(&self, id: WatchId) {
        self.cleared.lock().unwrap().push(id);
        self.sender.lock().unwrap().take();
    }

    async fn current_position(
        &self,
        _options: WatchOptions,
    ) -> std::result::Result<GeoSample, PositionError> {
        if self.deny.load(Ordering::SeqCst) {
            return Err(PositionError::PermissionDenied);
        }
        self.fix
            .lock()
            .unwrap()
            .clone()
            .unwrap_or(Err(PositionError::PositionUnavailable))
    }
}
