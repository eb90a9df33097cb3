//! Network reachability tracking.
//!
//! The device is online when the platform reports a live link and the user
//! has not forced offline mode. Listeners hear about each edge exactly once.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::scheduler::{ScheduledTask, TickControl};
use crate::storage::{keys, Storage};

/// Reports whether the platform currently has a usable network link.
pub trait ConnectivityProbe: Send + Sync {
    /// Sample the link state now.
    fn is_up(&self) -> bool;
}

impl<F> ConnectivityProbe for F
where
    F: Fn() -> bool + Send + Sync,
{
    fn is_up(&self) -> bool {
        self()
    }
}

/// A change in the derived online state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Offline to online.
    WentOnline,
    /// Online to offline.
    WentOffline,
}

type Listener = Box<dyn Fn(Transition) + Send + Sync>;

/// Tracks the online state and notifies listeners on edges.
pub struct ConnectivityMonitor {
    probe: Box<dyn ConnectivityProbe>,
    storage: Arc<Storage>,
    live: AtomicBool,
    offline_mode: AtomicBool,
    // Last state announced to listeners. Held while firing so edges stay ordered.
    announced: Mutex<bool>,
    listeners: Mutex<Vec<Listener>>,
}

impl std::fmt::Debug for ConnectivityMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectivityMonitor")
            .field("live", &self.live.load(Ordering::SeqCst))
            .field("offline_mode", &self.offline_mode.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl ConnectivityMonitor {
    /// Create a monitor, sampling the probe and the persisted offline flag.
    pub fn new(probe: Box<dyn ConnectivityProbe>, storage: Arc<Storage>) -> Self {
        let offline_mode = match storage.get_json::<bool>(keys::OFFLINE_MODE) {
            Ok(flag) => flag.unwrap_or(false),
            Err(e) => {
                warn!(error = %e, "Unreadable offline mode flag; assuming off");
                false
            }
        };
        let live = probe.is_up();

        debug!(live, offline_mode, "Connectivity monitor created");
        Self {
            probe,
            storage,
            live: AtomicBool::new(live),
            offline_mode: AtomicBool::new(offline_mode),
            announced: Mutex::new(live && !offline_mode),
            listeners: Mutex::new(Vec::new()),
        }
    }

    /// Whether the device is currently online.
    #[must_use]
    pub fn is_online(&self) -> bool {
        self.live.load(Ordering::SeqCst) && !self.offline_mode.load(Ordering::SeqCst)
    }

    /// Whether the user has forced offline mode.
    #[must_use]
    pub fn offline_mode(&self) -> bool {
        self.offline_mode.load(Ordering::SeqCst)
    }

    /// Register a listener called once per edge.
    ///
    /// Listeners run inline on the thread that observed the edge and must
    /// not call back into the monitor.
    pub fn on_transition(&self, listener: impl Fn(Transition) + Send + Sync + 'static) {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Box::new(listener));
    }

    /// Register a listener that forwards edges into a channel.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<Transition> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.on_transition(move |transition| {
            let _ = tx.send(transition);
        });
        rx
    }

    /// Force offline mode on or off. The flag survives restarts.
    ///
    /// # Errors
    ///
    /// Returns an error if the flag cannot be persisted; the in-memory
    /// state is left unchanged in that case.
    pub fn set_offline_mode(&self, enabled: bool) -> Result<()> {
        self.storage.put_json(keys::OFFLINE_MODE, &enabled)?;
        self.offline_mode.store(enabled, Ordering::SeqCst);
        info!(enabled, "Offline mode changed");
        self.announce();
        Ok(())
    }

    /// Record a live link event pushed by the platform.
    pub fn report_live(&self, up: bool) {
        self.live.store(up, Ordering::SeqCst);
        self.announce();
    }

    /// Re-sample the probe. Returns the resulting online state.
    pub fn refresh(&self) -> bool {
        self.report_live(self.probe.is_up());
        self.is_online()
    }

    /// Poll the probe every `poll_interval` until the returned task is dropped.
    pub fn run(self: &Arc<Self>, poll_interval: Duration) -> ScheduledTask {
        let monitor = Arc::clone(self);
        ScheduledTask::every("connectivity-poll", poll_interval, move || {
            monitor.refresh();
            std::future::ready(TickControl::Continue)
        })
    }

    fn announce(&self) {
        // Sampled under the lock so a racing update cannot announce a stale state
        let mut announced = self.announced.lock().unwrap_or_else(PoisonError::into_inner);
        let online = self.is_online();
        if *announced == online {
            return;
        }
        *announced = online;

        let transition = if online {
            Transition::WentOnline
        } else {
            Transition::WentOffline
        };
        info!(?transition, "Connectivity changed");

        let listeners = self.listeners.lock().unwrap_or_else(PoisonError::into_inner);
        for listener in listeners.iter() {
            listener(transition);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn monitor_with(link: &Arc<AtomicBool>, storage: Arc<Storage>) -> ConnectivityMonitor {
        let link = Arc::clone(link);
        ConnectivityMonitor::new(Box::new(move || link.load(Ordering::SeqCst)), storage)
    }

    fn storage() -> Arc<Storage> {
        Arc::new(Storage::open_in_memory().unwrap())
    }

    #[test]
    fn test_initial_state_follows_probe() {
        let link = Arc::new(AtomicBool::new(true));
        assert!(monitor_with(&link, storage()).is_online());

        link.store(false, Ordering::SeqCst);
        assert!(!monitor_with(&link, storage()).is_online());
    }

    #[test]
    fn test_listener_fires_once_per_edge() {
        let link = Arc::new(AtomicBool::new(false));
        let monitor = monitor_with(&link, storage());
        let mut rx = monitor.subscribe();

        monitor.refresh();
        monitor.refresh();
        assert!(rx.try_recv().is_err());

        link.store(true, Ordering::SeqCst);
        assert!(monitor.refresh());
        monitor.refresh();
        monitor.report_live(true);

        assert_eq!(rx.try_recv().unwrap(), Transition::WentOnline);
        assert!(rx.try_recv().is_err());

        monitor.report_live(false);
        assert_eq!(rx.try_recv().unwrap(), Transition::WentOffline);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_offline_mode_overrides_live_link() {
        let link = Arc::new(AtomicBool::new(true));
        let monitor = monitor_with(&link, storage());
        let mut rx = monitor.subscribe();

        monitor.set_offline_mode(true).unwrap();
        assert!(!monitor.is_online());
        assert!(monitor.offline_mode());
        assert_eq!(rx.try_recv().unwrap(), Transition::WentOffline);

        monitor.refresh();
        assert!(!monitor.is_online());

        monitor.set_offline_mode(false).unwrap();
        assert!(monitor.is_online());
        assert_eq!(rx.try_recv().unwrap(), Transition::WentOnline);
    }

    #[test]
    fn test_offline_mode_is_persisted() {
        let link = Arc::new(AtomicBool::new(true));
        let storage = storage();

        monitor_with(&link, Arc::clone(&storage))
            .set_offline_mode(true)
            .unwrap();

        let reopened = monitor_with(&link, storage);
        assert!(reopened.offline_mode());
        assert!(!reopened.is_online());
    }

    #[test]
    fn test_malformed_offline_flag_defaults_off() {
        let link = Arc::new(AtomicBool::new(true));
        let storage = storage();
        storage.put_json(keys::OFFLINE_MODE, &"yes please").unwrap();

        let monitor = monitor_with(&link, storage);
        assert!(!monitor.offline_mode());
        assert!(monitor.is_online());
    }

    #[test]
    fn test_every_listener_is_called() {
        let link = Arc::new(AtomicBool::new(false));
        let monitor = monitor_with(&link, storage());
        let calls = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let calls = Arc::clone(&calls);
            monitor.on_transition(move |_| {
                calls.fetch_add(1, Ordering::SeqCst);
            });
        }

        monitor.report_live(true);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_racing_updates_keep_edges_in_step() {
        let link = Arc::new(AtomicBool::new(true));
        let monitor = monitor_with(&link, storage());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        monitor.on_transition(move |t| sink.lock().unwrap().push(t));

        std::thread::scope(|scope| {
            scope.spawn(|| {
                for i in 0..500 {
                    monitor.report_live(i % 2 == 0);
                }
            });
            scope.spawn(|| {
                for i in 0..200 {
                    monitor.set_offline_mode(i % 2 == 0).unwrap();
                }
            });
        });

        monitor.set_offline_mode(false).unwrap();
        monitor.report_live(true);
        assert!(monitor.is_online());

        let edges = seen.lock().unwrap().clone();
        assert!(edges.windows(2).all(|pair| pair[0] != pair[1]));
        if let Some(last) = edges.last() {
            assert_eq!(*last, Transition::WentOnline);
        }

        seen.lock().unwrap().clear();
        monitor.set_offline_mode(true).unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![Transition::WentOffline]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_polls_probe() {
        let link = Arc::new(AtomicBool::new(false));
        let monitor = Arc::new(monitor_with(&link, storage()));
        let mut rx = monitor.subscribe();
        let _poll = monitor.run(Duration::from_secs(5));

        link.store(true, Ordering::SeqCst);
        assert!(!monitor.is_online());

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(monitor.is_online());
        assert_eq!(rx.recv().await, Some(Transition::WentOnline));
    }
}
