//! Cancellable periodic tasks.
//!
//! Replaces ad hoc sleep loops for the dead-letter sweep, link polling and
//! auto-share. A task is cancelled cooperatively: the flag is checked at
//! the top of each tick, so a tick that has already started runs to
//! completion.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, trace};

/// What a tick wants to happen next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickControl {
    /// Keep the schedule running.
    Continue,
    /// End the schedule after this tick.
    Stop,
}

#[derive(Debug, Default)]
struct Shared {
    cancelled: AtomicBool,
    wake: Notify,
}

/// A running periodic task.
///
/// Dropping the handle cancels the task.
#[derive(Debug)]
pub struct ScheduledTask {
    shared: Arc<Shared>,
    join: Option<JoinHandle<()>>,
}

impl ScheduledTask {
    /// Run `tick` every `period`, starting one period from now.
    ///
    /// Must be called from within a tokio runtime.
    pub fn every<F, Fut>(name: &'static str, period: Duration, mut tick: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = TickControl> + Send + 'static,
    {
        let shared = Arc::new(Shared::default());
        let task_shared = Arc::clone(&shared);

        let join = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    () = task_shared.wake.notified() => {}
                }

                if task_shared.cancelled.load(Ordering::SeqCst) {
                    debug!(task = name, "Scheduled task cancelled");
                    break;
                }

                trace!(task = name, "Scheduled task tick");
                if tick().await == TickControl::Stop {
                    debug!(task = name, "Scheduled task stopped itself");
                    break;
                }
            }
        });

        debug!(task = name, period_ms = period.as_millis(), "Scheduled task started");
        Self {
            shared,
            join: Some(join),
        }
    }

    /// Ask the task to stop before its next tick.
    pub fn cancel(&self) {
        self.shared.cancelled.store(true, Ordering::SeqCst);
        self.shared.wake.notify_one();
    }

    /// Whether the task has exited.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.join.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Wait for the task to exit. Returns at once if it was already joined.
    pub async fn join(&mut self) {
        if let Some(join) = self.join.take() {
            let _ = join.await;
        }
    }
}

impl Drop for ScheduledTask {
    fn drop(&mut self) {
        self.cancel();
    }
}
