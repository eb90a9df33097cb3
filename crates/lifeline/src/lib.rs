//! `lifeline` - Offline-first durability and sync for emergency alerts
//!
//! This library keeps SOS alerts, emergency contacts and location history
//! usable when the network is gone, and delivers queued alerts at least
//! once when it comes back.

#![warn(missing_docs)]
#![warn(missing_debug_implementations)]
#![deny(unsafe_code)]

pub mod cli;
pub mod config;
pub mod connectivity;
pub mod contacts;
pub mod context;
pub mod dispatch;
pub mod error;
pub mod logging;
pub mod model;
pub mod outbox;
pub mod remote;
pub mod retry;
pub mod scheduler;
pub mod storage;
pub mod sync;
pub mod tracker;

#[cfg(test)]
pub(crate) mod testing;

pub use config::Config;
pub use connectivity::{ConnectivityMonitor, ConnectivityProbe, Transition};
pub use contacts::ContactCache;
pub use context::{BackgroundTasks, Collaborators, EmergencyContext, SosOutcome};
pub use dispatch::{DispatchReport, Dispatcher};
pub use error::{Error, PositionError, Result};
pub use logging::init_logging;
pub use model::{AlertStatus, Contact, GeoSample, QueuedAlert};
pub use outbox::AlertOutbox;
pub use retry::{RetryableWriter, WriteOutcome};
pub use scheduler::{ScheduledTask, TickControl};
pub use storage::{Storage, StorageStats};
pub use sync::{ReplayOutcome, ReplayReport, SyncCoordinator};
pub use tracker::LocationTracker;
