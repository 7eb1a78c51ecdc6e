//! Fire-and-forget notification fan-out.
//!
//! The session publishes device facts (battery, reservoir, bolus state,
//! recommends-loop, errors, fresh glucose) without knowing who consumes them.
//! Delivery is best-effort over a tokio broadcast channel: no subscribers and
//! lagged subscribers are both fine, and nothing blocks the publisher.

use crate::model::{Battery, GlucoseSample};
use std::sync::Arc;
use tokio::sync::broadcast;

/// Observer-facing notification kinds.
#[derive(Debug, Clone)]
pub enum DeviceNotification {
    PumpBatteryChanged(Battery),
    PumpReservoirChanged(f64),
    /// The pump asks the dosing algorithm to run now.
    RecommendsLoop,
    BolusInProgress(bool),
    /// Transient device error, surfaced for presentation. No corrective
    /// action is taken here.
    PumpError(String),
    /// A deduplicated, time-ordered batch from the direct-sensor path.
    GlucosePublished(Arc<Vec<GlucoseSample>>),
}

/// Broadcast hub. Cheap to clone; all clones share one channel.
#[derive(Debug, Clone)]
pub struct Broadcaster {
    tx: broadcast::Sender<DeviceNotification>,
}

impl Broadcaster {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Fan out to current subscribers. A send with zero subscribers is not
    /// an error.
    pub fn notify(&self, notification: DeviceNotification) {
        let _ = self.tx.send(notification);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DeviceNotification> {
        self.tx.subscribe()
    }
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new(64)
    }
}
