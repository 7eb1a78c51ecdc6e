//! Device-manager capability traits.
//!
//! Vendor pump and CGM drivers satisfy these small contracts instead of a
//! monolithic device trait. The orchestration layer only ever talks to the
//! traits; driver internals (Bluetooth sessions, retry policy) stay behind
//! them.
//!
//! Delegate fan-out from a driver is modeled as an inbound message channel:
//! the session hands each active manager an mpsc sender, and every vendor
//! event becomes a tagged callback variant consumed in arrival order on the
//! session's single worker task. Request/response callbacks carry a oneshot
//! reply channel because the originating vendor call is not guaranteed to be
//! synchronous.

use crate::model::{
    BolusProgress, PodStatus, PumpEvent, PumpStatus, RawSensorReading, ReservoirReading, Trend,
};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot, watch};

/// Opaque manager-defined serialized state.
pub type RawState = serde_json::Value;

/// Common surface of any device manager.
pub trait DeviceManager: Send + Sync {
    /// Stable family identifier, used as the registry key.
    fn manager_identifier(&self) -> &'static str;

    /// Serialize enough state to reconstruct this instance after restart.
    fn raw_state(&self) -> RawState;

    /// Localized display name.
    fn localized_title(&self) -> String;

    /// Small icon name for display state, if the family ships one.
    fn small_image(&self) -> Option<String> {
        None
    }
}

/// Events a pump driver delivers to its delegate.
#[derive(Debug)]
pub enum PumpCallback {
    /// Pump status changed (bolus state, battery, pod telemetry).
    StatusUpdated(PumpStatus),
    /// Internal raw state changed; the session re-persists it.
    StateUpdated,
    /// Fresh history events read from the pump. The completion channel is
    /// answered once the events are durably stored.
    NewPumpEvents {
        events: Vec<PumpEvent>,
        completion: oneshot::Sender<Result<(), String>>,
    },
    /// The driver adjusted the pump clock by this many seconds.
    ClockDriftAdjusted { adjustment_secs: f64 },
    /// A reservoir reading; the reply reports the stored record.
    ReservoirReading {
        units: f64,
        at: DateTime<Utc>,
        completion: oneshot::Sender<Result<ReservoirReading, String>>,
    },
    /// The driver asks how far back to look for new events.
    StartDateForNewEvents(oneshot::Sender<DateTime<Utc>>),
    /// The pump asks for a dosing-algorithm run now.
    RecommendsLoop,
    /// Operational error during polling or bolusing.
    DidError(String),
    /// The pump is about to deactivate; the session clears it.
    WillDeactivate,
}

/// Events a CGM driver delivers to its delegate.
#[derive(Debug)]
pub enum CgmCallback {
    /// New sensor readings, unordered.
    NewReadings(Vec<RawSensorReading>),
    /// Sensor status changed (logged only at this layer).
    StatusUpdated,
    /// Internal raw state changed; the session re-persists it.
    StateUpdated,
    /// The driver asks where new data should start.
    StartDateForNewData(oneshot::Sender<DateTime<Utc>>),
    /// The driver asks for its credential storage prefix.
    CredentialStoragePrefix(oneshot::Sender<String>),
    /// The sensor wants to be removed; the session clears it.
    WantsDeletion,
}

/// An insulin pump driver.
#[async_trait]
pub trait PumpManager: DeviceManager {
    /// Point delegate callbacks at the session. Called on every activation.
    fn set_delegate(&mut self, delegate: mpsc::Sender<PumpCallback>);

    /// Ask the pump for fresh data now. Fire-and-forget from the caller's
    /// perspective; results arrive as delegate callbacks.
    async fn ensure_current_data(&self) -> Result<()>;

    /// Pod/cartridge telemetry for pod-style pumps.
    fn pod_status(&self) -> Option<PodStatus> {
        None
    }

    /// Progress reporter for a bolus in flight, if one is running.
    fn create_bolus_progress_reporter(&self) -> Option<watch::Receiver<BolusProgress>> {
        None
    }
}

/// A continuous glucose monitor driver.
#[async_trait]
pub trait CgmManager: DeviceManager {
    /// Point delegate callbacks at the session. Called on every activation.
    fn set_delegate(&mut self, delegate: mpsc::Sender<CgmCallback>);

    /// Whether published batches should be mirrored to the remote service.
    fn should_sync_to_remote_service(&self) -> bool {
        false
    }

    /// Trend reported for the sensor's most recent reading, if known.
    fn glucose_display_trend(&self) -> Option<Trend> {
        None
    }
}
