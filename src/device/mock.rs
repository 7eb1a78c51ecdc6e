//! Mock device managers.
//!
//! Simulated pump and CGM drivers for testing the orchestration layer and
//! for running the demo binary without physical hardware. Each mock keeps
//! its state behind an `Arc` and hands out a controller so tests can poke
//! the "vendor side" (push readings, fail, deactivate) after the session has
//! taken ownership of the manager itself.

use crate::device::capabilities::{
    CgmCallback, CgmManager, DeviceManager, PumpCallback, PumpManager, RawState,
};
use crate::model::{
    BolusProgress, BolusState, PodStatus, PumpEvent, PumpStatus, RawSensorReading,
    ReservoirReading, Trend,
};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot, watch};

// =============================================================================
// MockPump
// =============================================================================

/// Serializable mock pump state (the "raw state" blob).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MockPumpState {
    pub title: String,
    pub battery_charge: Option<f64>,
    pub pod: Option<PodStatus>,
}

impl Default for MockPumpState {
    fn default() -> Self {
        Self {
            title: "Mock Pump".to_string(),
            battery_charge: Some(0.8),
            pod: None,
        }
    }
}

struct PumpInner {
    state: Mutex<MockPumpState>,
    delegate: Mutex<Option<mpsc::Sender<PumpCallback>>>,
    poll_count: AtomicUsize,
    bolus_tx: watch::Sender<BolusProgress>,
}

/// Simulated insulin pump.
pub struct MockPump {
    inner: Arc<PumpInner>,
}

/// Vendor-side handle for driving a [`MockPump`] after the session owns it.
#[derive(Clone)]
pub struct MockPumpController {
    inner: Arc<PumpInner>,
}

impl MockPump {
    pub const IDENTIFIER: &'static str = "MockPumpManager";

    pub fn new() -> Self {
        Self::with_state(MockPumpState::default())
    }

    pub fn with_state(state: MockPumpState) -> Self {
        let (bolus_tx, _) = watch::channel(BolusProgress {
            delivered_units: 0.0,
            total_units: 0.0,
        });
        Self {
            inner: Arc::new(PumpInner {
                state: Mutex::new(state),
                delegate: Mutex::new(None),
                poll_count: AtomicUsize::new(0),
                bolus_tx,
            }),
        }
    }

    /// Registry constructor.
    pub fn from_raw_state(raw: &RawState) -> Result<Box<dyn PumpManager>> {
        let state: MockPumpState = serde_json::from_value(raw.clone())?;
        Ok(Box::new(Self::with_state(state)))
    }

    pub fn controller(&self) -> MockPumpController {
        MockPumpController {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl Default for MockPump {
    fn default() -> Self {
        Self::new()
    }
}

impl MockPumpController {
    fn delegate(&self) -> Result<mpsc::Sender<PumpCallback>> {
        self.inner
            .delegate
            .lock()
            .map_err(|_| anyhow!("mock pump poisoned"))?
            .clone()
            .ok_or_else(|| anyhow!("mock pump has no delegate"))
    }

    /// Number of `ensure_current_data` polls issued against this pump.
    pub fn poll_count(&self) -> usize {
        self.inner.poll_count.load(Ordering::SeqCst)
    }

    pub fn set_pod(&self, pod: Option<PodStatus>) {
        if let Ok(mut state) = self.inner.state.lock() {
            state.pod = pod;
        }
    }

    pub fn set_battery_charge(&self, charge: Option<f64>) {
        if let Ok(mut state) = self.inner.state.lock() {
            state.battery_charge = charge;
        }
    }

    fn current_status(&self, bolus_state: BolusState) -> PumpStatus {
        let state = self
            .inner
            .state
            .lock()
            .map(|s| s.clone())
            .unwrap_or_default();
        PumpStatus {
            bolus_state,
            battery_charge_remaining: state.battery_charge,
            pod: state.pod,
        }
    }

    /// Deliver a status-updated callback with the current mock state.
    pub async fn send_status(&self, bolus_state: BolusState) -> Result<()> {
        let status = self.current_status(bolus_state);
        self.delegate()?
            .send(PumpCallback::StatusUpdated(status))
            .await
            .map_err(|_| anyhow!("session inbox closed"))
    }

    /// Deliver history events and await the storage acknowledgement.
    pub async fn send_events(&self, events: Vec<PumpEvent>) -> Result<()> {
        let (completion, done) = oneshot::channel();
        self.delegate()?
            .send(PumpCallback::NewPumpEvents { events, completion })
            .await
            .map_err(|_| anyhow!("session inbox closed"))?;
        done.await
            .map_err(|_| anyhow!("completion dropped"))?
            .map_err(|e| anyhow!(e))
    }

    /// Deliver a reservoir reading and await the stored record.
    pub async fn send_reservoir_reading(
        &self,
        units: f64,
        at: DateTime<Utc>,
    ) -> Result<ReservoirReading> {
        let (completion, done) = oneshot::channel();
        self.delegate()?
            .send(PumpCallback::ReservoirReading {
                units,
                at,
                completion,
            })
            .await
            .map_err(|_| anyhow!("session inbox closed"))?;
        done.await
            .map_err(|_| anyhow!("completion dropped"))?
            .map_err(|e| anyhow!(e))
    }

    /// Ask the session how far back to look for new events.
    pub async fn query_events_start_date(&self) -> Result<DateTime<Utc>> {
        let (reply, rx) = oneshot::channel();
        self.delegate()?
            .send(PumpCallback::StartDateForNewEvents(reply))
            .await
            .map_err(|_| anyhow!("session inbox closed"))?;
        rx.await.map_err(|_| anyhow!("reply dropped"))
    }

    pub async fn recommend_loop(&self) -> Result<()> {
        self.delegate()?
            .send(PumpCallback::RecommendsLoop)
            .await
            .map_err(|_| anyhow!("session inbox closed"))
    }

    pub async fn fail(&self, message: &str) -> Result<()> {
        self.delegate()?
            .send(PumpCallback::DidError(message.to_string()))
            .await
            .map_err(|_| anyhow!("session inbox closed"))
    }

    pub async fn deactivate(&self) -> Result<()> {
        self.delegate()?
            .send(PumpCallback::WillDeactivate)
            .await
            .map_err(|_| anyhow!("session inbox closed"))
    }

    /// Publish bolus progress to any attached reporter.
    pub fn report_bolus_progress(&self, delivered_units: f64, total_units: f64) {
        let _ = self.inner.bolus_tx.send(BolusProgress {
            delivered_units,
            total_units,
        });
    }
}

impl DeviceManager for MockPump {
    fn manager_identifier(&self) -> &'static str {
        Self::IDENTIFIER
    }

    fn raw_state(&self) -> RawState {
        self.inner
            .state
            .lock()
            .ok()
            .and_then(|s| serde_json::to_value(&*s).ok())
            .unwrap_or(serde_json::Value::Null)
    }

    fn localized_title(&self) -> String {
        self.inner
            .state
            .lock()
            .map(|s| s.title.clone())
            .unwrap_or_else(|_| "Mock Pump".to_string())
    }

    fn small_image(&self) -> Option<String> {
        Some("pump.mock".to_string())
    }
}

#[async_trait]
impl PumpManager for MockPump {
    fn set_delegate(&mut self, delegate: mpsc::Sender<PumpCallback>) {
        if let Ok(mut slot) = self.inner.delegate.lock() {
            *slot = Some(delegate);
        }
    }

    async fn ensure_current_data(&self) -> Result<()> {
        self.inner.poll_count.fetch_add(1, Ordering::SeqCst);
        let controller = MockPumpController {
            inner: Arc::clone(&self.inner),
        };
        // A real driver reports back asynchronously; the mock answers with
        // an immediate status callback.
        controller.send_status(BolusState::NoBolus).await
    }

    fn pod_status(&self) -> Option<PodStatus> {
        self.inner.state.lock().ok().and_then(|s| s.pod)
    }

    fn create_bolus_progress_reporter(&self) -> Option<watch::Receiver<BolusProgress>> {
        Some(self.inner.bolus_tx.subscribe())
    }
}

// =============================================================================
// MockCgm
// =============================================================================

/// Serializable mock CGM state (the "raw state" blob).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MockCgmState {
    pub title: String,
    pub should_sync_to_remote_service: bool,
    pub trend: Option<Trend>,
}

impl Default for MockCgmState {
    fn default() -> Self {
        Self {
            title: "Mock CGM".to_string(),
            should_sync_to_remote_service: false,
            trend: Some(Trend::Flat),
        }
    }
}

struct CgmInner {
    state: Mutex<MockCgmState>,
    delegate: Mutex<Option<mpsc::Sender<CgmCallback>>>,
}

/// Simulated glucose sensor.
pub struct MockCgm {
    inner: Arc<CgmInner>,
}

/// Vendor-side handle for driving a [`MockCgm`].
#[derive(Clone)]
pub struct MockCgmController {
    inner: Arc<CgmInner>,
}

impl MockCgm {
    pub const IDENTIFIER: &'static str = "MockCgmManager";

    pub fn new() -> Self {
        Self::with_state(MockCgmState::default())
    }

    pub fn with_state(state: MockCgmState) -> Self {
        Self {
            inner: Arc::new(CgmInner {
                state: Mutex::new(state),
                delegate: Mutex::new(None),
            }),
        }
    }

    /// Registry constructor.
    pub fn from_raw_state(raw: &RawState) -> Result<Box<dyn CgmManager>> {
        let state: MockCgmState = serde_json::from_value(raw.clone())?;
        Ok(Box::new(Self::with_state(state)))
    }

    pub fn controller(&self) -> MockCgmController {
        MockCgmController {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl Default for MockCgm {
    fn default() -> Self {
        Self::new()
    }
}

impl MockCgmController {
    fn delegate(&self) -> Result<mpsc::Sender<CgmCallback>> {
        self.inner
            .delegate
            .lock()
            .map_err(|_| anyhow!("mock cgm poisoned"))?
            .clone()
            .ok_or_else(|| anyhow!("mock cgm has no delegate"))
    }

    pub fn set_trend(&self, trend: Option<Trend>) {
        if let Ok(mut state) = self.inner.state.lock() {
            state.trend = trend;
        }
    }

    /// Push a batch of readings through the delegate channel.
    pub async fn push_readings(&self, readings: Vec<RawSensorReading>) -> Result<()> {
        self.delegate()?
            .send(CgmCallback::NewReadings(readings))
            .await
            .map_err(|_| anyhow!("session inbox closed"))
    }

    pub async fn wants_deletion(&self) -> Result<()> {
        self.delegate()?
            .send(CgmCallback::WantsDeletion)
            .await
            .map_err(|_| anyhow!("session inbox closed"))
    }

    pub async fn query_credential_prefix(&self) -> Result<String> {
        let (reply, rx) = oneshot::channel();
        self.delegate()?
            .send(CgmCallback::CredentialStoragePrefix(reply))
            .await
            .map_err(|_| anyhow!("session inbox closed"))?;
        rx.await.map_err(|_| anyhow!("reply dropped"))
    }

    pub async fn query_data_start_date(&self) -> Result<DateTime<Utc>> {
        let (reply, rx) = oneshot::channel();
        self.delegate()?
            .send(CgmCallback::StartDateForNewData(reply))
            .await
            .map_err(|_| anyhow!("session inbox closed"))?;
        rx.await.map_err(|_| anyhow!("reply dropped"))
    }

    /// Synthesize a plausible reading around a baseline, for demo runs.
    pub fn synth_reading(&self, baseline_mgdl: f64) -> RawSensorReading {
        let jitter: f64 = rand::thread_rng().gen_range(-8.0..8.0);
        RawSensorReading {
            quantity_mgdl: (baseline_mgdl + jitter).max(40.0),
            date: Utc::now(),
        }
    }
}

impl DeviceManager for MockCgm {
    fn manager_identifier(&self) -> &'static str {
        Self::IDENTIFIER
    }

    fn raw_state(&self) -> RawState {
        self.inner
            .state
            .lock()
            .ok()
            .and_then(|s| serde_json::to_value(&*s).ok())
            .unwrap_or(serde_json::Value::Null)
    }

    fn localized_title(&self) -> String {
        self.inner
            .state
            .lock()
            .map(|s| s.title.clone())
            .unwrap_or_else(|_| "Mock CGM".to_string())
    }

    fn small_image(&self) -> Option<String> {
        Some("cgm.mock".to_string())
    }
}

#[async_trait]
impl CgmManager for MockCgm {
    fn set_delegate(&mut self, delegate: mpsc::Sender<CgmCallback>) {
        if let Ok(mut slot) = self.inner.delegate.lock() {
            *slot = Some(delegate);
        }
    }

    fn should_sync_to_remote_service(&self) -> bool {
        self.inner
            .state
            .lock()
            .map(|s| s.should_sync_to_remote_service)
            .unwrap_or(false)
    }

    fn glucose_display_trend(&self) -> Option<Trend> {
        self.inner.state.lock().ok().and_then(|s| s.trend)
    }
}
