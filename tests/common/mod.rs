#![allow(dead_code)]

//! Shared harness for session-level tests: a full session actor wired to
//! in-memory stores, with the concrete store handles kept around so tests
//! can inspect persistence directly.

use aps_core::broadcast::Broadcaster;
use aps_core::config::Settings;
use aps_core::device::mock::{MockCgm, MockPump};
use aps_core::device::registry::{CgmRegistry, PumpRegistry};
use aps_core::device::session::{DeviceSession, SessionDeps, SessionHandle};
use aps_core::heartbeat::HeartbeatGate;
use aps_core::ingest::{GlucoseSlot, NullRemoteService, RemoteGlucoseService};
use aps_core::model::GlucoseSample;
use aps_core::storage::{
    GlucoseStore, InMemoryGlucoseStore, JsonPumpHistoryStore, KeyValueStore, MemoryStore,
    PumpHistoryStore,
};
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;

/// Remote service double: hands out a canned batch once and records uploads.
#[derive(Default)]
pub struct ScriptedRemote {
    canned: Mutex<Vec<GlucoseSample>>,
    uploaded: Mutex<Vec<GlucoseSample>>,
}

impl ScriptedRemote {
    pub fn with_canned(samples: Vec<GlucoseSample>) -> Self {
        Self {
            canned: Mutex::new(samples),
            uploaded: Mutex::new(Vec::new()),
        }
    }

    pub fn uploaded(&self) -> Vec<GlucoseSample> {
        self.uploaded.lock().unwrap().clone()
    }
}

#[async_trait]
impl RemoteGlucoseService for ScriptedRemote {
    async fn fetch_glucose(&self) -> anyhow::Result<Vec<GlucoseSample>> {
        Ok(std::mem::take(&mut *self.canned.lock().unwrap()))
    }

    async fn upload_glucose(&self, samples: &[GlucoseSample]) -> anyhow::Result<()> {
        self.uploaded.lock().unwrap().extend_from_slice(samples);
        Ok(())
    }
}

pub struct Harness {
    pub session: SessionHandle,
    pub task: JoinHandle<()>,
    pub key_value: Arc<MemoryStore>,
    pub history: Arc<JsonPumpHistoryStore<Arc<MemoryStore>>>,
    pub glucose: Arc<InMemoryGlucoseStore>,
    pub slot: Arc<GlucoseSlot>,
    pub broadcaster: Broadcaster,
    pub gate: Arc<HeartbeatGate>,
    pub settings: Settings,
}

pub fn spawn_session() -> Harness {
    spawn_session_on(Arc::new(MemoryStore::new()))
}

/// Spawn a session over an existing key-value store, so restart scenarios
/// can rehydrate from state a previous session persisted.
pub fn spawn_session_on(key_value: Arc<MemoryStore>) -> Harness {
    spawn_session_with(key_value, Arc::new(NullRemoteService))
}

pub fn spawn_session_with_remote(remote: Arc<dyn RemoteGlucoseService>) -> Harness {
    spawn_session_with(Arc::new(MemoryStore::new()), remote)
}

fn spawn_session_with(
    key_value: Arc<MemoryStore>,
    remote: Arc<dyn RemoteGlucoseService>,
) -> Harness {
    let settings = Settings::default();

    let mut pump_registry = PumpRegistry::new();
    pump_registry.register(MockPump::IDENTIFIER, MockPump::from_raw_state);
    let mut cgm_registry = CgmRegistry::new();
    cgm_registry.register(MockCgm::IDENTIFIER, MockCgm::from_raw_state);

    let history = Arc::new(JsonPumpHistoryStore::new(Arc::clone(&key_value)));
    let glucose = Arc::new(InMemoryGlucoseStore::new(
        settings.glucose.min_sample_spacing,
    ));
    let slot = Arc::new(GlucoseSlot::new());
    let broadcaster = Broadcaster::default();
    let gate = Arc::new(HeartbeatGate::new(&settings.heartbeat));

    let deps = SessionDeps {
        pump_registry: Arc::new(pump_registry),
        cgm_registry: Arc::new(cgm_registry),
        key_value: Arc::clone(&key_value) as Arc<dyn KeyValueStore>,
        pump_history: Arc::clone(&history) as Arc<dyn PumpHistoryStore>,
        glucose: Arc::clone(&glucose) as Arc<dyn GlucoseStore>,
        remote,
        glucose_slot: Arc::clone(&slot),
        broadcaster: broadcaster.clone(),
        gate: Arc::clone(&gate),
    };
    let (session, task) = DeviceSession::spawn(deps, &settings);

    Harness {
        session,
        task,
        key_value,
        history,
        glucose,
        slot,
        broadcaster,
        gate,
        settings,
    }
}
