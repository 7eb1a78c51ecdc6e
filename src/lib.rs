//! # aps-core
//!
//! Device orchestration and glucose ingestion core for a closed-loop
//! insulin delivery system. The crate owns the lifecycle of the paired
//! pump and CGM managers, throttles pump polling through a heartbeat
//! watermark, and runs the periodic pipeline that merges glucose from the
//! direct sensor path, the remote service, and a shared storage file into
//! a deduplicated local store.
//!
//! ## Crate Structure
//!
//! - **`broadcast`**: In-process notification hub (`Broadcaster`) fanning
//!   device facts out to any number of subscribers.
//! - **`config`**: TOML-backed `Settings` covering storage paths, heartbeat
//!   intervals, and glucose ingestion cadence.
//! - **`device`**: Capability traits for pump and CGM managers, the
//!   identifier-keyed reconstruction registries, the session actor that
//!   owns the active managers, and mock drivers for testing.
//! - **`error`**: The crate-wide `DeviceError` enum and `AppResult` alias.
//! - **`heartbeat`**: The `HeartbeatGate` watermark cell deciding when a
//!   pump poll is due.
//! - **`ingest`**: Glucose sources (sensor slot, remote service, shared
//!   storage reader) and the periodic `GlucoseIngestionPipeline`.
//! - **`model`**: Wire-faithful domain types: glucose samples, trend and
//!   direction vocabularies, battery and reservoir snapshots.
//! - **`storage`**: Key-value persistence plus the glucose and pump
//!   history stores with their sync watermarks.

pub mod broadcast;
pub mod config;
pub mod device;
pub mod error;
pub mod heartbeat;
pub mod ingest;
pub mod model;
pub mod storage;

pub use broadcast::{Broadcaster, DeviceNotification};
pub use config::Settings;
pub use device::capabilities::{CgmManager, DeviceManager, PumpManager};
pub use device::registry::{CgmRegistry, PumpRegistry};
pub use device::session::{DeviceSession, SessionDeps, SessionHandle};
pub use error::{AppResult, DeviceError};
pub use heartbeat::HeartbeatGate;
pub use ingest::GlucoseIngestionPipeline;
pub use model::{Direction, GlucoseSample, Trend};
