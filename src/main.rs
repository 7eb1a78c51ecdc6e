//! CLI entry point for aps-core.
//!
//! Wires the session actor, glucose ingestion pipeline, and notification
//! log together around the mock pump and CGM drivers, so the orchestration
//! core can be exercised without physical hardware. A synthetic sensor feed
//! pushes one reading per glucose tick.
//!
//! # Usage
//!
//! ```bash
//! aps-core run                    # defaults from config/default.toml
//! aps-core run --config local     # overlay config/local.toml
//! ```

use anyhow::Result;
use aps_core::broadcast::{Broadcaster, DeviceNotification};
use aps_core::config::Settings;
use aps_core::device::mock::{MockCgm, MockPump};
use aps_core::device::registry::{CgmRegistry, PumpRegistry};
use aps_core::device::session::{DeviceSession, SessionDeps};
use aps_core::heartbeat::HeartbeatGate;
use aps_core::ingest::{GlucoseIngestionPipeline, GlucoseSlot, NullRemoteService, SharedStorageReader};
use aps_core::storage::{FileStore, InMemoryGlucoseStore, JsonPumpHistoryStore};
use chrono::Utc;
use clap::{Parser, Subcommand};
use log::{info, warn};
use std::sync::Arc;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser)]
#[command(name = "aps-core")]
#[command(about = "Closed-loop device orchestration core", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the orchestration loop with mock devices
    Run {
        /// Name of an overlay config under config/ (without extension)
        #[arg(long)]
        config: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config } => {
            let settings = Settings::new(config.as_deref())?;
            env_logger::Builder::new()
                .parse_filters(&settings.log_level.0)
                .init();
            run(settings).await
        }
    }
}

async fn run(settings: Settings) -> Result<()> {
    info!("starting aps-core");

    let mut pump_registry = PumpRegistry::new();
    pump_registry.register(MockPump::IDENTIFIER, MockPump::from_raw_state);
    let mut cgm_registry = CgmRegistry::new();
    cgm_registry.register(MockCgm::IDENTIFIER, MockCgm::from_raw_state);
    info!(
        "registered pump families {:?}, cgm families {:?}",
        pump_registry.identifiers(),
        cgm_registry.identifiers()
    );

    let key_value = Arc::new(FileStore::new(&settings.storage.data_dir));
    let pump_history = Arc::new(JsonPumpHistoryStore::new(Arc::clone(&key_value)));
    let glucose = Arc::new(InMemoryGlucoseStore::new(
        settings.glucose.min_sample_spacing,
    ));
    let remote = Arc::new(NullRemoteService);
    let slot = Arc::new(GlucoseSlot::new());
    let broadcaster = Broadcaster::default();
    let gate = Arc::new(HeartbeatGate::new(&settings.heartbeat));

    let deps = SessionDeps {
        pump_registry: Arc::new(pump_registry),
        cgm_registry: Arc::new(cgm_registry),
        key_value,
        pump_history,
        glucose: glucose.clone(),
        remote: remote.clone(),
        glucose_slot: Arc::clone(&slot),
        broadcaster: broadcaster.clone(),
        gate: Arc::clone(&gate),
    };
    let (session, session_task) = DeviceSession::spawn(deps, &settings);

    // Notification log. Glucose batches get a validity summary so garbage
    // readings are visible right away.
    let mut notifications = broadcaster.subscribe();
    tokio::spawn(async move {
        while let Ok(notification) = notifications.recv().await {
            match notification {
                DeviceNotification::PumpBatteryChanged(battery) => {
                    info!("battery: {:?}% ({:?})", battery.percent, battery.state)
                }
                DeviceNotification::PumpReservoirChanged(units) => {
                    info!("reservoir: {units} U")
                }
                DeviceNotification::RecommendsLoop => info!("pump recommends a loop run"),
                DeviceNotification::BolusInProgress(active) => {
                    info!("bolus in progress: {active}")
                }
                DeviceNotification::PumpError(message) => warn!("pump error: {message}"),
                DeviceNotification::GlucosePublished(samples) => {
                    let valid = samples.iter().filter(|s| s.is_state_valid()).count();
                    info!("glucose published: {} samples, {} valid", samples.len(), valid)
                }
            }
        }
    });

    // Pair mock devices unless the session restored persisted ones.
    let pump = MockPump::new();
    let cgm = MockCgm::new();
    let cgm_controller = cgm.controller();
    session.set_pump(Some(Box::new(pump))).await?;
    session.set_cgm(Some(Box::new(cgm))).await?;

    // Synthetic sensor feed, one reading per glucose tick.
    let feed_interval = settings.glucose.tick_interval;
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(feed_interval);
        loop {
            ticker.tick().await;
            let reading = cgm_controller.synth_reading(120.0);
            if cgm_controller.push_readings(vec![reading]).await.is_err() {
                break;
            }
        }
    });

    let shared = SharedStorageReader::new(
        &settings.glucose.shared_storage_path,
        settings.glucose.max_shared_entries,
    );
    let pipeline = GlucoseIngestionPipeline::new(
        session.clone(),
        glucose,
        remote,
        shared,
        slot,
        settings.glucose.tick_interval,
    );
    let pipeline_task = tokio::spawn(pipeline.run());

    // Kick an immediate forced refresh so the pump reports before the first
    // scheduled heartbeat.
    session.heartbeat(Utc::now(), true).await?;

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    session.shutdown().await?;
    pipeline_task.abort();
    session_task.await?;
    Ok(())
}
