//! Device session actor.
//!
//! The session is the single owner of the active pump and CGM managers. It
//! runs in a dedicated Tokio task and processes [`SessionCommand`] messages
//! strictly in arrival order, so no locks are needed for session state:
//! vendor callbacks, heartbeat requests, and manager replacement all funnel
//! through one mpsc inbox. Request/response commands answer over oneshot
//! channels.
//!
//! Display state (name/icon pairing, pod expiry) is published through
//! `watch` channels and re-derived synchronously with every manager
//! mutation, so observers never see a stale pairing. Battery, reservoir,
//! bolus and error facts fan out through the [`Broadcaster`].

use crate::broadcast::{Broadcaster, DeviceNotification};
use crate::config::Settings;
use crate::device::capabilities::{CgmCallback, CgmManager, PumpCallback, PumpManager};
use crate::device::registry::{CgmRegistry, PumpRegistry};
use crate::error::{AppResult, DeviceError};
use crate::heartbeat::HeartbeatGate;
use crate::ingest::sources::{GlucoseSlot, RemoteGlucoseService};
use crate::model::{
    direction_for_trend, BolusProgress, CgmDisplayState, GlucoseSample, PersistedManagerState,
    PumpDisplayState, ReservoirReading, ReservoirValue, GLUCOSE_DEVICE_TAG,
    RESERVOIR_LEVEL_UNKNOWN,
};
use crate::storage::{keys, GlucoseStore, KeyValueStore, KeyValueStoreExt, PumpHistoryStore};
use chrono::{DateTime, Duration, Utc};
use log::{debug, error, info, warn};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

/// How far before the last recorded event new pump events should start.
const EVENT_LOOKBACK: i64 = 15; // minutes
/// Lookback when no pump event has ever been recorded.
const INITIAL_EVENT_LOOKBACK: i64 = 2; // hours

/// Commands processed by the session worker.
pub enum SessionCommand {
    /// Replace the active pump (or clear it with `None`).
    SetPump {
        manager: Option<Box<dyn PumpManager>>,
        response: oneshot::Sender<()>,
    },
    /// Replace the active CGM (or clear it with `None`).
    SetCgm {
        manager: Option<Box<dyn CgmManager>>,
        response: oneshot::Sender<()>,
    },
    /// Request a pump data refresh; acknowledged once the decision (poll or
    /// skip) has been carried out.
    Heartbeat {
        now: DateTime<Utc>,
        force: bool,
        response: oneshot::Sender<()>,
    },
    /// Delegate event from the active pump.
    Pump(PumpCallback),
    /// Delegate event from the active CGM.
    Cgm(CgmCallback),
    PumpEventsStartDate {
        response: oneshot::Sender<DateTime<Utc>>,
    },
    CgmDataStartDate {
        response: oneshot::Sender<DateTime<Utc>>,
    },
    HasActiveCgm {
        response: oneshot::Sender<bool>,
    },
    BolusProgressReporter {
        response: oneshot::Sender<Option<watch::Receiver<BolusProgress>>>,
    },
    Shutdown {
        response: oneshot::Sender<()>,
    },
}

impl SessionCommand {
    pub fn set_pump(manager: Option<Box<dyn PumpManager>>) -> (Self, oneshot::Receiver<()>) {
        let (response, rx) = oneshot::channel();
        (SessionCommand::SetPump { manager, response }, rx)
    }

    pub fn set_cgm(manager: Option<Box<dyn CgmManager>>) -> (Self, oneshot::Receiver<()>) {
        let (response, rx) = oneshot::channel();
        (SessionCommand::SetCgm { manager, response }, rx)
    }

    pub fn heartbeat(now: DateTime<Utc>, force: bool) -> (Self, oneshot::Receiver<()>) {
        let (response, rx) = oneshot::channel();
        (
            SessionCommand::Heartbeat {
                now,
                force,
                response,
            },
            rx,
        )
    }
}

/// Everything the session needs; bundled so `spawn` stays readable.
pub struct SessionDeps {
    pub pump_registry: Arc<PumpRegistry>,
    pub cgm_registry: Arc<CgmRegistry>,
    pub key_value: Arc<dyn KeyValueStore>,
    pub pump_history: Arc<dyn PumpHistoryStore>,
    pub glucose: Arc<dyn GlucoseStore>,
    pub remote: Arc<dyn RemoteGlucoseService>,
    pub glucose_slot: Arc<GlucoseSlot>,
    pub broadcaster: Broadcaster,
    pub gate: Arc<HeartbeatGate>,
}

/// Cloneable handle to a running session.
#[derive(Clone)]
pub struct SessionHandle {
    tx: mpsc::Sender<SessionCommand>,
    pump_display: watch::Receiver<Option<PumpDisplayState>>,
    cgm_display: watch::Receiver<Option<CgmDisplayState>>,
    pump_expires_at: watch::Receiver<Option<DateTime<Utc>>>,
}

impl SessionHandle {
    async fn request<T>(
        &self,
        cmd: SessionCommand,
        rx: oneshot::Receiver<T>,
    ) -> AppResult<T> {
        self.tx
            .send(cmd)
            .await
            .map_err(|_| DeviceError::SessionClosed)?;
        rx.await.map_err(|_| DeviceError::SessionClosed)
    }

    pub async fn set_pump(&self, manager: Option<Box<dyn PumpManager>>) -> AppResult<()> {
        let (cmd, rx) = SessionCommand::set_pump(manager);
        self.request(cmd, rx).await
    }

    pub async fn set_cgm(&self, manager: Option<Box<dyn CgmManager>>) -> AppResult<()> {
        let (cmd, rx) = SessionCommand::set_cgm(manager);
        self.request(cmd, rx).await
    }

    /// Single entry point for pump refresh requests from any context.
    pub async fn heartbeat(&self, now: DateTime<Utc>, force: bool) -> AppResult<()> {
        let (cmd, rx) = SessionCommand::heartbeat(now, force);
        self.request(cmd, rx).await
    }

    pub async fn pump_events_start_date(&self) -> AppResult<DateTime<Utc>> {
        let (response, rx) = oneshot::channel();
        self.request(SessionCommand::PumpEventsStartDate { response }, rx)
            .await
    }

    pub async fn cgm_data_start_date(&self) -> AppResult<DateTime<Utc>> {
        let (response, rx) = oneshot::channel();
        self.request(SessionCommand::CgmDataStartDate { response }, rx)
            .await
    }

    pub async fn has_active_cgm(&self) -> AppResult<bool> {
        let (response, rx) = oneshot::channel();
        self.request(SessionCommand::HasActiveCgm { response }, rx)
            .await
    }

    pub async fn bolus_progress_reporter(
        &self,
    ) -> AppResult<Option<watch::Receiver<BolusProgress>>> {
        let (response, rx) = oneshot::channel();
        self.request(SessionCommand::BolusProgressReporter { response }, rx)
            .await
    }

    pub async fn shutdown(&self) -> AppResult<()> {
        let (response, rx) = oneshot::channel();
        self.request(SessionCommand::Shutdown { response }, rx).await
    }

    pub fn pump_display(&self) -> watch::Receiver<Option<PumpDisplayState>> {
        self.pump_display.clone()
    }

    pub fn cgm_display(&self) -> watch::Receiver<Option<CgmDisplayState>> {
        self.cgm_display.clone()
    }

    pub fn pump_expires_at(&self) -> watch::Receiver<Option<DateTime<Utc>>> {
        self.pump_expires_at.clone()
    }
}

/// The session actor. Construct via [`DeviceSession::spawn`].
pub struct DeviceSession {
    deps: SessionDeps,
    credential_storage_prefix: String,
    inbox_tx: mpsc::Sender<SessionCommand>,

    pump: Option<Box<dyn PumpManager>>,
    cgm: Option<Box<dyn CgmManager>>,
    last_pump_event_date: Option<DateTime<Utc>>,

    pump_forwarder: Option<JoinHandle<()>>,
    cgm_forwarder: Option<JoinHandle<()>>,

    pump_display_tx: watch::Sender<Option<PumpDisplayState>>,
    cgm_display_tx: watch::Sender<Option<CgmDisplayState>>,
    pump_expires_tx: watch::Sender<Option<DateTime<Utc>>>,
}

impl DeviceSession {
    /// Spawn the session worker. Persisted managers are reconstructed from
    /// the key-value store before the first command is processed;
    /// reconstruction failure degrades to "no device".
    pub fn spawn(deps: SessionDeps, settings: &Settings) -> (SessionHandle, JoinHandle<()>) {
        let (inbox_tx, inbox_rx) = mpsc::channel(64);
        let (pump_display_tx, pump_display) = watch::channel(None);
        let (cgm_display_tx, cgm_display) = watch::channel(None);
        let (pump_expires_tx, pump_expires_at) = watch::channel(None);

        let handle = SessionHandle {
            tx: inbox_tx.clone(),
            pump_display,
            cgm_display,
            pump_expires_at,
        };

        let actor = DeviceSession {
            deps,
            credential_storage_prefix: settings.cgm.credential_storage_prefix.clone(),
            inbox_tx,
            pump: None,
            cgm: None,
            last_pump_event_date: None,
            pump_forwarder: None,
            cgm_forwarder: None,
            pump_display_tx,
            cgm_display_tx,
            pump_expires_tx,
        };

        let task = tokio::spawn(actor.run(inbox_rx));
        (handle, task)
    }

    async fn run(mut self, mut inbox: mpsc::Receiver<SessionCommand>) {
        self.bootstrap();

        while let Some(cmd) = inbox.recv().await {
            match cmd {
                SessionCommand::SetPump { manager, response } => {
                    self.set_pump(manager);
                    let _ = response.send(());
                }
                SessionCommand::SetCgm { manager, response } => {
                    self.set_cgm(manager);
                    let _ = response.send(());
                }
                SessionCommand::Heartbeat {
                    now,
                    force,
                    response,
                } => {
                    self.handle_heartbeat(now, force).await;
                    let _ = response.send(());
                }
                SessionCommand::Pump(callback) => self.handle_pump_callback(callback).await,
                SessionCommand::Cgm(callback) => self.handle_cgm_callback(callback).await,
                SessionCommand::PumpEventsStartDate { response } => {
                    let _ = response.send(self.pump_events_start_date(Utc::now()));
                }
                SessionCommand::CgmDataStartDate { response } => {
                    let _ = response.send(self.deps.glucose.sync_date());
                }
                SessionCommand::HasActiveCgm { response } => {
                    let _ = response.send(self.cgm.is_some());
                }
                SessionCommand::BolusProgressReporter { response } => {
                    let reporter = self
                        .pump
                        .as_ref()
                        .and_then(|p| p.create_bolus_progress_reporter());
                    let _ = response.send(reporter);
                }
                SessionCommand::Shutdown { response } => {
                    let _ = response.send(());
                    break;
                }
            }
        }

        if let Some(task) = self.pump_forwarder.take() {
            task.abort();
        }
        if let Some(task) = self.cgm_forwarder.take() {
            task.abort();
        }
        info!("device session stopped");
    }

    /// Rehydrate persisted managers and the last-event watermark.
    fn bootstrap(&mut self) {
        match self
            .deps
            .key_value
            .load_as::<PersistedManagerState>(keys::PUMP_MANAGER)
        {
            Ok(Some(persisted)) => {
                if let Some(pump) = self.deps.pump_registry.reconstruct(&persisted) {
                    info!("restored pump manager '{}'", persisted.manager_identifier);
                    self.set_pump(Some(pump));
                }
            }
            Ok(None) => {}
            Err(err) => warn!("could not read persisted pump state: {err}"),
        }

        match self
            .deps
            .key_value
            .load_as::<PersistedManagerState>(keys::CGM_MANAGER)
        {
            Ok(Some(persisted)) => {
                if let Some(cgm) = self.deps.cgm_registry.reconstruct(&persisted) {
                    info!("restored CGM manager '{}'", persisted.manager_identifier);
                    self.set_cgm(Some(cgm));
                }
            }
            Ok(None) => {}
            Err(err) => warn!("could not read persisted CGM state: {err}"),
        }

        match self
            .deps
            .key_value
            .load_as::<DateTime<Utc>>(keys::LAST_PUMP_EVENT_DATE)
        {
            Ok(date) => self.last_pump_event_date = date,
            Err(err) => warn!("could not read last pump event date: {err}"),
        }
    }

    // =========================================================================
    // Manager replacement
    // =========================================================================

    fn set_pump(&mut self, manager: Option<Box<dyn PumpManager>>) {
        if let Some(task) = self.pump_forwarder.take() {
            task.abort();
        }

        match manager {
            Some(mut pump) => {
                let (tx, rx) = mpsc::channel(64);
                pump.set_delegate(tx);
                self.pump_forwarder = Some(spawn_forwarder(rx, self.inbox_tx.clone(), SessionCommand::Pump));

                self.persist_pump_state(pump.as_ref());
                self.pump_display_tx.send_replace(Some(PumpDisplayState {
                    name: pump.localized_title(),
                    image: pump.small_image(),
                }));
                self.pump_expires_tx
                    .send_replace(pump.pod_status().and_then(|pod| pod.expires_at));
                self.pump = Some(pump);
            }
            None => {
                self.pump = None;
                if let Err(err) = self.deps.key_value.remove(keys::PUMP_MANAGER) {
                    warn!("could not clear persisted pump state: {err}");
                }
                self.pump_display_tx.send_replace(None);
                self.pump_expires_tx.send_replace(None);
            }
        }
    }

    fn set_cgm(&mut self, manager: Option<Box<dyn CgmManager>>) {
        if let Some(task) = self.cgm_forwarder.take() {
            task.abort();
        }

        match manager {
            Some(mut cgm) => {
                let (tx, rx) = mpsc::channel(64);
                cgm.set_delegate(tx);
                self.cgm_forwarder = Some(spawn_forwarder(rx, self.inbox_tx.clone(), SessionCommand::Cgm));

                self.persist_cgm_state(cgm.as_ref());
                self.cgm_display_tx.send_replace(Some(CgmDisplayState {
                    name: cgm.localized_title(),
                    image: cgm.small_image(),
                }));
                self.cgm = Some(cgm);
            }
            None => {
                self.cgm = None;
                if let Err(err) = self.deps.key_value.remove(keys::CGM_MANAGER) {
                    warn!("could not clear persisted CGM state: {err}");
                }
                self.cgm_display_tx.send_replace(None);
            }
        }
    }

    fn persist_pump_state(&self, pump: &dyn PumpManager) {
        let persisted = PersistedManagerState {
            manager_identifier: pump.manager_identifier().to_string(),
            state: pump.raw_state(),
        };
        if let Err(err) = self.deps.key_value.save_as(keys::PUMP_MANAGER, &persisted) {
            error!("could not persist pump state: {err}");
        }
    }

    fn persist_cgm_state(&self, cgm: &dyn CgmManager) {
        let persisted = PersistedManagerState {
            manager_identifier: cgm.manager_identifier().to_string(),
            state: cgm.raw_state(),
        };
        if let Err(err) = self.deps.key_value.save_as(keys::CGM_MANAGER, &persisted) {
            error!("could not persist CGM state: {err}");
        }
    }

    // =========================================================================
    // Heartbeat
    // =========================================================================

    async fn handle_heartbeat(&mut self, now: DateTime<Utc>, force: bool) {
        if force {
            self.deps.gate.advance(now);
            self.update_pump_data().await;
            return;
        }

        match self.deps.gate.try_advance(now) {
            Ok(()) => self.update_pump_data().await,
            Err(elapsed) => debug!(
                "last heartbeat {:.1} min ago, skip updating the pump data",
                elapsed.num_seconds() as f64 / 60.0
            ),
        }
    }

    async fn update_pump_data(&self) {
        let Some(pump) = &self.pump else {
            debug!("pump is not set, skip updating");
            return;
        };

        debug!("start updating the pump data");
        if let Err(err) = pump.ensure_current_data().await {
            warn!("pump data update failed: {err}");
        }
    }

    fn pump_events_start_date(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        self.last_pump_event_date
            .map(|date| date - Duration::minutes(EVENT_LOOKBACK))
            .unwrap_or_else(|| now - Duration::hours(INITIAL_EVENT_LOOKBACK))
    }

    // =========================================================================
    // Pump delegate callbacks
    // =========================================================================

    async fn handle_pump_callback(&mut self, callback: PumpCallback) {
        match callback {
            PumpCallback::StatusUpdated(status) => {
                debug!("new pump status, bolus: {:?}", status.bolus_state);
                self.deps.broadcaster.notify(DeviceNotification::BolusInProgress(
                    status.bolus_state.is_in_progress(),
                ));

                let battery = crate::model::Battery::from_charge(status.battery_charge_remaining);
                if let Err(err) = self.deps.key_value.save_as(keys::BATTERY, &battery) {
                    error!("could not persist battery snapshot: {err}");
                }
                self.deps
                    .broadcaster
                    .notify(DeviceNotification::PumpBatteryChanged(battery));

                if let Some(pod) = status.pod {
                    let reservoir = pod.reservoir_level.unwrap_or(RESERVOIR_LEVEL_UNKNOWN);
                    if let Err(err) = self.deps.key_value.save_as(keys::RESERVOIR, &reservoir) {
                        error!("could not persist reservoir level: {err}");
                    }
                    self.deps
                        .broadcaster
                        .notify(DeviceNotification::PumpReservoirChanged(reservoir));
                    self.pump_expires_tx.send_replace(pod.expires_at);
                }
            }
            PumpCallback::StateUpdated => {
                if let Some(pump) = &self.pump {
                    self.persist_pump_state(pump.as_ref());
                }
            }
            PumpCallback::NewPumpEvents { events, completion } => {
                debug!("new pump events: {}", events.len());
                match self.deps.pump_history.store_events(events.clone()) {
                    Ok(()) => {
                        if let Some(latest) = events.iter().map(|e| e.date).max() {
                            self.last_pump_event_date = Some(latest);
                            if let Err(err) = self
                                .deps
                                .key_value
                                .save_as(keys::LAST_PUMP_EVENT_DATE, &latest)
                            {
                                warn!("could not persist last pump event date: {err}");
                            }
                        }
                        let _ = completion.send(Ok(()));
                    }
                    Err(err) => {
                        error!("could not store pump events: {err}");
                        let _ = completion.send(Err(err.to_string()));
                    }
                }
            }
            PumpCallback::ClockDriftAdjusted { adjustment_secs } => {
                debug!("pump clock adjusted by {adjustment_secs}s");
            }
            PumpCallback::ReservoirReading {
                units,
                at,
                completion,
            } => {
                debug!("reservoir value {units}, at {at}");
                let result = match self.deps.key_value.save_as(keys::RESERVOIR, &units) {
                    Ok(()) => {
                        self.deps
                            .broadcaster
                            .notify(DeviceNotification::PumpReservoirChanged(units));
                        Ok(ReservoirReading {
                            new_value: ReservoirValue {
                                start_date: at,
                                unit_volume: units,
                            },
                            last_value: None,
                            continuous: true,
                        })
                    }
                    Err(err) => {
                        error!("could not persist reservoir reading: {err}");
                        Err(err.to_string())
                    }
                };
                let _ = completion.send(result);
            }
            PumpCallback::StartDateForNewEvents(reply) => {
                let _ = reply.send(self.pump_events_start_date(Utc::now()));
            }
            PumpCallback::RecommendsLoop => {
                debug!("pump recommends loop");
                self.deps.broadcaster.notify(DeviceNotification::RecommendsLoop);
            }
            PumpCallback::DidError(message) => {
                warn!("pump error: {message}");
                self.deps
                    .broadcaster
                    .notify(DeviceNotification::PumpError(message));
            }
            PumpCallback::WillDeactivate => {
                info!("pump will deactivate");
                self.set_pump(None);
            }
        }
    }

    // =========================================================================
    // CGM delegate callbacks
    // =========================================================================

    async fn handle_cgm_callback(&mut self, callback: CgmCallback) {
        match callback {
            CgmCallback::NewReadings(readings) => self.publish_sensor_readings(readings).await,
            CgmCallback::StatusUpdated => debug!("cgm status updated"),
            CgmCallback::StateUpdated => {
                if let Some(cgm) = &self.cgm {
                    self.persist_cgm_state(cgm.as_ref());
                }
            }
            CgmCallback::StartDateForNewData(reply) => {
                let _ = reply.send(self.deps.glucose.sync_date());
            }
            CgmCallback::CredentialStoragePrefix(reply) => {
                let _ = reply.send(self.credential_storage_prefix.clone());
            }
            CgmCallback::WantsDeletion => {
                info!("cgm wants deletion");
                self.set_cgm(None);
            }
        }
    }

    /// Direct-sensor publish path: sort descending, convert to whole mg/dL,
    /// attach the trend only to the chronological maximum, tag and publish.
    async fn publish_sensor_readings(
        &mut self,
        mut readings: Vec<crate::model::RawSensorReading>,
    ) {
        if readings.is_empty() {
            debug!("no new glucose retrieved");
            return;
        }

        readings.sort_by(|a, b| b.date.cmp(&a.date));
        let trend = self.cgm.as_ref().and_then(|cgm| cgm.glucose_display_trend());

        let samples: Vec<GlucoseSample> = readings
            .iter()
            .enumerate()
            .map(|(index, reading)| {
                let direction = if index == 0 {
                    direction_for_trend(trend)
                } else {
                    None
                };
                GlucoseSample::new(
                    GLUCOSE_DEVICE_TAG,
                    reading.quantity_mgdl.round() as i32,
                    direction,
                    reading.date,
                )
            })
            .collect();

        debug!("publishing {} sensor samples", samples.len());
        self.deps.glucose_slot.publish(samples.clone());
        self.deps
            .broadcaster
            .notify(DeviceNotification::GlucosePublished(Arc::new(samples.clone())));

        let should_mirror = self
            .cgm
            .as_ref()
            .map(|cgm| cgm.should_sync_to_remote_service())
            .unwrap_or(false);
        if should_mirror {
            if let Err(err) = self.deps.remote.upload_glucose(&samples).await {
                warn!("could not mirror glucose to remote service: {err}");
            }
        }
    }
}

/// Bridge a manager's delegate channel into the session inbox, preserving
/// delivery order.
fn spawn_forwarder<C: Send + 'static>(
    mut rx: mpsc::Receiver<C>,
    inbox: mpsc::Sender<SessionCommand>,
    wrap: fn(C) -> SessionCommand,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(callback) = rx.recv().await {
            if inbox.send(wrap(callback)).await.is_err() {
                break;
            }
        }
    })
}
