//! Periodic glucose ingestion loop.
//!
//! One tick gathers candidates from the active source (direct sensor slot
//! when a CGM is paired, otherwise the remote service) plus the shared
//! storage file, filters out anything at or before the store's sync
//! watermark and anything spaced too closely, persists what survives, and
//! requests an unforced heartbeat so a pump poll can ride on fresh glucose.

use crate::device::session::SessionHandle;
use crate::ingest::sources::{GlucoseSlot, RemoteGlucoseService, SharedStorageReader};
use crate::model::GlucoseSample;
use crate::storage::GlucoseStore;
use chrono::Utc;
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;

pub struct GlucoseIngestionPipeline {
    session: SessionHandle,
    store: Arc<dyn GlucoseStore>,
    remote: Arc<dyn RemoteGlucoseService>,
    shared: SharedStorageReader,
    slot: Arc<GlucoseSlot>,
    tick_interval: Duration,
}

impl GlucoseIngestionPipeline {
    pub fn new(
        session: SessionHandle,
        store: Arc<dyn GlucoseStore>,
        remote: Arc<dyn RemoteGlucoseService>,
        shared: SharedStorageReader,
        slot: Arc<GlucoseSlot>,
        tick_interval: Duration,
    ) -> Self {
        GlucoseIngestionPipeline {
            session,
            store,
            remote,
            shared,
            slot,
            tick_interval,
        }
    }

    /// Drive the loop until the session shuts down. The first tick fires
    /// immediately.
    pub async fn run(self) {
        let mut ticker = tokio::time::interval(self.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            match self.run_tick().await {
                Ok(_) => {}
                Err(err) => {
                    warn!("glucose tick aborted, session is gone: {err}");
                    break;
                }
            }
        }
    }

    /// One ingestion pass. Returns the number of samples stored.
    pub async fn run_tick(&self) -> crate::error::AppResult<usize> {
        let sync_date = self.store.sync_date();

        let mut candidates = if self.session.has_active_cgm().await? {
            // Direct sensor path: anything the CGM pushed since the last
            // tick is waiting in the slot. Draining consumes it, so a batch
            // is considered exactly once.
            self.slot.drain()
        } else {
            match self.remote.fetch_glucose().await {
                Ok(samples) => samples,
                Err(err) => {
                    warn!("remote glucose fetch failed: {err}");
                    Vec::new()
                }
            }
        };

        candidates.extend(self.shared.fetch_latest());
        if candidates.is_empty() {
            debug!("glucose tick: no candidates");
            return Ok(0);
        }

        let fresh: Vec<GlucoseSample> = candidates
            .into_iter()
            .filter(|sample| sample.date_string > sync_date)
            .collect();
        let accepted = self.store.filter_too_frequent(fresh, sync_date);
        if accepted.is_empty() {
            debug!("glucose tick: nothing new past {sync_date}");
            return Ok(0);
        }

        let count = accepted.len();
        if let Err(err) = self.store.store_glucose(accepted) {
            warn!("could not store glucose: {err}");
            return Ok(0);
        }
        info!("stored {count} new glucose samples");

        self.session.heartbeat(Utc::now(), false).await?;
        Ok(count)
    }
}
