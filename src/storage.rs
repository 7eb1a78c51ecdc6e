//! Durable storage collaborators.
//!
//! Three narrow interfaces back the orchestration core:
//!
//! - [`KeyValueStore`]: durable JSON blobs under well-known keys (persisted
//!   manager state, battery and reservoir snapshots). No transactional
//!   guarantee across keys.
//! - [`GlucoseStore`]: owns the ingestion watermark and the too-frequent
//!   sampling policy; storing a batch advances the watermark.
//! - [`PumpHistoryStore`]: append-only pump event history.
//!
//! A file-backed key-value store (one JSON file per key) is provided for the
//! binary; in-memory implementations back the tests.

use crate::error::{AppResult, DeviceError};
use crate::model::{GlucoseSample, PumpEvent};
use anyhow::Result;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{de::DeserializeOwned, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

/// Well-known key-value store keys.
pub mod keys {
    pub const PUMP_MANAGER: &str = "devices/pump_manager";
    pub const CGM_MANAGER: &str = "devices/cgm_manager";
    pub const LAST_PUMP_EVENT_DATE: &str = "devices/last_pump_event_date";
    pub const BATTERY: &str = "monitor/battery";
    pub const RESERVOIR: &str = "monitor/reservoir";
    pub const PUMP_HISTORY: &str = "monitor/pump_history";
}

// =============================================================================
// Key-value store
// =============================================================================

pub trait KeyValueStore: Send + Sync {
    fn save(&self, key: &str, value: serde_json::Value) -> AppResult<()>;
    fn load(&self, key: &str) -> AppResult<Option<serde_json::Value>>;
    fn remove(&self, key: &str) -> AppResult<()>;
}

/// Typed helpers over the JSON interface.
pub trait KeyValueStoreExt: KeyValueStore {
    fn save_as<T: Serialize>(&self, key: &str, value: &T) -> AppResult<()> {
        self.save(key, serde_json::to_value(value)?)
    }

    fn load_as<T: DeserializeOwned>(&self, key: &str) -> AppResult<Option<T>> {
        match self.load(key)? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }
}

impl<S: KeyValueStore + ?Sized> KeyValueStoreExt for S {}

impl<S: KeyValueStore + ?Sized> KeyValueStore for std::sync::Arc<S> {
    fn save(&self, key: &str, value: serde_json::Value) -> AppResult<()> {
        (**self).save(key, value)
    }

    fn load(&self, key: &str) -> AppResult<Option<serde_json::Value>> {
        (**self).load(key)
    }

    fn remove(&self, key: &str) -> AppResult<()> {
        (**self).remove(key)
    }
}

/// File-backed store: one pretty-printed JSON file per key under a root
/// directory. Keys may contain `/` separators which become subdirectories.
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(format!("{key}.json"))
    }
}

impl KeyValueStore for FileStore {
    fn save(&self, key: &str, value: serde_json::Value) -> AppResult<()> {
        let path = self.path_for(key);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let bytes = serde_json::to_vec_pretty(&value)?;
        std::fs::write(path, bytes)?;
        Ok(())
    }

    fn load(&self, key: &str) -> AppResult<Option<serde_json::Value>> {
        let path = self.path_for(key);
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        Ok(Some(serde_json::from_str(&raw)?))
    }

    fn remove(&self, key: &str) -> AppResult<()> {
        match std::fs::remove_file(self.path_for(key)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

/// In-memory store for tests.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, serde_json::Value>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn save(&self, key: &str, value: serde_json::Value) -> AppResult<()> {
        self.entries
            .lock()
            .map_err(|_| DeviceError::Storage("memory store poisoned".into()))?
            .insert(key.to_string(), value);
        Ok(())
    }

    fn load(&self, key: &str) -> AppResult<Option<serde_json::Value>> {
        Ok(self
            .entries
            .lock()
            .map_err(|_| DeviceError::Storage("memory store poisoned".into()))?
            .get(key)
            .cloned())
    }

    fn remove(&self, key: &str) -> AppResult<()> {
        self.entries
            .lock()
            .map_err(|_| DeviceError::Storage("memory store poisoned".into()))?
            .remove(key);
        Ok(())
    }
}

// =============================================================================
// Glucose store
// =============================================================================

pub trait GlucoseStore: Send + Sync {
    /// Current ingestion watermark: data at or before this instant has
    /// already been processed. Never decreases.
    fn sync_date(&self) -> DateTime<Utc>;

    /// Drop samples spaced more tightly than the minimum clinically
    /// meaningful sampling interval, measured from `since` forward.
    fn filter_too_frequent(
        &self,
        samples: Vec<GlucoseSample>,
        since: DateTime<Utc>,
    ) -> Vec<GlucoseSample>;

    /// Persist a batch; advances the watermark to the newest stored sample.
    fn store_glucose(&self, samples: Vec<GlucoseSample>) -> Result<()>;

    /// Stored samples, newest last.
    fn recent(&self) -> Vec<GlucoseSample>;
}

struct GlucoseStoreInner {
    samples: Vec<GlucoseSample>,
    last_synced: Option<DateTime<Utc>>,
}

/// In-memory glucose store with watermark semantics.
pub struct InMemoryGlucoseStore {
    inner: Mutex<GlucoseStoreInner>,
    min_spacing: ChronoDuration,
}

impl InMemoryGlucoseStore {
    pub fn new(min_spacing: Duration) -> Self {
        Self {
            inner: Mutex::new(GlucoseStoreInner {
                samples: Vec::new(),
                last_synced: None,
            }),
            min_spacing: ChronoDuration::from_std(min_spacing)
                .unwrap_or_else(|_| ChronoDuration::seconds(60)),
        }
    }

    /// Pin the watermark explicitly (test support).
    pub fn set_sync_date(&self, date: DateTime<Utc>) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.last_synced = Some(date);
        }
    }
}

impl Default for InMemoryGlucoseStore {
    fn default() -> Self {
        Self::new(Duration::from_secs(60))
    }
}

impl GlucoseStore for InMemoryGlucoseStore {
    fn sync_date(&self) -> DateTime<Utc> {
        self.inner
            .lock()
            .ok()
            .and_then(|inner| inner.last_synced)
            .unwrap_or_else(|| Utc::now() - ChronoDuration::hours(24))
    }

    fn filter_too_frequent(
        &self,
        samples: Vec<GlucoseSample>,
        since: DateTime<Utc>,
    ) -> Vec<GlucoseSample> {
        let mut sorted = samples;
        sorted.sort_by_key(|s| s.date_string);

        let mut kept = Vec::with_capacity(sorted.len());
        let mut last = since;
        for sample in sorted {
            if sample.date_string < last + self.min_spacing {
                continue;
            }
            last = sample.date_string;
            kept.push(sample);
        }
        kept
    }

    fn store_glucose(&self, samples: Vec<GlucoseSample>) -> Result<()> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|_| anyhow::anyhow!("glucose store poisoned"))?;
        let newest = samples.iter().map(|s| s.date_string).max();
        if let Some(newest) = newest {
            // Watermark is monotone: an out-of-order store never rewinds it.
            inner.last_synced = Some(match inner.last_synced {
                Some(existing) => existing.max(newest),
                None => newest,
            });
        }
        inner.samples.extend(samples);
        inner.samples.sort_by_key(|s| s.date_string);
        Ok(())
    }

    fn recent(&self) -> Vec<GlucoseSample> {
        self.inner
            .lock()
            .map(|inner| inner.samples.clone())
            .unwrap_or_default()
    }
}

// =============================================================================
// Pump history store
// =============================================================================

pub trait PumpHistoryStore: Send + Sync {
    fn store_events(&self, events: Vec<PumpEvent>) -> Result<()>;
    fn events(&self) -> Vec<PumpEvent>;
}

/// History store backed by a key-value store entry (append semantics).
pub struct JsonPumpHistoryStore<S: KeyValueStore> {
    store: S,
}

impl<S: KeyValueStore> JsonPumpHistoryStore<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }
}

impl<S: KeyValueStore> PumpHistoryStore for JsonPumpHistoryStore<S> {
    fn store_events(&self, events: Vec<PumpEvent>) -> Result<()> {
        let mut all: Vec<PumpEvent> = self
            .store
            .load_as(keys::PUMP_HISTORY)
            .map_err(|e| anyhow::anyhow!(e))?
            .unwrap_or_default();
        all.extend(events);
        self.store
            .save_as(keys::PUMP_HISTORY, &all)
            .map_err(|e| anyhow::anyhow!(e))?;
        Ok(())
    }

    fn events(&self) -> Vec<PumpEvent> {
        self.store
            .load_as(keys::PUMP_HISTORY)
            .ok()
            .flatten()
            .unwrap_or_default()
    }
}
