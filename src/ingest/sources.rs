//! Glucose sample sources feeding the ingestion pipeline.
//!
//! Three channels can contribute candidates per tick:
//!
//! - the direct-sensor path, bridged through a [`GlucoseSlot`] (single-slot,
//!   latest-wins, drained exactly once per tick),
//! - a remote-service fallback used only when no direct sensor is active,
//! - a shared-storage fallback: a JSON blob written by a companion process
//!   under a well-known key, always polled.

use crate::model::{Direction, GlucoseSample};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use log::{debug, warn};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Mutex;
use uuid::Uuid;

// =============================================================================
// Drain-once slot
// =============================================================================

/// Single-slot overwrite buffer bridging the sensor push callback and the
/// pull-based pipeline.
///
/// Holds at most one undelivered batch: a new push overwrites rather than
/// queuing, so a slow tick cannot accumulate backlog. Draining returns the
/// batch and clears the slot so it is never re-delivered.
#[derive(Default)]
pub struct GlucoseSlot {
    slot: Mutex<Option<Vec<GlucoseSample>>>,
}

impl GlucoseSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite the slot with the latest batch.
    pub fn publish(&self, batch: Vec<GlucoseSample>) {
        if let Ok(mut slot) = self.slot.lock() {
            *slot = Some(batch);
        }
    }

    /// Take the buffered batch, leaving the slot empty.
    pub fn drain(&self) -> Vec<GlucoseSample> {
        self.slot
            .lock()
            .ok()
            .and_then(|mut slot| slot.take())
            .unwrap_or_default()
    }
}

// =============================================================================
// Remote-service fallback
// =============================================================================

/// Remote glucose service: fallback fetch when no direct sensor is active,
/// and upload mirror for sensors that opt in.
#[async_trait]
pub trait RemoteGlucoseService: Send + Sync {
    async fn fetch_glucose(&self) -> Result<Vec<GlucoseSample>>;
    async fn upload_glucose(&self, samples: &[GlucoseSample]) -> Result<()>;
}

/// Disabled remote service: fetches nothing, uploads nowhere.
pub struct NullRemoteService;

#[async_trait]
impl RemoteGlucoseService for NullRemoteService {
    async fn fetch_glucose(&self) -> Result<Vec<GlucoseSample>> {
        Ok(Vec::new())
    }

    async fn upload_glucose(&self, _samples: &[GlucoseSample]) -> Result<()> {
        Ok(())
    }
}

// =============================================================================
// Shared-storage fallback
// =============================================================================

/// Wire shape of one shared-storage entry.
#[derive(Debug, Deserialize)]
struct SharedEntry {
    #[serde(rename = "Value")]
    value: i32,
    direction: String,
    #[serde(rename = "DT")]
    dt: String,
}

static WCF_DATE_RE: Lazy<Regex> = Lazy::new(|| {
    #[allow(clippy::unwrap_used)] // pattern is a literal
    Regex::new(r"\((-?\d+)\)").unwrap()
});

/// Parse the `"/Date(<epoch_ms>)/"` timestamp format exactly.
pub(crate) fn parse_wcf_date(raw: &str) -> Option<DateTime<Utc>> {
    let captures = WCF_DATE_RE.captures(raw)?;
    let millis: i64 = captures.get(1)?.as_str().parse().ok()?;
    Utc.timestamp_millis_opt(millis).single()
}

/// Reads the companion process's latest-readings blob.
pub struct SharedStorageReader {
    path: PathBuf,
    max_entries: usize,
}

impl SharedStorageReader {
    pub fn new(path: impl Into<PathBuf>, max_entries: usize) -> Self {
        Self {
            path: path.into(),
            max_entries,
        }
    }

    /// Fetch up to `max_entries` samples from shared storage.
    ///
    /// A missing blob or unreadable top-level document yields an empty
    /// batch; a single malformed entry is skipped, not fatal.
    pub fn fetch_latest(&self) -> Vec<GlucoseSample> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Vec::new(),
            Err(err) => {
                warn!("shared storage unreadable: {err}");
                return Vec::new();
            }
        };

        let entries: Vec<serde_json::Value> = match serde_json::from_str(&raw) {
            Ok(entries) => entries,
            Err(err) => {
                warn!("shared storage is not a JSON array: {err}");
                return Vec::new();
            }
        };

        let mut samples = Vec::new();
        for entry in entries.into_iter().take(self.max_entries) {
            let Ok(entry) = serde_json::from_value::<SharedEntry>(entry) else {
                debug!("skipping malformed shared-storage entry");
                continue;
            };
            let Some(date) = parse_wcf_date(&entry.dt) else {
                debug!("skipping shared-storage entry with bad timestamp {:?}", entry.dt);
                continue;
            };

            samples.push(GlucoseSample {
                id: Uuid::new_v4().to_string(),
                device: String::new(),
                sample_type: "sgv".to_string(),
                sgv: Some(entry.value),
                direction: Direction::from_raw(&entry.direction),
                date: date.timestamp_millis(),
                date_string: date,
                filtered: None,
                noise: None,
                glucose: Some(entry.value),
            });
        }
        samples
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::GLUCOSE_DEVICE_TAG;
    use std::io::Write;

    #[test]
    fn slot_overwrites_and_drains_once() {
        let slot = GlucoseSlot::new();
        let ts = Utc::now();
        slot.publish(vec![GlucoseSample::new(GLUCOSE_DEVICE_TAG, 100, None, ts)]);
        slot.publish(vec![
            GlucoseSample::new(GLUCOSE_DEVICE_TAG, 110, None, ts),
            GlucoseSample::new(GLUCOSE_DEVICE_TAG, 112, None, ts),
        ]);

        // Latest batch wins, earlier one is gone.
        let drained = slot.drain();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].sgv, Some(110));

        // Second drain is empty.
        assert!(slot.drain().is_empty());
    }

    #[test]
    fn wcf_date_parses_exactly() {
        let parsed = parse_wcf_date("/Date(1462404576000)/").unwrap();
        assert_eq!(parsed.timestamp_millis(), 1_462_404_576_000);

        assert!(parse_wcf_date("/Date()/").is_none());
        assert!(parse_wcf_date("2016-05-04T12:00:00Z").is_none());
    }

    #[test]
    fn shared_storage_skips_malformed_entries() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"[
                {{"Value": 120, "direction": "Flat", "DT": "/Date(1462404576000)/"}},
                {{"Value": "bad", "direction": "Flat", "DT": "/Date(1462404576000)/"}},
                {{"Value": 130, "direction": "FortyFiveUp", "DT": "not a date"}},
                {{"Value": 140, "direction": "SingleDown", "DT": "/Date(1462404876000)/"}}
            ]"#
        )
        .unwrap();

        let reader = SharedStorageReader::new(file.path(), 60);
        let samples = reader.fetch_latest();
        assert_eq!(samples.len(), 2);
        assert_eq!(samples[0].sgv, Some(120));
        assert_eq!(samples[0].direction, Some(Direction::Flat));
        assert_eq!(samples[1].direction, Some(Direction::SingleDown));
    }

    #[test]
    fn shared_storage_missing_file_is_empty() {
        let reader = SharedStorageReader::new("/nonexistent/latest_readings.json", 60);
        assert!(reader.fetch_latest().is_empty());
    }

    #[test]
    fn shared_storage_caps_entry_count() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        let entries: Vec<String> = (0..5)
            .map(|i| {
                format!(
                    r#"{{"Value": {}, "direction": "Flat", "DT": "/Date({})/"}}"#,
                    100 + i,
                    1_462_404_576_000_i64 + i * 60_000
                )
            })
            .collect();
        write!(file, "[{}]", entries.join(",")).unwrap();

        let reader = SharedStorageReader::new(file.path(), 3);
        assert_eq!(reader.fetch_latest().len(), 3);
    }
}
