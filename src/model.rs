//! Domain model shared across the orchestration core.
//!
//! Defines the glucose sample and trend/direction vocabulary, pump telemetry
//! snapshots (battery, reservoir, pod), pump history events, and the display
//! state published for each active device. All types are plain serde-enabled
//! data; behavior lives in the session and pipeline modules.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Device tag attached to samples produced by the direct-sensor path.
pub const GLUCOSE_DEVICE_TAG: &str = "aps-core";

/// Sentinel reservoir level reported when a pod has no measured reservoir.
///
/// Preserved verbatim through persistence and broadcast; consumers treat it
/// as "unknown/unbounded", never as a numeric reading.
pub const RESERVOIR_LEVEL_UNKNOWN: f64 = 0xDEAD_BEEF_u32 as f64;

/// mg/dL → mmol/L exchange rate.
pub const MMOL_EXCHANGE_RATE: f64 = 0.0555;

/// Convert a whole mg/dL value to mmol/L.
pub fn mgdl_to_mmol(mgdl: i32) -> f64 {
    f64::from(mgdl) * MMOL_EXCHANGE_RATE
}

/// Convert a mmol/L value to mg/dL.
pub fn mmol_to_mgdl(mmol: f64) -> f64 {
    mmol / MMOL_EXCHANGE_RATE
}

// =============================================================================
// Glucose samples
// =============================================================================

/// Nightscout-style direction vocabulary (9 symbols plus sentinels).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    TripleUp,
    DoubleUp,
    SingleUp,
    FortyFiveUp,
    Flat,
    FortyFiveDown,
    SingleDown,
    DoubleDown,
    TripleDown,
    #[serde(rename = "NONE")]
    None,
    #[serde(rename = "NOT COMPUTABLE")]
    NotComputable,
    #[serde(rename = "RATE OUT OF RANGE")]
    RateOutOfRange,
}

impl Direction {
    /// Parse the wire spelling used by shared storage and remote services.
    pub fn from_raw(raw: &str) -> Option<Self> {
        serde_json::from_value(serde_json::Value::String(raw.to_string())).ok()
    }
}

/// Seven-level ordinal trend scale reported by sensor SDKs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Trend {
    UpUpUp,
    UpUp,
    Up,
    Flat,
    Down,
    DownDown,
    DownDownDown,
}

impl Trend {
    /// Decode the 1-based ordinal used on the wire. Unrecognized levels map
    /// to `None` so a future SDK value degrades to "no direction".
    pub fn from_level(level: u8) -> Option<Self> {
        match level {
            1 => Some(Trend::UpUpUp),
            2 => Some(Trend::UpUp),
            3 => Some(Trend::Up),
            4 => Some(Trend::Flat),
            5 => Some(Trend::Down),
            6 => Some(Trend::DownDown),
            7 => Some(Trend::DownDownDown),
            _ => None,
        }
    }
}

/// Total mapping from the sensor trend scale onto the direction vocabulary.
///
/// Flat maps to the midpoint; an absent trend maps to no direction rather
/// than failing.
pub fn direction_for_trend(trend: Option<Trend>) -> Option<Direction> {
    let trend = trend?;
    Some(match trend {
        Trend::UpUpUp => Direction::TripleUp,
        Trend::UpUp => Direction::DoubleUp,
        Trend::Up => Direction::SingleUp,
        Trend::Flat => Direction::Flat,
        Trend::Down => Direction::SingleDown,
        Trend::DownDown => Direction::DoubleDown,
        Trend::DownDownDown => Direction::TripleDown,
    })
}

/// A single blood-glucose sample, immutable once constructed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlucoseSample {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(default)]
    pub device: String,
    #[serde(rename = "type", default = "default_sample_type")]
    pub sample_type: String,
    pub sgv: Option<i32>,
    pub direction: Option<Direction>,
    /// Raw timestamp in epoch milliseconds (wire form).
    pub date: i64,
    #[serde(rename = "dateString")]
    pub date_string: DateTime<Utc>,
    pub filtered: Option<f64>,
    pub noise: Option<i32>,
    pub glucose: Option<i32>,
}

fn default_sample_type() -> String {
    "sgv".to_string()
}

impl GlucoseSample {
    /// Build a sample with a fresh unique id and matching ms timestamp.
    pub fn new(
        device: &str,
        value_mgdl: i32,
        direction: Option<Direction>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            device: device.to_string(),
            sample_type: default_sample_type(),
            sgv: Some(value_mgdl),
            direction,
            date: timestamp.timestamp_millis(),
            date_string: timestamp,
            filtered: None,
            noise: None,
            glucose: Some(value_mgdl),
        }
    }

    /// A sample is clinically valid iff its value is at least 39 mg/dL and
    /// its noise indicator (if present) is not the "bad" sentinel.
    pub fn is_state_valid(&self) -> bool {
        self.sgv.unwrap_or(0) >= 39 && self.noise.unwrap_or(1) != 4
    }
}

/// Raw reading as delivered by a sensor SDK, before canonical conversion.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RawSensorReading {
    /// Quantity in mg/dL, not yet rounded.
    pub quantity_mgdl: f64,
    pub date: DateTime<Utc>,
}

// =============================================================================
// Pump telemetry
// =============================================================================

/// Battery banding cutoff: below this percentage the battery reads as low.
pub const LOW_BATTERY_PERCENT: i32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatteryState {
    Normal,
    Low,
}

/// Snapshot of pump battery charge, persisted and broadcast on status change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Battery {
    pub percent: i32,
    pub voltage: Option<f64>,
    #[serde(rename = "string")]
    pub state: BatteryState,
    pub display: bool,
}

impl Battery {
    /// Derive a snapshot from the pump-reported charge fraction. An absent
    /// reading displays as a full, non-displayable battery.
    pub fn from_charge(charge_remaining: Option<f64>) -> Self {
        let percent = (charge_remaining.unwrap_or(1.0) * 100.0).round() as i32;
        Self {
            percent,
            voltage: None,
            state: if percent >= LOW_BATTERY_PERCENT {
                BatteryState::Normal
            } else {
                BatteryState::Low
            },
            display: charge_remaining.is_some(),
        }
    }
}

/// One reservoir measurement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReservoirValue {
    pub start_date: DateTime<Utc>,
    pub unit_volume: f64,
}

/// Record returned to the pump driver after a reservoir reading is stored.
///
/// `continuous` is always asserted true: this layer does not attempt gap
/// detection.
#[derive(Debug, Clone, PartialEq)]
pub struct ReservoirReading {
    pub new_value: ReservoirValue,
    pub last_value: Option<ReservoirValue>,
    pub continuous: bool,
}

/// Pod-style telemetry exposed by some pump families.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PodStatus {
    pub reservoir_level: Option<f64>,
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BolusState {
    NoBolus,
    InProgress,
    Canceling,
}

impl BolusState {
    pub fn is_in_progress(&self) -> bool {
        matches!(self, BolusState::InProgress)
    }
}

/// Status reported by a pump driver on every meaningful change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PumpStatus {
    pub bolus_state: BolusState,
    /// Charge fraction in `0.0..=1.0`, `None` when the pump has no gauge.
    pub battery_charge_remaining: Option<f64>,
    pub pod: Option<PodStatus>,
}

/// Progress of a bolus in flight, published by the pump's progress reporter.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BolusProgress {
    pub delivered_units: f64,
    pub total_units: f64,
}

impl BolusProgress {
    pub fn percent_complete(&self) -> f64 {
        if self.total_units <= 0.0 {
            return 0.0;
        }
        (self.delivered_units / self.total_units).clamp(0.0, 1.0) * 100.0
    }
}

/// One pump history event (dose, alarm, rewind, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PumpEvent {
    pub title: String,
    pub date: DateTime<Utc>,
}

// =============================================================================
// Display state
// =============================================================================

/// Display state derived whenever the active pump changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PumpDisplayState {
    pub name: String,
    pub image: Option<String>,
}

/// Display state derived whenever the active CGM changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CgmDisplayState {
    pub name: String,
    pub image: Option<String>,
}

/// Manager state as written to durable storage: the family identifier plus
/// the manager-defined opaque blob.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedManagerState {
    pub manager_identifier: String,
    pub state: serde_json::Value,
}
