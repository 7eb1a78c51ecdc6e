//! Rate-limited heartbeat gating.
//!
//! `HeartbeatGate` is the single shared watermark deciding whether a pump
//! poll may be issued now. It is a mutex-guarded cell with a narrow
//! read-modify-write API: the session worker serializes all heartbeat
//! handling, but a user-initiated force refresh may be evaluated from
//! another context, so the cell carries its own guard.
//!
//! The required interval follows a three-tier rule: the default 4.5 minutes
//! everywhere except a catch-up band of 5–10 minutes of elapsed time, where
//! it tightens to 1 minute. The apparent asymmetry (0–5 min and >10 min both
//! use the default) reflects deliberate vendor polling-rate constraints and
//! is preserved as-is.

use crate::config::HeartbeatSettings;
use chrono::{DateTime, Duration, Utc};

/// Guarded `last_heartbeat_time` cell plus the tier rule.
#[derive(Debug)]
pub struct HeartbeatGate {
    last: std::sync::Mutex<DateTime<Utc>>,
    default_interval: Duration,
    catch_up_interval: Duration,
    band_start: Duration,
    band_end: Duration,
}

impl HeartbeatGate {
    pub fn new(settings: &HeartbeatSettings) -> Self {
        let to_chrono = |d: std::time::Duration| {
            Duration::from_std(d).unwrap_or_else(|_| Duration::seconds(270))
        };
        Self {
            last: std::sync::Mutex::new(DateTime::<Utc>::MIN_UTC),
            default_interval: to_chrono(settings.default_interval),
            catch_up_interval: to_chrono(settings.catch_up_interval),
            band_start: to_chrono(settings.catch_up_band_start),
            band_end: to_chrono(settings.catch_up_band_end),
        }
    }

    /// Last successful advance. `DateTime::MIN_UTC` before the first one.
    pub fn last(&self) -> DateTime<Utc> {
        self.last.lock().map(|g| *g).unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    /// Interval required before the next unforced poll, given elapsed time
    /// since the previous one. Only the 5–10 minute band tightens it.
    pub fn required_interval(&self, elapsed: Duration) -> Duration {
        if elapsed > self.band_end {
            self.default_interval
        } else if elapsed > self.band_start {
            self.catch_up_interval
        } else {
            self.default_interval
        }
    }

    /// Unconditionally advance the watermark (forced poll path). The
    /// watermark never moves backwards.
    pub fn advance(&self, now: DateTime<Utc>) {
        if let Ok(mut last) = self.last.lock() {
            if now > *last {
                *last = now;
            }
        }
    }

    /// Advance the watermark iff enough time has elapsed; returns the
    /// elapsed duration on refusal so callers can log the skip.
    pub fn try_advance(&self, now: DateTime<Utc>) -> Result<(), Duration> {
        let Ok(mut last) = self.last.lock() else {
            return Err(Duration::zero());
        };
        let elapsed = now - *last;
        if elapsed < self.required_interval(elapsed) {
            return Err(elapsed);
        }
        *last = now;
        Ok(())
    }

    /// Rewind the watermark to a fixed instant. Test support only; runtime
    /// code never decreases the watermark.
    pub fn reset(&self, to: DateTime<Utc>) {
        if let Ok(mut last) = self.last.lock() {
            *last = to;
        }
    }
}

impl Default for HeartbeatGate {
    fn default() -> Self {
        Self::new(&HeartbeatSettings::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn gate_at(last: DateTime<Utc>) -> HeartbeatGate {
        let gate = HeartbeatGate::default();
        gate.reset(last);
        gate
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).single().unwrap()
    }

    #[test]
    fn tier_rule_matches_vendor_table() {
        let gate = HeartbeatGate::default();
        assert_eq!(
            gate.required_interval(Duration::minutes(2)),
            Duration::seconds(270)
        );
        assert_eq!(
            gate.required_interval(Duration::minutes(6)),
            Duration::seconds(60)
        );
        // Band edges: exactly 5 min stays default, exactly 10 min catches up.
        assert_eq!(
            gate.required_interval(Duration::minutes(5)),
            Duration::seconds(270)
        );
        assert_eq!(
            gate.required_interval(Duration::minutes(10)),
            Duration::seconds(60)
        );
        assert_eq!(
            gate.required_interval(Duration::minutes(11)),
            Duration::seconds(270)
        );
    }

    #[test]
    fn short_elapsed_refuses_and_keeps_watermark() {
        let gate = gate_at(t0());
        let now = t0() + Duration::minutes(3);
        assert!(gate.try_advance(now).is_err());
        assert_eq!(gate.last(), t0());
    }

    #[test]
    fn default_interval_elapsed_advances() {
        let gate = gate_at(t0());
        let now = t0() + Duration::seconds(270);
        assert!(gate.try_advance(now).is_ok());
        assert_eq!(gate.last(), now);
    }

    #[test]
    fn catch_up_band_tightens_interval() {
        let gate = gate_at(t0());
        let now = t0() + Duration::minutes(6);
        assert!(gate.try_advance(now).is_ok());
        assert_eq!(gate.last(), now);
    }

    #[test]
    fn above_band_reverts_to_default() {
        let gate = gate_at(t0());
        assert_eq!(
            gate.required_interval(Duration::minutes(20)),
            Duration::seconds(270)
        );
        assert!(gate.try_advance(t0() + Duration::minutes(20)).is_ok());
    }

    #[test]
    fn forced_advance_never_rewinds() {
        let gate = gate_at(t0());
        gate.advance(t0() - Duration::minutes(5));
        assert_eq!(gate.last(), t0());
        gate.advance(t0() + Duration::minutes(1));
        assert_eq!(gate.last(), t0() + Duration::minutes(1));
    }
}
