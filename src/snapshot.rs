//! BMS state snapshot (spec §3 "BMS state snapshot") and the freshness
//! policy that governs when it may be exposed to the aggregator (spec §4.2).

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::codec::flags::{ErrorFlags, StatusFlags, WarningFlags};
use crate::codec::{FrameKind, REQUIRED_GROUP_IDS};

/// Nominal BMS transmit period; freshness window is three times this value
/// (spec §4.2) unless overridden per-input.
pub const DEFAULT_NOMINAL_PERIOD: Duration = Duration::from_secs(1);

/// One input BMS's most recent decoded state. Owned exclusively by its
/// input session; the aggregator only ever reads a cloned copy.
#[derive(Debug, Clone)]
pub struct BmsSnapshot {
    pub u_setpoint_charge: f64,
    pub u_setpoint_discharge: f64,
    pub i_lim_charge: f64,
    pub i_lim_discharge: f64,
    pub u_measured: f64,
    pub i_measured: f64,
    pub t_measured: f64,
    pub soc: f64,
    pub soh: f64,
    pub capacity_ah: f64,
    pub error_flags: ErrorFlags,
    pub warning_flags: WarningFlags,
    pub status_flags: StatusFlags,
    pub last_update_ts: Instant,
    /// A full `REQUIRED_GROUP_IDS` set has been received at least once.
    /// Monotonic: once true, never reverts to false (spec §3 invariant).
    pub complete: bool,
    /// Per-telegram-group last-seen timestamp, used for the freshness check.
    last_seen: HashMap<u32, Instant>,
    nominal_period: Duration,
}

impl BmsSnapshot {
    pub fn new(capacity_ah: f64, nominal_period: Duration) -> Self {
        let now = Instant::now();
        BmsSnapshot {
            u_setpoint_charge: 0.0,
            u_setpoint_discharge: 0.0,
            i_lim_charge: 0.0,
            i_lim_discharge: 0.0,
            u_measured: 0.0,
            i_measured: 0.0,
            t_measured: 0.0,
            soc: 0.0,
            soh: 0.0,
            capacity_ah,
            error_flags: ErrorFlags::empty(),
            warning_flags: WarningFlags::empty(),
            status_flags: StatusFlags::empty(),
            last_update_ts: now,
            complete: false,
            last_seen: HashMap::new(),
            nominal_period,
        }
    }

    /// Apply a decoded telegram, updating the relevant fields in place and
    /// recording `last_seen[group] = now`. Returns `true` if this update
    /// caused the snapshot to become `complete` for the first time.
    pub fn apply(&mut self, id: u32, kind: &FrameKind) -> bool {
        let now = Instant::now();
        match kind {
            FrameKind::Limits(l) => {
                self.u_setpoint_charge = l.u_charge;
                self.u_setpoint_discharge = l.u_discharge;
                self.i_lim_charge = l.i_lim_charge;
                self.i_lim_discharge = l.i_lim_discharge;
            }
            FrameKind::SocSoh(s) => {
                self.soc = s.soc as f64;
                self.soh = s.soh as f64;
            }
            FrameKind::Measurements(m) => {
                self.u_measured = m.u_measured;
                self.i_measured = m.i_measured;
                self.t_measured = m.t_measured;
            }
            FrameKind::Status(s) => {
                self.error_flags = s.error_flags;
                self.warning_flags = s.warning_flags;
            }
            FrameKind::Request(r) => {
                self.status_flags = r.status_flags;
            }
            FrameKind::Manufacturer(_) | FrameKind::Sync | FrameKind::Ignored(_) => {
                return false;
            }
        }
        self.last_update_ts = now;
        self.last_seen.insert(id, now);

        let was_complete = self.complete;
        if !was_complete && REQUIRED_GROUP_IDS.iter().all(|g| self.last_seen.contains_key(g)) {
            self.complete = true;
        }
        self.complete && !was_complete
    }

    /// True iff every required telegram group has been seen within the
    /// freshness window (three times the nominal transmit period).
    pub fn is_fresh(&self) -> bool {
        if !self.complete {
            return false;
        }
        let window = self.nominal_period * 3;
        let now = Instant::now();
        REQUIRED_GROUP_IDS.iter().all(|g| {
            self.last_seen
                .get(g)
                .is_some_and(|ts| now.duration_since(*ts) <= window)
        })
    }

    /// Age of the oldest required group's last update, for telemetry
    /// (`"last_seen_age_s"`).
    pub fn staleness_age(&self) -> Duration {
        let now = Instant::now();
        REQUIRED_GROUP_IDS
            .iter()
            .map(|g| {
                self.last_seen
                    .get(g)
                    .map(|ts| now.duration_since(*ts))
                    .unwrap_or(Duration::MAX)
            })
            .max()
            .unwrap_or(Duration::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{ID_LIMITS, ID_MEASUREMENTS, ID_SOC_SOH, ID_STATUS};
    use crate::codec::{LimitsTelegram, MeasurementsTelegram, SocSohTelegram, StatusTelegram};

    fn limits() -> FrameKind {
        FrameKind::Limits(LimitsTelegram {
            u_charge: 55.0,
            i_lim_charge: 100.0,
            i_lim_discharge: 100.0,
            u_discharge: 45.0,
        })
    }

    fn soc_soh() -> FrameKind {
        FrameKind::SocSoh(SocSohTelegram { soc: 50, soh: 100 })
    }

    fn measurements() -> FrameKind {
        FrameKind::Measurements(MeasurementsTelegram {
            u_measured: 52.0,
            i_measured: 20.0,
            t_measured: 25.0,
        })
    }

    fn status() -> FrameKind {
        FrameKind::Status(StatusTelegram {
            error_flags: ErrorFlags::empty(),
            warning_flags: WarningFlags::empty(),
            module_count: 1,
            vendor: *b"PN\0",
        })
    }

    #[test]
    fn becomes_complete_only_after_all_required_groups_seen() {
        let mut snap = BmsSnapshot::new(100.0, DEFAULT_NOMINAL_PERIOD);
        assert!(!snap.apply(ID_LIMITS, &limits()));
        assert!(!snap.complete);
        assert!(!snap.apply(ID_SOC_SOH, &soc_soh()));
        assert!(!snap.apply(ID_MEASUREMENTS, &measurements()));
        assert!(snap.apply(ID_STATUS, &status()));
        assert!(snap.complete);
    }

    #[test]
    fn complete_never_reverts_to_false() {
        let mut snap = BmsSnapshot::new(100.0, DEFAULT_NOMINAL_PERIOD);
        snap.apply(ID_LIMITS, &limits());
        snap.apply(ID_SOC_SOH, &soc_soh());
        snap.apply(ID_MEASUREMENTS, &measurements());
        snap.apply(ID_STATUS, &status());
        assert!(snap.complete);
        // A later partial update must not un-complete the snapshot.
        snap.apply(ID_SOC_SOH, &soc_soh());
        assert!(snap.complete);
    }

    #[test]
    fn fresh_only_when_complete_and_within_window() {
        let mut snap = BmsSnapshot::new(100.0, Duration::from_millis(1));
        assert!(!snap.is_fresh());
        snap.apply(ID_LIMITS, &limits());
        snap.apply(ID_SOC_SOH, &soc_soh());
        snap.apply(ID_MEASUREMENTS, &measurements());
        snap.apply(ID_STATUS, &status());
        assert!(snap.is_fresh());
        std::thread::sleep(Duration::from_millis(10));
        assert!(!snap.is_fresh());
    }
}
