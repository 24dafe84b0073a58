//! Unified state and the capacity-weighted aggregation rules (C3, spec §4.3).

use crate::codec::flags::{StatusFlags, STATUS_ENABLE_MASK};
use crate::config::BatteryConfig;
use crate::snapshot::BmsSnapshot;

/// The aggregator's output: one virtual BMS representing the whole parallel
/// battery stack (spec §3 "Unified state").
#[derive(Debug, Clone, PartialEq)]
pub struct UnifiedState {
    pub generation: u64,
    pub u_setpoint_charge: f64,
    pub u_setpoint_discharge: f64,
    pub i_lim_charge: f64,
    pub i_lim_discharge: f64,
    pub u_measured: f64,
    pub i_measured: f64,
    pub t_measured: f64,
    pub soc: f64,
    pub soh: f64,
    pub capacity_total_ah: f64,
    pub error_flags: crate::codec::flags::ErrorFlags,
    pub warning_flags: crate::codec::flags::WarningFlags,
    pub status_flags: StatusFlags,
}

/// Combines fresh input snapshots into a unified state. Stateless apart from
/// the monotonically increasing generation counter (spec §3: "a `generation`
/// counter monotonically increasing on every recomputation").
pub struct Aggregator {
    battery: BatteryConfig,
    generation: u64,
}

impl Aggregator {
    pub fn new(battery: BatteryConfig) -> Self {
        Aggregator {
            battery,
            generation: 0,
        }
    }

    /// Produce a unified state from the given snapshots, or `None` if the
    /// inputs are not all fresh, or total capacity is zero (spec §4.3 tie-break
    /// rule: "when `C = 0` ... the aggregator emits no unified state").
    ///
    /// Suppression on non-freshness is deliberate: partial data could
    /// mis-command inverters (spec §4.3).
    pub fn aggregate(&mut self, snapshots: &[BmsSnapshot]) -> Option<UnifiedState> {
        if snapshots.is_empty() || !snapshots.iter().all(BmsSnapshot::is_fresh) {
            return None;
        }

        let capacity_total_ah: f64 = snapshots.iter().map(|s| s.capacity_ah).sum();
        if capacity_total_ah <= 0.0 {
            log::error!("aggregator: total configured capacity is zero, cannot weight inputs");
            return None;
        }

        let weighted = |f: fn(&BmsSnapshot) -> f64| -> f64 {
            snapshots.iter().map(|s| f(s) * s.capacity_ah).sum::<f64>() / capacity_total_ah
        };

        let u_setpoint_charge = snapshots
            .iter()
            .map(|s| s.u_setpoint_charge)
            .fold(f64::INFINITY, f64::min);
        let u_setpoint_discharge = snapshots
            .iter()
            .map(|s| s.u_setpoint_discharge)
            .fold(f64::NEG_INFINITY, f64::max);

        let sum_i_lim_charge: f64 = snapshots.iter().map(|s| s.i_lim_charge).sum();
        let sum_i_lim_discharge: f64 = snapshots.iter().map(|s| s.i_lim_discharge).sum();
        let i_lim_charge = sum_i_lim_charge.min(self.battery.i_lim_charge);
        let i_lim_discharge = sum_i_lim_discharge.min(self.battery.i_lim_discharge);

        let sum_i: f64 = snapshots.iter().map(|s| s.i_measured).sum();
        let i_measured = sum_i * self.battery.i_tot_scaling + self.battery.i_tot_offset;

        let error_flags = snapshots
            .iter()
            .fold(crate::codec::flags::ErrorFlags::empty(), |acc, s| {
                acc | s.error_flags
            });
        let warning_flags = snapshots
            .iter()
            .fold(crate::codec::flags::WarningFlags::empty(), |acc, s| {
                acc | s.warning_flags
            });

        let enable_bits = snapshots
            .iter()
            .map(|s| s.status_flags & STATUS_ENABLE_MASK)
            .fold(STATUS_ENABLE_MASK, |acc, s| acc & s);
        let request_bits = snapshots
            .iter()
            .map(|s| s.status_flags & !STATUS_ENABLE_MASK)
            .fold(StatusFlags::empty(), |acc, s| acc | s);
        let status_flags = enable_bits | request_bits;

        self.generation += 1;

        Some(UnifiedState {
            generation: self.generation,
            u_setpoint_charge,
            u_setpoint_discharge,
            i_lim_charge,
            i_lim_discharge,
            u_measured: weighted(|s| s.u_measured),
            i_measured,
            t_measured: weighted(|s| s.t_measured),
            soc: weighted(|s| s.soc),
            soh: weighted(|s| s.soh),
            capacity_total_ah,
            error_flags,
            warning_flags,
            status_flags,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::flags::ErrorFlags;
    use std::time::Duration;

    fn snap(capacity_ah: f64, soc: f64, u_setpoint_charge: f64, u_setpoint_discharge: f64) -> BmsSnapshot {
        let mut s = BmsSnapshot::new(capacity_ah, Duration::from_secs(3600));
        s.soc = soc;
        s.soh = 100.0;
        s.u_setpoint_charge = u_setpoint_charge;
        s.u_setpoint_discharge = u_setpoint_discharge;
        s.u_measured = 52.0;
        s.i_measured = 0.0;
        s.t_measured = 25.0;
        s.i_lim_charge = 0.0;
        s.i_lim_discharge = 0.0;
        s.complete = true;
        s
    }

    fn battery() -> BatteryConfig {
        BatteryConfig {
            i_lim_charge: 1000.0,
            i_lim_discharge: 1000.0,
            i_tot_scaling: 1.0,
            i_tot_offset: 0.0,
        }
    }

    #[test]
    fn s2_weighted_average_soc() {
        let mut agg = Aggregator::new(battery());
        let a = snap(100.0, 40.0, 55.0, 45.0);
        let b = snap(300.0, 80.0, 55.0, 45.0);
        let unified = agg.aggregate(&[a, b]).unwrap();
        assert!((unified.soc - 70.0).abs() < 1e-9);
    }

    #[test]
    fn s3_voltage_safety_min_max() {
        let mut agg = Aggregator::new(battery());
        let a = snap(100.0, 50.0, 55.0, 44.0);
        let b = snap(100.0, 50.0, 56.0, 45.0);
        let unified = agg.aggregate(&[a, b]).unwrap();
        assert!((unified.u_setpoint_charge - 55.0).abs() < 1e-9);
        assert!((unified.u_setpoint_discharge - 45.0).abs() < 1e-9);
    }

    #[test]
    fn s4_current_limit_clamped_to_battery_config() {
        let mut battery = battery();
        battery.i_lim_charge = 700.0;
        let mut agg = Aggregator::new(battery);
        let mut a = snap(100.0, 50.0, 55.0, 45.0);
        a.i_lim_charge = 500.0;
        let mut b = snap(100.0, 50.0, 55.0, 45.0);
        b.i_lim_charge = 300.0;
        let unified = agg.aggregate(&[a, b]).unwrap();
        assert!((unified.i_lim_charge - 700.0).abs() < 1e-9);
    }

    #[test]
    fn invariant_2_i_lim_bounded_by_battery_config_and_sum() {
        let mut battery = battery();
        battery.i_lim_charge = 50.0;
        let mut agg = Aggregator::new(battery);
        let mut a = snap(100.0, 50.0, 55.0, 45.0);
        a.i_lim_charge = 30.0;
        let mut b = snap(100.0, 50.0, 55.0, 45.0);
        b.i_lim_charge = 30.0;
        let sum = a.i_lim_charge + b.i_lim_charge;
        let unified = agg.aggregate(&[a, b]).unwrap();
        assert!(unified.i_lim_charge <= 50.0);
        assert!(unified.i_lim_charge <= sum);
    }

    #[test]
    fn zero_total_capacity_suppresses_output() {
        let mut agg = Aggregator::new(battery());
        let a = snap(0.0, 50.0, 55.0, 45.0);
        assert!(agg.aggregate(&[a]).is_none());
    }

    #[test]
    fn non_fresh_input_suppresses_output() {
        let mut agg = Aggregator::new(battery());
        let mut stale = snap(100.0, 50.0, 55.0, 45.0);
        stale.complete = false;
        assert!(agg.aggregate(&[stale]).is_none());
    }

    #[test]
    fn invariant_4_pure_modulo_generation() {
        let mut agg = Aggregator::new(battery());
        let a = snap(100.0, 50.0, 55.0, 45.0);
        let b = snap(100.0, 50.0, 55.0, 45.0);
        let first = agg.aggregate(&[a.clone(), b.clone()]).unwrap();
        let second = agg.aggregate(&[a, b]).unwrap();
        assert_eq!(second.generation, first.generation + 1);
        assert_eq!(second.soc, first.soc);
        assert_eq!(second.u_setpoint_charge, first.u_setpoint_charge);
    }

    #[test]
    fn error_flags_or_across_inputs() {
        let mut agg = Aggregator::new(battery());
        let mut a = snap(100.0, 50.0, 55.0, 45.0);
        a.error_flags = ErrorFlags::CELL_OVERVOLTAGE;
        let mut b = snap(100.0, 50.0, 55.0, 45.0);
        b.error_flags = ErrorFlags::SHORT_CIRCUIT;
        let unified = agg.aggregate(&[a, b]).unwrap();
        assert!(unified.error_flags.contains(ErrorFlags::CELL_OVERVOLTAGE));
        assert!(unified.error_flags.contains(ErrorFlags::SHORT_CIRCUIT));
    }

    #[test]
    fn status_enable_requires_unanimous_agreement() {
        let mut agg = Aggregator::new(battery());
        let mut a = snap(100.0, 50.0, 55.0, 45.0);
        a.status_flags = StatusFlags::CHARGE_ENABLE | StatusFlags::DISCHARGE_ENABLE;
        let mut b = snap(100.0, 50.0, 55.0, 45.0);
        b.status_flags = StatusFlags::DISCHARGE_ENABLE; // charge not enabled here
        let unified = agg.aggregate(&[a, b]).unwrap();
        assert!(!unified.status_flags.contains(StatusFlags::CHARGE_ENABLE));
        assert!(unified.status_flags.contains(StatusFlags::DISCHARGE_ENABLE));
    }

    #[test]
    fn status_request_bits_are_union() {
        let mut agg = Aggregator::new(battery());
        let mut a = snap(100.0, 50.0, 55.0, 45.0);
        a.status_flags = StatusFlags::FORCE_CHARGE_1;
        let b = snap(100.0, 50.0, 55.0, 45.0);
        let unified = agg.aggregate(&[a, b]).unwrap();
        assert!(unified.status_flags.contains(StatusFlags::FORCE_CHARGE_1));
    }
}
