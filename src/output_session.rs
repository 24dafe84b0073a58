//! Output BMS session task (C4, spec §4 "Output sessions").
//!
//! Translates the aggregator's [`UnifiedState`] into the fixed Pylontech/SMA
//! telegram burst an inverter expects, with push-mode coalescing and an
//! optional sync-mode handshake driven by inbound/outbound 0x305 frames.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, watch};

use crate::aggregator::UnifiedState;
use crate::can_iface;
use crate::codec::{self, CanFrame};
use crate::codec::{
    LimitsTelegram, ManufacturerTelegram, MeasurementsTelegram, RequestTelegram, SocSohTelegram,
    StatusTelegram,
};
use crate::config::OutputBmsConfig;

#[derive(Debug, Default, Clone, Copy)]
pub struct OutputStats {
    pub bursts_sent: u64,
    pub frames_failed: u64,
}

/// Build the six outbound telegrams in the fixed emission order
/// `0x351, 0x355, 0x356, 0x359, 0x35C, 0x35E`, with this output's own
/// scaling/offset and current-limit cap applied (spec §4 "per-output current
/// transform").
fn build_frames(unified: &UnifiedState, config: &OutputBmsConfig) -> Vec<(u32, Vec<u8>)> {
    let i_lim_charge = unified.i_lim_charge.min(config.i_lim_charge);
    let i_lim_discharge = unified.i_lim_discharge.min(config.i_lim_discharge);
    let i_measured = unified.i_measured * config.i_scaling + config.i_offset;

    let limits = LimitsTelegram {
        u_charge: unified.u_setpoint_charge,
        i_lim_charge,
        i_lim_discharge,
        u_discharge: unified.u_setpoint_discharge,
    };
    let soc_soh = SocSohTelegram {
        soc: unified.soc.round().clamp(0.0, u16::MAX as f64) as u16,
        soh: unified.soh.round().clamp(0.0, u16::MAX as f64) as u16,
    };
    let measurements = MeasurementsTelegram {
        u_measured: unified.u_measured,
        i_measured,
        t_measured: unified.t_measured,
    };
    let status = StatusTelegram {
        error_flags: unified.error_flags,
        warning_flags: unified.warning_flags,
        module_count: 1,
        vendor: *b"GW\0",
    };
    let request = RequestTelegram {
        status_flags: unified.status_flags,
    };
    let manufacturer = ManufacturerTelegram {
        name: *b"GATEWAY\0",
    };

    vec![
        limits.encode(),
        soc_soh.encode(),
        measurements.encode(),
        status.encode(),
        request.encode(),
        manufacturer.encode(),
    ]
}

/// Resolves once `pending` is true and `push_min_delay` has elapsed since
/// `last_sent`; stays pending forever otherwise. Used purely to wake the
/// select loop up for a re-check, never to decide by itself.
async fn wait_until_ready(pending: bool, last_sent: Option<Instant>, delay: Duration) {
    if !pending {
        std::future::pending::<()>().await;
        return;
    }
    if let Some(t) = last_sent {
        let elapsed = t.elapsed();
        if elapsed < delay {
            tokio::time::sleep(delay - elapsed).await;
        }
    }
}

/// Drive one output (inverter-facing) session: coalesce unified-state
/// updates behind `PUSH-MIN-DELAY`, answer inbound sync requests, and
/// optionally emit our own periodic sync telegram (spec §4 "push/sync
/// modes"). A per-frame send failure is logged and counted, never
/// propagated — the burst continues with the remaining frames.
pub async fn run(
    desc: String,
    config: OutputBmsConfig,
    mut state_rx: watch::Receiver<Option<UnifiedState>>,
    mut frame_rx: mpsc::Receiver<CanFrame>,
    write_tx: mpsc::Sender<(u32, Vec<u8>)>,
    mut shutdown: watch::Receiver<bool>,
    write_failures: Arc<AtomicU64>,
) -> OutputStats {
    let push_min_delay = Duration::from_secs_f64(config.push_min_delay.max(0.0));
    let mut last_sent: Option<Instant> = None;
    let mut pending = false;
    let mut stats = OutputStats::default();

    let mut sync_timer = (config.send_sync_activated && config.sync_interval > 0.0)
        .then(|| tokio::time::interval(Duration::from_secs_f64(config.sync_interval)));

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    stats.frames_failed += write_failures.load(Ordering::Relaxed);
                    return stats;
                }
            }
            changed = state_rx.changed() => {
                if changed.is_err() {
                    log::warn!("output[{desc}]: unified state channel closed, ending session");
                    stats.frames_failed += write_failures.load(Ordering::Relaxed);
                    return stats;
                }
                // Sync mode only transmits in answer to an inbound sync/ack
                // frame (spec §4.4); a state update alone must not trigger one.
                if !config.send_sync_activated {
                    pending = true;
                }
            }
            maybe_frame = frame_rx.recv() => {
                match maybe_frame {
                    Some(frame) if codec::is_sync_ack(&frame.data) => pending = true,
                    Some(_) => {}
                    None => log::warn!("output[{desc}]: reader channel closed"),
                }
            }
            _ = async {
                match sync_timer.as_mut() {
                    Some(timer) => { timer.tick().await; }
                    None => std::future::pending::<()>().await,
                }
            } => {
                if write_tx.send(can_iface::sync_frame()).await.is_err() {
                    log::warn!("output[{desc}]: failed to queue outgoing sync frame");
                }
            }
            _ = wait_until_ready(pending, last_sent, push_min_delay) => {}
        }

        if !pending {
            continue;
        }
        let ready = last_sent.map_or(true, |t| t.elapsed() >= push_min_delay);
        if !ready {
            continue;
        }
        let Some(unified) = state_rx.borrow().clone() else {
            pending = false;
            continue;
        };
        pending = false;
        last_sent = Some(Instant::now());

        for (id, data) in build_frames(&unified, &config) {
            if write_tx.send((id, data)).await.is_err() {
                stats.frames_failed += 1;
                log::warn!("output[{desc}]: failed to queue frame {id:#x}");
            }
        }
        stats.bursts_sent += 1;
    }
}
