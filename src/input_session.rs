//! Input BMS session task (C2, spec §4 "Input sessions").
//!
//! Owns one input BMS's [`BmsSnapshot`], fed by frames arriving from
//! [`crate::can_iface::run_reader`]. Reconnect backoff lives in `can_iface`;
//! this task only worries about decoding and bookkeeping once frames arrive.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};

use crate::codec::{self, CanFrame};
use crate::codec::flags::{ErrorFlags, WarningFlags};
use crate::config::InputBmsConfig;
use crate::error::CodecError;
use crate::snapshot::BmsSnapshot;

/// Running counters exposed to telemetry and logs.
#[derive(Debug, Default, Clone, Copy)]
pub struct InputStats {
    pub frames_decoded: u64,
    pub decode_errors: u64,
}

/// Decode one frame and apply it to `snapshot`. Split out from [`run`] so the
/// decode/apply step is unit-testable without a runtime.
fn decode_and_apply(snapshot: &Arc<Mutex<BmsSnapshot>>, frame: &CanFrame) -> Result<bool, CodecError> {
    let kind = codec::decode(frame)?;
    Ok(snapshot.lock().apply(frame.id, &kind))
}

/// Drive one input BMS: decode inbound frames into `snapshot`, notify the
/// aggregator's mailbox on every accepted frame, and optionally poll the BMS
/// with an outgoing sync telegram every `POLL-INTERVAL` seconds.
///
/// Ends when `frame_rx` closes (the reader gave up, e.g. shutdown was
/// signaled) or `shutdown` fires.
pub async fn run(
    desc: String,
    config: InputBmsConfig,
    mut frame_rx: mpsc::Receiver<CanFrame>,
    snapshot: Arc<Mutex<BmsSnapshot>>,
    notify_tx: mpsc::Sender<()>,
    write_tx: Option<mpsc::Sender<(u32, Vec<u8>)>>,
    mut shutdown: watch::Receiver<bool>,
) -> InputStats {
    let mut stats = InputStats::default();
    let mut poll_timer = config
        .poll_interval
        .filter(|s| *s > 0.0)
        .map(|secs| tokio::time::interval(Duration::from_secs_f64(secs)));

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return stats;
                }
            }
            maybe_frame = frame_rx.recv() => {
                let Some(frame) = maybe_frame else {
                    log::warn!("input[{desc}]: reader channel closed, ending session");
                    return stats;
                };
                match decode_and_apply(&snapshot, &frame) {
                    Ok(became_complete) => {
                        stats.frames_decoded += 1;
                        if became_complete {
                            log::info!("input[{desc}]: snapshot complete, all required telegrams seen");
                        }
                        let _ = notify_tx.try_send(());
                    }
                    Err(err) => {
                        stats.decode_errors += 1;
                        log::warn!("input[{desc}]: decode error on id {:#x}: {err}", frame.id);
                    }
                }
            }
            _ = async {
                match poll_timer.as_mut() {
                    Some(timer) => { timer.tick().await; }
                    None => std::future::pending().await,
                }
            } => {
                if let Some(tx) = &write_tx {
                    let _ = tx.send(crate::can_iface::sync_frame()).await;
                }
            }
        }
    }
}

/// Current state reported alongside the aggregator's unified state, used by
/// the MQTT publisher's `inputs[]` array (spec §6).
pub struct InputReport {
    pub description: String,
    pub fresh: bool,
    pub last_seen_age_s: f64,
    pub error_flags: ErrorFlags,
    pub warning_flags: WarningFlags,
}

pub fn report(desc: &str, snapshot: &BmsSnapshot) -> InputReport {
    InputReport {
        description: desc.to_string(),
        fresh: snapshot.is_fresh(),
        last_seen_age_s: snapshot.staleness_age().as_secs_f64(),
        error_flags: snapshot.error_flags,
        warning_flags: snapshot.warning_flags,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::ID_LIMITS;
    use std::time::Duration as StdDuration;

    #[test]
    fn decode_and_apply_accepts_known_frame() {
        let snapshot = Arc::new(Mutex::new(BmsSnapshot::new(100.0, StdDuration::from_secs(1))));
        let frame = CanFrame::new(ID_LIMITS, vec![0x26, 0x02, 0xE8, 0x03, 0xE8, 0x03, 0xC2, 0x01]);
        let became_complete = decode_and_apply(&snapshot, &frame).unwrap();
        assert!(!became_complete);
        assert!((snapshot.lock().u_setpoint_charge - 55.0).abs() < 1e-9);
    }

    #[test]
    fn decode_and_apply_reports_truncated_frame_as_error() {
        let snapshot = Arc::new(Mutex::new(BmsSnapshot::new(100.0, StdDuration::from_secs(1))));
        let frame = CanFrame::new(ID_LIMITS, vec![0x01]);
        assert!(decode_and_apply(&snapshot, &frame).is_err());
    }

    #[test]
    fn decode_and_apply_ignores_unknown_id_without_error() {
        let snapshot = Arc::new(Mutex::new(BmsSnapshot::new(100.0, StdDuration::from_secs(1))));
        let frame = CanFrame::new(0x7FF, vec![0, 0, 0, 0, 0, 0, 0, 0]);
        let became_complete = decode_and_apply(&snapshot, &frame).unwrap();
        assert!(!became_complete);
    }
}
