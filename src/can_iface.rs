//! SocketCAN interface glue shared by input and output sessions.
//!
//! `socketcan::CanSocket` is blocking; each direction gets its own socket
//! bound to the same named interface (the kernel CAN bus is a broadcast
//! medium, so independent reader/writer sockets on one interface is the
//! normal multi-listener pattern, same as running `candump` and `cansend`
//! concurrently) and its own dedicated OS thread driven through
//! `tokio::task::spawn_blocking`, mirroring the teacher's blocking-manager-
//! wrapped-for-async-callers shape (`can_handler.rs` + `commands.rs`).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use socketcan::{CanDataFrame, CanFrame as SocketCanFrame, Frame, Id, Socket, StandardId};
use tokio::sync::{mpsc, watch};

use crate::codec::CanFrame;
use crate::error::InterfaceError;

const INITIAL_BACKOFF: Duration = Duration::from_millis(250);
const MAX_BACKOFF: Duration = Duration::from_secs(5);
const READ_TIMEOUT: Duration = Duration::from_millis(200);

fn open_socket(iface: &str) -> Result<socketcan::CanSocket, InterfaceError> {
    socketcan::CanSocket::open(iface).map_err(|source| {
        if source.kind() == std::io::ErrorKind::PermissionDenied {
            InterfaceError::PermissionDenied(iface.to_string())
        } else {
            InterfaceError::Socket {
                iface: iface.to_string(),
                source,
            }
        }
    })
}

fn decode_raw_id(id: Id) -> u32 {
    match id {
        Id::Standard(sid) => sid.as_raw() as u32,
        Id::Extended(eid) => eid.as_raw(),
    }
}

fn build_frame(id: u32, data: &[u8]) -> Option<CanDataFrame> {
    let std_id = StandardId::new(id as u16)?;
    CanDataFrame::new(std_id, data)
}

/// Open `iface` once for reading, retrying with exponential backoff
/// (250 ms → capped at 5 s, spec §4.2 "Failure model") until it succeeds or
/// shutdown is signaled. Returns `None` on shutdown.
async fn open_with_backoff(
    iface: &str,
    shutdown: &mut watch::Receiver<bool>,
) -> Option<socketcan::CanSocket> {
    let mut backoff = INITIAL_BACKOFF;
    loop {
        if *shutdown.borrow() {
            return None;
        }
        match open_socket(iface) {
            Ok(socket) => return Some(socket),
            Err(err) => {
                log::warn!(
                    "can_iface[{iface}]: failed to open ({err}), retrying in {backoff:?}"
                );
                tokio::select! {
                    _ = tokio::time::sleep(backoff) => {}
                    _ = shutdown.changed() => return None,
                }
                backoff = (backoff * 2).min(MAX_BACKOFF);
            }
        }
    }
}

/// Continuously read frames from `iface`, forwarding decoded `CanFrame`s on
/// `tx`. Runs until `shutdown` is signaled; never panics the process on I/O
/// error (spec §4.2: "The session never panics the process").
pub async fn run_reader(iface: String, tx: mpsc::Sender<CanFrame>, mut shutdown: watch::Receiver<bool>) {
    loop {
        let Some(socket) = open_with_backoff(&iface, &mut shutdown).await else {
            return;
        };
        if let Err(err) = socket.set_read_timeout(READ_TIMEOUT) {
            log::warn!("can_iface[{iface}]: failed to set read timeout: {err}");
        }
        log::info!("can_iface[{iface}]: reader connected");

        'connected: loop {
            if *shutdown.borrow() {
                return;
            }
            let read_result = tokio::select! {
                _ = shutdown.changed() => return,
                r = tokio::task::spawn_blocking({
                    let socket = socket.try_clone();
                    move || socket.and_then(|s| s.read_frame())
                }) => r,
            };
            match read_result {
                Ok(Ok(frame)) => {
                    let id = decode_raw_id(frame.id());
                    let data = frame.data().to_vec();
                    if tx.send(CanFrame::new(id, data)).await.is_err() {
                        return;
                    }
                }
                Ok(Err(err)) => {
                    use std::io::ErrorKind;
                    match err.kind() {
                        ErrorKind::WouldBlock | ErrorKind::TimedOut => continue 'connected,
                        _ => {
                            log::warn!("can_iface[{iface}]: read error: {err}, reconnecting");
                            break 'connected;
                        }
                    }
                }
                Err(join_err) => {
                    log::error!("can_iface[{iface}]: reader task join error: {join_err}");
                    break 'connected;
                }
            }
        }
    }
}

/// Continuously drain `rx` and transmit each `(id, data)` frame on `iface`.
/// A send failure is logged, incremented on `write_failures`, and never
/// propagated — callers (C4) read the counter to fold on-wire failures into
/// their own telemetry (spec §4.4: "the failure is counted, not propagated").
pub async fn run_writer(
    iface: String,
    mut rx: mpsc::Receiver<(u32, Vec<u8>)>,
    mut shutdown: watch::Receiver<bool>,
    write_failures: Arc<AtomicU64>,
) {
    loop {
        let Some(socket) = open_with_backoff(&iface, &mut shutdown).await else {
            return;
        };
        log::info!("can_iface[{iface}]: writer connected");

        'connected: loop {
            let next = tokio::select! {
                _ = shutdown.changed() => return,
                item = rx.recv() => item,
            };
            let Some((id, data)) = next else {
                return;
            };
            let Some(frame) = build_frame(id, &data) else {
                log::warn!("can_iface[{iface}]: cannot build frame for id {id:#x}");
                write_failures.fetch_add(1, Ordering::Relaxed);
                continue;
            };
            let socket_clone = socket.try_clone();
            let write_result = tokio::task::spawn_blocking(move || {
                socket_clone.and_then(|s| s.write_frame(&SocketCanFrame::from(frame)))
            })
            .await;
            match write_result {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    log::warn!("can_iface[{iface}]: write error: {err}, reconnecting");
                    write_failures.fetch_add(1, Ordering::Relaxed);
                    break 'connected;
                }
                Err(join_err) => {
                    log::error!("can_iface[{iface}]: writer task join error: {join_err}");
                    write_failures.fetch_add(1, Ordering::Relaxed);
                    break 'connected;
                }
            }
        }
    }
}

/// Send one outbound sync/acknowledge telegram or any other single frame on
/// a socket opened ad hoc. Used by the periodic sync transmitter in output
/// sessions, which piggybacks on the same writer channel as ordinary frames.
pub fn sync_frame() -> (u32, Vec<u8>) {
    crate::codec::encode_sync()
}
