//! Supervisor (C6, spec §5 "Process model"): wires input sessions through
//! the aggregator to the output and MQTT sessions, and owns the shutdown
//! signal every task selects on.
//!
//! Each input and output is a "unit" of three cooperating tasks (reader,
//! writer, session). A crash in any of a unit's three tasks tears down and
//! respawns the whole unit in place, with fresh local channels, after
//! [`crate::restart::RESTART_DELAY`] — never a global shutdown (spec §4.6,
//! §7's `TaskCrash` row: "restart task (up to 10 times within 60 s), then
//! exit 3"). The aggregator and MQTT publisher are process-wide singletons
//! whose channel endpoints cannot be rebuilt in place, so their *pure*
//! per-event computation is wrapped in `catch_unwind` instead (see
//! `run_aggregator` here and `mqtt::run`'s payload construction) — this
//! "restarts" the unit of work without ever tearing down the owning task.

use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;

use crate::aggregator::{Aggregator, UnifiedState};
use crate::can_iface;
use crate::config::{BatteryConfig, Config, InputBmsConfig, OutputBmsConfig};
use crate::error::GatewayError;
use crate::restart::{panic_message, FailureTracker, MAX_FAILURES_IN_WINDOW, RESTART_DELAY};
use crate::snapshot::{BmsSnapshot, DEFAULT_NOMINAL_PERIOD};
use crate::{input_session, mqtt, output_session};

const JOIN_TIMEOUT: Duration = Duration::from_secs(2);
/// Channel capacity for raw CAN frames between `can_iface` and a session.
const FRAME_CHANNEL_CAPACITY: usize = 64;
/// Channel capacity for outbound write requests. 1 keeps the mailbox
/// "bounded, drop-oldest" in spirit: a burst of newer frames is preferred
/// over a backlog of stale ones once the writer falls behind.
const WRITE_CHANNEL_CAPACITY: usize = 32;

async fn wait_for_shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
        Ok(s) => s,
        Err(err) => {
            log::warn!("dispatch: failed to install SIGTERM handler: {err}");
            // Fall back to only watching ctrl-c.
            let _ = ctrl_c.await;
            return;
        }
    };
    tokio::select! {
        _ = ctrl_c => log::info!("dispatch: received SIGINT"),
        _ = sigterm.recv() => log::info!("dispatch: received SIGTERM"),
    }
}

/// Outcome of one run of a supervised unit's three tasks.
enum UnitOutcome {
    /// The unit ended because the process is shutting down.
    ShutdownRequested,
    /// A subtask ended unexpectedly; contains a log-friendly reason.
    Crashed(String),
}

/// Block until `shutdown_rx` flips to `true`, or return immediately if it
/// already has. Used to let a restart-delay sleep be interrupted by shutdown.
async fn wait_for_shutdown_flag(shutdown_rx: &watch::Receiver<bool>) {
    let mut rx = shutdown_rx.clone();
    if *rx.borrow() {
        return;
    }
    while rx.changed().await.is_ok() {
        if *rx.borrow() {
            return;
        }
    }
}

/// Render a [`tokio::task::JoinError`] for a log line: the panic message if
/// it was a panic, a generic description otherwise (e.g. cancellation).
fn describe_join_error(join_err: tokio::task::JoinError) -> String {
    if join_err.is_panic() {
        format!("panicked: {}", panic_message(&*join_err.into_panic()))
    } else {
        format!("ended abnormally: {join_err}")
    }
}

/// Run one input unit's reader/poll-writer/session trio to completion, with
/// fresh local channels. `snapshot` and `notify_tx` are shared, unrecreatable
/// resources that survive across restarts of this unit.
async fn run_input_unit(
    input: InputBmsConfig,
    name: String,
    snapshot: Arc<Mutex<BmsSnapshot>>,
    notify_tx: mpsc::Sender<()>,
    shutdown_rx: watch::Receiver<bool>,
) -> UnitOutcome {
    let (frame_tx, frame_rx) = mpsc::channel(FRAME_CHANNEL_CAPACITY);
    let (poll_tx, poll_rx) = mpsc::channel(1);
    let write_failures = Arc::new(AtomicU64::new(0));

    let mut set: JoinSet<()> = JoinSet::new();

    let iface = input.can_if.clone();
    let reader_shutdown = shutdown_rx.clone();
    set.spawn(async move {
        can_iface::run_reader(iface, frame_tx, reader_shutdown).await;
    });

    let iface = input.can_if.clone();
    let writer_shutdown = shutdown_rx.clone();
    set.spawn(async move {
        can_iface::run_writer(iface, poll_rx, writer_shutdown, write_failures).await;
    });

    let session_name = name.clone();
    let session_shutdown = shutdown_rx.clone();
    set.spawn(async move {
        let stats = input_session::run(
            session_name.clone(),
            input,
            frame_rx,
            snapshot,
            notify_tx,
            Some(poll_tx),
            session_shutdown,
        )
        .await;
        log::info!(
            "input[{session_name}]: session ended (decoded={}, decode_errors={})",
            stats.frames_decoded,
            stats.decode_errors
        );
    });

    let first = set.join_next().await;
    set.abort_all();
    while set.join_next().await.is_some() {}

    if *shutdown_rx.borrow() {
        return UnitOutcome::ShutdownRequested;
    }
    match first {
        Some(Ok(())) => UnitOutcome::Crashed(format!("input[{name}]: a subtask exited unexpectedly")),
        Some(Err(join_err)) => UnitOutcome::Crashed(format!(
            "input[{name}]: subtask {}",
            describe_join_error(join_err)
        )),
        None => UnitOutcome::ShutdownRequested,
    }
}

/// Supervise one input unit: keep restarting it, with [`RESTART_DELAY`]
/// between attempts, until shutdown or its failure budget is exhausted
/// (spec §4.6, §7).
async fn supervise_input(
    input: InputBmsConfig,
    snapshot: Arc<Mutex<BmsSnapshot>>,
    notify_tx: mpsc::Sender<()>,
    shutdown_rx: watch::Receiver<bool>,
) -> Result<(), GatewayError> {
    let name = input.description.clone();
    let mut failures = FailureTracker::new();
    loop {
        match run_input_unit(input.clone(), name.clone(), snapshot.clone(), notify_tx.clone(), shutdown_rx.clone()).await {
            UnitOutcome::ShutdownRequested => return Ok(()),
            UnitOutcome::Crashed(reason) => {
                if !failures.record_and_check_budget() {
                    log::error!("input[{name}]: {reason}, exhausted restart budget, giving up");
                    return Err(GatewayError::TaskExhausted {
                        name: format!("input[{name}]"),
                        count: MAX_FAILURES_IN_WINDOW as u32,
                    });
                }
                log::error!("input[{name}]: {reason}, restarting in {RESTART_DELAY:?}");
                tokio::select! {
                    _ = tokio::time::sleep(RESTART_DELAY) => {}
                    _ = wait_for_shutdown_flag(&shutdown_rx) => return Ok(()),
                }
            }
        }
    }
}

/// Run one output unit's reader/writer/session trio to completion, with
/// fresh local channels each attempt.
async fn run_output_unit(
    output: OutputBmsConfig,
    name: String,
    state_rx: watch::Receiver<Option<UnifiedState>>,
    shutdown_rx: watch::Receiver<bool>,
) -> UnitOutcome {
    let (write_tx, write_rx) = mpsc::channel(WRITE_CHANNEL_CAPACITY);
    let (frame_tx, frame_rx) = mpsc::channel(FRAME_CHANNEL_CAPACITY);
    let write_failures = Arc::new(AtomicU64::new(0));

    let mut set: JoinSet<()> = JoinSet::new();

    let iface = output.can_if.clone();
    let reader_shutdown = shutdown_rx.clone();
    set.spawn(async move {
        can_iface::run_reader(iface, frame_tx, reader_shutdown).await;
    });

    let iface = output.can_if.clone();
    let writer_shutdown = shutdown_rx.clone();
    let writer_failures = write_failures.clone();
    set.spawn(async move {
        can_iface::run_writer(iface, write_rx, writer_shutdown, writer_failures).await;
    });

    let session_name = name.clone();
    let session_shutdown = shutdown_rx.clone();
    set.spawn(async move {
        let stats = output_session::run(
            session_name.clone(),
            output,
            state_rx,
            frame_rx,
            write_tx,
            session_shutdown,
            write_failures,
        )
        .await;
        log::info!(
            "output[{session_name}]: session ended (bursts={}, frames_failed={})",
            stats.bursts_sent,
            stats.frames_failed
        );
    });

    let first = set.join_next().await;
    set.abort_all();
    while set.join_next().await.is_some() {}

    if *shutdown_rx.borrow() {
        return UnitOutcome::ShutdownRequested;
    }
    match first {
        Some(Ok(())) => UnitOutcome::Crashed(format!("output[{name}]: a subtask exited unexpectedly")),
        Some(Err(join_err)) => UnitOutcome::Crashed(format!(
            "output[{name}]: subtask {}",
            describe_join_error(join_err)
        )),
        None => UnitOutcome::ShutdownRequested,
    }
}

/// Supervise one output unit the same way [`supervise_input`] does.
async fn supervise_output(
    output: OutputBmsConfig,
    state_rx: watch::Receiver<Option<UnifiedState>>,
    shutdown_rx: watch::Receiver<bool>,
) -> Result<(), GatewayError> {
    let name = output.description.clone();
    let mut failures = FailureTracker::new();
    loop {
        match run_output_unit(output.clone(), name.clone(), state_rx.clone(), shutdown_rx.clone()).await {
            UnitOutcome::ShutdownRequested => return Ok(()),
            UnitOutcome::Crashed(reason) => {
                if !failures.record_and_check_budget() {
                    log::error!("output[{name}]: {reason}, exhausted restart budget, giving up");
                    return Err(GatewayError::TaskExhausted {
                        name: format!("output[{name}]"),
                        count: MAX_FAILURES_IN_WINDOW as u32,
                    });
                }
                log::error!("output[{name}]: {reason}, restarting in {RESTART_DELAY:?}");
                tokio::select! {
                    _ = tokio::time::sleep(RESTART_DELAY) => {}
                    _ = wait_for_shutdown_flag(&shutdown_rx) => return Ok(()),
                }
            }
        }
    }
}

/// Drive the aggregator's notify -> recompute -> publish loop. A panic
/// inside the pure `aggregate` call is caught and counted rather than
/// killing the task (spec §4.6) — there is no per-task channel to rebuild
/// here, `notify_rx` and `state_tx` are process-wide singletons, so the
/// "restart" is of the computation, not the task.
async fn run_aggregator(
    battery: BatteryConfig,
    agg_snapshots: Vec<(String, Arc<Mutex<BmsSnapshot>>)>,
    mut notify_rx: mpsc::Receiver<()>,
    state_tx: watch::Sender<Option<UnifiedState>>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Result<(), GatewayError> {
    let mut aggregator = Aggregator::new(battery);
    let mut failures = FailureTracker::new();
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    return Ok(());
                }
            }
            received = notify_rx.recv() => {
                if received.is_none() {
                    return Ok(());
                }
                let snaps: Vec<BmsSnapshot> =
                    agg_snapshots.iter().map(|(_, s)| s.lock().clone()).collect();
                match std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| aggregator.aggregate(&snaps))) {
                    Ok(Some(unified)) => {
                        if state_tx.send(Some(unified)).is_err() {
                            return Ok(());
                        }
                    }
                    Ok(None) => {}
                    Err(panic) => {
                        log::error!("aggregator: computation panicked: {}", panic_message(&*panic));
                        if !failures.record_and_check_budget() {
                            return Err(GatewayError::TaskExhausted {
                                name: "aggregator".to_string(),
                                count: MAX_FAILURES_IN_WINDOW as u32,
                            });
                        }
                    }
                }
            }
        }
    }
}

/// Run the gateway to completion: start every session unit, wait for a
/// shutdown signal or a unit exhausting its restart budget, then drain
/// everything within [`JOIN_TIMEOUT`] per task.
pub async fn run(config: Config) -> Result<(), GatewayError> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (notify_tx, notify_rx) = mpsc::channel::<()>(1);
    let (state_tx, state_rx) = watch::channel::<Option<UnifiedState>>(None);

    let mut tasks: JoinSet<Result<(), GatewayError>> = JoinSet::new();
    let mut input_snapshots: Vec<(String, Arc<Mutex<BmsSnapshot>>)> = Vec::new();

    for input in config.bmses_in.clone() {
        let snapshot = Arc::new(Mutex::new(BmsSnapshot::new(
            input.capacity_ah,
            DEFAULT_NOMINAL_PERIOD,
        )));
        input_snapshots.push((input.description.clone(), snapshot.clone()));

        let notify = notify_tx.clone();
        let unit_shutdown = shutdown_rx.clone();
        tasks.spawn(supervise_input(input, snapshot, notify, unit_shutdown));
    }

    let battery = config.battery;
    let agg_snapshots = input_snapshots.clone();
    let agg_shutdown = shutdown_rx.clone();
    tasks.spawn(run_aggregator(battery, agg_snapshots, notify_rx, state_tx, agg_shutdown));

    for output in config.bmses_out.clone() {
        let output_state = state_rx.clone();
        let unit_shutdown = shutdown_rx.clone();
        tasks.spawn(supervise_output(output, output_state, unit_shutdown));
    }

    if config.mqtt.activated {
        let mqtt_config = config.mqtt.clone();
        let mqtt_shutdown = shutdown_rx.clone();
        let mqtt_state = state_rx.clone();
        let mqtt_inputs = input_snapshots.clone();
        tasks.spawn(async move {
            mqtt::run(mqtt_config, mqtt_state, mqtt_inputs, mqtt_shutdown).await;
            Ok(())
        });
    }

    let mut crash: Option<GatewayError> = None;

    tokio::select! {
        _ = wait_for_shutdown_signal() => {
            log::info!("dispatch: shutting down gateway");
            let _ = shutdown_tx.send(true);
        }
        finished = tasks.join_next() => {
            let _ = shutdown_tx.send(true);
            match finished {
                Some(Ok(Ok(()))) => {}
                Some(Ok(Err(err))) => {
                    log::error!("dispatch: {err}, shutting down");
                    crash = Some(err);
                }
                Some(Err(join_err)) => {
                    log::error!("dispatch: a supervised unit panicked ({join_err}), shutting down");
                    crash = Some(GatewayError::TaskExhausted { name: join_err.to_string(), count: 1 });
                }
                None => {}
            }
        }
    }

    while !tasks.is_empty() {
        match tokio::time::timeout(JOIN_TIMEOUT, tasks.join_next()).await {
            Ok(Some(Ok(Ok(())))) => log::debug!("dispatch: supervised unit drained"),
            Ok(Some(Ok(Err(err)))) => {
                log::warn!("dispatch: supervised unit ended with error during drain: {err}");
                crash.get_or_insert(err);
            }
            Ok(Some(Err(join_err))) => log::warn!("dispatch: task panicked during drain: {join_err}"),
            Ok(None) => break,
            Err(_) => {
                log::warn!("dispatch: {} task(s) did not exit within {JOIN_TIMEOUT:?}, abandoning", tasks.len());
                tasks.abort_all();
                crash.get_or_insert(GatewayError::TaskExhausted {
                    name: "supervisor drain".to_string(),
                    count: tasks.len() as u32,
                });
                break;
            }
        }
    }

    match crash {
        Some(err) => Err(err),
        None => Ok(()),
    }
}
