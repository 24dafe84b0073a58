//! MQTT telemetry publisher (C5, spec §6 "MQTT telemetry").

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rumqttc::{AsyncClient, MqttOptions, QoS};
use tokio::sync::watch;

use crate::aggregator::UnifiedState;
use crate::config::MqttConfig;
use crate::error::BrokerError;
use crate::snapshot::BmsSnapshot;

const MIN_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Epoch seconds as a float, per the `"ts"` field of the MQTT JSON schema.
fn epoch_seconds() -> f64 {
    let now = chrono::Utc::now();
    now.timestamp() as f64 + now.timestamp_subsec_nanos() as f64 / 1e9
}

fn build_payload(unified: &UnifiedState, inputs: &[(String, Arc<Mutex<BmsSnapshot>>)]) -> serde_json::Value {
    let inputs_json: Vec<serde_json::Value> = inputs
        .iter()
        .map(|(desc, snapshot)| {
            let snapshot = snapshot.lock();
            serde_json::json!({
                "desc": desc,
                "fresh": snapshot.is_fresh(),
                "last_seen_age_s": snapshot.staleness_age().as_secs_f64(),
            })
        })
        .collect();

    serde_json::json!({
        "gen": unified.generation,
        "ts": epoch_seconds(),
        "u_charge": unified.u_setpoint_charge,
        "u_discharge": unified.u_setpoint_discharge,
        "i_lim_charge": unified.i_lim_charge,
        "i_lim_discharge": unified.i_lim_discharge,
        "u": unified.u_measured,
        "i": unified.i_measured,
        "t": unified.t_measured,
        "soc": unified.soc,
        "soh": unified.soh,
        "capacity_ah": unified.capacity_total_ah,
        "errors": unified.error_flags.names(),
        "warnings": unified.warning_flags.names(),
        "status": serde_json::Value::Object(unified.status_flags.as_json_map()),
        "inputs": inputs_json,
    })
}

/// Drive the connection's event loop, reconnecting with backoff
/// (1s → capped at 30s) on every error. `rumqttc` handles the actual TCP
/// reconnection; this loop just keeps polling it and keeps the process from
/// busy-spinning while the broker is unreachable.
async fn drive_eventloop(mut eventloop: rumqttc::EventLoop, mut shutdown: watch::Receiver<bool>) {
    let mut backoff = MIN_BACKOFF;
    loop {
        if *shutdown.borrow() {
            return;
        }
        tokio::select! {
            _ = shutdown.changed() => return,
            result = eventloop.poll() => match result {
                Ok(_) => backoff = MIN_BACKOFF,
                Err(err) => {
                    let broker_err = BrokerError::Connection(err.to_string());
                    log::warn!("mqtt: {broker_err}, retrying in {backoff:?}");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
            },
        }
    }
}

/// Publish the unified state as JSON on a fixed `INTERVAL`-second schedule
/// (spec §4.5/§6): an independent ticker, not the arrival of a new unified
/// state, drives each check. On expiry, a publish only happens if a unified
/// state with a new generation has been produced since the last publish; the
/// first tick after startup is the earliest a publish can ever happen.
/// No-op entirely if `ACTIVATED = false`.
pub async fn run(
    config: MqttConfig,
    state_rx: watch::Receiver<Option<UnifiedState>>,
    inputs: Vec<(String, Arc<Mutex<BmsSnapshot>>)>,
    mut shutdown: watch::Receiver<bool>,
) {
    if !config.activated {
        log::info!("mqtt: publisher disabled by configuration");
        return;
    }

    let mut options = MqttOptions::new("can-bms-gateway", config.broker.clone(), config.port);
    options.set_keep_alive(Duration::from_secs(30));
    let (client, eventloop) = AsyncClient::new(options, 16);

    let driver_shutdown = shutdown.clone();
    tokio::spawn(drive_eventloop(eventloop, driver_shutdown));

    let period = Duration::from_secs_f64(config.interval.max(0.001));
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    let mut last_published_generation: Option<u64> = None;
    let mut failures = crate::restart::FailureTracker::new();

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
            }
            _ = ticker.tick() => {
                let Some(unified) = state_rx.borrow().clone() else {
                    continue;
                };
                if last_published_generation == Some(unified.generation) {
                    continue;
                }
                let payload = match std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    build_payload(&unified, &inputs)
                })) {
                    Ok(payload) => payload,
                    Err(panic) => {
                        log::error!(
                            "mqtt: payload construction panicked: {}",
                            crate::restart::panic_message(&*panic)
                        );
                        if !failures.record_and_check_budget() {
                            log::error!("mqtt: payload construction failed too many times, disabling publisher");
                            return;
                        }
                        continue;
                    }
                };
                match client
                    .publish(&config.topic, QoS::AtMostOnce, false, payload.to_string())
                    .await
                {
                    Ok(()) => last_published_generation = Some(unified.generation),
                    Err(err) => log::warn!("mqtt: publish failed: {err}"),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::flags::{ErrorFlags, StatusFlags, WarningFlags};

    fn unified() -> UnifiedState {
        UnifiedState {
            generation: 7,
            u_setpoint_charge: 55.0,
            u_setpoint_discharge: 45.0,
            i_lim_charge: 100.0,
            i_lim_discharge: 100.0,
            u_measured: 52.0,
            i_measured: 20.0,
            t_measured: 25.0,
            soc: 70.0,
            soh: 99.0,
            capacity_total_ah: 400.0,
            error_flags: ErrorFlags::CELL_OVERVOLTAGE,
            warning_flags: WarningFlags::empty(),
            status_flags: StatusFlags::CHARGE_ENABLE,
        }
    }

    #[test]
    fn payload_includes_generation_and_error_names() {
        let snapshot = Arc::new(Mutex::new(BmsSnapshot::new(100.0, Duration::from_secs(1))));
        let payload = build_payload(&unified(), &[("battery 1".to_string(), snapshot)]);
        assert_eq!(payload["gen"], 7);
        assert_eq!(payload["errors"][0], "error.cell_overvoltage");
        assert_eq!(payload["inputs"][0]["desc"], "battery 1");
        assert!(payload["ts"].is_f64(), "ts must be an epoch-seconds float per the schema");
    }
}
