//! Error taxonomy for the gateway, per the error handling design:
//! - `ConfigError` is fatal at startup (exit code 2).
//! - `InterfaceError` covers CAN socket failures; sessions retry internally
//!   and only surface this at startup (interface does not exist at all).
//! - `CodecError` is counted and dropped by the input session, never
//!   propagated here.
//! - `GatewayError` is the top-level error `main` inspects to pick an exit
//!   code (non-config errors exit 3).

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
    #[error("no [[bmses-in]] entries configured")]
    NoInputs,
    #[error("no [[bmses-out]] entries configured")]
    NoOutputs,
    #[error("bmses-in[{index}] ({desc}): CAPACITY-AH must be > 0, got {value}")]
    InvalidCapacity {
        index: usize,
        desc: String,
        value: f64,
    },
    #[error("battery I-LIM-CHARGE/I-LIM-DISCHARGE must be >= 0")]
    InvalidCurrentLimit,
    #[error("duplicate CAN-IF {0:?} configured more than once")]
    DuplicateInterface(String),
}

#[derive(Error, Debug)]
pub enum InterfaceError {
    #[error("CAN interface {iface}: {source}")]
    Socket {
        iface: String,
        #[source]
        source: std::io::Error,
    },
    #[error("CAN interface {0}: permission denied")]
    PermissionDenied(String),
}

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("frame too short: got {got} bytes, need at least {need}")]
    Truncated { got: usize, need: usize },
}

#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("MQTT connection error: {0}")]
    Connection(String),
}

/// Top-level error surfaced from the dispatch core to `main`.
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("task {name} crashed {count} times within the failure window; giving up")]
    TaskExhausted { name: String, count: u32 },
}

impl GatewayError {
    /// Process exit code per spec §6/§7: 2 for config errors, 3 otherwise.
    pub fn exit_code(&self) -> i32 {
        match self {
            GatewayError::Config(_) => 2,
            _ => 3,
        }
    }
}
