//! TOML configuration surface (C7, spec §6 "Configuration surface").

use std::collections::HashSet;
use std::path::Path;

use serde::Deserialize;

use crate::error::ConfigError;

/// The embedded default configuration template copied out by `--init`.
pub const DEFAULT_TEMPLATE: &str = include_str!("../config/default.toml");

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(rename = "GATEWAY-ACTIVATED")]
    pub gateway_activated: bool,
    pub mqtt: MqttConfig,
    pub battery: BatteryConfig,
    #[serde(rename = "bmses-in")]
    pub bmses_in: Vec<InputBmsConfig>,
    #[serde(rename = "bmses-out")]
    pub bmses_out: Vec<OutputBmsConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MqttConfig {
    #[serde(rename = "ACTIVATED")]
    pub activated: bool,
    #[serde(rename = "TOPIC")]
    pub topic: String,
    #[serde(rename = "BROKER")]
    pub broker: String,
    #[serde(rename = "PORT")]
    pub port: u16,
    /// Minimum seconds between publishes.
    #[serde(rename = "INTERVAL")]
    pub interval: f64,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct BatteryConfig {
    #[serde(rename = "I-LIM-CHARGE")]
    pub i_lim_charge: f64,
    #[serde(rename = "I-LIM-DISCHARGE")]
    pub i_lim_discharge: f64,
    #[serde(rename = "I-TOT-SCALING")]
    pub i_tot_scaling: f64,
    #[serde(rename = "I-TOT-OFFSET")]
    pub i_tot_offset: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InputBmsConfig {
    #[serde(rename = "CAN-IF")]
    pub can_if: String,
    #[serde(rename = "DESCRIPTION")]
    pub description: String,
    #[serde(rename = "CAPACITY-AH")]
    pub capacity_ah: f64,
    /// Seconds between outgoing sync polls; absent = polling disabled.
    #[serde(rename = "POLL-INTERVAL")]
    pub poll_interval: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OutputBmsConfig {
    #[serde(rename = "CAN-IF")]
    pub can_if: String,
    #[serde(rename = "DESCRIPTION")]
    pub description: String,
    #[serde(rename = "I-LIM-CHARGE")]
    pub i_lim_charge: f64,
    #[serde(rename = "I-LIM-DISCHARGE")]
    pub i_lim_discharge: f64,
    #[serde(rename = "I-SCALING")]
    pub i_scaling: f64,
    #[serde(rename = "I-OFFSET")]
    pub i_offset: f64,
    /// Seconds; 0 disables coalescing in push mode.
    #[serde(rename = "PUSH-MIN-DELAY")]
    pub push_min_delay: f64,
    #[serde(rename = "SEND-SYNC-ACTIVATED")]
    pub send_sync_activated: bool,
    #[serde(rename = "SYNC-INTERVAL")]
    pub sync_interval: f64,
}

impl Config {
    pub fn load(path: &Path) -> Result<Config, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let config: Config = toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.bmses_in.is_empty() {
            return Err(ConfigError::NoInputs);
        }
        if self.bmses_out.is_empty() {
            return Err(ConfigError::NoOutputs);
        }
        if self.battery.i_lim_charge < 0.0 || self.battery.i_lim_discharge < 0.0 {
            return Err(ConfigError::InvalidCurrentLimit);
        }
        for (index, input) in self.bmses_in.iter().enumerate() {
            if input.capacity_ah <= 0.0 {
                return Err(ConfigError::InvalidCapacity {
                    index,
                    desc: input.description.clone(),
                    value: input.capacity_ah,
                });
            }
        }
        let mut seen = HashSet::new();
        for iface in self
            .bmses_in
            .iter()
            .map(|i| &i.can_if)
            .chain(self.bmses_out.iter().map(|o| &o.can_if))
        {
            if !seen.insert(iface.clone()) {
                return Err(ConfigError::DuplicateInterface(iface.clone()));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_template_parses_and_validates() {
        let config: Config = toml::from_str(DEFAULT_TEMPLATE).expect("template must parse");
        config.validate().expect("template must validate");
    }

    #[test]
    fn rejects_empty_inputs() {
        let toml = r#"
            GATEWAY-ACTIVATED = true
            [mqtt]
            ACTIVATED = false
            TOPIC = "bms"
            BROKER = "localhost"
            PORT = 1883
            INTERVAL = 5.0
            [battery]
            I-LIM-CHARGE = 100.0
            I-LIM-DISCHARGE = 100.0
            I-TOT-SCALING = 1.0
            I-TOT-OFFSET = 0.0
            bmses-in = []
            [[bmses-out]]
            CAN-IF = "can_out_1"
            DESCRIPTION = "inv1"
            I-LIM-CHARGE = 100.0
            I-LIM-DISCHARGE = 100.0
            I-SCALING = 1.0
            I-OFFSET = 0.0
            PUSH-MIN-DELAY = 1.0
            SEND-SYNC-ACTIVATED = false
            SYNC-INTERVAL = 1.0
        "#;
        let config: Config = toml::from_str(toml).unwrap();
        assert!(matches!(config.validate(), Err(ConfigError::NoInputs)));
    }

    #[test]
    fn rejects_duplicate_interfaces() {
        let toml = r#"
            GATEWAY-ACTIVATED = true
            [mqtt]
            ACTIVATED = false
            TOPIC = "bms"
            BROKER = "localhost"
            PORT = 1883
            INTERVAL = 5.0
            [battery]
            I-LIM-CHARGE = 100.0
            I-LIM-DISCHARGE = 100.0
            I-TOT-SCALING = 1.0
            I-TOT-OFFSET = 0.0
            [[bmses-in]]
            CAN-IF = "can0"
            DESCRIPTION = "a"
            CAPACITY-AH = 100.0
            [[bmses-out]]
            CAN-IF = "can0"
            DESCRIPTION = "inv1"
            I-LIM-CHARGE = 100.0
            I-LIM-DISCHARGE = 100.0
            I-SCALING = 1.0
            I-OFFSET = 0.0
            PUSH-MIN-DELAY = 1.0
            SEND-SYNC-ACTIVATED = false
            SYNC-INTERVAL = 1.0
        "#;
        let config: Config = toml::from_str(toml).unwrap();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::DuplicateInterface(_))
        ));
    }
}
