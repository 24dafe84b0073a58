//! Bit-position schema for the three BMS→Inverter flag telegrams.
//!
//! The exact bit positions are not reproduced in the protocol fragments this
//! gateway was built from; the mapping below was fixed from the commonly
//! published Pylontech/SMA Sunny Island low-voltage CAN reference (the same
//! layout used by most open-source Pylontech readouts) and is treated as
//! authoritative for this gateway. Bits outside the named ranges are kept
//! (`from_bits_retain`) so the aggregator's OR/AND reductions never silently
//! drop information, but are not exposed under a name.

use bitflags::bitflags;

bitflags! {
    /// Protection (error) bits, CAN ID 0x359, bytes 0-1 (little-endian u16).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ErrorFlags: u16 {
        const CELL_OVERVOLTAGE          = 1 << 0;
        const CELL_UNDERVOLTAGE         = 1 << 1;
        const CHARGE_OVERTEMPERATURE    = 1 << 2;
        const CHARGE_UNDERTEMPERATURE   = 1 << 3;
        const DISCHARGE_OVERTEMPERATURE = 1 << 4;
        const DISCHARGE_UNDERTEMPERATURE = 1 << 5;
        const DISCHARGE_OVERCURRENT     = 1 << 6;
        const CHARGE_OVERCURRENT        = 1 << 7;
        const SHORT_CIRCUIT             = 1 << 8;
        const MODULE_OVERVOLTAGE        = 1 << 9;
        const MODULE_UNDERVOLTAGE       = 1 << 10;
    }
}

bitflags! {
    /// Alarm (warning) bits, CAN ID 0x359, bytes 2-3 (little-endian u16).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct WarningFlags: u16 {
        const CELL_HIGH_VOLTAGE          = 1 << 0;
        const CELL_LOW_VOLTAGE           = 1 << 1;
        const CHARGE_HIGH_TEMPERATURE    = 1 << 2;
        const CHARGE_LOW_TEMPERATURE     = 1 << 3;
        const DISCHARGE_HIGH_TEMPERATURE = 1 << 4;
        const DISCHARGE_LOW_TEMPERATURE  = 1 << 5;
        const DISCHARGE_HIGH_CURRENT     = 1 << 6;
        const CHARGE_HIGH_CURRENT        = 1 << 7;
        const INTERNAL_FAILURE           = 1 << 8;
        const MODULE_HIGH_VOLTAGE        = 1 << 9;
        const MODULE_LOW_VOLTAGE         = 1 << 10;
        const AMBIENT_HIGH_TEMPERATURE   = 1 << 11;
        const AMBIENT_LOW_TEMPERATURE    = 1 << 12;
    }
}

bitflags! {
    /// Status/request bits, CAN ID 0x35C, byte 0.
    ///
    /// `CHARGE_ENABLE` and `DISCHARGE_ENABLE` are the "enable" category the
    /// aggregator ANDs (§4.3: unanimous enable required); the remaining
    /// bits are the "alarm/force-charge/request" category the aggregator ORs.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct StatusFlags: u16 {
        const CHARGE_ENABLE       = 1 << 0;
        const DISCHARGE_ENABLE    = 1 << 1;
        const FORCE_CHARGE_1      = 1 << 2;
        const FORCE_CHARGE_2      = 1 << 3;
        const FULL_CHARGE_REQUEST = 1 << 4;
    }
}

/// The subset of `StatusFlags` that the aggregator treats as "enable" bits
/// (ANDed across inputs, conservative: all modules must agree to enable).
pub const STATUS_ENABLE_MASK: StatusFlags =
    StatusFlags::CHARGE_ENABLE.union(StatusFlags::DISCHARGE_ENABLE);

const ERROR_NAMES: &[(ErrorFlags, &str)] = &[
    (ErrorFlags::CELL_OVERVOLTAGE, "error.cell_overvoltage"),
    (ErrorFlags::CELL_UNDERVOLTAGE, "error.cell_undervoltage"),
    (ErrorFlags::CHARGE_OVERTEMPERATURE, "error.charge_overtemperature"),
    (ErrorFlags::CHARGE_UNDERTEMPERATURE, "error.charge_undertemperature"),
    (ErrorFlags::DISCHARGE_OVERTEMPERATURE, "error.discharge_overtemperature"),
    (ErrorFlags::DISCHARGE_UNDERTEMPERATURE, "error.discharge_undertemperature"),
    (ErrorFlags::DISCHARGE_OVERCURRENT, "error.discharge_overcurrent"),
    (ErrorFlags::CHARGE_OVERCURRENT, "error.charge_overcurrent"),
    (ErrorFlags::SHORT_CIRCUIT, "error.short_circuit"),
    (ErrorFlags::MODULE_OVERVOLTAGE, "error.module_overvoltage"),
    (ErrorFlags::MODULE_UNDERVOLTAGE, "error.module_undervoltage"),
];

const WARNING_NAMES: &[(WarningFlags, &str)] = &[
    (WarningFlags::CELL_HIGH_VOLTAGE, "warn.cell_high_voltage"),
    (WarningFlags::CELL_LOW_VOLTAGE, "warn.cell_low_voltage"),
    (WarningFlags::CHARGE_HIGH_TEMPERATURE, "warn.charge_high_temperature"),
    (WarningFlags::CHARGE_LOW_TEMPERATURE, "warn.charge_low_temperature"),
    (WarningFlags::DISCHARGE_HIGH_TEMPERATURE, "warn.discharge_high_temperature"),
    (WarningFlags::DISCHARGE_LOW_TEMPERATURE, "warn.discharge_low_temperature"),
    (WarningFlags::DISCHARGE_HIGH_CURRENT, "warn.discharge_high_current"),
    (WarningFlags::CHARGE_HIGH_CURRENT, "warn.charge_high_current"),
    (WarningFlags::INTERNAL_FAILURE, "warn.internal_failure"),
    (WarningFlags::MODULE_HIGH_VOLTAGE, "warn.module_high_voltage"),
    (WarningFlags::MODULE_LOW_VOLTAGE, "warn.module_low_voltage"),
    (WarningFlags::AMBIENT_HIGH_TEMPERATURE, "warn.ambient_high_temperature"),
    (WarningFlags::AMBIENT_LOW_TEMPERATURE, "warn.ambient_low_temperature"),
];

const STATUS_NAMES: &[(StatusFlags, &str)] = &[
    (StatusFlags::CHARGE_ENABLE, "status.charge_enable"),
    (StatusFlags::DISCHARGE_ENABLE, "status.discharge_enable"),
    (StatusFlags::FORCE_CHARGE_1, "status.force_charge_1"),
    (StatusFlags::FORCE_CHARGE_2, "status.force_charge_2"),
    (StatusFlags::FULL_CHARGE_REQUEST, "status.full_charge_request"),
];

impl ErrorFlags {
    /// Named bits that are currently set, for JSON telemetry (`"errors"`).
    pub fn names(self) -> Vec<&'static str> {
        ERROR_NAMES
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect()
    }
}

impl WarningFlags {
    pub fn names(self) -> Vec<&'static str> {
        WARNING_NAMES
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect()
    }
}

impl StatusFlags {
    pub fn names(self) -> Vec<&'static str> {
        STATUS_NAMES
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect()
    }

    /// Serialize as the MQTT JSON `"status"` object: `{"<name>": <bool>, ...}`.
    pub fn as_json_map(self) -> serde_json::Map<String, serde_json::Value> {
        let mut map = serde_json::Map::new();
        for (flag, name) in STATUS_NAMES {
            map.insert(name.to_string(), serde_json::Value::Bool(self.contains(*flag)));
        }
        map
    }
}
