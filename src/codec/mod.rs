//! Pylontech/SMA Sunny Island LV BMS CAN telegram codec (C1).
//!
//! Pure bidirectional mapping between raw CAN frames (29-bit/11-bit ID plus
//! up to 8 data bytes) and typed telegram records. No I/O, no clocks: every
//! function here is a plain value transform, which is what makes it testable
//! by vector (spec invariant 1, decode∘encode = identity).

mod telegram;
pub mod flags;

pub use telegram::*;

/// CAN identifier, 0x305 — sync/acknowledge telegram (both directions).
pub const ID_SYNC: u32 = 0x305;
/// CAN identifier, 0x351 — charge/discharge voltage and current limits.
pub const ID_LIMITS: u32 = 0x351;
/// CAN identifier, 0x355 — SOC/SOH.
pub const ID_SOC_SOH: u32 = 0x355;
/// CAN identifier, 0x356 — measured voltage/current/temperature.
pub const ID_MEASUREMENTS: u32 = 0x356;
/// CAN identifier, 0x359 — protection/alarm bits, module count, vendor id.
pub const ID_STATUS: u32 = 0x359;
/// CAN identifier, 0x35C — status/request bits.
pub const ID_REQUEST: u32 = 0x35C;
/// CAN identifier, 0x35E — manufacturer ASCII name.
pub const ID_MANUFACTURER: u32 = 0x35E;

/// The set of telegram groups an input session must see at least once before
/// its snapshot is marked `complete` (spec §4.2).
pub const REQUIRED_GROUP_IDS: [u32; 4] = [ID_LIMITS, ID_SOC_SOH, ID_MEASUREMENTS, ID_STATUS];

/// An immutable, already-timestamped raw CAN frame (spec §3 "CAN frame").
#[derive(Debug, Clone)]
pub struct CanFrame {
    pub id: u32,
    pub data: Vec<u8>,
    /// Monotonic receive timestamp.
    pub received_at: std::time::Instant,
}

impl CanFrame {
    pub fn new(id: u32, data: Vec<u8>) -> Self {
        CanFrame {
            id,
            data,
            received_at: std::time::Instant::now(),
        }
    }
}
