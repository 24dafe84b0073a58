//! Typed telegram records and their wire (de)serialization.

use super::flags::{ErrorFlags, StatusFlags, WarningFlags};
use super::{
    CanFrame, ID_LIMITS, ID_MANUFACTURER, ID_MEASUREMENTS, ID_REQUEST, ID_SOC_SOH, ID_STATUS,
    ID_SYNC,
};
use crate::error::CodecError;

/// 0x351 — charge/discharge voltage and current limit request.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LimitsTelegram {
    /// End-of-charge voltage request, V.
    pub u_charge: f64,
    /// Charge current limit, A.
    pub i_lim_charge: f64,
    /// Discharge current limit, A.
    pub i_lim_discharge: f64,
    /// Low-cutoff voltage request, V.
    pub u_discharge: f64,
}

/// 0x355 — state of charge / state of health.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SocSohTelegram {
    pub soc: u16,
    pub soh: u16,
}

/// 0x356 — measured pack voltage, current, and temperature.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MeasurementsTelegram {
    pub u_measured: f64,
    /// Signed: positive = charge.
    pub i_measured: f64,
    pub t_measured: f64,
}

/// 0x359 — protection/alarm bits, module count, and vendor identifier.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StatusTelegram {
    pub error_flags: ErrorFlags,
    pub warning_flags: WarningFlags,
    pub module_count: u8,
    /// Vendor ASCII bytes 5-7, conventionally "PN".
    pub vendor: [u8; 3],
}

/// 0x35C — status/request bits (charge-enable, discharge-enable, force-charge, …).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RequestTelegram {
    pub status_flags: StatusFlags,
}

/// 0x35E — manufacturer name, 8 ASCII bytes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ManufacturerTelegram {
    pub name: [u8; 8],
}

/// Decoded frame classification. Unknown CAN IDs decode to `Ignored` rather
/// than an error (spec §4.1).
#[derive(Debug, Clone, PartialEq)]
pub enum FrameKind {
    Limits(LimitsTelegram),
    SocSoh(SocSohTelegram),
    Measurements(MeasurementsTelegram),
    Status(StatusTelegram),
    Request(RequestTelegram),
    Manufacturer(ManufacturerTelegram),
    /// Sync/acknowledge telegram, 0x305, eight zero bytes.
    Sync,
    /// CAN ID not part of the recognized telegram family.
    Ignored(u32),
}

fn need(data: &[u8], n: usize) -> Result<(), CodecError> {
    if data.len() < n {
        Err(CodecError::Truncated {
            got: data.len(),
            need: n,
        })
    } else {
        Ok(())
    }
}

fn u16le(data: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([data[at], data[at + 1]])
}

fn i16le(data: &[u8], at: usize) -> i16 {
    i16::from_le_bytes([data[at], data[at + 1]])
}

/// Decode a raw CAN frame into a typed telegram.
///
/// Only the ID/length shape is interpreted here; the codec does no I/O and
/// never blocks.
pub fn decode(frame: &CanFrame) -> Result<FrameKind, CodecError> {
    match frame.id {
        ID_LIMITS => {
            need(&frame.data, 8)?;
            Ok(FrameKind::Limits(LimitsTelegram {
                u_charge: u16le(&frame.data, 0) as f64 * 0.1,
                i_lim_charge: u16le(&frame.data, 2) as f64 * 0.1,
                i_lim_discharge: u16le(&frame.data, 4) as f64 * 0.1,
                u_discharge: u16le(&frame.data, 6) as f64 * 0.1,
            }))
        }
        ID_SOC_SOH => {
            need(&frame.data, 4)?;
            Ok(FrameKind::SocSoh(SocSohTelegram {
                soc: u16le(&frame.data, 0),
                soh: u16le(&frame.data, 2),
            }))
        }
        ID_MEASUREMENTS => {
            need(&frame.data, 6)?;
            Ok(FrameKind::Measurements(MeasurementsTelegram {
                u_measured: i16le(&frame.data, 0) as f64 * 0.01,
                i_measured: i16le(&frame.data, 2) as f64 * 0.1,
                t_measured: i16le(&frame.data, 4) as f64 * 0.1,
            }))
        }
        ID_STATUS => {
            need(&frame.data, 8)?;
            Ok(FrameKind::Status(StatusTelegram {
                error_flags: ErrorFlags::from_bits_retain(u16le(&frame.data, 0)),
                warning_flags: WarningFlags::from_bits_retain(u16le(&frame.data, 2)),
                module_count: frame.data[4],
                vendor: [frame.data[5], frame.data[6], frame.data[7]],
            }))
        }
        ID_REQUEST => {
            need(&frame.data, 2)?;
            Ok(FrameKind::Request(RequestTelegram {
                status_flags: StatusFlags::from_bits_retain(u16le(&frame.data, 0)),
            }))
        }
        ID_MANUFACTURER => {
            need(&frame.data, 8)?;
            let mut name = [0u8; 8];
            name.copy_from_slice(&frame.data[0..8]);
            Ok(FrameKind::Manufacturer(ManufacturerTelegram { name }))
        }
        ID_SYNC => Ok(FrameKind::Sync),
        other => Ok(FrameKind::Ignored(other)),
    }
}

/// Clamp a value into the representable range of a little-endian unsigned
/// field before dividing down to wire units, matching the spec's "clamp to
/// the representable range" encoder rule.
fn clamp_u16(scaled: f64) -> u16 {
    scaled.round().clamp(0.0, u16::MAX as f64) as u16
}

fn clamp_i16(scaled: f64) -> i16 {
    scaled.round().clamp(i16::MIN as f64, i16::MAX as f64) as i16
}

impl LimitsTelegram {
    pub fn encode(&self) -> (u32, Vec<u8>) {
        let mut data = vec![0u8; 8];
        data[0..2].copy_from_slice(&clamp_u16(self.u_charge * 10.0).to_le_bytes());
        data[2..4].copy_from_slice(&clamp_u16(self.i_lim_charge * 10.0).to_le_bytes());
        data[4..6].copy_from_slice(&clamp_u16(self.i_lim_discharge * 10.0).to_le_bytes());
        data[6..8].copy_from_slice(&clamp_u16(self.u_discharge * 10.0).to_le_bytes());
        (ID_LIMITS, data)
    }
}

impl SocSohTelegram {
    pub fn encode(&self) -> (u32, Vec<u8>) {
        let mut data = vec![0u8; 8];
        data[0..2].copy_from_slice(&self.soc.to_le_bytes());
        data[2..4].copy_from_slice(&self.soh.to_le_bytes());
        (ID_SOC_SOH, data)
    }
}

impl MeasurementsTelegram {
    pub fn encode(&self) -> (u32, Vec<u8>) {
        let mut data = vec![0u8; 8];
        data[0..2].copy_from_slice(&clamp_i16(self.u_measured * 100.0).to_le_bytes());
        data[2..4].copy_from_slice(&clamp_i16(self.i_measured * 10.0).to_le_bytes());
        data[4..6].copy_from_slice(&clamp_i16(self.t_measured * 10.0).to_le_bytes());
        (ID_MEASUREMENTS, data)
    }
}

impl StatusTelegram {
    pub fn encode(&self) -> (u32, Vec<u8>) {
        let mut data = vec![0u8; 8];
        data[0..2].copy_from_slice(&self.error_flags.bits().to_le_bytes());
        data[2..4].copy_from_slice(&self.warning_flags.bits().to_le_bytes());
        data[4] = self.module_count;
        data[5..8].copy_from_slice(&self.vendor);
        (ID_STATUS, data)
    }
}

impl RequestTelegram {
    pub fn encode(&self) -> (u32, Vec<u8>) {
        let mut data = vec![0u8; 8];
        data[0..2].copy_from_slice(&self.status_flags.bits().to_le_bytes());
        (ID_REQUEST, data)
    }
}

impl ManufacturerTelegram {
    pub fn encode(&self) -> (u32, Vec<u8>) {
        (ID_MANUFACTURER, self.name.to_vec())
    }
}

/// Build the outbound sync telegram: 0x305, eight zero bytes.
pub fn encode_sync() -> (u32, Vec<u8>) {
    (ID_SYNC, vec![0u8; 8])
}

/// True iff `data` is the inbound sync/acknowledge payload (8 zero bytes).
pub fn is_sync_ack(data: &[u8]) -> bool {
    data.len() == 8 && data.iter().all(|&b| b == 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(id: u32, data: Vec<u8>) -> CanFrame {
        CanFrame::new(id, data)
    }

    #[test]
    fn decode_limits() {
        // u_charge=550 (55.0V), i_lim_charge=1000 (100.0A), i_lim_discharge=1000, u_discharge=450
        let data = vec![0x26, 0x02, 0xE8, 0x03, 0xE8, 0x03, 0xC2, 0x01];
        let decoded = decode(&frame(ID_LIMITS, data)).unwrap();
        match decoded {
            FrameKind::Limits(l) => {
                assert!((l.u_charge - 55.0).abs() < 1e-9);
                assert!((l.i_lim_charge - 100.0).abs() < 1e-9);
                assert!((l.i_lim_discharge - 100.0).abs() < 1e-9);
                assert!((l.u_discharge - 45.0).abs() < 1e-9);
            }
            _ => panic!("wrong kind"),
        }
    }

    #[test]
    fn encode_decode_limits_roundtrip() {
        let t = LimitsTelegram {
            u_charge: 55.0,
            i_lim_charge: 100.0,
            i_lim_discharge: 100.0,
            u_discharge: 45.0,
        };
        let (id, data) = t.encode();
        assert_eq!(id, ID_LIMITS);
        let decoded = decode(&frame(id, data)).unwrap();
        assert_eq!(decoded, FrameKind::Limits(t));
    }

    #[test]
    fn encode_decode_measurements_roundtrip_s1() {
        // S1: i_measured = 20.0 A -> wire value 200 (0.1 A units)
        let t = MeasurementsTelegram {
            u_measured: 52.0,
            i_measured: 20.0,
            t_measured: 25.0,
        };
        let (id, data) = t.encode();
        assert_eq!(u16le(&data, 2), 200);
        let decoded = decode(&frame(id, data)).unwrap();
        assert_eq!(decoded, FrameKind::Measurements(t));
    }

    #[test]
    fn encode_decode_negative_current() {
        let t = MeasurementsTelegram {
            u_measured: 52.0,
            i_measured: -12.3,
            t_measured: -5.0,
        };
        let (_, data) = t.encode();
        let decoded = decode(&frame(ID_MEASUREMENTS, data)).unwrap();
        match decoded {
            FrameKind::Measurements(m) => {
                assert!((m.i_measured - (-12.3)).abs() < 1e-9);
                assert!((m.t_measured - (-5.0)).abs() < 1e-9);
            }
            _ => panic!("wrong kind"),
        }
    }

    #[test]
    fn decode_unknown_id_is_ignored_not_error() {
        let decoded = decode(&frame(0x123, vec![0; 8])).unwrap();
        assert_eq!(decoded, FrameKind::Ignored(0x123));
    }

    #[test]
    fn decode_truncated_is_error() {
        let err = decode(&frame(ID_LIMITS, vec![0, 1, 2])).unwrap_err();
        assert!(matches!(err, CodecError::Truncated { .. }));
    }

    #[test]
    fn status_flags_preserve_unknown_bits() {
        let status = StatusTelegram {
            error_flags: ErrorFlags::from_bits_retain(0x8000),
            warning_flags: WarningFlags::empty(),
            module_count: 4,
            vendor: *b"PN\0",
        };
        let (_, data) = status.encode();
        let decoded = decode(&frame(ID_STATUS, data)).unwrap();
        match decoded {
            FrameKind::Status(s) => assert_eq!(s.error_flags.bits(), 0x8000),
            _ => panic!("wrong kind"),
        }
    }

    #[test]
    fn sync_ack_detection() {
        assert!(is_sync_ack(&[0u8; 8]));
        assert!(!is_sync_ack(&[0, 0, 1, 0, 0, 0, 0, 0]));
        let (id, data) = encode_sync();
        assert_eq!(id, ID_SYNC);
        assert!(is_sync_ack(&data));
    }

    #[test]
    fn clamp_caps_out_of_range_values() {
        let t = LimitsTelegram {
            u_charge: 10_000.0,
            i_lim_charge: -5.0,
            i_lim_discharge: 0.0,
            u_discharge: 0.0,
        };
        let (_, data) = t.encode();
        assert_eq!(u16le(&data, 0), u16::MAX);
        assert_eq!(u16le(&data, 2), 0);
    }
}
