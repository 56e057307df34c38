//! Typed messages produced by the two family decoders.
//!
//! Downstream code never pokes at raw frame bytes; it dispatches on
//! [`DecodedMessage`] variants. Fields carry already-scaled engineering
//! units (degrees, km/h, metres) — wire scaling factors live in the
//! decoders only.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

/// Cell tower identification attached to a Jimi GPS fix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CellInfo {
    pub mcc: u16,
    pub mnc: u16,
    pub lac: u32,
    pub cell_id: u64,
}

/// A decoded GPS position from a Jimi GPS frame (protocol 0x22 or 0xA0).
#[derive(Debug, Clone, PartialEq)]
pub struct GpsFix {
    pub timestamp: DateTime<Utc>,
    pub latitude: f64,
    pub longitude: f64,
    /// km/h as reported.
    pub speed: f64,
    /// Heading in degrees, 0..360.
    pub course: f64,
    pub satellites: u8,
    /// GPS-positioned status bit; unpositioned fixes are never published.
    pub positioned: bool,
    /// Real-time (vs. stored/differential) flag.
    pub real_time: bool,
    pub cell: Option<CellInfo>,
    pub serial: u16,
    /// Raw protocol id the fix arrived under (0x22 or 0xA0).
    pub protocol: u8,
}

/// IO elements of one Ruptela record, grouped by value width in bytes.
///
/// Keys of the outer map are the section widths (1, 2, 4, 8); inner maps go
/// from IO id to the value read at that width. 8-byte values are clamped to
/// the i64 range.
pub type IoElements = BTreeMap<u8, BTreeMap<u16, i64>>;

/// One telemetry record from a Ruptela records frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub timestamp: DateTime<Utc>,
    pub priority: u8,
    pub latitude: f64,
    pub longitude: f64,
    /// Metres.
    pub altitude: f64,
    /// Degrees, 0..360.
    pub angle: f64,
    pub satellites: u8,
    /// km/h.
    pub speed: f64,
    pub hdop: f64,
    pub event_id: u16,
    pub io: IoElements,
}

/// Everything a validated frame can decode to, across both families.
#[derive(Debug, Clone, PartialEq)]
pub enum DecodedMessage {
    /// Jimi login (protocol 0x01).
    Login {
        imei: String,
        type_id: u16,
        tz_lang: u16,
        serial: u16,
    },
    /// Heartbeat from either family. For Jimi, `protocol` is 0x23 or 0x36;
    /// for Ruptela it is command 16.
    Heartbeat { serial: u16, protocol: u8 },
    /// Jimi time calibration request (protocol 0x8A).
    TimeRequest { serial: u16 },
    /// Jimi GPS fix.
    Gps(GpsFix),
    /// Ruptela records batch (commands 1 and 68).
    Records {
        imei: String,
        command: u8,
        records: Vec<Record>,
        records_left: u8,
    },
    /// Ruptela identification (commands 15 and 18).
    Identification {
        imei: String,
        command: u8,
        payload: Vec<u8>,
    },
    /// Anything unrecognized, or a known command whose payload was too
    /// short. Carries enough to decide whether a generic ACK is owed.
    Unknown {
        protocol: u8,
        serial: u16,
        payload: Vec<u8>,
    },
}

impl DecodedMessage {
    /// The device serial number this message carries, when the family has
    /// one (Jimi frames always do; Ruptela frames have none).
    pub fn serial(&self) -> Option<u16> {
        match self {
            DecodedMessage::Login { serial, .. }
            | DecodedMessage::Heartbeat { serial, .. }
            | DecodedMessage::TimeRequest { serial }
            | DecodedMessage::Unknown { serial, .. } => Some(*serial),
            DecodedMessage::Gps(fix) => Some(fix.serial),
            DecodedMessage::Records { .. } | DecodedMessage::Identification { .. } => None,
        }
    }
}
