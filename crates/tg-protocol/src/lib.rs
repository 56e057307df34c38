// tg-protocol: canonical telemetry records and the subscriber push contract.
//
// Every message delivered to a subscriber is self-describing via a
// top-level `type` tag. Subscribers dispatch on the tag and must tolerate
// unknown optional fields; the field set below is the frozen v1 contract.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// ---------------------------------------------------------------------------
// Shared sub-types
// ---------------------------------------------------------------------------

/// Cell tower identification, present when the tracker reported one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CellInfo {
    pub mcc: u16,
    pub mnc: u16,
    pub lac: u32,
    pub cell_id: u64,
}

/// A normalized, validated position fix as delivered to subscribers.
///
/// Coordinates are WGS-84 decimal degrees, already range-checked; the
/// timestamp is UTC — the gateway never applies timezone offsets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryFix {
    pub imei: String,
    pub timestamp: DateTime<Utc>,
    pub latitude: f64,
    pub longitude: f64,
    /// km/h, clamped to 0..=1000.
    pub speed: f64,
    /// Heading in degrees, 0..360.
    pub course: f64,
    /// Metres, when the family reports one (Ruptela records).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub altitude: Option<f64>,
    pub satellites: u8,
    /// GPS-positioned flag as reported by the device.
    pub positioned: bool,
    /// True when the fix passed full validation (always true for emitted
    /// fixes; carried for subscriber-side symmetry with raw feeds).
    pub valid: bool,
    /// Wire protocol identifier the fix arrived under (family-specific).
    pub protocol: String,
    /// Device serial of the originating frame, when the family has one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serial: Option<u16>,
    /// TCP port the device connected to.
    pub source_port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cell: Option<CellInfo>,
    /// Ruptela IO elements, keyed `width:io_id` for JSON friendliness.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub io_elements: BTreeMap<String, i64>,
}

/// A device lifecycle notice (login, disconnect, poll-phase change).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceStatus {
    pub imei: String,
    pub event: String,
    pub timestamp: DateTime<Utc>,
    pub source_port: u16,
}

/// An alarm/alert raised by a device frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceAlert {
    pub imei: String,
    pub code: u16,
    pub timestamp: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Push messages
// ---------------------------------------------------------------------------

/// The tagged union delivered over the push channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum PushMessage {
    /// A fix from a Jimi (GT06-family) tracker.
    #[serde(rename = "jimi-data")]
    JimiData(TelemetryFix),
    /// A fix from a Ruptela tracker.
    #[serde(rename = "gps-data")]
    GpsData(TelemetryFix),
    /// A device alarm.
    #[serde(rename = "alert-data")]
    AlertData(DeviceAlert),
    /// Device lifecycle notice.
    #[serde(rename = "status-data")]
    StatusData(DeviceStatus),
}

impl PushMessage {
    /// The IMEI the message concerns.
    pub fn imei(&self) -> &str {
        match self {
            PushMessage::JimiData(f) | PushMessage::GpsData(f) => &f.imei,
            PushMessage::AlertData(a) => &a.imei,
            PushMessage::StatusData(s) => &s.imei,
        }
    }
}
