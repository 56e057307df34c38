//! Decoder and encoders for the Jimi JM-LL301 (GT06-style) family.
//!
//! Inbound frames have already passed marker and CRC validation in the
//! [`FrameReader`](crate::frame::FrameReader); this module only interprets
//! payloads. A payload too short for its advertised protocol id degrades to
//! [`DecodedMessage::Unknown`] — the session still owes most unknown frames
//! a generic ACK, so the serial must survive even when the body does not
//! parse.
//!
//! Encoders produce the three outbound frame shapes the gateway needs:
//! the 10-byte generic ACK, the 16-byte time response, and the
//! request-location command (protocol 0x80).

use chrono::{DateTime, Datelike, TimeZone, Timelike, Utc};

use crate::checksum::crc16_itu;
use crate::message::{CellInfo, DecodedMessage, GpsFix};

/// Protocol ids the gateway dispatches on.
pub const PROTO_LOGIN: u8 = 0x01;
pub const PROTO_GPS_2G: u8 = 0x22;
pub const PROTO_HEARTBEAT: u8 = 0x23;
pub const PROTO_HEARTBEAT_ALT: u8 = 0x36;
pub const PROTO_LOCATION_REQUEST: u8 = 0x80;
pub const PROTO_TIME_REQUEST: u8 = 0x8A;
pub const PROTO_GPS_4G: u8 = 0xA0;

/// Protocol ids that must not receive any reply.
pub const NO_REPLY_PROTOCOLS: [u8; 3] = [0x12, 0x13, 0x16];

const SCALE_COORD: f64 = 1_800_000.0;

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------

/// Decode a validated Jimi frame.
///
/// `hemisphere_west` is the per-port deployment policy: when set, decoded
/// longitudes are forced negative regardless of the frame's east/west bit.
pub fn decode(frame: &[u8], hemisphere_west: bool) -> DecodedMessage {
    // Marker dictates the length-field width and thus where the protocol
    // id sits.
    let proto_at = if frame.starts_with(&[0x79, 0x79]) { 4 } else { 3 };
    let total = frame.len();
    if total < proto_at + 7 {
        return DecodedMessage::Unknown {
            protocol: 0,
            serial: 0,
            payload: Vec::new(),
        };
    }
    let protocol = frame[proto_at];
    let serial = u16::from_be_bytes([frame[total - 6], frame[total - 5]]);
    // Body between the protocol id and the trailing serial.
    let body = &frame[proto_at + 1..total - 6];

    match protocol {
        PROTO_LOGIN => decode_login(body, serial).unwrap_or_else(|| unknown(protocol, serial, body)),
        PROTO_GPS_2G | PROTO_GPS_4G => decode_gps(protocol, body, serial, hemisphere_west)
            .unwrap_or_else(|| unknown(protocol, serial, body)),
        PROTO_HEARTBEAT | PROTO_HEARTBEAT_ALT => DecodedMessage::Heartbeat { serial, protocol },
        PROTO_TIME_REQUEST => DecodedMessage::TimeRequest { serial },
        _ => unknown(protocol, serial, body),
    }
}

fn unknown(protocol: u8, serial: u16, body: &[u8]) -> DecodedMessage {
    DecodedMessage::Unknown {
        protocol,
        serial,
        payload: body.to_vec(),
    }
}

/// BCD-decode the 8-byte terminal id, skipping nibbles that are not
/// decimal digits.
pub fn decode_bcd_imei(raw: &[u8]) -> String {
    let mut imei = String::with_capacity(raw.len() * 2);
    for &b in raw {
        for nibble in [b >> 4, b & 0x0F] {
            if nibble <= 9 {
                imei.push(char::from(b'0' + nibble));
            }
        }
    }
    imei
}

fn decode_login(body: &[u8], serial: u16) -> Option<DecodedMessage> {
    let mut c = Cursor::new(body);
    let imei = decode_bcd_imei(c.take(8)?);
    let type_id = c.u16()?;
    let tz_lang = c.u16()?;
    Some(DecodedMessage::Login {
        imei,
        type_id,
        tz_lang,
        serial,
    })
}

fn decode_gps(
    protocol: u8,
    body: &[u8],
    serial: u16,
    hemisphere_west: bool,
) -> Option<DecodedMessage> {
    let mut c = Cursor::new(body);
    let (yy, mo, dd) = (c.u8()?, c.u8()?, c.u8()?);
    let (hh, mi, ss) = (c.u8()?, c.u8()?, c.u8()?);
    let timestamp = Utc
        .with_ymd_and_hms(
            2000 + i32::from(yy),
            u32::from(mo),
            u32::from(dd),
            u32::from(hh),
            u32::from(mi),
            u32::from(ss),
        )
        .single()?;
    let satellites = c.u8()? & 0x0F;
    let lat_raw = c.u32()?;
    let lon_raw = c.u32()?;
    let speed = f64::from(c.u8()?);
    let course_status = c.u16()?;

    let course = f64::from(course_status & 0x03FF);
    let real_time = course_status & 0x0400 != 0;
    let positioned = course_status & 0x0800 != 0;
    let west = course_status & 0x1000 != 0;
    let north = course_status & 0x2000 != 0;

    let mut latitude = f64::from(lat_raw) / SCALE_COORD;
    if !north {
        latitude = -latitude;
    }
    let mut longitude = f64::from(lon_raw) / SCALE_COORD;
    if hemisphere_west || west {
        longitude = -longitude;
    }

    // Cell block is optional on some firmware revisions; a fix without it
    // is still a fix.
    let cell = decode_cell(protocol, &mut c);

    Some(DecodedMessage::Gps(GpsFix {
        timestamp,
        latitude,
        longitude,
        speed,
        course,
        satellites,
        positioned,
        real_time,
        cell,
        serial,
        protocol,
    }))
}

fn decode_cell(protocol: u8, c: &mut Cursor) -> Option<CellInfo> {
    let mcc_raw = c.u16()?;
    let two_byte_mnc = mcc_raw & 0x8000 != 0;
    let mcc = mcc_raw & 0x7FFF;
    let mnc = if two_byte_mnc {
        c.u16()?
    } else {
        u16::from(c.u8()?)
    };
    let (lac, cell_id) = if protocol == PROTO_GPS_4G {
        (c.u32()?, c.u64()?)
    } else {
        (u32::from(c.u16()?), c.uint(3)?)
    };
    Some(CellInfo {
        mcc,
        mnc,
        lac,
        cell_id,
    })
}

// ---------------------------------------------------------------------------
// Encoding
// ---------------------------------------------------------------------------

fn build_frame(inner: &[u8]) -> Vec<u8> {
    let mut f = Vec::with_capacity(inner.len() + 6);
    f.extend_from_slice(&[0x78, 0x78]);
    f.extend_from_slice(inner);
    f.extend_from_slice(&crc16_itu(inner).to_be_bytes());
    f.extend_from_slice(&[0x0D, 0x0A]);
    f
}

/// The 10-byte generic ACK: echoes the protocol id and the serial of the
/// frame it acknowledges.
pub fn encode_ack(protocol: u8, serial: u16) -> Vec<u8> {
    let mut inner = vec![0x05, protocol];
    inner.extend_from_slice(&serial.to_be_bytes());
    build_frame(&inner)
}

/// The 16-byte time response to a 0x8A request, carrying UTC wall-clock.
pub fn encode_time_response(now: DateTime<Utc>, serial: u16) -> Vec<u8> {
    let mut inner = vec![
        0x0B,
        PROTO_TIME_REQUEST,
        (now.year() - 2000) as u8,
        now.month() as u8,
        now.day() as u8,
        now.hour() as u8,
        now.minute() as u8,
        now.second() as u8,
    ];
    inner.extend_from_slice(&serial.to_be_bytes());
    build_frame(&inner)
}

/// The request-location command the poll scheduler transmits.
pub fn encode_location_request(serial: u16) -> Vec<u8> {
    encode_ack(PROTO_LOCATION_REQUEST, serial)
}

// ---------------------------------------------------------------------------
// Byte cursor
// ---------------------------------------------------------------------------

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Cursor { bytes, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        let end = self.pos.checked_add(n)?;
        if end > self.bytes.len() {
            return None;
        }
        let s = &self.bytes[self.pos..end];
        self.pos = end;
        Some(s)
    }

    fn u8(&mut self) -> Option<u8> {
        self.take(1).map(|s| s[0])
    }

    fn u16(&mut self) -> Option<u16> {
        self.take(2).map(|s| u16::from_be_bytes([s[0], s[1]]))
    }

    fn u32(&mut self) -> Option<u32> {
        self.take(4)
            .map(|s| u32::from_be_bytes([s[0], s[1], s[2], s[3]]))
    }

    fn u64(&mut self) -> Option<u64> {
        self.uint(8)
    }

    /// Big-endian unsigned integer of `n` bytes, n <= 8.
    fn uint(&mut self, n: usize) -> Option<u64> {
        let s = self.take(n)?;
        let mut v = 0u64;
        for &b in s {
            v = (v << 8) | u64::from(b);
        }
        Some(v)
    }
}
