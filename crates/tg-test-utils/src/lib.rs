//! Device-side frame construction for tests and the emulator.
//!
//! These builders produce the frames a *tracker* would send — the inverse
//! of the gateway's decode path. CRCs are always valid unless a test
//! corrupts them on purpose.

use tg_wire::checksum::{crc16_itu, crc16_kermit};

// ---------------------------------------------------------------------------
// Jimi (GT06-style) device frames
// ---------------------------------------------------------------------------

/// Wrap `inner` (length byte through serial) in markers and CRC.
pub fn jimi_frame(inner: &[u8]) -> Vec<u8> {
    let mut f = Vec::with_capacity(inner.len() + 6);
    f.extend_from_slice(&[0x78, 0x78]);
    f.extend_from_slice(inner);
    f.extend_from_slice(&crc16_itu(inner).to_be_bytes());
    f.extend_from_slice(&[0x0D, 0x0A]);
    f
}

/// A login frame for an 8-byte BCD terminal id.
pub fn jimi_login(imei_bcd: [u8; 8], serial: u16) -> Vec<u8> {
    let mut inner = vec![0x11, 0x01];
    inner.extend_from_slice(&imei_bcd);
    inner.extend_from_slice(&[0x36, 0x00, 0x36, 0x01]);
    inner.extend_from_slice(&serial.to_be_bytes());
    jimi_frame(&inner)
}

/// A heartbeat frame (protocol 0x23 or 0x36).
pub fn jimi_heartbeat(protocol: u8, serial: u16) -> Vec<u8> {
    let mut inner = vec![0x05, protocol];
    inner.extend_from_slice(&serial.to_be_bytes());
    jimi_frame(&inner)
}

/// Parameters for a synthetic Jimi GPS frame (protocol 0x22).
#[derive(Debug, Clone)]
pub struct JimiGps {
    /// (yy, mo, dd, hh, mi, ss) as sent on the wire.
    pub datetime: (u8, u8, u8, u8, u8, u8),
    pub satellites: u8,
    /// Raw coordinate units (degrees * 1,800,000).
    pub lat_raw: u32,
    pub lon_raw: u32,
    pub speed: u8,
    pub course: u16,
    pub real_time: bool,
    pub positioned: bool,
    pub north: bool,
    pub serial: u16,
}

impl Default for JimiGps {
    fn default() -> Self {
        JimiGps {
            datetime: (24, 2, 3, 14, 5, 6),
            satellites: 9,
            // 54.6872 N, 25.2787 E in 1/1,800,000-degree units.
            lat_raw: 98_436_960,
            lon_raw: 45_501_660,
            speed: 60,
            course: 150,
            real_time: true,
            positioned: true,
            north: true,
            serial: 1,
        }
    }
}

/// Build a 2G GPS frame with a minimal cell block.
pub fn jimi_gps(gps: &JimiGps) -> Vec<u8> {
    let (yy, mo, dd, hh, mi, ss) = gps.datetime;
    let mut status = gps.course & 0x03FF;
    if gps.real_time {
        status |= 0x0400;
    }
    if gps.positioned {
        status |= 0x0800;
    }
    if gps.north {
        status |= 0x2000;
    }
    let mut payload = vec![0x22, yy, mo, dd, hh, mi, ss, 0xC0 | (gps.satellites & 0x0F)];
    payload.extend_from_slice(&gps.lat_raw.to_be_bytes());
    payload.extend_from_slice(&gps.lon_raw.to_be_bytes());
    payload.push(gps.speed);
    payload.extend_from_slice(&status.to_be_bytes());
    payload.extend_from_slice(&460u16.to_be_bytes()); // mcc
    payload.push(0); // mnc
    payload.extend_from_slice(&0x1234u16.to_be_bytes()); // lac
    payload.extend_from_slice(&[0x00, 0x56, 0x78]); // cell id
    payload.extend_from_slice(&gps.serial.to_be_bytes());

    let mut inner = vec![(payload.len() + 2) as u8];
    inner.extend_from_slice(&payload);
    jimi_frame(&inner)
}

// ---------------------------------------------------------------------------
// Ruptela device frames
// ---------------------------------------------------------------------------

/// Wrap a body (IMEI + command + payload) in length prefix and CRC.
pub fn ruptela_frame(body: &[u8]) -> Vec<u8> {
    let mut f = Vec::with_capacity(body.len() + 4);
    f.extend_from_slice(&(body.len() as u16).to_be_bytes());
    f.extend_from_slice(body);
    f.extend_from_slice(&crc16_kermit(body).to_be_bytes());
    f
}

/// Parameters for one synthetic Ruptela record.
#[derive(Debug, Clone)]
pub struct RuptelaRecord {
    pub timestamp: u32,
    /// Decimal degrees; scaled to 1e-7 units on the wire.
    pub latitude: f64,
    pub longitude: f64,
    /// Metres.
    pub altitude: f64,
    pub angle: f64,
    pub satellites: u8,
    pub speed: u16,
    pub hdop: f64,
    pub event_id: u8,
}

impl Default for RuptelaRecord {
    fn default() -> Self {
        RuptelaRecord {
            timestamp: 1_706_968_806,
            latitude: 54.6872,
            longitude: 25.2787,
            altitude: 123.4,
            angle: 90.0,
            satellites: 11,
            speed: 45,
            hdop: 1.2,
            event_id: 5,
        }
    }
}

/// A command-1 records frame carrying `records`, no IO elements.
pub fn ruptela_records(imei: u64, records: &[RuptelaRecord]) -> Vec<u8> {
    let mut body = imei.to_be_bytes().to_vec();
    body.push(1); // command: records
    body.push(0); // records left
    body.push(records.len() as u8);
    for r in records {
        body.extend_from_slice(&r.timestamp.to_be_bytes());
        body.push(0); // timestamp extension
        body.push(0); // priority
        body.extend_from_slice(&((r.longitude * 1e7) as i32).to_be_bytes());
        body.extend_from_slice(&((r.latitude * 1e7) as i32).to_be_bytes());
        body.extend_from_slice(&((r.altitude * 10.0) as u16).to_be_bytes());
        body.extend_from_slice(&((r.angle * 100.0) as u16).to_be_bytes());
        body.push(r.satellites);
        body.extend_from_slice(&r.speed.to_be_bytes());
        body.push((r.hdop * 10.0) as u8);
        body.push(r.event_id);
        // Empty IO sections for all four widths.
        body.extend_from_slice(&[0, 0, 0, 0]);
    }
    ruptela_frame(&body)
}

/// A heartbeat frame (command 16).
pub fn ruptela_heartbeat(imei: u64) -> Vec<u8> {
    let mut body = imei.to_be_bytes().to_vec();
    body.push(16);
    ruptela_frame(&body)
}

/// An identification frame (command 15) with a free-form payload.
pub fn ruptela_identification(imei: u64, payload: &[u8]) -> Vec<u8> {
    let mut body = imei.to_be_bytes().to_vec();
    body.push(15);
    body.extend_from_slice(payload);
    ruptela_frame(&body)
}
