//! Decoder and encoders for the Ruptela framed-records family (FM/ECO).
//!
//! Frames reaching [`decode`] have already passed length and CRC checks.
//! Layout: 2-byte packet length, 8-byte IMEI, 1-byte command, payload,
//! 2-byte CRC-16/Kermit. Unlike the Jimi family there is no device serial;
//! acknowledgements reference the command id instead, offset by 99
//! (records → 100, identification → 115, heartbeat → 116, dynamic
//! identification → 117).
//!
//! Records parsing is deliberately tolerant at the tail: a record whose
//! header truncates is dropped, but an IO section that overruns the payload
//! keeps the elements parsed so far — partial batches from flaky firmware
//! still produce telemetry.

use chrono::{TimeZone, Utc};

use crate::checksum::crc16_kermit;
use crate::message::{DecodedMessage, IoElements, Record};

/// Inbound command ids.
pub const CMD_RECORDS: u8 = 1;
pub const CMD_IDENTIFICATION: u8 = 15;
pub const CMD_HEARTBEAT: u8 = 16;
pub const CMD_DYN_IDENTIFICATION: u8 = 18;
pub const CMD_RECORDS_EXT: u8 = 68;

/// Response command offset: a received command is acknowledged with
/// `command + 99`, except extended records which share the records ACK.
pub const RESP_RECORDS: u8 = 100;
pub const RESP_IDENTIFICATION: u8 = 115;
pub const RESP_HEARTBEAT: u8 = 116;
pub const RESP_DYN_IDENTIFICATION: u8 = 117;

const SCALE_COORD: f64 = 1e7;

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------

/// Decode a validated Ruptela frame.
pub fn decode(frame: &[u8]) -> DecodedMessage {
    if frame.len() < 13 {
        return DecodedMessage::Unknown {
            protocol: 0,
            serial: 0,
            payload: frame.to_vec(),
        };
    }
    let imei_raw = u64::from_be_bytes(frame[2..10].try_into().expect("8-byte slice"));
    let imei = imei_raw.to_string();
    let command = frame[10];
    let payload = &frame[11..frame.len() - 2];

    match command {
        CMD_RECORDS | CMD_RECORDS_EXT => match parse_records(command, payload) {
            Some((records_left, records)) => DecodedMessage::Records {
                imei,
                command,
                records,
                records_left,
            },
            None => unknown(command, payload),
        },
        CMD_IDENTIFICATION | CMD_DYN_IDENTIFICATION => DecodedMessage::Identification {
            imei,
            command,
            payload: payload.to_vec(),
        },
        CMD_HEARTBEAT => DecodedMessage::Heartbeat {
            serial: 0,
            protocol: CMD_HEARTBEAT,
        },
        _ => unknown(command, payload),
    }
}

fn unknown(command: u8, payload: &[u8]) -> DecodedMessage {
    DecodedMessage::Unknown {
        protocol: command,
        serial: 0,
        payload: payload.to_vec(),
    }
}

fn parse_records(command: u8, payload: &[u8]) -> Option<(u8, Vec<Record>)> {
    let mut c = Cursor::new(payload);
    let records_left = c.u8()?;
    let declared = c.u8()?;
    let mut records = Vec::with_capacity(usize::from(declared));
    for _ in 0..declared {
        match parse_record(command, &mut c) {
            RecordParse::Complete(r) => records.push(r),
            // IO overrun: keep the partially-furnished record, stop the
            // batch — the cursor position is no longer trustworthy.
            RecordParse::Partial(r) => {
                records.push(r);
                break;
            }
            RecordParse::HeaderTruncated => break,
        }
    }
    Some((records_left, records))
}

enum RecordParse {
    Complete(Record),
    Partial(Record),
    HeaderTruncated,
}

fn parse_record(command: u8, c: &mut Cursor) -> RecordParse {
    let Some(header) = parse_record_header(command, c) else {
        return RecordParse::HeaderTruncated;
    };
    let (mut record, extended_io_ids) = header;
    let (io, complete) = parse_io_elements(c, extended_io_ids);
    record.io = io;
    if complete {
        RecordParse::Complete(record)
    } else {
        RecordParse::Partial(record)
    }
}

fn parse_record_header(command: u8, c: &mut Cursor) -> Option<(Record, bool)> {
    let extended = command == CMD_RECORDS_EXT;
    let ts = c.u32()?;
    let _ts_extension = c.u8()?;
    if extended {
        let _record_extension = c.u8()?;
    }
    let priority = c.u8()?;
    let longitude = f64::from(c.i32()?) / SCALE_COORD;
    let latitude = f64::from(c.i32()?) / SCALE_COORD;
    let altitude = f64::from(c.u16()?) / 10.0;
    let angle = f64::from(c.u16()?) / 100.0;
    let satellites = c.u8()?;
    let speed = f64::from(c.u16()?);
    let hdop = f64::from(c.u8()?) / 10.0;
    let event_id = if extended {
        c.u16()?
    } else {
        u16::from(c.u8()?)
    };
    let timestamp = Utc.timestamp_opt(i64::from(ts), 0).single()?;
    Some((
        Record {
            timestamp,
            priority,
            latitude,
            longitude,
            altitude,
            angle,
            satellites,
            speed,
            hdop,
            event_id,
            io: IoElements::new(),
        },
        extended,
    ))
}

/// The four IO sections, keyed by value width. The boolean is false when a
/// section overran the payload; the map still holds every element parsed
/// before the overrun.
fn parse_io_elements(c: &mut Cursor, extended_io_ids: bool) -> (IoElements, bool) {
    let mut io = IoElements::new();
    for width in [1u8, 2, 4, 8] {
        let Some(count) = c.u8() else {
            return (io, false);
        };
        for _ in 0..count {
            let id = if extended_io_ids {
                c.u16()
            } else {
                c.u8().map(u16::from)
            };
            let (Some(id), Some(value)) = (id, c.int(usize::from(width))) else {
                return (io, false);
            };
            io.entry(width).or_default().insert(id, value);
        }
    }
    (io, true)
}

// ---------------------------------------------------------------------------
// Encoding
// ---------------------------------------------------------------------------

fn build_frame(body: &[u8]) -> Vec<u8> {
    let mut f = Vec::with_capacity(body.len() + 4);
    f.extend_from_slice(&(body.len() as u16).to_be_bytes());
    f.extend_from_slice(body);
    f.extend_from_slice(&crc16_kermit(body).to_be_bytes());
    f
}

/// Records ACK: positive when at least one record was accepted.
pub fn encode_records_ack(accepted: bool) -> Vec<u8> {
    build_frame(&[RESP_RECORDS, u8::from(accepted)])
}

/// Identification ACK policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentAck {
    Authorized,
    /// Rejected; the device should back off for this many minutes.
    Rejected { delay_minutes: u8 },
}

/// Identification ACK for commands 15 (response 115) and 18 (response 117).
pub fn encode_identification_ack(command: u8, decision: IdentAck) -> Vec<u8> {
    let resp = if command == CMD_DYN_IDENTIFICATION {
        RESP_DYN_IDENTIFICATION
    } else {
        RESP_IDENTIFICATION
    };
    match decision {
        IdentAck::Authorized => build_frame(&[resp, 0x01]),
        IdentAck::Rejected { delay_minutes } => build_frame(&[resp, 0x02, delay_minutes]),
    }
}

/// Heartbeat ACK: response command 116, payload 0x01.
pub fn encode_heartbeat_ack() -> Vec<u8> {
    build_frame(&[RESP_HEARTBEAT, 0x01])
}

/// Generic ACK for commands without a dedicated response shape: the
/// received command id offset by 99, payload 0x01.
pub fn encode_generic_ack(command: u8) -> Vec<u8> {
    build_frame(&[command.wrapping_add(99), 0x01])
}

/// Parse a server-side response frame (used by tests and the device
/// emulator): returns the response command and its payload.
pub fn decode_response(frame: &[u8]) -> Option<(u8, Vec<u8>)> {
    if frame.len() < 5 {
        return None;
    }
    let len = u16::from_be_bytes([frame[0], frame[1]]) as usize;
    if frame.len() != len + 4 {
        return None;
    }
    let body = &frame[2..2 + len];
    let carried = u16::from_be_bytes([frame[len + 2], frame[len + 3]]);
    if crc16_kermit(body) != carried {
        return None;
    }
    Some((body[0], body[1..].to_vec()))
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

    fn i32(&mut self) -> Option<i32> {
        self.u32().map(|v| v as i32)
    }

    /// Big-endian unsigned value of `n` bytes, clamped into the i64 range
    /// (8-byte IO values may use the full u64 span).
    fn int(&mut self, n: usize) -> Option<i64> {
        let s = self.take(n)?;
        let mut v = 0u64;
        for &b in s {
            v = (v << 8) | u64::from(b);
        }
        Some(i64::try_from(v).unwrap_or(i64::MAX))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const TWO_RECORD_FRAME: &str = "0046000144a21cd245a101000265be46e600000f11393820989ac004d223280b002d0c05010201011d30d4000065be472200000f1144f02098a67804d8238c0a002f0b050000000054c7";

    fn body_frame(body: &[u8]) -> Vec<u8> {
        build_frame(body)
    }

    #[test]
    fn two_record_batch_decodes() {
        let frame = hex::decode(TWO_RECORD_FRAME).unwrap();
        let msg = decode(&frame);
        let DecodedMessage::Records {
            imei,
            command,
            records,
            records_left,
        } = msg
        else {
            panic!("expected records, got {msg:?}");
        };
        assert_eq!(imei, "356938035643809");
        assert_eq!(command, CMD_RECORDS);
        assert_eq!(records_left, 0);
        assert_eq!(records.len(), 2);

        let r = &records[0];
        assert_eq!(
            r.timestamp,
            Utc.timestamp_opt(1_706_968_806, 0).single().unwrap()
        );
        assert_eq!(r.priority, 0);
        assert!((r.longitude - 25.2787).abs() < 1e-9);
        assert!((r.latitude - 54.6872).abs() < 1e-9);
        assert!((r.altitude - 123.4).abs() < 1e-9);
        assert!((r.angle - 90.0).abs() < 1e-9);
        assert_eq!(r.satellites, 11);
        assert_eq!(r.speed, 45.0);
        assert!((r.hdop - 1.2).abs() < 1e-9);
        assert_eq!(r.event_id, 5);
        assert_eq!(r.io[&1][&2], 1);
        assert_eq!(r.io[&2][&29], 12_500);

        let r = &records[1];
        assert_eq!(
            r.timestamp,
            Utc.timestamp_opt(1_706_968_866, 0).single().unwrap()
        );
        assert!((r.longitude - 25.2790).abs() < 1e-9);
        assert!((r.latitude - 54.6875).abs() < 1e-9);
        assert_eq!(r.satellites, 10);
        assert_eq!(r.speed, 47.0);
    }

    #[test]
    fn extended_records_use_wide_ids_and_events() {
        // One command-68 record: 25-byte header, u16 IO ids, u16 event.
        let mut body = 356_938_035_643_809u64.to_be_bytes().to_vec();
        body.push(CMD_RECORDS_EXT);
        body.push(0); // records left
        body.push(1); // record count
        body.extend_from_slice(&1_706_968_806u32.to_be_bytes());
        body.push(0); // timestamp extension
        body.push(0); // record extension
        body.push(1); // priority
        body.extend_from_slice(&252_787_000i32.to_be_bytes()); // lon
        body.extend_from_slice(&546_872_000i32.to_be_bytes()); // lat
        body.extend_from_slice(&1234u16.to_be_bytes()); // altitude*10
        body.extend_from_slice(&9000u16.to_be_bytes()); // angle*100
        body.push(9); // satellites
        body.extend_from_slice(&52u16.to_be_bytes()); // speed
        body.push(14); // hdop*10
        body.extend_from_slice(&0x0207u16.to_be_bytes()); // event id
        body.push(1); // 1-byte section
        body.extend_from_slice(&0x0105u16.to_be_bytes()); // io id 261
        body.push(0xFF);
        body.push(0); // 2-byte section
        body.push(0); // 4-byte section
        body.push(1); // 8-byte section
        body.extend_from_slice(&0x0200u16.to_be_bytes());
        body.extend_from_slice(&u64::MAX.to_be_bytes());
        let frame = body_frame(&body);

        let DecodedMessage::Records {
            command, records, ..
        } = decode(&frame)
        else {
            panic!("expected records");
        };
        assert_eq!(command, CMD_RECORDS_EXT);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].event_id, 0x0207);
        assert_eq!(records[0].io[&1][&261], 0xFF);
        // 8-byte values clamp to the i64 range.
        assert_eq!(records[0].io[&8][&0x0200], i64::MAX);
    }

    #[test]
    fn io_section_overrun_keeps_parsed_records() {
        let frame = hex::decode(TWO_RECORD_FRAME).unwrap();
        // Chop the second record's IO sections off and re-frame.
        let body = &frame[2..frame.len() - 2];
        let truncated = &body[..body.len() - 4];
        let reframed = body_frame(truncated);
        let DecodedMessage::Records { records, .. } = decode(&reframed) else {
            panic!("expected records");
        };
        // First record is intact; the second survives without its IO tail.
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].io[&2][&29], 12_500);
        assert_eq!(records[1].speed, 47.0);
    }

    #[test]
    fn heartbeat_and_identification_variants() {
        let mut body = 356_938_035_643_809u64.to_be_bytes().to_vec();
        body.push(CMD_HEARTBEAT);
        assert_eq!(
            decode(&body_frame(&body)),
            DecodedMessage::Heartbeat {
                serial: 0,
                protocol: CMD_HEARTBEAT
            }
        );

        let mut body = 356_938_035_643_809u64.to_be_bytes().to_vec();
        body.push(CMD_IDENTIFICATION);
        body.extend_from_slice(b"FM-Pro5");
        match decode(&body_frame(&body)) {
            DecodedMessage::Identification {
                imei,
                command,
                payload,
            } => {
                assert_eq!(imei, "356938035643809");
                assert_eq!(command, CMD_IDENTIFICATION);
                assert_eq!(payload, b"FM-Pro5");
            }
            other => panic!("expected identification, got {other:?}"),
        }
    }

    #[test]
    fn unrecognized_command_is_unknown() {
        let mut body = 356_938_035_643_809u64.to_be_bytes().to_vec();
        body.push(0x33);
        body.extend_from_slice(&[0xDE, 0xAD]);
        match decode(&body_frame(&body)) {
            DecodedMessage::Unknown {
                protocol, payload, ..
            } => {
                assert_eq!(protocol, 0x33);
                assert_eq!(payload, vec![0xDE, 0xAD]);
            }
            other => panic!("expected unknown, got {other:?}"),
        }
    }

    #[test]
    fn ack_wire_bytes() {
        assert_eq!(encode_records_ack(true), hex::decode("0002640113bc").unwrap());
        assert_eq!(encode_records_ack(false), hex::decode("000264000235").unwrap());
        assert_eq!(encode_heartbeat_ack(), hex::decode("00027401862d").unwrap());
        assert_eq!(
            encode_identification_ack(CMD_IDENTIFICATION, IdentAck::Authorized),
            hex::decode("00027301cb25").unwrap()
        );
        assert_eq!(
            encode_identification_ack(CMD_DYN_IDENTIFICATION, IdentAck::Authorized),
            hex::decode("000275019ff5").unwrap()
        );
    }

    #[test]
    fn rejected_identification_carries_backoff() {
        let wire = encode_identification_ack(CMD_IDENTIFICATION, IdentAck::Rejected {
            delay_minutes: 30,
        });
        let (resp, payload) = decode_response(&wire).unwrap();
        assert_eq!(resp, RESP_IDENTIFICATION);
        assert_eq!(payload, vec![0x02, 30]);
    }

    #[test]
    fn ack_frames_roundtrip() {
        for wire in [
            encode_records_ack(true),
            encode_records_ack(false),
            encode_heartbeat_ack(),
        ] {
            let (resp, payload) = decode_response(&wire).unwrap();
            let rebuilt = build_frame(&{
                let mut b = vec![resp];
                b.extend_from_slice(&payload);
                b
            });
            assert_eq!(rebuilt, wire);
        }
    }
}
