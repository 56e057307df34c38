//! End-to-end wire vectors: raw captured-style bytes through the frame
//! reader and the family decoders, with the exact ACK bytes a device
//! expects in return.

use tg_wire::checksum::crc16_itu;
use tg_wire::{jimi, ruptela, DecodedMessage, FrameError, FrameReader, ProtocolFamily};

fn jimi_frame(inner: &[u8]) -> Vec<u8> {
    let mut f = vec![0x78, 0x78];
    f.extend_from_slice(inner);
    f.extend_from_slice(&crc16_itu(inner).to_be_bytes());
    f.extend_from_slice(&[0x0D, 0x0A]);
    f
}

#[test]
fn jimi_login_to_ack_roundtrip() {
    // Login for terminal id 0356938035643809, serial 1.
    let mut inner = vec![0x11, 0x01];
    inner.extend_from_slice(&[0x03, 0x56, 0x93, 0x80, 0x35, 0x64, 0x38, 0x09]);
    inner.extend_from_slice(&[0x36, 0x00, 0x36, 0x01, 0x00, 0x01]);
    let wire = jimi_frame(&inner);

    let mut reader = FrameReader::new(ProtocolFamily::Jimi);
    reader.push(&wire);
    let frame = reader.next_frame().unwrap().expect("one complete frame");

    let DecodedMessage::Login { imei, serial, .. } = jimi::decode(&frame.bytes, false) else {
        panic!("expected login");
    };
    assert_eq!(imei, "0356938035643809");
    assert_eq!(serial, 1);

    // The ACK a live device verifies byte-for-byte.
    assert_eq!(
        jimi::encode_ack(jimi::PROTO_LOGIN, serial),
        vec![0x78, 0x78, 0x05, 0x01, 0x00, 0x01, 0xD9, 0xDC, 0x0D, 0x0A]
    );
}

#[test]
fn corrupted_crc_discards_frame_but_not_stream() {
    let mut inner = vec![0x11, 0x01];
    inner.extend_from_slice(&[0x03, 0x56, 0x93, 0x80, 0x35, 0x64, 0x38, 0x09]);
    inner.extend_from_slice(&[0x36, 0x00, 0x36, 0x01, 0x00, 0x01]);
    let good = jimi_frame(&inner);
    let mut bad = good.clone();
    let crc_lo = bad.len() - 3;
    bad[crc_lo] ^= 0x01;

    let mut reader = FrameReader::new(ProtocolFamily::Jimi);
    reader.push(&bad);
    reader.push(&good);

    assert!(matches!(
        reader.next_frame(),
        Err(FrameError::ChecksumMismatch { .. })
    ));
    let frame = reader.next_frame().unwrap().expect("valid frame after bad one");
    assert!(matches!(
        jimi::decode(&frame.bytes, false),
        DecodedMessage::Login { .. }
    ));
}

#[test]
fn ruptela_records_batch_and_ack() {
    let wire = hex::decode(
        "0046000144a21cd245a101000265be46e600000f11393820989ac004d223280b002d0c05010201011d30d4000065be472200000f1144f02098a67804d8238c0a002f0b050000000054c7",
    )
    .unwrap();

    let mut reader = FrameReader::new(ProtocolFamily::Ruptela);
    // Ruptela devices commonly trickle frames; feed in two halves.
    reader.push(&wire[..20]);
    assert_eq!(reader.next_frame(), Ok(None));
    reader.push(&wire[20..]);
    let frame = reader.next_frame().unwrap().expect("one complete frame");

    let DecodedMessage::Records { imei, records, .. } = ruptela::decode(&frame.bytes) else {
        panic!("expected records");
    };
    assert_eq!(imei, "356938035643809");
    assert_eq!(records.len(), 2);
    assert!(records[0].timestamp < records[1].timestamp);

    // Positive ACK: length 2, response command 100, accepted flag, CRC.
    assert_eq!(
        ruptela::encode_records_ack(true),
        hex::decode("0002640113bc").unwrap()
    );
}

#[test]
fn jimi_gps_requires_no_ack_and_decodes_position() {
    let wire = hex::decode(
        "78781f221802030e0506c904fa1be0068b6a403c2c9601cc001234005678000599700d0a",
    )
    .unwrap();
    let mut reader = FrameReader::new(ProtocolFamily::Jimi);
    reader.push(&wire);
    let frame = reader.next_frame().unwrap().expect("one complete frame");
    let DecodedMessage::Gps(fix) = jimi::decode(&frame.bytes, true) else {
        panic!("expected gps");
    };
    assert!(fix.positioned);
    // Western deployment: longitude forced negative.
    assert!(fix.longitude < 0.0);
    assert!(fix.latitude > 0.0);
}
