//! End-to-end Ruptela session tests over loopback TCP: records batches,
//! ACK polarity, duplicate suppression, stationary consolidation,
//! heartbeats, and identification.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};

use gateway::config::{PortConfig, PortFamily};
use gateway::dedup::RecentWindow;
use gateway::fanout::SubscriberSet;
use gateway::listener::PortListener;
use gateway::poll::PollConfig;
use gateway::registry::SessionRegistry;
use gateway::session::SessionContext;
use tg_protocol::PushMessage;
use tg_test_utils::{ruptela_heartbeat, ruptela_identification, ruptela_records, RuptelaRecord};

const IMEI: u64 = 356_938_035_643_809;

struct Harness {
    addr: std::net::SocketAddr,
    ctx: Arc<SessionContext>,
    push_rx: mpsc::Receiver<PushMessage>,
    _shutdown_tx: watch::Sender<bool>,
}

async fn harness() -> Harness {
    let fanout = Arc::new(SubscriberSet::new("tok"));
    let (sub_id, push_rx) = fanout.attach();
    assert!(fanout.authenticate(sub_id, "tok"));

    let ctx = Arc::new(SessionContext {
        fanout,
        dedup: Arc::new(RecentWindow::new()),
        registry: Arc::new(SessionRegistry::new()),
        poll_config: PollConfig::default(),
        idle_timeout: Duration::from_secs(300),
    });

    let port = PortConfig {
        port: 6000,
        family: PortFamily::RuptelaFm,
        hemisphere_west: false,
    };
    let listener = PortListener::bind_addr("127.0.0.1:0", port).await.unwrap();
    let addr = listener.local_addr();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(listener.run(ctx.clone(), 100, shutdown_rx));

    Harness {
        addr,
        ctx,
        push_rx,
        _shutdown_tx: shutdown_tx,
    }
}

async fn read_exact(conn: &mut TcpStream, n: usize) -> Vec<u8> {
    let mut buf = vec![0u8; n];
    tokio::time::timeout(Duration::from_secs(2), conn.read_exact(&mut buf))
        .await
        .expect("read timed out")
        .expect("read failed");
    buf
}

async fn next_push(rx: &mut mpsc::Receiver<PushMessage>) -> PushMessage {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("push timed out")
        .expect("push channel closed")
}

fn record(ts: u32, lat: f64, lon: f64, speed: u16) -> RuptelaRecord {
    RuptelaRecord {
        timestamp: ts,
        latitude: lat,
        longitude: lon,
        speed,
        ..RuptelaRecord::default()
    }
}

const POSITIVE_ACK: [u8; 6] = [0x00, 0x02, 0x64, 0x01, 0x13, 0xBC];
const NEGATIVE_ACK: [u8; 6] = [0x00, 0x02, 0x64, 0x00, 0x02, 0x35];

#[tokio::test]
async fn records_batch_is_acked_and_published_in_order() {
    let mut h = harness().await;
    let mut conn = TcpStream::connect(h.addr).await.unwrap();

    // Out-of-order timestamps on the wire; emission is sorted.
    let frame = ruptela_records(
        IMEI,
        &[
            record(1_706_968_866, 54.6875, 25.2790, 47),
            record(1_706_968_806, 54.6872, 25.2787, 45),
        ],
    );
    conn.write_all(&frame).await.unwrap();

    assert_eq!(read_exact(&mut conn, 6).await, POSITIVE_ACK);

    // First push is the device-identified status.
    match next_push(&mut h.push_rx).await {
        PushMessage::StatusData(s) => assert_eq!(s.event, "login"),
        other => panic!("expected status, got {other:?}"),
    }
    let first = next_push(&mut h.push_rx).await;
    let second = next_push(&mut h.push_rx).await;
    match (&first, &second) {
        (PushMessage::GpsData(a), PushMessage::GpsData(b)) => {
            assert_eq!(a.imei, IMEI.to_string());
            assert!(a.timestamp < b.timestamp);
            assert_eq!(a.speed, 45.0);
            assert_eq!(b.speed, 47.0);
        }
        other => panic!("expected two fixes, got {other:?}"),
    }
    assert_eq!(h.ctx.registry.active_count(), 1);
}

#[tokio::test]
async fn duplicate_records_are_acked_but_not_reemitted() {
    let mut h = harness().await;
    let mut conn = TcpStream::connect(h.addr).await.unwrap();

    let frame = ruptela_records(IMEI, &[record(1_706_968_806, 54.6872, 25.2787, 45)]);
    conn.write_all(&frame).await.unwrap();
    assert_eq!(read_exact(&mut conn, 6).await, POSITIVE_ACK);
    next_push(&mut h.push_rx).await; // status
    next_push(&mut h.push_rx).await; // the fix

    // Same record again: still a positive ACK, nothing re-emitted.
    conn.write_all(&frame).await.unwrap();
    assert_eq!(read_exact(&mut conn, 6).await, POSITIVE_ACK);
    assert!(h.push_rx.try_recv().is_err());
}

#[tokio::test]
async fn stationary_batch_collapses_to_latest_record() {
    let mut h = harness().await;
    let mut conn = TcpStream::connect(h.addr).await.unwrap();

    let records: Vec<RuptelaRecord> = (0..5)
        .map(|i| record(1_706_968_800 + i * 6, 54.6872, 25.2787, 0))
        .collect();
    conn.write_all(&ruptela_records(IMEI, &records)).await.unwrap();
    assert_eq!(read_exact(&mut conn, 6).await, POSITIVE_ACK);

    next_push(&mut h.push_rx).await; // status
    match next_push(&mut h.push_rx).await {
        PushMessage::GpsData(fix) => {
            assert_eq!(fix.timestamp.timestamp(), 1_706_968_824);
            assert_eq!(fix.speed, 0.0);
        }
        other => panic!("expected one fix, got {other:?}"),
    }
    assert!(h.push_rx.try_recv().is_err());
}

#[tokio::test]
async fn all_invalid_records_get_negative_ack() {
    let mut h = harness().await;
    let mut conn = TcpStream::connect(h.addr).await.unwrap();

    let frame = ruptela_records(
        IMEI,
        &[
            record(1_706_968_806, 0.0, 0.0, 45),
            record(1_706_968_866, 95.0, 25.0, 45),
        ],
    );
    conn.write_all(&frame).await.unwrap();
    assert_eq!(read_exact(&mut conn, 6).await, NEGATIVE_ACK);

    // Device is identified (status goes out) but no fix is published.
    match next_push(&mut h.push_rx).await {
        PushMessage::StatusData(_) => {}
        other => panic!("expected status only, got {other:?}"),
    }
    assert!(h.push_rx.try_recv().is_err());
}

#[tokio::test]
async fn heartbeat_and_identification_acks() {
    let h = harness().await;
    let mut conn = TcpStream::connect(h.addr).await.unwrap();

    conn.write_all(&ruptela_heartbeat(IMEI)).await.unwrap();
    assert_eq!(
        read_exact(&mut conn, 6).await,
        [0x00, 0x02, 0x74, 0x01, 0x86, 0x2D]
    );

    conn.write_all(&ruptela_identification(IMEI, b"FM-Pro5"))
        .await
        .unwrap();
    assert_eq!(
        read_exact(&mut conn, 6).await,
        [0x00, 0x02, 0x73, 0x01, 0xCB, 0x25]
    );
}

#[tokio::test]
async fn corrupted_then_valid_frame_on_same_connection() {
    let mut h = harness().await;
    let mut conn = TcpStream::connect(h.addr).await.unwrap();

    let good = ruptela_records(IMEI, &[record(1_706_968_806, 54.6872, 25.2787, 45)]);
    let mut bad = good.clone();
    let last = bad.len() - 1;
    bad[last] ^= 0x01;

    conn.write_all(&bad).await.unwrap();
    conn.write_all(&good).await.unwrap();
    // Only the valid frame is acknowledged.
    assert_eq!(read_exact(&mut conn, 6).await, POSITIVE_ACK);
    next_push(&mut h.push_rx).await; // status
    match next_push(&mut h.push_rx).await {
        PushMessage::GpsData(fix) => assert_eq!(fix.imei, IMEI.to_string()),
        other => panic!("expected fix, got {other:?}"),
    }
}
