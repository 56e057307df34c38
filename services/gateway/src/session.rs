//! Per-connection session worker.
//!
//! One worker task owns each accepted device connection: the frame reader,
//! the session state, and both halves of the socket. ACKs are written
//! inline from the frame handler; poll-scheduler frames arrive over the
//! session's outbound channel and are written from the same select loop,
//! so socket writes stay serialized per connection.
//!
//! Lifecycle: `Connected` (pre-login) → `LoggedIn`/`Polling` → closed.
//! Framing errors never terminate a session — the offending frame is
//! dropped and the device's own retry cadence is relied on. Socket errors,
//! peer close, and the idle timeout do terminate it, cancelling the poll
//! scheduler synchronously; nothing is written after that.

use std::net::SocketAddr;
use std::sync::atomic::AtomicU16;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use tg_protocol::{DeviceStatus, PushMessage, TelemetryFix};
use tg_wire::{
    jimi,
    ruptela::{self, IdentAck},
    DecodedMessage, Frame, FrameReader, GpsFix, ProtocolFamily, Record,
};

use crate::config::PortConfig;
use crate::dedup::RecentWindow;
use crate::fanout::SubscriberSet;
use crate::normalize;
use crate::poll::{self, LastFix, PollConfig, PollHandle};
use crate::registry::SessionRegistry;

/// Queue depth for scheduler-originated outbound frames.
const OUTBOUND_QUEUE: usize = 32;
const READ_BUFFER: usize = 2048;

/// Accepted length range for a BCD-decoded IMEI.
const IMEI_MIN_DIGITS: usize = 12;
const IMEI_MAX_DIGITS: usize = 16;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("socket: {0}")]
    Io(#[from] std::io::Error),
}

/// Process-wide collaborators injected into every session.
pub struct SessionContext {
    pub fanout: Arc<SubscriberSet>,
    pub dedup: Arc<RecentWindow>,
    pub registry: Arc<SessionRegistry>,
    pub poll_config: PollConfig,
    pub idle_timeout: Duration,
}

/// Drive one device connection to completion.
///
/// Returns `Ok` on clean close (peer EOF, idle timeout, shutdown) and
/// `Err` on socket failure. Either way the poll scheduler is cancelled and
/// the registry entry removed before returning.
pub async fn run_session(
    stream: TcpStream,
    peer: SocketAddr,
    family: ProtocolFamily,
    port: &PortConfig,
    ctx: Arc<SessionContext>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), SessionError> {
    let (mut read_half, mut write_half) = stream.into_split();
    let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(OUTBOUND_QUEUE);
    let mut reader = FrameReader::new(family);
    let mut session = Session::new(peer, port, out_tx, ctx.clone());
    let mut buf = vec![0u8; READ_BUFFER];
    // Idle is measured on device reads only; outbound polling does not
    // keep a silent connection alive.
    let mut last_read = tokio::time::Instant::now();

    let result = loop {
        let idle = tokio::time::sleep_until(last_read + ctx.idle_timeout);
        tokio::select! {
            biased;
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!(peer = %peer, "shutdown requested, closing session");
                    break Ok(());
                }
            }
            maybe = out_rx.recv() => {
                match maybe {
                    Some(frame) => {
                        if let Err(e) = write_half.write_all(&frame).await {
                            break Err(e.into());
                        }
                    }
                    None => break Ok(()),
                }
            }
            _ = idle => {
                info!(
                    peer = %peer,
                    imei = session.imei.as_deref().unwrap_or("-"),
                    "idle timeout, closing session"
                );
                break Ok(());
            }
            read = read_half.read(&mut buf) => {
                match read {
                    Ok(0) => {
                        debug!(peer = %peer, "peer closed connection");
                        break Ok(());
                    }
                    Ok(n) => {
                        last_read = tokio::time::Instant::now();
                        reader.push(&buf[..n]);
                        if let Err(e) = session.drain_frames(&mut reader, &mut write_half).await {
                            break Err(e);
                        }
                    }
                    Err(e) => break Err(e.into()),
                }
            }
        }
    };

    // Half-close before teardown so a well-behaved peer sees FIN rather
    // than RST; errors here are moot, the session is over.
    let _ = write_half.shutdown().await;
    session.close();
    result
}

// ---------------------------------------------------------------------------
// Session state
// ---------------------------------------------------------------------------

struct Session {
    peer: SocketAddr,
    source_port: u16,
    family_tag: &'static str,
    hemisphere_west: bool,
    /// Stamped at login (Jimi) or first identified frame (Ruptela);
    /// immutable afterwards until close.
    imei: Option<String>,
    logged_in: bool,
    /// Last serial seen from the device (Jimi).
    last_serial: u16,
    /// Next outbound serial, shared with the poll scheduler.
    out_serial: Arc<AtomicU16>,
    out_tx: mpsc::Sender<Vec<u8>>,
    poll: Option<PollHandle>,
    last_fix: LastFix,
    ctx: Arc<SessionContext>,
}

impl Session {
    fn new(
        peer: SocketAddr,
        port: &PortConfig,
        out_tx: mpsc::Sender<Vec<u8>>,
        ctx: Arc<SessionContext>,
    ) -> Self {
        Session {
            peer,
            source_port: port.port,
            family_tag: port.family.tag(),
            hemisphere_west: port.hemisphere_west,
            imei: None,
            logged_in: false,
            last_serial: 0,
            out_serial: Arc::new(AtomicU16::new(0)),
            out_tx,
            poll: None,
            last_fix: Arc::new(Mutex::new(None)),
            ctx,
        }
    }

    /// Pull every complete frame out of the reader and handle it. Framing
    /// errors are logged and swallowed; only socket errors propagate.
    async fn drain_frames(
        &mut self,
        reader: &mut FrameReader,
        w: &mut OwnedWriteHalf,
    ) -> Result<(), SessionError> {
        loop {
            match reader.next_frame() {
                Ok(Some(frame)) => self.handle_frame(&frame, w).await?,
                Ok(None) => return Ok(()),
                Err(e) => {
                    warn!(peer = %self.peer, error = %e, "framing error, frame discarded");
                }
            }
        }
    }

    async fn handle_frame(&mut self, frame: &Frame, w: &mut OwnedWriteHalf) -> Result<(), SessionError> {
        match frame.family {
            ProtocolFamily::Jimi => {
                let msg = jimi::decode(&frame.bytes, self.hemisphere_west);
                self.handle_jimi(msg, w).await
            }
            ProtocolFamily::Ruptela => {
                let msg = ruptela::decode(&frame.bytes);
                self.handle_ruptela(msg, w).await
            }
        }
    }

    // -- Jimi ---------------------------------------------------------------

    async fn handle_jimi(
        &mut self,
        msg: DecodedMessage,
        w: &mut OwnedWriteHalf,
    ) -> Result<(), SessionError> {
        if let Some(serial) = msg.serial() {
            self.last_serial = serial;
        }
        if let Some(imei) = &self.imei {
            self.ctx.registry.record_frame(imei);
        }
        match msg {
            DecodedMessage::Login { imei, serial, .. } => {
                if self.logged_in {
                    debug!(peer = %self.peer, imei = %imei, "duplicate login");
                    // Still acknowledged: an unanswered login makes the
                    // device re-send it forever. No other state changes.
                    w.write_all(&jimi::encode_ack(jimi::PROTO_LOGIN, serial)).await?;
                    return Ok(());
                }
                if !(IMEI_MIN_DIGITS..=IMEI_MAX_DIGITS).contains(&imei.len()) {
                    warn!(
                        peer = %self.peer,
                        imei = %imei,
                        "login rejected: decoded IMEI length out of range"
                    );
                    return Ok(());
                }
                info!(imei = %imei, port = self.source_port, "device logged in");
                self.ctx.registry.register(
                    &imei,
                    self.family_tag,
                    self.source_port,
                    self.peer.to_string(),
                );
                // ACK goes out before the scheduler exists.
                w.write_all(&jimi::encode_ack(jimi::PROTO_LOGIN, serial)).await?;
                self.ctx
                    .fanout
                    .publish(&self.status_message(&imei, "login"));
                self.poll = Some(poll::spawn(
                    imei.clone(),
                    self.out_tx.clone(),
                    self.out_serial.clone(),
                    self.last_fix.clone(),
                    self.ctx.poll_config.clone(),
                ));
                self.imei = Some(imei);
                self.logged_in = true;
            }
            DecodedMessage::Heartbeat { serial, protocol } => {
                w.write_all(&jimi::encode_ack(protocol, serial)).await?;
            }
            DecodedMessage::TimeRequest { serial } => {
                w.write_all(&jimi::encode_time_response(Utc::now(), serial)).await?;
            }
            DecodedMessage::Gps(gps) => self.handle_jimi_fix(gps),
            DecodedMessage::Unknown { protocol, serial, .. } => {
                if jimi::NO_REPLY_PROTOCOLS.contains(&protocol) {
                    debug!(protocol, "no-reply protocol, staying quiet");
                } else {
                    w.write_all(&jimi::encode_ack(protocol, serial)).await?;
                }
            }
            DecodedMessage::Records { .. } | DecodedMessage::Identification { .. } => {
                debug!(peer = %self.peer, "ruptela message on a jimi port, ignored");
            }
        }
        Ok(())
    }

    /// GPS frames never get an ACK; valid fixes feed the scheduler and the
    /// fan-out, invalid ones vanish without counting as device activity.
    fn handle_jimi_fix(&mut self, gps: GpsFix) {
        if !gps.positioned {
            debug!(peer = %self.peer, "unpositioned fix dropped");
            return;
        }
        let Some(imei) = self.imei.clone() else {
            debug!(peer = %self.peer, "fix before login dropped");
            return;
        };
        let fix = self.fix_from_jimi(&imei, &gps);
        match normalize::sanitize(fix) {
            Some(fix) => {
                *self.last_fix.lock().expect("last-fix lock poisoned") =
                    Some(tokio::time::Instant::now());
                if self.ctx.dedup.check_and_insert(&fix) {
                    self.ctx.registry.record_fix(&imei, fix.timestamp);
                    self.ctx.fanout.publish(&PushMessage::JimiData(fix));
                }
            }
            None => debug!(peer = %self.peer, imei = %imei, "invalid fix dropped"),
        }
    }

    // -- Ruptela ------------------------------------------------------------

    async fn handle_ruptela(
        &mut self,
        msg: DecodedMessage,
        w: &mut OwnedWriteHalf,
    ) -> Result<(), SessionError> {
        match msg {
            DecodedMessage::Records {
                imei,
                command,
                records,
                records_left,
            } => {
                self.identify(&imei);
                self.ctx.registry.record_frame(&imei);
                let batch: Vec<TelemetryFix> = records
                    .iter()
                    .map(|r| self.fix_from_record(&imei, command, r))
                    .collect();
                let normalized = normalize::prepare_batch(batch);
                // Positive ACK when anything survived validation; the
                // dedup window only gates emission.
                let accepted = !normalized.is_empty();
                for fix in normalize::consolidate_stationary(normalized) {
                    if self.ctx.dedup.check_and_insert(&fix) {
                        self.ctx.registry.record_fix(&imei, fix.timestamp);
                        self.ctx.fanout.publish(&PushMessage::GpsData(fix));
                    }
                }
                if records_left > 0 {
                    debug!(imei = %imei, records_left, "device holds more records");
                }
                w.write_all(&ruptela::encode_records_ack(accepted)).await?;
            }
            DecodedMessage::Identification { imei, command, .. } => {
                self.identify(&imei);
                self.ctx.registry.record_frame(&imei);
                w.write_all(&ruptela::encode_identification_ack(command, IdentAck::Authorized))
                    .await?;
            }
            DecodedMessage::Heartbeat { .. } => {
                if let Some(imei) = &self.imei {
                    self.ctx.registry.record_frame(imei);
                }
                w.write_all(&ruptela::encode_heartbeat_ack()).await?;
            }
            DecodedMessage::Unknown { protocol, .. } => {
                w.write_all(&ruptela::encode_generic_ack(protocol)).await?;
            }
            DecodedMessage::Login { .. }
            | DecodedMessage::TimeRequest { .. }
            | DecodedMessage::Gps(_) => {
                debug!(peer = %self.peer, "jimi message on a ruptela port, ignored");
            }
        }
        Ok(())
    }

    /// Stamp the session IMEI on first sight; later frames must agree.
    fn identify(&mut self, imei: &str) {
        match &self.imei {
            None => {
                info!(imei = %imei, port = self.source_port, "device identified");
                self.ctx.registry.register(
                    imei,
                    self.family_tag,
                    self.source_port,
                    self.peer.to_string(),
                );
                self.ctx
                    .fanout
                    .publish(&self.status_message(imei, "login"));
                self.imei = Some(imei.to_owned());
            }
            Some(existing) if existing != imei => {
                warn!(
                    peer = %self.peer,
                    session_imei = %existing,
                    frame_imei = %imei,
                    "frame IMEI differs from session IMEI, keeping session identity"
                );
            }
            Some(_) => {}
        }
    }

    // -- Conversions --------------------------------------------------------

    fn fix_from_jimi(&self, imei: &str, gps: &GpsFix) -> TelemetryFix {
        TelemetryFix {
            imei: imei.to_owned(),
            timestamp: gps.timestamp,
            latitude: gps.latitude,
            longitude: gps.longitude,
            speed: gps.speed,
            course: gps.course,
            altitude: None,
            satellites: gps.satellites,
            positioned: gps.positioned,
            valid: true,
            protocol: format!("{}/0x{:02X}", self.family_tag, gps.protocol),
            serial: Some(gps.serial),
            source_port: self.source_port,
            cell: gps.cell.map(|c| tg_protocol::CellInfo {
                mcc: c.mcc,
                mnc: c.mnc,
                lac: c.lac,
                cell_id: c.cell_id,
            }),
            io_elements: Default::default(),
        }
    }

    fn fix_from_record(&self, imei: &str, command: u8, record: &Record) -> TelemetryFix {
        let mut io_elements = std::collections::BTreeMap::new();
        for (width, section) in &record.io {
            for (id, value) in section {
                io_elements.insert(format!("{width}:{id}"), *value);
            }
        }
        TelemetryFix {
            imei: imei.to_owned(),
            timestamp: record.timestamp,
            latitude: record.latitude,
            longitude: record.longitude,
            speed: record.speed,
            course: record.angle,
            altitude: Some(record.altitude),
            satellites: record.satellites,
            positioned: true,
            valid: true,
            protocol: format!("{}/{}", self.family_tag, command),
            serial: None,
            source_port: self.source_port,
            cell: None,
            io_elements,
        }
    }

    fn status_message(&self, imei: &str, event: &str) -> PushMessage {
        PushMessage::StatusData(DeviceStatus {
            imei: imei.to_owned(),
            event: event.to_owned(),
            timestamp: Utc::now(),
            source_port: self.source_port,
        })
    }

    /// Tear down: cancel the scheduler first so no frame can be queued
    /// after this point, then drop the registry entry.
    fn close(&mut self) {
        if let Some(poll) = self.poll.take() {
            poll.cancel();
        }
        if let Some(imei) = self.imei.take() {
            self.ctx.registry.unregister(&imei);
            self.ctx
                .fanout
                .publish(&PushMessage::StatusData(DeviceStatus {
                    imei: imei.clone(),
                    event: "disconnect".to_owned(),
                    timestamp: Utc::now(),
                    source_port: self.source_port,
                }));
            info!(imei = %imei, last_serial = self.last_serial, "session closed");
        }
    }
}
