//! Tracker-device emulator.
//!
//! Speaks either protocol family against a running gateway: a Jimi session
//! does login → heartbeats → periodic GPS frames and logs whatever the
//! gateway sends back (ACKs, time responses, request-location commands);
//! a Ruptela session sends periodic records batches and logs the ACKs.
//!
//! Positions drift randomly around a starting point so the normalizer and
//! deduper see realistic traffic.

use chrono::{Datelike, Timelike, Utc};
use clap::{Arg, Command};
use rand::Rng;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use tg_test_utils::{jimi_gps, jimi_heartbeat, jimi_login, ruptela_records, JimiGps, RuptelaRecord};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(
            std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_owned()),
        ))
        .init();

    let matches = Command::new("tg-emulator")
        .about("Tracker-device emulator for the telematics gateway")
        .arg(
            Arg::new("family")
                .long("family")
                .value_parser(["jimi", "ruptela"])
                .required(true),
        )
        .arg(
            Arg::new("target")
                .long("target")
                .value_name("HOST:PORT")
                .required(true),
        )
        .arg(
            Arg::new("imei")
                .long("imei")
                .default_value("356938035643809"),
        )
        .arg(
            Arg::new("interval")
                .long("interval")
                .value_name("MS")
                .default_value("10000"),
        )
        .get_matches();

    let family = matches.get_one::<String>("family").expect("required");
    let target = matches.get_one::<String>("target").expect("required");
    let imei = matches.get_one::<String>("imei").expect("has default");
    let interval: u64 = matches
        .get_one::<String>("interval")
        .expect("has default")
        .parse()
        .unwrap_or_else(|_| {
            eprintln!("interval must be milliseconds");
            std::process::exit(2);
        });

    let stream = match TcpStream::connect(target).await {
        Ok(s) => {
            info!(target = %target, "connected to gateway");
            s
        }
        Err(e) => {
            eprintln!("failed to connect to {target}: {e}");
            std::process::exit(1);
        }
    };

    match family.as_str() {
        "jimi" => run_jimi(stream, imei, Duration::from_millis(interval)).await,
        _ => run_ruptela(stream, imei, Duration::from_millis(interval)).await,
    }
}

/// Pack a decimal IMEI string into the 8-byte BCD terminal id, left-padded
/// with zeros.
fn imei_to_bcd(imei: &str) -> [u8; 8] {
    let padded = format!("{imei:0>16}");
    let mut out = [0u8; 8];
    for (i, chunk) in padded.as_bytes().chunks(2).take(8).enumerate() {
        let hi = (chunk[0] as char).to_digit(10).unwrap_or(0) as u8;
        let lo = (chunk[1] as char).to_digit(10).unwrap_or(0) as u8;
        out[i] = (hi << 4) | lo;
    }
    out
}

async fn run_jimi(mut stream: TcpStream, imei: &str, interval: Duration) {
    let mut serial: u16 = 1;
    stream
        .write_all(&jimi_login(imei_to_bcd(imei), serial))
        .await
        .expect("login write failed");
    info!(imei, "login sent");

    let mut read_buf = [0u8; 256];
    let mut lat = 54.6872;
    let mut lon = 25.2787;
    let mut ticks: u32 = 0;

    loop {
        tokio::select! {
            read = stream.read(&mut read_buf) => {
                match read {
                    Ok(0) => { warn!("gateway closed the connection"); return; }
                    Ok(n) => log_gateway_frame(&read_buf[..n]),
                    Err(e) => { warn!(error = %e, "read error"); return; }
                }
            }
            _ = tokio::time::sleep(interval) => {
                serial = serial.wrapping_add(1);
                ticks += 1;
                drift(&mut lat, &mut lon);
                let now = Utc::now();
                let gps = JimiGps {
                    datetime: (
                        (now.year() - 2000) as u8,
                        now.month() as u8,
                        now.day() as u8,
                        now.hour() as u8,
                        now.minute() as u8,
                        now.second() as u8,
                    ),
                    satellites: rand::thread_rng().gen_range(6..=12),
                    lat_raw: (lat * 1_800_000.0) as u32,
                    lon_raw: (lon * 1_800_000.0) as u32,
                    speed: rand::thread_rng().gen_range(0..=90),
                    course: rand::thread_rng().gen_range(0..360),
                    real_time: true,
                    positioned: true,
                    north: true,
                    serial,
                };
                if stream.write_all(&jimi_gps(&gps)).await.is_err() {
                    warn!("write failed, exiting");
                    return;
                }
                info!(serial, lat, lon, "gps frame sent");
                // A heartbeat every few fixes keeps the session warm.
                if ticks % 3 == 0 {
                    serial = serial.wrapping_add(1);
                    if stream.write_all(&jimi_heartbeat(0x23, serial)).await.is_err() {
                        return;
                    }
                }
            }
        }
    }
}

async fn run_ruptela(mut stream: TcpStream, imei: &str, interval: Duration) {
    let imei_num: u64 = imei.parse().unwrap_or_else(|_| {
        eprintln!("ruptela IMEI must be numeric");
        std::process::exit(2);
    });
    let mut read_buf = [0u8; 64];
    let mut lat = 54.6872;
    let mut lon = 25.2787;

    loop {
        drift(&mut lat, &mut lon);
        let record = RuptelaRecord {
            timestamp: Utc::now().timestamp() as u32,
            latitude: lat,
            longitude: lon,
            speed: rand::thread_rng().gen_range(0..=90),
            ..RuptelaRecord::default()
        };
        if stream
            .write_all(&ruptela_records(imei_num, &[record]))
            .await
            .is_err()
        {
            warn!("write failed, exiting");
            return;
        }
        info!(lat, lon, "records frame sent");

        match tokio::time::timeout(Duration::from_secs(5), stream.read(&mut read_buf)).await {
            Ok(Ok(0)) => {
                warn!("gateway closed the connection");
                return;
            }
            Ok(Ok(n)) => match tg_wire::ruptela::decode_response(&read_buf[..n]) {
                Some((cmd, payload)) => info!(cmd, ?payload, "ack received"),
                None => warn!(bytes = n, "unparseable response"),
            },
            Ok(Err(e)) => {
                warn!(error = %e, "read error");
                return;
            }
            Err(_) => warn!("no ack within 5s"),
        }
        tokio::time::sleep(interval).await;
    }
}

fn drift(lat: &mut f64, lon: &mut f64) {
    let mut rng = rand::thread_rng();
    *lat += rng.gen_range(-0.0005..0.0005);
    *lon += rng.gen_range(-0.0005..0.0005);
}

fn log_gateway_frame(bytes: &[u8]) {
    match tg_wire::jimi::decode(bytes, false) {
        tg_wire::DecodedMessage::Unknown { protocol, serial, .. } if protocol == 0x80 => {
            info!(serial, "gateway requested location");
        }
        msg => info!(?msg, "gateway frame"),
    }
}
