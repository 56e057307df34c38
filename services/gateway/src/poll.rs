//! GPS poll scheduler for Jimi sessions.
//!
//! JM-LL301 units stay silent after login until prompted, so every Jimi
//! session runs exactly one scheduler task that transmits request-location
//! frames (protocol 0x80) until the device starts reporting on its own.
//!
//! Three phases:
//! - **Aggressive** — first request right after the post-login settle
//!   delay, then every 15 s, at most 6 requests; hands off to Steady.
//! - **Steady** — every 60 s: request if no fix for 90 s; a fresh fix means
//!   the device reports autonomously, hand off to Idle.
//! - **Idle** — every 300 s: request only if no fix for 300 s.
//!
//! The scheduler never touches the socket. Frames go through the session's
//! outbound channel, so writes stay serialized with ACK emission. The
//! session cancels the task synchronously on close; no frame is sent after
//! that.

use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info};

use tg_wire::jimi::encode_location_request;

/// Timing knobs, separated out so tests can compress the clock.
#[derive(Debug, Clone)]
pub struct PollConfig {
    /// Delay between login ACK and the first request.
    pub settle: Duration,
    pub aggressive_interval: Duration,
    pub aggressive_max_fires: u32,
    pub steady_interval: Duration,
    /// A fix younger than this means the device is reporting on its own.
    pub steady_stale: Duration,
    pub idle_interval: Duration,
    pub idle_stale: Duration,
}

impl Default for PollConfig {
    fn default() -> Self {
        PollConfig {
            settle: Duration::from_millis(500),
            aggressive_interval: Duration::from_secs(15),
            aggressive_max_fires: 6,
            steady_interval: Duration::from_secs(60),
            steady_stale: Duration::from_secs(90),
            idle_interval: Duration::from_secs(300),
            idle_stale: Duration::from_secs(300),
        }
    }
}

/// Shared record of when the session last saw a valid fix.
pub type LastFix = Arc<Mutex<Option<Instant>>>;

/// Handle owned by the session; cancelling is synchronous.
pub struct PollHandle {
    shutdown_tx: watch::Sender<bool>,
    task: tokio::task::JoinHandle<()>,
}

impl PollHandle {
    /// Stop the scheduler. After this returns no further frame will be
    /// queued.
    pub fn cancel(&self) {
        let _ = self.shutdown_tx.send(true);
        self.task.abort();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Aggressive,
    Steady,
    Idle,
}

/// Spawn the scheduler for one session.
///
/// `serial` is the session's outbound serial counter; each fire takes the
/// next value. `last_fix` is written by the session whenever a valid fix
/// arrives.
pub fn spawn(
    imei: String,
    out_tx: mpsc::Sender<Vec<u8>>,
    serial: Arc<AtomicU16>,
    last_fix: LastFix,
    config: PollConfig,
) -> PollHandle {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let task = tokio::spawn(run(imei, out_tx, serial, last_fix, config, shutdown_rx));
    PollHandle { shutdown_tx, task }
}

async fn run(
    imei: String,
    out_tx: mpsc::Sender<Vec<u8>>,
    serial: Arc<AtomicU16>,
    last_fix: LastFix,
    config: PollConfig,
    mut shutdown: watch::Receiver<bool>,
) {
    if !wait(&mut shutdown, config.settle).await {
        return;
    }

    let mut phase = Phase::Aggressive;
    let mut aggressive_fires = 0u32;
    info!(imei = %imei, "poll scheduler started");

    loop {
        match phase {
            Phase::Aggressive => {
                if fix_age(&last_fix)
                    .map(|age| age < config.steady_stale)
                    .unwrap_or(false)
                {
                    debug!(imei = %imei, "fix during aggressive phase, easing off");
                    phase = Phase::Steady;
                    continue;
                }
                if aggressive_fires >= config.aggressive_max_fires {
                    phase = Phase::Steady;
                    continue;
                }
                if !send_request(&out_tx, &serial).await {
                    return;
                }
                aggressive_fires += 1;
                if !wait(&mut shutdown, config.aggressive_interval).await {
                    return;
                }
            }
            Phase::Steady => {
                if !wait(&mut shutdown, config.steady_interval).await {
                    return;
                }
                match fix_age(&last_fix) {
                    Some(age) if age < config.steady_stale => {
                        info!(imei = %imei, "device reporting autonomously");
                        phase = Phase::Idle;
                    }
                    _ => {
                        if !send_request(&out_tx, &serial).await {
                            return;
                        }
                    }
                }
            }
            Phase::Idle => {
                if !wait(&mut shutdown, config.idle_interval).await {
                    return;
                }
                let stale = fix_age(&last_fix)
                    .map(|age| age >= config.idle_stale)
                    .unwrap_or(true);
                if stale && !send_request(&out_tx, &serial).await {
                    return;
                }
            }
        }
    }
}

/// Age of the most recent fix; `None` when no fix has arrived yet.
fn fix_age(last_fix: &LastFix) -> Option<Duration> {
    last_fix
        .lock()
        .expect("last-fix lock poisoned")
        .map(|at| at.elapsed())
}

/// False when the session hung up the outbound channel.
async fn send_request(out_tx: &mpsc::Sender<Vec<u8>>, serial: &Arc<AtomicU16>) -> bool {
    let s = serial.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
    out_tx.send(encode_location_request(s)).await.is_ok()
}

/// Sleep unless shutdown arrives first; false means stop.
async fn wait(shutdown: &mut watch::Receiver<bool>, dur: Duration) -> bool {
    tokio::select! {
        biased;
        _ = shutdown.changed() => !*shutdown.borrow(),
        _ = tokio::time::sleep(dur) => true,
    }
}
