//! Per-port TCP listeners.
//!
//! Each configured port gets one accept loop. Accepted connections are
//! tuned (nodelay + 30 s keepalive probes) and handed to a session worker;
//! bypass ports get a log-only handler that never answers. A per-port
//! connection cap refuses extra devices at accept time — a refused tracker
//! backs off and redials on its own.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::PortConfig;
use crate::session::{self, SessionContext};

/// Keepalive probe interval for device sockets.
const KEEPALIVE_TIME: Duration = Duration::from_secs(30);

/// One bound listener for one configured port.
pub struct PortListener {
    listener: TcpListener,
    port: PortConfig,
}

impl PortListener {
    /// Bind on all interfaces at the configured port.
    pub async fn bind(port: PortConfig) -> io::Result<Self> {
        Self::bind_addr(&format!("0.0.0.0:{}", port.port), port).await
    }

    /// Bind on an explicit address (tests use `127.0.0.1:0`).
    pub async fn bind_addr(addr: &str, port: PortConfig) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!(
            addr = %listener.local_addr()?,
            family = port.family.tag(),
            "listener bound"
        );
        Ok(PortListener { listener, port })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.listener
            .local_addr()
            .expect("local_addr always succeeds after bind")
    }

    /// Accept loop; runs until shutdown flips.
    pub async fn run(
        self,
        ctx: Arc<SessionContext>,
        max_connections: usize,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let active = Arc::new(AtomicUsize::new(0));
        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!(family = self.port.family.tag(), "listener shutting down");
                        break;
                    }
                }
                accept = self.listener.accept() => {
                    match accept {
                        Ok((stream, peer)) => {
                            if active.load(Ordering::SeqCst) >= max_connections {
                                warn!(
                                    peer = %peer,
                                    family = self.port.family.tag(),
                                    "connection limit reached, refusing"
                                );
                                drop(stream);
                                continue;
                            }
                            active.fetch_add(1, Ordering::SeqCst);
                            tune_socket(&stream);
                            debug!(peer = %peer, family = self.port.family.tag(), "device connected");
                            let ctx = ctx.clone();
                            let port = self.port.clone();
                            let active = active.clone();
                            let shutdown = shutdown.clone();
                            tokio::spawn(async move {
                                serve_connection(stream, peer, port, ctx, shutdown).await;
                                active.fetch_sub(1, Ordering::SeqCst);
                            });
                        }
                        Err(e) => warn!(error = %e, "accept error"),
                    }
                }
            }
        }
    }
}

async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    port: PortConfig,
    ctx: Arc<SessionContext>,
    shutdown: watch::Receiver<bool>,
) {
    match port.family.wire_family() {
        Some(family) => {
            if let Err(e) =
                session::run_session(stream, peer, family, &port, ctx.clone(), shutdown).await
            {
                warn!(peer = %peer, error = %e, "session ended with socket error");
            }
        }
        None => run_bypass(stream, peer, ctx.idle_timeout).await,
    }
}

/// Log-only handler for bypass ports: hex-dump whatever arrives, answer
/// nothing.
async fn run_bypass(mut stream: TcpStream, peer: SocketAddr, idle_timeout: Duration) {
    let mut buf = vec![0u8; 2048];
    loop {
        match tokio::time::timeout(idle_timeout, stream.read(&mut buf)).await {
            Err(_) => {
                info!(peer = %peer, "bypass connection idle, closing");
                break;
            }
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => {
                let dump: String = buf[..n].iter().map(|b| format!("{b:02x}")).collect();
                info!(peer = %peer, bytes = n, data = %dump, "bypass traffic");
            }
            Ok(Err(e)) => {
                debug!(peer = %peer, error = %e, "bypass read error");
                break;
            }
        }
    }
}

fn tune_socket(stream: &TcpStream) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!(error = %e, "failed to set nodelay");
    }
    let sock = socket2::SockRef::from(stream);
    let keepalive = socket2::TcpKeepalive::new().with_time(KEEPALIVE_TIME);
    if let Err(e) = sock.set_tcp_keepalive(&keepalive) {
        debug!(error = %e, "failed to enable tcp keepalive");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PortFamily;
    use crate::dedup::RecentWindow;
    use crate::fanout::SubscriberSet;
    use crate::poll::PollConfig;
    use crate::registry::SessionRegistry;

    fn ctx() -> Arc<SessionContext> {
        Arc::new(SessionContext {
            fanout: Arc::new(SubscriberSet::new("tok")),
            dedup: Arc::new(RecentWindow::new()),
            registry: Arc::new(SessionRegistry::new()),
            poll_config: PollConfig::default(),
            idle_timeout: Duration::from_secs(300),
        })
    }

    fn port(family: PortFamily) -> PortConfig {
        PortConfig {
            port: 0,
            family,
            hemisphere_west: false,
        }
    }

    #[tokio::test]
    async fn binds_and_accepts() {
        let listener = PortListener::bind_addr("127.0.0.1:0", port(PortFamily::Jimi))
            .await
            .unwrap();
        let addr = listener.local_addr();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(listener.run(ctx(), 4, shutdown_rx));

        let conn = TcpStream::connect(addr).await;
        assert!(conn.is_ok());
        let _ = shutdown_tx.send(true);
    }

    #[tokio::test]
    async fn connection_limit_refuses_extras() {
        let listener = PortListener::bind_addr("127.0.0.1:0", port(PortFamily::Jimi))
            .await
            .unwrap();
        let addr = listener.local_addr();
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(listener.run(ctx(), 1, shutdown_rx));

        let _first = TcpStream::connect(addr).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let mut second = TcpStream::connect(addr).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        // The refused connection is closed immediately: read yields EOF.
        let mut buf = [0u8; 1];
        let n = tokio::time::timeout(Duration::from_secs(2), second.read(&mut buf))
            .await
            .expect("refused connection should close promptly")
            .unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn bypass_connection_accepts_bytes_and_stays_quiet() {
        use tokio::io::AsyncWriteExt;
        let listener = PortListener::bind_addr("127.0.0.1:0", port(PortFamily::Bypass))
            .await
            .unwrap();
        let addr = listener.local_addr();
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(listener.run(ctx(), 4, shutdown_rx));

        let mut conn = TcpStream::connect(addr).await.unwrap();
        conn.write_all(&[0x78, 0x78, 0x05, 0x01]).await.unwrap();
        // Nothing ever comes back on a bypass port.
        let mut buf = [0u8; 16];
        let read = tokio::time::timeout(Duration::from_millis(200), conn.read(&mut buf)).await;
        assert!(read.is_err(), "bypass port must not reply");
    }
}
