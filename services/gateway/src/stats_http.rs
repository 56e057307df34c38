//! Read-only stats HTTP endpoint.
//!
//! Provides:
//! - `GET /healthz` — always 200 OK (process is running)
//! - `GET /stats`   — JSON: active device sessions + subscriber counts
//!
//! Deliberately tiny: a hand-rolled responder on a tokio listener, no
//! routing framework. Read-only, no authentication.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::fanout::SubscriberSet;
use crate::registry::SessionRegistry;

pub struct StatsServer {
    listener: TcpListener,
    registry: Arc<SessionRegistry>,
    fanout: Arc<SubscriberSet>,
}

impl StatsServer {
    pub async fn bind(
        addr: &str,
        registry: Arc<SessionRegistry>,
        fanout: Arc<SubscriberSet>,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!(addr = %listener.local_addr()?, "stats endpoint bound");
        Ok(StatsServer {
            listener,
            registry,
            fanout,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.listener
            .local_addr()
            .expect("local_addr always succeeds after bind")
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => {
                    if *shutdown.borrow() { break; }
                }
                accept = self.listener.accept() => {
                    match accept {
                        Ok((stream, _peer)) => {
                            let registry = self.registry.clone();
                            let fanout = self.fanout.clone();
                            tokio::spawn(async move {
                                if let Err(e) = serve_request(stream, registry, fanout).await {
                                    debug!(error = %e, "stats request failed");
                                }
                            });
                        }
                        Err(e) => warn!(error = %e, "stats accept error"),
                    }
                }
            }
        }
    }
}

async fn serve_request(
    mut stream: TcpStream,
    registry: Arc<SessionRegistry>,
    fanout: Arc<SubscriberSet>,
) -> io::Result<()> {
    let mut buf = vec![0u8; 1024];
    let n = stream.read(&mut buf).await?;
    let request = String::from_utf8_lossy(&buf[..n]);
    let path = request
        .lines()
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        .unwrap_or("/");

    let (status, content_type, body) = match path {
        "/healthz" => ("200 OK", "text/plain", "ok\n".to_owned()),
        "/stats" | "/jimi/stats" => {
            let body = serde_json::json!({
                "active_devices": registry.snapshot(),
                "device_count": registry.active_count(),
                "subscribers": fanout.subscriber_count(),
                "authenticated_subscribers": fanout.authenticated_count(),
            });
            ("200 OK", "application/json", body.to_string())
        }
        _ => ("404 Not Found", "text/plain", "not found\n".to_owned()),
    };

    let response = format!(
        "HTTP/1.1 {status}\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    stream.write_all(response.as_bytes()).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    async fn request(addr: SocketAddr, path: &str) -> String {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(format!("GET {path} HTTP/1.1\r\nHost: x\r\n\r\n").as_bytes())
            .await
            .unwrap();
        let mut out = String::new();
        stream.read_to_string(&mut out).await.unwrap();
        out
    }

    fn server_parts() -> (Arc<SessionRegistry>, Arc<SubscriberSet>) {
        (
            Arc::new(SessionRegistry::new()),
            Arc::new(SubscriberSet::new("tok")),
        )
    }

    #[tokio::test]
    async fn healthz_is_200() {
        let (registry, fanout) = server_parts();
        let server = StatsServer::bind("127.0.0.1:0", registry, fanout)
            .await
            .unwrap();
        let addr = server.local_addr();
        let (_tx, rx) = watch::channel(false);
        tokio::spawn(server.run(rx));

        let resp = request(addr, "/healthz").await;
        assert!(resp.starts_with("HTTP/1.1 200"), "resp: {resp}");
    }

    #[tokio::test]
    async fn stats_reports_sessions_and_subscribers() {
        let (registry, fanout) = server_parts();
        registry.register("356938035643809", "jimi", 7000, "10.0.0.1:999".to_owned());
        registry.record_fix("356938035643809", Utc::now());
        let (id, _rx_sub) = fanout.attach();
        fanout.authenticate(id, "tok");

        let server = StatsServer::bind("127.0.0.1:0", registry, fanout)
            .await
            .unwrap();
        let addr = server.local_addr();
        let (_tx, rx) = watch::channel(false);
        tokio::spawn(server.run(rx));

        let resp = request(addr, "/stats").await;
        let body = resp.split("\r\n\r\n").nth(1).unwrap();
        let json: serde_json::Value = serde_json::from_str(body).unwrap();
        assert_eq!(json["device_count"], 1);
        assert_eq!(json["subscribers"], 1);
        assert_eq!(json["authenticated_subscribers"], 1);
        assert_eq!(json["active_devices"][0]["imei"], "356938035643809");
        assert_eq!(json["active_devices"][0]["fixes_emitted"], 1);

        // Legacy path serves the same payload.
        let resp = request(addr, "/jimi/stats").await;
        assert!(resp.starts_with("HTTP/1.1 200"), "resp: {resp}");
    }

    #[tokio::test]
    async fn unknown_path_is_404() {
        let (registry, fanout) = server_parts();
        let server = StatsServer::bind("127.0.0.1:0", registry, fanout)
            .await
            .unwrap();
        let addr = server.local_addr();
        let (_tx, rx) = watch::channel(false);
        tokio::spawn(server.run(rx));

        let resp = request(addr, "/nope").await;
        assert!(resp.starts_with("HTTP/1.1 404"), "resp: {resp}");
    }
}
