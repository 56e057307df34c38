use std::sync::Arc;
use std::time::Duration;

use clap::{Arg, ArgAction, Command};
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use gateway::config::{self, GatewayConfig};
use gateway::dedup::RecentWindow;
use gateway::fanout::SubscriberSet;
use gateway::listener::PortListener;
use gateway::poll::PollConfig;
use gateway::registry::SessionRegistry;
use gateway::session::SessionContext;
use gateway::stats_http::StatsServer;

#[tokio::main]
async fn main() {
    let matches = Command::new("tg-gateway")
        .about("Multi-protocol telematics ingestion gateway")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("PATH")
                .help("Path to the TOML config file")
                .default_value(config::DEFAULT_CONFIG_PATH),
        )
        .arg(
            Arg::new("debug")
                .long("debug")
                .action(ArgAction::SetTrue)
                .help("Force debug-level logging"),
        )
        .get_matches();

    let log_level = if matches.get_flag("debug") {
        "debug".to_owned()
    } else {
        std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_owned())
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(log_level))
        .init();

    let config_path = matches
        .get_one::<String>("config")
        .expect("config has a default");
    let cfg = match config::load_config_from_path(std::path::Path::new(config_path)) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, path = %config_path, "failed to load config");
            std::process::exit(1);
        }
    };

    run(cfg).await;
    info!("gateway shut down gracefully");
}

async fn run(cfg: GatewayConfig) {
    let ctx = Arc::new(SessionContext {
        fanout: Arc::new(SubscriberSet::new(&cfg.subscriber_token)),
        dedup: Arc::new(RecentWindow::new()),
        registry: Arc::new(SessionRegistry::new()),
        poll_config: PollConfig::default(),
        idle_timeout: cfg.limits.idle_timeout,
    });
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut tasks = Vec::new();
    for port in &cfg.ports {
        let listener = match PortListener::bind(port.clone()).await {
            Ok(l) => l,
            Err(e) => {
                error!(port = port.port, error = %e, "failed to bind listener");
                std::process::exit(1);
            }
        };
        tasks.push(tokio::spawn(listener.run(
            ctx.clone(),
            cfg.limits.max_connections_per_port,
            shutdown_rx.clone(),
        )));
    }

    if let Some(bind) = &cfg.stats_bind {
        match StatsServer::bind(bind, ctx.registry.clone(), ctx.fanout.clone()).await {
            Ok(server) => {
                tasks.push(tokio::spawn(server.run(shutdown_rx.clone())));
            }
            Err(e) => {
                error!(addr = %bind, error = %e, "failed to bind stats endpoint");
                std::process::exit(1);
            }
        }
    }

    info!(ports = cfg.ports.len(), "gateway running");
    shutdown_signal().await;
    let _ = shutdown_tx.send(true);

    // Give listeners and sessions a short grace to wind down.
    let drain = async {
        for task in tasks {
            let _ = task.await;
        }
    };
    if tokio::time::timeout(Duration::from_secs(5), drain).await.is_err() {
        info!("grace period elapsed, exiting with tasks still winding down");
    }
}

/// Waits for SIGTERM or Ctrl-C (SIGINT) and returns to trigger graceful shutdown.
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => { info!("received Ctrl+C, shutting down"); },
        _ = terminate => { info!("received SIGTERM, shutting down"); },
    }
}
