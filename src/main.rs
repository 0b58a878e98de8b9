mod aof;
mod app;
mod commands;
mod config;
mod error;
mod persist;
mod resp;
mod server;
mod snapshot;
mod store;

use std::net::SocketAddr;
use std::sync::Arc;

use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

fn install_metrics(addr: &str) {
    let addr: SocketAddr = match addr.parse() {
        Ok(addr) => addr,
        Err(e) => {
            warn!(error = %e, addr = %addr, "invalid metrics listen address, metrics disabled");
            return;
        }
    };
    if let Err(e) = PrometheusBuilder::new().with_http_listener(addr).install() {
        warn!(error = %e, addr = %addr, "failed to install Prometheus exporter, metrics disabled");
        return;
    }
    info!(addr = %addr, "metrics exporter listening");

    metrics::describe_gauge!("snapkv_keys_total", "Number of keys in the table");
    metrics::describe_histogram!("snapkv_command_duration_seconds", "Command processing latency in seconds");
    metrics::describe_counter!("snapkv_snapshots_total", "Snapshot attempts by result");
    metrics::describe_counter!("snapkv_append_log_errors_total", "Failed append log writes and flushes");
    metrics::describe_gauge!("snapkv_connections_active", "Currently open client connections");
}

#[tokio::main]
async fn main() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = config::Config::from_env();
    install_metrics(&config.metrics_listen_addr());

    let app = match app::AppState::open(config).await {
        Ok(app) => Arc::new(app),
        Err(e) => {
            error!(error = %e, "failed to open data directory or append log");
            std::process::exit(1);
        }
    };
    app.spawn_background_tasks();

    let addr = app.config.listen_addr();
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(error = %e, addr = %addr, "failed to bind");
            std::process::exit(1);
        }
    };
    info!(addr = %addr, "snapkv listening");

    #[cfg(unix)]
    let mut sigterm = match signal::unix::signal(signal::unix::SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(e) => {
            error!(error = %e, "failed to install SIGTERM handler");
            std::process::exit(1);
        }
    };

    loop {
        #[cfg(unix)]
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, peer)) => {
                        debug!(%peer, "accepted connection");
                        tokio::spawn(server::handle_connection(stream, Arc::clone(&app)));
                    }
                    Err(e) => error!(?e, "accept error"),
                }
            }
            _ = signal::ctrl_c() => {
                info!("received SIGINT, shutting down");
                break;
            }
            _ = sigterm.recv() => {
                info!("received SIGTERM, shutting down");
                break;
            }
        }

        #[cfg(not(unix))]
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, peer)) => {
                        debug!(%peer, "accepted connection");
                        tokio::spawn(server::handle_connection(stream, Arc::clone(&app)));
                    }
                    Err(e) => error!(?e, "accept error"),
                }
            }
            _ = signal::ctrl_c() => {
                info!("received SIGINT, shutting down");
                break;
            }
        }
    }

    app.flush_append_log();
}
