//! radrelay - Source-preserving RADIUS relay daemon

use std::net::{SocketAddr, SocketAddrV4, UdpSocket};
use std::thread;
use std::time::Duration;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use radrelay::stats::MetricsSnapshot;
use radrelay::{fixed_sizer, Dispatcher, Metrics, RawSocket, RelayConfig, ShardedSelector};

#[derive(Parser)]
#[command(name = "radrelay")]
#[command(version)]
#[command(about = "Source-preserving UDP relay for RADIUS with rate limiting", long_about = None)]
struct Cli {
    /// Path to the JSON configuration file
    #[arg(long, short, env = "RADRELAY_CONFIG")]
    config: Option<String>,

    /// Override the inbound UDP listen address
    #[arg(long)]
    listen: Option<SocketAddrV4>,

    /// Override the downstream destination address
    #[arg(long)]
    dest: Option<SocketAddrV4>,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("radrelay v{}", env!("CARGO_PKG_VERSION"));

    let cli = Cli::parse();
    let mut config = match &cli.config {
        Some(path) => RelayConfig::load(path)?,
        None => {
            tracing::warn!("no config given, using defaults");
            RelayConfig::default()
        }
    };
    if let Some(listen) = cli.listen {
        config.listen_addr = listen;
    }
    if let Some(dest) = cli.dest {
        config.dest_addr = dest;
    }

    let metrics = Metrics::new();
    spawn_metrics_server(config.metrics_addr, metrics.clone())?;

    let limits = &config.limits;
    let selector = ShardedSelector::new(
        Duration::from_secs(limits.refill_secs),
        limits.unused_ticks,
        fixed_sizer(limits.user_fill, limits.user_max),
        fixed_sizer(limits.port_fill, limits.port_max),
        &metrics,
    )?;

    let socket = UdpSocket::bind(config.listen_addr)?;
    tracing::info!(addr = %socket.local_addr()?, dest = %config.dest_addr, "listening");

    let writers = (0..config.writers.max(1))
        .map(|_| RawSocket::open())
        .collect::<Result<Vec<_>, _>>()?;

    let dispatcher = Dispatcher::new(config.dest_addr, selector, metrics.dispatch.clone());
    dispatcher.listen(&socket, &writers, config.queue_depth.max(1));

    Ok(())
}

/// Serve `/metrics`, `/health` and `/stats` from a dedicated thread.
///
/// The data path is plain threads; only this endpoint needs a runtime, so it
/// gets its own single-threaded one.
fn spawn_metrics_server(addr: SocketAddr, metrics: Metrics) -> std::io::Result<()> {
    thread::Builder::new().name("metrics-http".into()).spawn(move || {
        let runtime = match tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
        {
            Ok(rt) => rt,
            Err(e) => {
                tracing::error!(error = %e, "metrics runtime failed to start");
                return;
            }
        };
        runtime.block_on(async move {
            let app = Router::new()
                .route("/metrics", get(prometheus))
                .route("/health", get(health))
                .route("/stats", get(stats))
                .with_state(metrics);

            let listener = match tokio::net::TcpListener::bind(addr).await {
                Ok(l) => l,
                Err(e) => {
                    tracing::error!(error = %e, %addr, "metrics endpoint failed to bind");
                    return;
                }
            };
            tracing::info!(%addr, "metrics endpoint listening");
            if let Err(e) = axum::serve(listener, app).await {
                tracing::error!(error = %e, "metrics endpoint failed");
            }
        });
    })?;
    Ok(())
}

async fn prometheus(State(metrics): State<Metrics>) -> String {
    metrics.prometheus()
}

async fn health() -> &'static str {
    "OK"
}

async fn stats(State(metrics): State<Metrics>) -> Json<MetricsSnapshot> {
    Json(metrics.snapshot())
}
