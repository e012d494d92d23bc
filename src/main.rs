//! termgate server entry point.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use termgate::api::{self, AppState};
use termgate::config::Config;

/// termgate - multi-session web terminal gateway.
///
/// Serves the catalog API and the `/ws` terminal stream on one listener.
#[derive(Parser, Debug)]
#[command(name = "termgate", version, about, long_about = None)]
struct Args {
    /// Address to bind
    #[arg(long, default_value = "0.0.0.0")]
    bind: IpAddr,

    /// Port serving both the HTTP catalog and the /ws stream
    #[arg(long, env = "TERMGATE_PORT", default_value_t = 3001)]
    port: u16,

    /// Directory for the persisted catalogs (default: ~/.termgate)
    #[arg(long, env = "TERMGATE_DATA_DIR")]
    data_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "termgate=info,tower_http=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut config = Config::default();
    if let Some(data_dir) = args.data_dir {
        config.data_dir = data_dir;
    }

    let state = AppState::new(config);
    let app = api::router(state.clone());

    let addr = SocketAddr::from((args.bind, args.port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "termgate listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received");
        })
        .await?;

    // Close every session and pooled transport before exiting so no child
    // processes, containers, or remote transports leak.
    state.shutdown().await;
    tracing::info!("termgate exiting");
    Ok(())
}
