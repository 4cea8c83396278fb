use std::env;

use tokio::net::TcpListener;
use tokio::signal;
use watchtower::{app, build_state_from_env, logging, LogConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let log = LogConfig::from_env()?;
    tracing::subscriber::set_global_default(logging::subscriber(
        log.format,
        logging::env_filter(&log),
        std::io::stdout,
    ))?;

    let state = build_state_from_env().await?;
    let app = app(state);

    let port: u16 = env::var("PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(8080);
    let addr: std::net::SocketAddr = ([0, 0, 0, 0], port).into();

    let listener = TcpListener::bind(addr).await?;
    tracing::info!(port, "Starting LLM Ops Watchtower");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    let _ = signal::ctrl_c().await;
    tracing::info!("shutdown signal received");
}
