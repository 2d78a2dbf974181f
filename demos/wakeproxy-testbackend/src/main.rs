//! A minimal backend for exercising the supervisor end to end: sleeps on
//! startup to make the wake window observable, then serves `/hello` and
//! `/health`.

use std::time::Duration;

use axum::routing::get;
use axum::{Json, Router};
use clap::Parser;
use serde::Serialize;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "wakeproxy-testbackend")]
struct Cli {
    #[arg(long, default_value = "8080")]
    port: u16,

    /// Simulated boot latency before the server starts listening.
    #[arg(long, value_parser = humantime::parse_duration, default_value = "500ms")]
    startup_delay: Duration,
}

#[derive(Serialize)]
struct Hello {
    message: &'static str,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    tokio::time::sleep(cli.startup_delay).await;

    let app = Router::new()
        .route("/hello", get(hello))
        .route("/health", get(health));

    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], cli.port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .unwrap_or_else(|e| panic!("failed to bind {addr}: {e}"));

    info!(%addr, "test backend listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server error");
}

async fn hello() -> Json<Hello> {
    Json(Hello {
        message: "hello world",
    })
}

async fn health() -> &'static str {
    "ok"
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
