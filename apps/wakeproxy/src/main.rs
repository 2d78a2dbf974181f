use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use url::Url;

use wakeproxy_core::{parse_port_map, Config, PidFile, Timeouts};
use wakeproxy_health::HealthProber;
use wakeproxy_process::ExecKillController;

const DEFAULT_PID_FILENAME: &str = "WAKEPROXY_PID";

#[derive(Parser, Debug)]
#[command(name = "wakeproxy", version, about = "scale-to-zero reverse proxy sidecar")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Listen on one or more ports, launching the backend on first traffic
    /// and draining it again after an idle window.
    Run {
        /// `listen_port:destination_url`, repeatable for more than one port.
        #[arg(long = "port", value_name = "LISTEN:DEST", required = true)]
        port_maps: Vec<String>,

        /// Path requested on the backend to determine readiness.
        #[arg(long, default_value = "/health")]
        health_check_path: String,

        /// Override the authority used for the health check URL; defaults
        /// to the first port mapping's destination.
        #[arg(long)]
        health_check_port: Option<u16>,

        #[arg(long, value_parser = humantime::parse_duration, default_value = "10s")]
        wake_timeout: Duration,

        #[arg(long, value_parser = humantime::parse_duration, default_value = "5m")]
        drain_timeout: Duration,

        #[arg(long, value_parser = humantime::parse_duration, default_value = "2s")]
        health_check_timeout: Duration,

        #[arg(long)]
        pid_path: Option<PathBuf>,

        /// The backend command and its arguments, e.g. `-- ./server --port 3000`.
        #[arg(trailing_var_arg = true, required = true)]
        command: Vec<String>,
    },
    /// Reads the pid file and reports whether the backend is healthy.
    /// Exits 0 if healthy (or if no backend is expected to be running),
    /// 1 otherwise. Intended for container/orchestrator health probes.
    Healthcheck {
        #[arg(long)]
        pid_path: Option<PathBuf>,

        #[arg(long, value_parser = humantime::parse_duration, default_value = "2s")]
        timeout: Duration,
    },
}

fn default_pid_path() -> PathBuf {
    std::env::temp_dir().join(DEFAULT_PID_FILENAME)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Run {
            port_maps,
            health_check_path,
            health_check_port,
            wake_timeout,
            drain_timeout,
            health_check_timeout,
            pid_path,
            command,
        } => {
            run(
                port_maps,
                health_check_path,
                health_check_port,
                wake_timeout,
                drain_timeout,
                health_check_timeout,
                pid_path,
                command,
            )
            .await
        }
        Command::Healthcheck { pid_path, timeout } => {
            healthcheck(pid_path.unwrap_or_else(default_pid_path), timeout).await
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn run(
    raw_port_maps: Vec<String>,
    health_check_path: String,
    health_check_port: Option<u16>,
    wake_timeout: Duration,
    drain_timeout: Duration,
    health_check_timeout: Duration,
    pid_path: Option<PathBuf>,
    command: Vec<String>,
) -> Result<()> {
    let port_maps = raw_port_maps
        .iter()
        .map(|raw| parse_port_map(raw))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| anyhow::anyhow!("{e}"))
        .context("invalid --port mapping")?;

    let (backend_command, backend_args) = command
        .split_first()
        .map(|(cmd, args)| (cmd.clone(), args.to_vec()))
        .context("a backend command is required")?;

    let pid_path = pid_path.unwrap_or_else(default_pid_path);

    let config = Config {
        port_maps: port_maps.clone(),
        timeouts: Timeouts {
            wake: wake_timeout,
            drain: drain_timeout,
            health_check: health_check_timeout,
        },
        health_check_path: health_check_path.clone(),
        command: backend_command.clone(),
        args: backend_args.clone(),
        pid_path: pid_path.clone(),
    };
    config.validate()?;

    let health_check_target = build_health_check_target(&port_maps, &health_check_path, health_check_port)?;

    let cancellation = CancellationToken::new();
    spawn_signal_watcher(cancellation.clone());

    let pid_file = PidFile::new(&pid_path);
    pid_file.write(None)?;

    let controller = ExecKillController::new(
        backend_command,
        backend_args,
        health_check_target,
        config.timeouts,
        pid_file.clone(),
        cancellation.clone(),
    );

    let client = reqwest::Client::new();
    let mut listener_tasks = Vec::with_capacity(port_maps.len());
    for port_map in &port_maps {
        let controller = controller.clone();
        let client = client.clone();
        let cancellation = cancellation.clone();
        let destination = port_map.destination.clone();
        let listen_port = port_map.listen_port;
        listener_tasks.push(tokio::spawn(async move {
            wakeproxy_proxy::serve_port(listen_port, destination, controller, client, cancellation).await
        }));
    }

    info!(ports = port_maps.len(), "wakeproxy is up");

    for task in listener_tasks {
        if let Err(e) = task.await.context("listener task panicked")? {
            error!(error = %e, "listener exited with an error");
        }
    }

    pid_file.remove();
    info!("wakeproxy shut down");
    Ok(())
}

fn build_health_check_target(
    port_maps: &[wakeproxy_core::PortMap],
    health_check_path: &str,
    health_check_port: Option<u16>,
) -> Result<Url> {
    let first = port_maps
        .first()
        .context("at least one --port mapping is required")?;
    let mut target = first.destination.clone();
    target.set_path(health_check_path);
    if let Some(port) = health_check_port {
        target
            .set_port(Some(port))
            .map_err(|_| anyhow::anyhow!("health check target does not support a port override"))?;
    }
    Ok(target)
}

fn spawn_signal_watcher(cancellation: CancellationToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sigterm =
                signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = sigterm.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
        }
        info!("shutdown signal received, draining");
        cancellation.cancel();
    });
}

async fn healthcheck(pid_path: PathBuf, timeout: Duration) -> Result<()> {
    let contents = PidFile::read(&pid_path)?;
    let prober = HealthProber::new();
    let healthy = wakeproxy_health::check_process_health(&prober, contents.as_ref(), timeout).await;

    match &contents {
        None => {
            println!("no pid file at {}", pid_path.display());
            std::process::exit(1);
        }
        Some(c) if c.health_check_url.is_none() => {
            println!("supervisor alive (pid {}), backend not running", c.pid);
        }
        Some(c) => {
            println!(
                "supervisor alive (pid {}), backend {}",
                c.pid,
                if healthy { "healthy" } else { "unhealthy" }
            );
            if !healthy {
                std::process::exit(1);
            }
        }
    }
    Ok(())
}
