//! CLI entry point: config loading, logging setup, bootstrap authentication,
//! and the sync-loop / event-engine tasks (spec.md §6).

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use iot_traffic_simulator::config::Config;
use iot_traffic_simulator::engine::EventEngine;
use iot_traffic_simulator::metrics::ActionMetrics;
use iot_traffic_simulator::state::StateStore;
use iot_traffic_simulator::sync::SyncLoop;
use iot_traffic_simulator::transport::TransportClient;

#[derive(Parser)]
#[command(name = "iot-traffic-simulator", version, about = "Impersonates RFID check-in terminals against a live OGS backend")]
struct Cli {
    /// Path to the simulator config YAML.
    #[arg(long, env = "SIMULATOR_CONFIG", default_value = "simulator.yaml")]
    config: PathBuf,

    /// `tracing_subscriber::EnvFilter` directive, e.g. "info" or "iot_traffic_simulator=debug".
    #[arg(long, env = "SIMULATOR_LOG", default_value = "info")]
    log: String,

    /// If set, logs are written to a daily-rolling file at this path instead of stderr.
    #[arg(long, env = "SIMULATOR_LOG_FILE")]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the simulator (default when no subcommand is given).
    Simulate,
    /// Config-related utilities.
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Load and validate the config, then exit without connecting anywhere.
    Check,
}

fn setup_logging(level: &str, log_file: Option<&std::path::Path>) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));
    match log_file {
        Some(path) => {
            let dir = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or_else(|| std::path::Path::new("."));
            let file_name = path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_else(|| "simulator.log".into());
            let appender = tracing_appender::rolling::daily(dir, file_name);
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt().with_env_filter(filter).with_writer(non_blocking).with_ansi(false).compact().init();
            Some(guard)
        }
        None => {
            tracing_subscriber::fmt().with_env_filter(filter).compact().init();
            None
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let _log_guard = setup_logging(&cli.log, cli.log_file.as_deref());

    let config = match Config::load(&cli.config) {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "config invalid");
            return ExitCode::from(2);
        }
    };

    match cli.command.unwrap_or(Command::Simulate) {
        Command::Config { action: ConfigAction::Check } => {
            info!(base_url = %config.base_url, devices = config.devices.len(), "config ok");
            ExitCode::SUCCESS
        }
        Command::Simulate => run_simulate(config),
    }
}

fn run_simulate(config: Config) -> ExitCode {
    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            error!(error = %e, "failed to start async runtime");
            return ExitCode::from(1);
        }
    };
    runtime.block_on(async_main(config))
}

async fn async_main(config: Config) -> ExitCode {
    let config = Arc::new(config);
    let transport = match TransportClient::new(config.base_url.clone()) {
        Ok(t) => Arc::new(t),
        Err(e) => {
            error!(error = %e, "failed to build transport client");
            return ExitCode::from(1);
        }
    };
    let store = Arc::new(StateStore::new(config.devices.iter().map(|d| d.device_id.clone())));
    let metrics = Arc::new(ActionMetrics::new());

    let sync_loop = Arc::new(SyncLoop::new(Arc::clone(&config), Arc::clone(&transport), Arc::clone(&store)));

    if let Err(partial) = sync_loop.bootstrap_authenticate().await {
        if partial.failures.len() >= partial.attempted {
            error!(error = %partial, "every device failed to authenticate, aborting");
            return ExitCode::from(3);
        }
        tracing::warn!(error = %partial, "continuing with a partially authenticated device set");
    }

    let engine = Arc::new(EventEngine::new(Arc::clone(&config), Arc::clone(&transport), Arc::clone(&store), Arc::clone(&metrics)));
    let shutdown = Arc::new(tokio::sync::Notify::new());

    let sync_handle = tokio::spawn(iot_traffic_simulator::sync::run(Arc::clone(&sync_loop), Arc::clone(&shutdown)));
    let engine_handle = tokio::spawn(iot_traffic_simulator::engine::run(Arc::clone(&engine), Arc::clone(&shutdown)));

    wait_for_shutdown_signal().await;
    info!("shutdown signal received, draining in-flight work");
    shutdown.notify_waiters();

    let _ = tokio::join!(sync_handle, engine_handle);

    for (action_type, counts) in metrics.snapshot().await {
        info!(action = action_type.label(), successes = counts.successes, failures = counts.failures, "final action counts");
    }

    ExitCode::SUCCESS
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut term = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
