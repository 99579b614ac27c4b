use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use probixel::cli::Cli;
use probixel::config::{self, ConfigState};
use probixel::core::{Notifier, Watchdog};
use probixel::health;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    let cli = Cli::parse_args();

    if cli.health {
        return match health::check_alive(&cli.pidfile) {
            Ok(pid) => {
                println!("alive (pid {})", pid);
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("{}", e);
                ExitCode::FAILURE
            }
        };
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Config errors are fatal at startup; reloads handle them softly.
    let cfg = match config::load_file(&cli.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            tracing::error!("cannot load {}: {}", cli.config.display(), e);
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = health::write_pidfile(&cli.pidfile) {
        tracing::error!("cannot write pidfile {}: {}", cli.pidfile.display(), e);
        return ExitCode::FAILURE;
    }

    run_agent(cli, cfg)
}

#[tokio::main]
async fn run_agent(cli: Cli, cfg: config::Config) -> ExitCode {
    let config_state = Arc::new(ConfigState::new(cfg));
    let notifier = match Notifier::new() {
        Ok(n) => Arc::new(n),
        Err(e) => {
            tracing::error!("cannot build notifier: {}", e);
            health::remove_pidfile(&cli.pidfile);
            return ExitCode::FAILURE;
        }
    };

    let watchdog = Watchdog::new(
        cli.config.clone(),
        config_state,
        notifier,
        Duration::from_secs(cli.delay),
    );

    let root = CancellationToken::new();
    let signal_root = root.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        tracing::info!("shutdown signal received");
        signal_root.cancel();
    });

    tracing::info!(
        config = %cli.config.display(),
        delay = cli.delay,
        "probixel starting"
    );
    watchdog.start(root).await;

    health::remove_pidfile(&cli.pidfile);
    ExitCode::SUCCESS
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut interrupt = match signal(SignalKind::interrupt()) {
        Ok(s) => s,
        Err(_) => return std::future::pending().await,
    };
    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(_) => return std::future::pending().await,
    };
    tokio::select! {
        _ = interrupt.recv() => {}
        _ = terminate.recv() => {}
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
