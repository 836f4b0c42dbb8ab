//! Kopia Engine Supervisor - headless harness CLI
//!
//! Drives the core library end to end: locate and verify the engine binary,
//! launch the server on a loopback port, wait for readiness, and open the
//! repository session. UI surfaces observe the same status stream this
//! binary logs.

#![forbid(unsafe_code)]

use std::path::{Path, PathBuf};

use anyhow::{Result, bail};
use clap::{Parser, Subcommand};
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use kes_core::config::{DEFAULT_SERVER_PASSWORD, DEFAULT_SERVER_USERNAME, base_url};
use kes_core::probe::DEFAULT_MAX_ATTEMPTS;
use kes_core::supervisor::{local_data_exists, resolve_repository_password};
use kes_core::{
    EngineConfig, EngineSupervisor, ReadinessProber, RepositorySessionManager, StatusStore,
};

#[derive(Parser)]
#[command(name = "kes")]
#[command(author, version, about = "Kopia engine supervisor - local backup engine harness")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to TOML configuration
    #[arg(short, long, env = "KES_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Launch the engine, open the repository, and supervise until Ctrl-C
    Run {
        /// Loopback port for the engine's HTTP API
        #[arg(long)]
        port: Option<u16>,

        /// Root directory for engine data and configuration
        #[arg(long)]
        root_dir: Option<PathBuf>,

        /// Repository password (defaults to the resolved password files)
        #[arg(long, env = "KES_REPO_PASSWORD")]
        password: Option<String>,
    },

    /// Probe readiness of an already-running engine
    Status {
        #[arg(long)]
        port: Option<u16>,
    },

    /// Connect to an existing repository on a running engine
    Connect {
        /// Filesystem path of the repository
        #[arg(long)]
        path: PathBuf,

        #[arg(long, env = "KES_REPO_PASSWORD")]
        password: String,

        #[arg(long)]
        port: Option<u16>,
    },

    /// Create a new repository on a running engine
    Create {
        /// Filesystem path of the repository
        #[arg(long)]
        path: PathBuf,

        #[arg(long, env = "KES_REPO_PASSWORD")]
        password: String,

        #[arg(long)]
        port: Option<u16>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    let mut config = EngineConfig::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Run {
            port,
            root_dir,
            password,
        } => {
            if let Some(port) = port {
                config.port = port;
            }
            if root_dir.is_some() {
                config.root_dir = root_dir;
            }
            run(config, password).await
        }
        Commands::Status { port } => {
            let port = port.unwrap_or(config.port);
            let prober = ReadinessProber::new()?;
            let url = status_url(port);
            if prober.await_ready(&url, 3).await {
                info!(port, "engine is ready");
                Ok(())
            } else {
                bail!("engine did not answer on {url}");
            }
        }
        Commands::Connect {
            path,
            password,
            port,
        } => {
            let port = port.unwrap_or(config.port);
            repository_call(port, &path, &password, false).await
        }
        Commands::Create {
            path,
            password,
            port,
        } => {
            let port = port.unwrap_or(config.port);
            repository_call(port, &path, &password, true).await
        }
    }
}

fn status_url(port: u16) -> String {
    format!("{}/api/v1/repo/status", base_url(port))
}

/// Full supervision sequence: start, probe, open session, hold until Ctrl-C.
async fn run(config: EngineConfig, password_override: Option<String>) -> Result<()> {
    let paths = config.paths();
    let status = StatusStore::new();

    // Mirror every status transition into the log stream.
    let mut transitions = status.subscribe();
    tokio::spawn(async move {
        while transitions.changed().await.is_ok() {
            let current = transitions.borrow_and_update().clone();
            info!(status = %current, "engine status changed");
        }
    });

    let mut supervisor = EngineSupervisor::new(
        paths.clone(),
        status.clone(),
        DEFAULT_SERVER_USERNAME,
        DEFAULT_SERVER_PASSWORD,
    );

    supervisor
        .start(config.port, None, config.insecure_allowed)
        .await?;

    let prober = ReadinessProber::new()?;
    if let Err(err) = prober
        .ensure_ready(&status_url(config.port), DEFAULT_MAX_ATTEMPTS)
        .await
    {
        status.set_error(err.to_string());
        supervisor.stop().await;
        return Err(err.into());
    }

    let password =
        password_override.unwrap_or_else(|| resolve_repository_password(&paths));
    let manager = RepositorySessionManager::new(
        config.port,
        DEFAULT_SERVER_USERNAME,
        DEFAULT_SERVER_PASSWORD,
        status.clone(),
    );

    // Connect when data already exists, otherwise create a fresh repository.
    let repo_dir = paths.repo_dir.clone();
    let outcome = if local_data_exists(&repo_dir) {
        manager.connect(&repo_dir, &password).await
    } else {
        manager.create(&repo_dir, &password).await
    };

    if !outcome.success {
        let message = outcome
            .error_message
            .clone()
            .unwrap_or_else(|| "repository session failed".to_string());
        if outcome.is_password_error() {
            warn!("the repository password was rejected; check the password files");
        }
        supervisor.stop().await;
        bail!("{message}");
    }

    info!(
        port = config.port,
        repo = %repo_dir.display(),
        "repository session established; press Ctrl-C to stop"
    );

    tokio::signal::ctrl_c().await?;
    info!("shutting down engine");
    supervisor.stop().await;
    Ok(())
}

/// One-shot connect/create against an engine that is already running.
async fn repository_call(port: u16, path: &Path, password: &str, create: bool) -> Result<()> {
    let status = StatusStore::new();
    let manager = RepositorySessionManager::new(
        port,
        DEFAULT_SERVER_USERNAME,
        DEFAULT_SERVER_PASSWORD,
        status,
    );

    let outcome = if create {
        manager.create(path, password).await
    } else {
        manager.connect(path, password).await
    };

    if outcome.success {
        info!(port, path = %path.display(), "repository session established");
        Ok(())
    } else {
        let message = outcome
            .error_message
            .clone()
            .unwrap_or_else(|| "repository session failed".to_string());
        if outcome.is_password_error() {
            error!("the repository password was rejected");
        }
        bail!("{message}");
    }
}
