use std::ffi::OsString;
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use stickypool::cluster::{Master, ProcessSpawner};
use stickypool::config::Config;
use stickypool::shutdown::Shutdown;
use stickypool::{metrics, worker};

#[derive(Parser)]
#[command(
    name = "stickypool",
    version,
    about = "Sticky-session process pool: routes each client to the same worker process",
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log format (text, json)
    #[arg(long, global = true)]
    log_format: Option<String>,

    /// Configuration file (TOML); environment variables are used otherwise
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the master and its worker pool
    Serve {
        /// Public port (overrides APP_PORT)
        #[arg(short, long)]
        port: Option<u16>,

        /// Number of worker processes (defaults to the number of CPU cores)
        #[arg(short, long)]
        workers: Option<usize>,

        /// Admin API address, e.g. 127.0.0.1:9090
        #[arg(long)]
        admin_addr: Option<SocketAddr>,
    },

    /// Serve the application from a single process without a pool
    Standalone {
        /// Listening port (overrides APP_PORT)
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Internal: run as a pool worker
    #[command(hide = true)]
    Worker {
        /// Pool slot
        #[arg(long)]
        ordinal: usize,

        /// Inherited IPC socket descriptor
        #[arg(long)]
        ipc_fd: RawFd,

        /// Direct listening port
        #[arg(long)]
        port: Option<u16>,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let mut config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            return ExitCode::FAILURE;
        }
    };

    if let Commands::Serve {
        port,
        workers,
        admin_addr,
    } = &cli.command
    {
        apply_serve_overrides(&mut config, *port, *workers, *admin_addr);
    }

    if let Err(e) = config.validate() {
        eprintln!("Error: invalid configuration: {:#}", e);
        return ExitCode::FAILURE;
    }

    if let Err(e) = setup_tracing(&config.logging.format, &config.logging.level, cli.verbose) {
        eprintln!("Error: {:#}", e);
        return ExitCode::FAILURE;
    }

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            tracing::error!(error = %e, "Failed to start runtime");
            return ExitCode::FAILURE;
        }
    };

    let global_args = worker_global_args(&cli);

    runtime.block_on(async move {
        match cli.command {
            Commands::Serve { .. } => serve(config, global_args).await,
            Commands::Standalone { port } => standalone(config, port).await,
            Commands::Worker {
                ordinal,
                ipc_fd,
                port,
            } => worker::run_process(config, ordinal, ipc_fd, port).await,
        }
    })
}

fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = match &cli.config {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("Failed to load {}", path.display()))?,
        None => Config::from_env().context("Failed to read configuration from environment")?,
    };

    if let Some(format) = &cli.log_format {
        config.logging.format = format.clone();
    }

    Ok(config)
}

fn apply_serve_overrides(
    config: &mut Config,
    port: Option<u16>,
    workers: Option<usize>,
    admin_addr: Option<SocketAddr>,
) {
    if let Some(port) = port {
        // Keep the default layout of worker ports right above the public port
        if config.cluster.worker_port_base == config.cluster.port.saturating_add(1) {
            config.cluster.worker_port_base = port.saturating_add(1);
        }
        config.cluster.port = port;
    }
    if let Some(workers) = workers {
        config.cluster.workers = workers;
    }
    if admin_addr.is_some() {
        config.admin.bind_address = admin_addr;
    }
}

/// Flags every worker must be started with so it logs and configures itself
/// the same way as the master
fn worker_global_args(cli: &Cli) -> Vec<OsString> {
    let mut args = Vec::new();
    if cli.verbose {
        args.push(OsString::from("--verbose"));
    }
    if let Some(format) = &cli.log_format {
        args.push(OsString::from("--log-format"));
        args.push(OsString::from(format));
    }
    if let Some(path) = &cli.config {
        args.push(OsString::from("--config"));
        args.push(path.as_os_str().to_owned());
    }
    args
}

async fn serve(config: Config, global_args: Vec<OsString>) -> ExitCode {
    if let Err(e) = metrics::init_metrics() {
        tracing::warn!("Metrics initialization failed: {}", e);
    }

    let shutdown = Shutdown::from_config(&config.shutdown);
    shutdown.install_panic_hook();
    if let Err(e) = shutdown.install_signal_handlers() {
        tracing::error!(error = %e, "Failed to install signal handlers");
        return ExitCode::FAILURE;
    }

    let spawner = match ProcessSpawner::current_exe() {
        Ok(spawner) => spawner.with_global_args(global_args),
        Err(e) => {
            tracing::error!(error = %e, "Cannot locate the worker executable");
            return ExitCode::FAILURE;
        }
    };

    let master = Master::new(config, Arc::new(spawner));
    let listener = match master.bind().await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(error = %e, "Failed to bind the public port");
            return ExitCode::FAILURE;
        }
    };

    match master.run(listener, shutdown.clone()).await {
        Ok(outcome) => shutdown.finish(outcome),
        Err(e) => {
            tracing::error!(error = %e, category = e.category().label(), "Master failed");
            ExitCode::FAILURE
        }
    }
}

async fn standalone(config: Config, port: Option<u16>) -> ExitCode {
    let shutdown = Shutdown::from_config(&config.shutdown);
    shutdown.install_panic_hook();
    if let Err(e) = shutdown.install_signal_handlers() {
        tracing::error!(error = %e, "Failed to install signal handlers");
        return ExitCode::FAILURE;
    }

    let addr = SocketAddr::new(config.cluster.bind_address, port.unwrap_or(config.cluster.port));
    match worker::run_standalone(addr, shutdown.clone()).await {
        Ok(outcome) => shutdown.finish(outcome),
        Err(e) => {
            tracing::error!(error = %e, category = e.category().label(), %addr, "Server failed");
            ExitCode::FAILURE
        }
    }
}

fn setup_tracing(format: &str, level: &str, verbose: bool) -> Result<()> {
    let env_filter = if verbose {
        tracing_subscriber::EnvFilter::new("stickypool=debug,info")
    } else {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .or_else(|_| tracing_subscriber::EnvFilter::try_new(format!("stickypool={level},warn")))
            .context("Invalid log level")?
    };

    match format {
        "json" => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().json())
                .try_init()?;
        }
        _ => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().pretty())
                .try_init()?;
        }
    }

    Ok(())
}
