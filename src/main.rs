use std::future::IntoFuture;
use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use tokio::sync::broadcast;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use camgrid::camera::registry::CameraRegistry;
use camgrid::camera::watchdog;
use camgrid::config::ConfigStore;
use camgrid::state::AppState;
use camgrid::status::StatusStore;
use camgrid::web;

/// Log level for the application
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

/// camgrid command line arguments
#[derive(Parser, Debug)]
#[command(name = "camgrid")]
#[command(version, about = "Camera capture and MJPEG preview multiplexing core", long_about = None)]
struct CliArgs {
    /// Listen address (overrides config file)
    #[arg(short = 'a', long, value_name = "ADDRESS")]
    address: Option<String>,

    /// HTTP port (overrides config file)
    #[arg(short = 'p', long, value_name = "PORT")]
    http_port: Option<u16>,

    /// Configuration file path (also via CONFIG_PATH)
    #[arg(short = 'c', long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short = 'l', long, value_name = "LEVEL", default_value = "info")]
    log_level: LogLevel,

    /// Increase verbosity (-v for debug, -vv for trace)
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();

    init_logging(args.log_level, args.verbose);

    tracing::info!("Starting camgrid v{}", env!("CARGO_PKG_VERSION"));

    // Configuration file: CLI arg > CONFIG_PATH > default
    let config_path = args
        .config
        .or_else(|| std::env::var("CONFIG_PATH").ok().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("camgrid.json"));
    tracing::info!("Configuration file: {}", config_path.display());

    let config_store = ConfigStore::open(&config_path).await?;
    let mut web_config = config_store.get().web.clone();

    // CLI overrides (only when explicitly specified)
    if let Some(addr) = args.address {
        web_config.bind_address = addr;
    }
    if let Some(port) = args.http_port {
        web_config.http_port = port;
    }

    // Create shutdown channel
    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    // Status store for out-of-process observation
    let status = std::sync::Arc::new(StatusStore::new());

    // Camera registry: build pipelines and autostart enabled cameras
    let registry = CameraRegistry::new(config_store.clone(), status.clone());
    registry.bootstrap().await?;
    tracing::info!(
        cameras = registry.enumerate().await.len(),
        "Camera registry ready"
    );

    // Stall watchdog
    let watchdog_handle = watchdog::spawn(registry.clone(), shutdown_tx.subscribe());

    let state = AppState::new(
        config_store,
        registry.clone(),
        status,
        shutdown_tx.clone(),
    );
    let router = web::create_router(state);

    let addr: SocketAddr = format!("{}:{}", web_config.bind_address, web_config.http_port)
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid bind address: {e}"))?;
    tracing::info!("Server listening on http://{addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let server = axum::serve(listener, router);

    // Graceful shutdown on ctrl-c: stop decoders first so no process leaks
    let shutdown = shutdown_tx.clone();
    tokio::select! {
        result = server.into_future() => {
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutdown signal received");
        }
    }

    let _ = shutdown.send(());
    registry.shutdown_all().await;
    let _ = watchdog_handle.await;
    tracing::info!("Shutdown complete");

    Ok(())
}

fn init_logging(level: LogLevel, verbose_count: u8) {
    // Verbose count overrides log level
    let effective_level = match verbose_count {
        0 => level,
        1 => LogLevel::Debug,
        _ => LogLevel::Trace,
    };

    let filter = match effective_level {
        LogLevel::Error => "camgrid=error,tower_http=error",
        LogLevel::Warn => "camgrid=warn,tower_http=warn",
        LogLevel::Info => "camgrid=info,tower_http=info",
        LogLevel::Debug => "camgrid=debug,tower_http=debug",
        LogLevel::Trace => "camgrid=trace,tower_http=debug",
    };

    // Environment variable takes highest priority
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into());

    if let Err(err) = tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
    {
        eprintln!("failed to initialize tracing: {err}");
    }
}
