//! hetero-deploy device daemon binary
//!
//! Serves orchestrator sessions for the device described by
//! `$HELPER_RES_FILE_PATH/resource.json`.

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use anyhow::{Context, Result};
use hetero_deploy::comm::CommRegistry;
use hetero_deploy::config::{
    resource_dir, DeviceConfig, ExecutorConfig, SessionConfig, TransportConfig,
};
use hetero_deploy::daemon::{DaemonServer, DaemonServices, SessionManager};
use hetero_deploy::executor::ForkLauncher;
use hetero_deploy::logging::init_logging;
use hetero_deploy::transport::QueueTransport;
use std::env;
use std::process;
use std::sync::Arc;
use tracing::info;

/// Environment variable overriding the default log level
const LOG_LEVEL_ENV: &str = "DEPLOYD_LOG_LEVEL";

/// Backend bound when `DEPLOYD_COMM_BACKEND` is unset
const DEFAULT_COMM_BACKEND: &str = "loopback";

fn main() -> Result<()> {
    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        print_usage();
        return Ok(());
    }

    let command = &args[1];

    match command.as_str() {
        "start" => start_daemon(),
        "check-config" => check_config(),
        "-h" | "--help" => {
            print_usage();
            Ok(())
        }
        _ => {
            eprintln!("Error: Unknown command '{}'", command);
            print_usage();
            process::exit(1);
        }
    }
}

fn start_daemon() -> Result<()> {
    let level = env::var(LOG_LEVEL_ENV).unwrap_or_else(|_| "info".to_string());
    init_logging(&level)?;

    let config = DeviceConfig::load().context("Failed to load device configuration")?;

    let backend = env::var("DEPLOYD_COMM_BACKEND").unwrap_or_else(|_| DEFAULT_COMM_BACKEND.into());
    let comm = CommRegistry::with_defaults()
        .bind(&backend)
        .with_context(|| format!("Failed to bind communication backend '{}'", backend))?;

    let services = Arc::new(DaemonServices::new(
        Arc::new(QueueTransport::in_memory(TransportConfig::default())),
        comm,
        Arc::new(ForkLauncher),
        ExecutorConfig::default(),
    ));
    let sessions = Arc::new(SessionManager::new(
        config.token.clone(),
        SessionConfig::from_device(&config),
        services,
    )?);

    let server = DaemonServer::bind(&config.listen_address(), sessions)?;
    server.register_signals()?;
    info!(
        device_id = config.device_id,
        address = %config.listen_address(),
        backend = %backend,
        "Device daemon started, press Ctrl-C to stop"
    );
    server.run()?;
    info!("Device daemon stopped");
    Ok(())
}

fn check_config() -> Result<()> {
    let dir = resource_dir()?;
    let config = DeviceConfig::load_from(&dir)
        .with_context(|| format!("Invalid configuration in {}", dir.display()))?;
    println!("Device {} listens on {}", config.device_id, config.listen_address());
    println!("Heartbeat timeout: {:?}", config.heartbeat_timeout());
    Ok(())
}

fn print_usage() {
    println!("hetero-deploy device daemon v{}", env!("CARGO_PKG_VERSION"));
    println!();
    println!("Usage: hetero-deployd <command>");
    println!();
    println!("Commands:");
    println!("  start         Load resource.json and serve orchestrator sessions");
    println!("  check-config  Validate resource.json and exit");
    println!("  -h, --help    Show this help message");
    println!();
    println!("Environment:");
    println!("  HELPER_RES_FILE_PATH   Directory containing resource.json");
    println!("  DEPLOYD_LOG_LEVEL      Log level (default: info, RUST_LOG overrides)");
    println!("  DEPLOYD_COMM_BACKEND   Communication backend (default: loopback)");
}
