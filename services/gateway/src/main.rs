// sms-gateway: Bridges an SMS modem and a message broker.
//
// Loads the TOML config, builds the configured device and broker engines,
// runs both pipelines and maps process signals onto shutdown/pause/resume.

use clap::{Arg, Command, value_parser};
use sms_gateway::config::{DEFAULT_CONFIG_PATH, load_config_from_path};
use sms_gateway::engines::{build_broker, build_device};
use sms_gateway::gateway::{Gateway, GatewayHandle};
use std::path::PathBuf;
use tracing::{error, info};

#[tokio::main]
async fn main() {
    // Initialize tracing subscriber for structured logging to stdout.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let matches = Command::new("sms-gateway")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Forwards SMS between a modem and a message broker")
        .arg(
            Arg::new("config")
                .help("Path to the TOML config file")
                .short('c')
                .long("config")
                .value_name("PATH")
                .value_parser(value_parser!(PathBuf))
                .default_value(DEFAULT_CONFIG_PATH),
        )
        .get_matches();
    let config_path = matches
        .get_one::<PathBuf>("config")
        .cloned()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));

    let cfg = match load_config_from_path(&config_path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("FATAL: failed to load config: {}", e);
            std::process::exit(1);
        }
    };

    let device = match build_device(&cfg.device) {
        Ok(d) => d,
        Err(e) => {
            eprintln!("FATAL: failed to set up device engine: {}", e);
            std::process::exit(1);
        }
    };
    let broker = match build_broker(&cfg.broker) {
        Ok(b) => b,
        Err(e) => {
            eprintln!("FATAL: failed to set up broker engine: {}", e);
            std::process::exit(1);
        }
    };

    info!(
        name = %cfg.name,
        config = %config_path.display(),
        device = %device.describe(),
        broker = %broker.describe(),
        "sms-gateway v{} starting",
        env!("CARGO_PKG_VERSION")
    );

    let gateway = Gateway::new(&cfg.name, device, broker)
        .with_timing(cfg.timing.device(), cfg.timing.broker())
        .start();

    wait_for_shutdown(&gateway).await;
    gateway.shutdown().await;
    info!("sms-gateway shutdown complete");
}

/// Block until SIGINT or SIGTERM.  SIGUSR1 pauses and SIGUSR2 resumes.
#[cfg(unix)]
async fn wait_for_shutdown(gateway: &GatewayHandle) {
    use tokio::signal::unix::{SignalKind, signal};

    let (mut sigterm, mut sigusr1, mut sigusr2) = match (
        signal(SignalKind::terminate()),
        signal(SignalKind::user_defined1()),
        signal(SignalKind::user_defined2()),
    ) {
        (Ok(t), Ok(u1), Ok(u2)) => (t, u1, u2),
        (Err(e), _, _) | (_, Err(e), _) | (_, _, Err(e)) => {
            error!("failed to install signal handlers: {}", e);
            tokio::signal::ctrl_c().await.ok();
            return;
        }
    };

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown: SIGINT received");
                return;
            }
            _ = sigterm.recv() => {
                info!("shutdown: SIGTERM received");
                return;
            }
            _ = sigusr1.recv() => gateway.pause(),
            _ = sigusr2.recv() => gateway.resume(),
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown(_gateway: &GatewayHandle) {
    tokio::signal::ctrl_c().await.ok();
    info!("shutdown: Ctrl-C received");
}
