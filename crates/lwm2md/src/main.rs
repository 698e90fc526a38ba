//! lwm2md - LwM2M device management client daemon
//!
//! Registers the device with the configured LwM2M servers (bootstrapping
//! first when only a bootstrap account is provisioned) and serves Device
//! Management, observation and firmware/software update requests.
//!
//! Usage:
//!   lwm2md [--config <lwm2md.toml>] [--endpoint <name>] [--log-json]
//!
//! When a software update stages a new client the daemon exits with the
//! configured restart exit code so its supervisor starts the new version.

mod host;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use lwm2m_client::{ClientConfig, ClientContext, Collaborators, Engine, ExitReason, NetConnector};
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "lwm2md")]
#[command(author, version, about = "LwM2M device management client daemon")]
struct Cli {
    /// Client configuration file (TOML)
    #[arg(short, long, default_value = "/etc/lwm2md/lwm2md.toml")]
    config: PathBuf,

    /// Endpoint client name, overriding the configuration
    #[arg(short, long)]
    endpoint: Option<String>,

    /// Log as JSON lines
    #[arg(long)]
    log_json: bool,
}

fn init_logging(json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "lwm2md=info,lwm2m_client=info,lwm2m_coap=info".into());
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_json);

    let mut config = ClientConfig::load(&cli.config)
        .with_context(|| format!("Failed to load {}", cli.config.display()))?;
    if let Some(endpoint) = cli.endpoint {
        config.endpoint = endpoint;
        config.validate().context("Invalid endpoint name")?;
    }
    info!(
        endpoint = %config.endpoint,
        config = %cli.config.display(),
        "Starting lwm2md"
    );

    let staging_dir = config.update.staging_dir.clone();
    tokio::fs::create_dir_all(&staging_dir)
        .await
        .with_context(|| format!("Failed to create staging directory {}", staging_dir.display()))?;
    let restart_exit_code = config.update.restart_exit_code;

    let collaborators =
        Collaborators::from_config(&config).context("Failed to set up package download")?;
    let mut context = ClientContext::new(config).context("Failed to provision client objects")?;
    host::install(&mut context.registry, &staging_dir).context("Failed to attach host objects")?;

    let engine = Engine::new(context, collaborators, Arc::new(NetConnector));
    let handle = engine.handle();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Shutting down...");
        handle.shutdown();
    });

    match engine.run().await.context("Client failed")? {
        ExitReason::Stopped => Ok(()),
        ExitReason::RestartRequested => {
            info!(exit_code = restart_exit_code, "Exiting for restart");
            std::process::exit(restart_exit_code)
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Cannot listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut term) => {
                term.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
