//! `nim-gateway`: serve Mesytec NIM modules to the browser control panel.
//!
//! ```bash
//! # real serial ports, settings from nim-gateway.toml if present
//! nim-gateway --port 8000
//!
//! # emulated MSCF-16 and MHV-4, no hardware needed
//! nim-gateway --simulate --log-level debug
//! ```

#[cfg(not(test))]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use anyhow::{Context, Result};
use clap::Parser;
use nim_daemon::{logging, GatewayConfig, LogFormat, Overrides};
use nim_server::AppState;
use nim_session::{PortOpener, PortScanner, SessionManager, SimulatedBench, SystemPorts};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "nim-gateway", version)]
#[command(about = "HTTP/WebSocket gateway for Mesytec MSCF-16 and MHV-4 modules", long_about = None)]
struct Cli {
    /// Configuration file (TOML). Defaults to ./nim-gateway.toml when present
    #[arg(long)]
    config: Option<PathBuf>,

    /// Listen address
    #[arg(long)]
    host: Option<String>,

    /// Listen port
    #[arg(long)]
    port: Option<u16>,

    /// Serve emulated modules instead of the host's serial ports
    #[arg(long)]
    simulate: bool,

    /// trace, debug, info, warn or error
    #[arg(long)]
    log_level: Option<String>,

    /// Log output format
    #[arg(long, value_enum)]
    log_format: Option<LogFormat>,
}

impl Cli {
    fn overrides(&self) -> Overrides {
        Overrides {
            host: self.host.clone(),
            port: self.port,
            simulate: self.simulate,
            log_level: self.log_level.clone(),
            log_format: self.log_format,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = GatewayConfig::load(cli.config.as_deref(), &cli.overrides())
        .context("failed to load configuration")?;
    config
        .validate()
        .map_err(anyhow::Error::msg)
        .context("invalid configuration")?;
    logging::init(&config.log).map_err(anyhow::Error::msg)?;

    let (opener, scanner): (Arc<dyn PortOpener>, Arc<dyn PortScanner>) = if config.simulate {
        let bench = Arc::new(SimulatedBench::default());
        info!(ports = ?bench.list_ports(), "serving emulated modules");
        (bench.clone(), bench)
    } else {
        (Arc::new(SystemPorts), Arc::new(SystemPorts))
    };

    let manager = SessionManager::new(config.manager(), opener);
    let app = nim_server::router(AppState::new(manager.clone(), scanner));

    let addr = config.listen_addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(%addr, simulate = config.simulate, "gateway listening");

    let shutdown = {
        let manager = manager.clone();
        async move {
            if let Err(e) = signal::ctrl_c().await {
                warn!(error = %e, "failed to listen for ctrl-c");
                std::future::pending::<()>().await;
            }
            info!("shutdown requested, closing sessions");
            manager.teardown().await;
        }
    };
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .context("server error")?;

    // sessions opened while the listener drained
    manager.teardown().await;
    info!("gateway stopped");
    Ok(())
}
