// src/main.rs - ino-host: INO heater integration with an HTTP command API
use clap::Parser;
use ino_host::host::serve_requests;
use ino_host::link::SerialConnector;
use ino_host::web::channel::HostRequest;
use ino_host::{load_config, Host};
use ino_shared::{Clock, MonotonicClock};
use ino_simulator::SimConnector;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;

const DEFAULT_LISTEN: &str = "0.0.0.0:3000";

#[derive(Parser, Debug)]
#[command(name = "ino-host", about = "Host integration for INO external heaters.")]
struct Cli {
    /// Path to the TOML printer config
    #[arg(default_value = "printer.toml")]
    config: PathBuf,

    /// Talk to simulated INO boards instead of serial ports
    #[arg(long)]
    simulate: bool,

    /// Address for the HTTP API (overrides [web] listen)
    #[arg(long)]
    listen: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync + 'static>> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let cli = Cli::parse();
    tracing::info!("Starting ino-host {}", env!("CARGO_PKG_VERSION"));
    tracing::info!("Loading configuration from: {}", cli.config.display());

    let config = load_config(&cli.config).inspect_err(|_| {
        tracing::error!("Please ensure the configuration file exists and is properly formatted");
    })?;
    let listen = cli
        .listen
        .clone()
        .or_else(|| config.web.listen.clone())
        .unwrap_or_else(|| DEFAULT_LISTEN.to_string());

    let clock: Arc<dyn Clock> = Arc::new(MonotonicClock::new());
    let started = if cli.simulate {
        tracing::info!("Using simulated INO boards");
        Host::start(config, clock, |name, _| SimConnector::hotend(name))
    } else {
        Host::start(config, clock, |_, section| {
            SerialConnector::new(section.serial.clone().unwrap_or_default(), section.baud)
        })
    };
    let host = match started {
        Ok(host) => Arc::new(host),
        Err(e) => {
            tracing::error!("Failed to initialize host: {}", e);
            return Err(e.into());
        }
    };

    let (host_tx, host_rx) = mpsc::channel::<HostRequest>(16);
    let requests = tokio::spawn(serve_requests(host.clone(), host_rx));

    let app = ino_host::web::api::create_router(host_tx);
    let listener = tokio::net::TcpListener::bind(&listen).await?;
    tracing::info!("Web API listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for ctrl-c: {}", e);
            }
        })
        .await?;

    host.shutdown().await;
    requests.abort();
    Ok(())
}
