use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use homewire::service::{FixedSensor, Thermostat};
use homewire::store::{DurableStore, FileFlash, Flash, MemoryFlash};
use homewire::{Server, ServerConfig};

#[derive(Debug, Parser)]
#[command(name = "homewire", version, about = "Home controller protocol server")]
struct Args {
    /// TOML configuration file.
    #[arg(short, long, default_value = "homewire.toml")]
    config: PathBuf,

    /// Listen address (overrides the config file).
    #[arg(short, long)]
    bind: Option<SocketAddr>,

    /// 64-hex-char AES-256 key (overrides the config file).
    #[arg(short, long)]
    key: Option<String>,

    /// Flash image file (overrides the config file).
    #[arg(long)]
    flash: Option<PathBuf>,

    /// Initial thermostat reading in °C.
    #[arg(long, default_value_t = 21.0)]
    temperature: f64,
}

async fn run(args: Args) -> homewire::Result<()> {
    let mut config = ServerConfig::load(&args.config)?;
    if let Some(bind) = args.bind {
        config.bind = bind;
    }
    if let Some(key) = args.key {
        config.key = Some(key);
    }
    if let Some(flash) = args.flash {
        config.flash_path = Some(flash);
    }

    let mut builder = Server::builder().config(config.clone());

    let flash: Box<dyn Flash> = match &config.flash_path {
        Some(path) => Box::new(FileFlash::open(path)?),
        None => {
            tracing::warn!("No flash image configured, settings will not survive restart");
            Box::new(MemoryFlash::default())
        }
    };
    let store = Arc::new(DurableStore::open(flash, builder.core_link(), config.store_config())?);

    let thermostat = Thermostat::new(FixedSensor::new(args.temperature, 0))
        .with_store(store.clone())
        .with_broadcast(builder.broadcast_slot());

    let server = builder.service(Arc::new(thermostat)).store(store).start().await?;

    server
        .run(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for shutdown signal: {}", e);
                std::future::pending::<()>().await;
            }
        })
        .await
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    match run(Args::parse()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{}", e);
            ExitCode::FAILURE
        }
    }
}
