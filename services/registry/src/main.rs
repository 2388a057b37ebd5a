//! Registry server process: loads configuration, opens the store, seeds it
//! and keeps the embedded store in sync until interrupted.

use camino::{Utf8Path, Utf8PathBuf};
use clap::Parser;
use eyre::WrapErr;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use registry::{RegistryConfig, RegistryService};

#[derive(Debug, Parser)]
#[command(name = "registry-server", version, about = "Server registry storage service")]
struct Args {
    /// Path to the TOML configuration file
    #[arg(short, long, env = "REGISTRY_CONFIG", value_name = "PATH")]
    config: Utf8PathBuf,

    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,
}

fn init_tracing(args: &Args) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_error::ErrorLayer::default());

    if args.log_json {
        subscriber.with(fmt::layer().json()).init();
    } else {
        subscriber.with(fmt::layer()).init();
    }
}

async fn load_config(path: &Utf8Path) -> eyre::Result<RegistryConfig> {
    let text = tokio::fs::read_to_string(path)
        .await
        .wrap_err_with(|| format!("read config {path}"))?;
    let config: RegistryConfig =
        toml_edit::de::from_str(&text).wrap_err_with(|| format!("parse config {path}"))?;
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    let args = Args::parse();
    init_tracing(&args);

    let config = load_config(&args.config).await?;
    let backend = config.store.clone().build().await?;
    let service = RegistryService::new(backend.store());
    tracing::info!(backend = backend.name(), "registry starting");

    if let Some(seed) = &config.seed {
        service.import_seed(seed).await?;
    }

    let cancel = CancellationToken::new();
    let listener = match backend.as_json_file() {
        Some(store) => config.sync.spawn(store, cancel.child_token()).await,
        None => None,
    };

    tokio::signal::ctrl_c()
        .await
        .wrap_err("wait for shutdown signal")?;
    tracing::info!("shutting down");

    cancel.cancel();
    if let Some(listener) = listener {
        listener.stop().await;
    }
    service.store().close().await?;

    Ok(())
}
