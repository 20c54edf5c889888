//! Image registry server
//!
//! Run with: cargo run -p image-registry --features cli -- --config registry.toml

use std::net::SocketAddr;

use camino::Utf8PathBuf;
use clap::Parser;
use eyre::WrapErr;
use image_registry::RegistryConfig;
use tracing_subscriber::EnvFilter;

/// Serve docker images over the v1 registry protocol.
#[derive(Parser, Debug)]
#[command(name = "registry-server", version, about)]
struct Cli {
    /// TOML configuration file.
    #[arg(long, short)]
    config: Utf8PathBuf,

    /// Listen address, overriding the configuration file.
    #[arg(long)]
    bind: Option<SocketAddr>,
}

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .init();
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    init_logging();
    let cli = Cli::parse();

    let contents = tokio::fs::read_to_string(&cli.config)
        .await
        .wrap_err_with(|| format!("reading {}", cli.config))?;
    let mut config: RegistryConfig = toml_edit::de::from_str(&contents)
        .wrap_err_with(|| format!("parsing {}", cli.config))?;

    if let Some(bind) = cli.bind {
        config.bind = bind;
    }
    let addr = config.bind;

    let app = config
        .builder()
        .await
        .wrap_err("configuring storage")?
        .build();

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .wrap_err_with(|| format!("binding {addr}"))?;

    tracing::info!("Image registry listening on http://{}", addr);
    tracing::info!("Try: curl http://{}/v1/_ping", addr);

    axum::serve(listener, app).await?;

    Ok(())
}
