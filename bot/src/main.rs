use anyhow::{Context, Result};
use herald::config::{load_config, Credentials, HeraldConfig};
use herald::telemetry::{init_tracing, DEFAULT_FILTER};
use herald::Client;
use herald_bot::{load_builtin, Databases};
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing(DEFAULT_FILTER);
    info!("Herald starting...");

    let mut config = match std::env::var("HERALD_CONFIG") {
        Ok(path) => {
            info!(path = %path, "Loading config");
            load_config(&path).with_context(|| format!("Failed to load config from {}", path))?
        }
        Err(_) => HeraldConfig::default(),
    };
    config.apply_env();

    let credentials = Credentials::from_env().context("Missing credentials")?;
    let databases = Databases::from_env();

    let client = Client::new(config, credentials).context("Failed to build client")?;
    load_builtin(&client, &databases).await?;
    info!(
        extensions = ?client.context().registry.extension_names(),
        "Extensions loaded"
    );

    // Returns Err on fatal gateway errors, which exits non-zero
    client.run().await?;
    Ok(())
}
