// Built-in extensions for the herald bot

pub mod booru;
pub mod channels;
pub mod meta;
pub mod settings;
pub mod statistics;

use anyhow::{Context, Result};
use herald::Client;
use std::path::PathBuf;
use std::sync::Arc;

use booru::Booru;
use settings::SettingsStore;
use statistics::{StatisticStore, Statistics};

/// Environment variable naming the statistics database file.
pub const STATS_DATABASE_ENV: &str = "HERALD_STATS_DATABASE";
pub const DEFAULT_STATS_DATABASE: &str = "herald-stats.db";

/// Environment variable naming the server settings database file.
pub const SETTINGS_DATABASE_ENV: &str = "HERALD_SETTINGS_DATABASE";
pub const DEFAULT_SETTINGS_DATABASE: &str = "herald-settings.db";

/// Where the built-in extensions keep their data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Databases {
    pub statistics: PathBuf,
    pub settings: PathBuf,
}

impl Databases {
    /// Both files inside `dir`, with the default names.
    pub fn in_dir(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        Self {
            statistics: dir.join(DEFAULT_STATS_DATABASE),
            settings: dir.join(DEFAULT_SETTINGS_DATABASE),
        }
    }

    pub fn from_env() -> Self {
        let path = |var: &str, default: &str| {
            PathBuf::from(std::env::var(var).unwrap_or_else(|_| default.to_string()))
        };
        Self {
            statistics: path(STATS_DATABASE_ENV, DEFAULT_STATS_DATABASE),
            settings: path(SETTINGS_DATABASE_ENV, DEFAULT_SETTINGS_DATABASE),
        }
    }
}

/// Load the meta, settings, booru and statistics extensions into `client`.
pub async fn load_builtin(client: &Client, databases: &Databases) -> Result<()> {
    let prefix = client
        .config()
        .commands
        .prefixes
        .first()
        .cloned()
        .unwrap_or_default();
    client
        .load(meta::extension(&prefix))
        .await
        .context("Failed to load meta extension")?;

    let settings = Arc::new(SettingsStore::open(&databases.settings)?);
    client
        .load(settings::extension(Arc::clone(&settings)))
        .await
        .context("Failed to load settings extension")?;
    client
        .load(booru::extension(Arc::new(Booru::new(settings))))
        .await
        .context("Failed to load booru extension")?;

    let store = StatisticStore::open(&databases.statistics)?;
    let stats = Arc::new(Statistics::new(Arc::new(store)));
    client
        .load(statistics::extension(stats))
        .await
        .context("Failed to load statistics extension")?;
    Ok(())
}
