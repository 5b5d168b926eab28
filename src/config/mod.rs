pub mod env;
pub use env::{Credentials, TOKEN_ENV};

use serde::Deserialize;
use std::path::Path;

use crate::error::{Error, Result};

// Re-export per-component config types
pub use crate::api::ApiConfig;
pub use crate::cache::CacheConfig;
pub use crate::command::CommandConfig;
pub use crate::dispatch::DispatcherConfig;
pub use crate::gateway::GatewayConfig;
pub use crate::http::HttpConfig;

/// Complete Herald configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HeraldConfig {
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub dispatcher: DispatcherConfig,
    #[serde(default)]
    pub commands: CommandConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub api: ApiConfig,
}

impl HeraldConfig {
    /// Parse configuration from a TOML string.
    pub fn from_toml(contents: &str) -> Result<Self> {
        toml::from_str(contents).map_err(|e| Error::Config(e.to_string()))
    }
}

/// Load configuration from TOML file
pub fn load_config(path: impl AsRef<Path>) -> Result<HeraldConfig> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("failed to read {}: {}", path.display(), e)))?;
    HeraldConfig::from_toml(&contents)
}
