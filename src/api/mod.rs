// Optional HTTP status listener

mod status;

pub use status::{create_status_router, StatusAppState};

use serde::Deserialize;

/// Status API configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_port() -> u16 {
    3000
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: default_port(),
        }
    }
}
