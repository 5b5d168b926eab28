use super::HeraldConfig;
use crate::error::{Error, Result};
use std::path::PathBuf;

/// Environment variable holding the bot token.
pub const TOKEN_ENV: &str = "HERALD_TOKEN";

/// Credentials presented to the gateway (IDENTIFY/RESUME) and the REST API.
#[derive(Clone)]
pub struct Credentials {
    pub token: String,
}

impl Credentials {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }

    /// Read the token from `HERALD_TOKEN`. Missing or blank is a config error.
    pub fn from_env() -> Result<Self> {
        match std::env::var(TOKEN_ENV) {
            Ok(token) if !token.trim().is_empty() => Ok(Self::new(token.trim())),
            _ => Err(Error::Config(format!(
                "{} environment variable is required",
                TOKEN_ENV
            ))),
        }
    }

    /// Value for the REST `Authorization` header.
    pub fn authorization(&self) -> String {
        format!("Bot {}", self.token)
    }
}

// Never print the token itself.
impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("token", &"<redacted>")
            .finish()
    }
}

impl HeraldConfig {
    /// Overlay feature flags from env vars, keeping file values where unset or unparsable.
    pub fn apply_env(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    pub(crate) fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("HERALD_INTENTS") {
            if let Ok(n) = v.parse::<u64>() {
                self.gateway.intents = n;
            }
        }
        if let Some(v) = lookup("HERALD_GATEWAY_URL") {
            if !v.is_empty() {
                self.gateway.url = Some(v);
            }
        }
        if let Some(v) = lookup("HERALD_API_ENABLED") {
            if let Ok(b) = v.parse::<bool>() {
                self.api.enabled = b;
            }
        }
        if let Some(v) = lookup("HERALD_API_PORT") {
            if let Ok(n) = v.parse::<u16>() {
                self.api.port = n;
            }
        }
        if let Some(v) = lookup("HERALD_DATABASE") {
            if !v.is_empty() {
                self.cache.database = Some(PathBuf::from(v));
            }
        }
        if let Some(v) = lookup("HERALD_PREFIX") {
            let prefixes: Vec<String> = v
                .split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(str::to_string)
                .collect();
            if !prefixes.is_empty() {
                self.commands.prefixes = prefixes;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_overrides_apply_parsable_values() {
        let vars: HashMap<&str, &str> = [
            ("HERALD_INTENTS", "1"),
            ("HERALD_API_ENABLED", "true"),
            ("HERALD_API_PORT", "8080"),
            ("HERALD_DATABASE", "/var/lib/herald/cache.db"),
            ("HERALD_PREFIX", "?, !"),
        ]
        .into_iter()
        .collect();

        let mut config = HeraldConfig::default();
        config.apply_overrides(|k| vars.get(k).map(|v| v.to_string()));

        assert_eq!(config.gateway.intents, 1);
        assert!(config.api.enabled);
        assert_eq!(config.api.port, 8080);
        assert_eq!(
            config.cache.database,
            Some(PathBuf::from("/var/lib/herald/cache.db"))
        );
        assert_eq!(config.commands.prefixes, vec!["?".to_string(), "!".to_string()]);
    }

    #[test]
    fn test_unparsable_overrides_are_ignored() {
        let mut config = HeraldConfig::default();
        let before = config.gateway.intents;
        config.apply_overrides(|k| match k {
            "HERALD_INTENTS" => Some("lots".to_string()),
            "HERALD_API_PORT" => Some("-1".to_string()),
            _ => None,
        });
        assert_eq!(config.gateway.intents, before);
        assert_eq!(config.api.port, 3000);
    }

    #[test]
    fn test_credentials_debug_is_redacted() {
        let creds = Credentials::new("super-secret");
        assert!(!format!("{:?}", creds).contains("super-secret"));
        assert_eq!(creds.authorization(), "Bot super-secret");
    }
}
