//! CLI configuration.
//!
//! Read from a TOML file (default `hubwire.toml`), then overridden by
//! command-line flags and `HUBWIRE_*` environment variables.

use std::path::Path;

use anyhow::{Context, bail};
use serde::Deserialize;

use hubwire_hub_connection::{CachePolicy, ConnectionConfig, ReconnectionPolicy};

/// Contents of the config file. Every field is optional.
#[derive(Debug, Default, Clone, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    pub url: Option<String>,
    pub token: Option<String>,
    pub debug: bool,
    pub reconnection: Option<ReconnectionPolicy>,
    pub cache: Option<CachePolicy>,
}

impl FileConfig {
    /// Loads `path`, or the defaults if it does not exist.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "config file not found, using defaults");
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn parse(content: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Applies overrides and builds the client configuration.
    pub fn into_connection_config(
        self,
        url: Option<String>,
        token: Option<String>,
        debug: bool,
    ) -> anyhow::Result<ConnectionConfig> {
        let Some(url) = url.or(self.url) else {
            bail!("no hub URL: pass --url, set HUBWIRE_URL, or add `url` to the config file");
        };
        let Some(token) = token.or(self.token) else {
            bail!("no access token: pass --token, set HUBWIRE_TOKEN, or add `token` to the config file");
        };

        let mut config = ConnectionConfig::new(url, token).with_debug(debug || self.debug);
        if let Some(policy) = self.reconnection {
            config = config.with_reconnection(policy);
        }
        if let Some(cache) = self.cache {
            config = config.with_cache(cache);
        }
        Ok(config)
    }
}
