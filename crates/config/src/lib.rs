// SPDX-License-Identifier: PolyForm-Shield-1.0

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::debug;

pub const ENV_ANTHROPIC_KEY: &str = "ANTHROPIC_API_KEY";
pub const ENV_GOOGLE_KEY: &str = "GOOGLE_API_KEY";
pub const ENV_HF_TOKEN: &str = "HUGGINGFACE_HUB_TOKEN";
pub const ENV_DATA_DIR: &str = "TOKMETER_DATA_DIR";

/// Name of the registry document inside the data directory.
pub const MODELS_FILE: &str = "models.json";

/// Root configuration. Every field has a default, so an empty file (or no
/// file at all) is a valid configuration.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TokmeterConfig {
    pub server: ServerSection,
    pub storage: StorageSection,
    pub limits: LimitsSection,
    pub credentials: Credentials,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerSection {
    pub host: IpAddr,
    /// HTTP API.
    pub gateway_port: u16,
    /// WebSocket model-list hub.
    pub hub_port: u16,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StorageSection {
    /// Where `models.json` lives. Defaults to the platform data directory.
    pub data_dir: Option<PathBuf>,
    /// Where downloaded `tokenizer.json` files are kept. Defaults to
    /// `<data_dir>/tokenizers`.
    pub tokenizer_cache_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LimitsSection {
    pub max_upload_mb: u64,
    pub custom_list_limit: usize,
}

#[derive(Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Credentials {
    pub anthropic_api_key: Option<String>,
    pub google_api_key: Option<String>,
    pub huggingface_token: Option<String>,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            gateway_port: 7860,
            hub_port: 7861,
        }
    }
}

impl Default for LimitsSection {
    fn default() -> Self {
        Self {
            max_upload_mb: 20,
            custom_list_limit: 20,
        }
    }
}

// Keys never end up in logs.
impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fn mask(v: &Option<String>) -> &'static str {
            if v.is_some() {
                "<set>"
            } else {
                "<unset>"
            }
        }
        f.debug_struct("Credentials")
            .field("anthropic_api_key", &mask(&self.anthropic_api_key))
            .field("google_api_key", &mask(&self.google_api_key))
            .field("huggingface_token", &mask(&self.huggingface_token))
            .finish()
    }
}

impl TokmeterConfig {
    pub fn gateway_addr(&self) -> SocketAddr {
        SocketAddr::new(self.server.host, self.server.gateway_port)
    }

    pub fn hub_addr(&self) -> SocketAddr {
        SocketAddr::new(self.server.host, self.server.hub_port)
    }

    pub fn max_upload_bytes(&self) -> usize {
        usize::try_from(self.limits.max_upload_mb.saturating_mul(1024 * 1024))
            .unwrap_or(usize::MAX)
    }

    /// Resolved data directory: configured value or the platform default.
    pub fn data_dir(&self) -> Result<PathBuf> {
        match &self.storage.data_dir {
            Some(dir) => Ok(dir.clone()),
            None => store::tokmeter_data_root(),
        }
    }

    pub fn models_path(&self) -> Result<PathBuf> {
        Ok(self.data_dir()?.join(MODELS_FILE))
    }

    pub fn tokenizer_cache_dir(&self) -> Result<PathBuf> {
        match &self.storage.tokenizer_cache_dir {
            Some(dir) => Ok(dir.clone()),
            None => Ok(self.data_dir()?.join("tokenizers")),
        }
    }

    /// Apply overrides from the process environment.
    pub fn apply_env(&mut self) {
        self.apply_env_from(|key| std::env::var(key).ok());
    }

    /// Apply overrides from an arbitrary lookup. Empty values are ignored.
    pub fn apply_env_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get(ENV_ANTHROPIC_KEY) {
            self.credentials.anthropic_api_key = Some(v);
        }
        if let Some(v) = get(ENV_GOOGLE_KEY) {
            self.credentials.google_api_key = Some(v);
        }
        if let Some(v) = get(ENV_HF_TOKEN) {
            self.credentials.huggingface_token = Some(v);
        }
        if let Some(v) = get(ENV_DATA_DIR) {
            self.storage.data_dir = Some(PathBuf::from(v));
        }
    }
}

pub fn parse(text: &str) -> Result<TokmeterConfig> {
    toml::from_str(text).context("invalid tokmeter configuration")
}

pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<TokmeterConfig> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let config =
        parse(&text).with_context(|| format!("failed to parse config file {}", path.display()))?;
    debug!("loaded configuration from {}", path.display());
    Ok(config)
}

/// File (if given) plus environment overrides; the entry point binaries use.
pub fn load(path: Option<&Path>) -> Result<TokmeterConfig> {
    let mut config = match path {
        Some(path) => load_from_file(path)?,
        None => TokmeterConfig::default(),
    };
    config.apply_env();
    Ok(config)
}
