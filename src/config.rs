//! TOML configuration for castforge.
//!
//! A layered configuration model: a config file (located via an
//! environment variable, then a standard system path) with compiled-in
//! defaults as the final fallback.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Root configuration for the castforge process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CastforgeConfig {
    #[serde(default)]
    pub cert: CertConfig,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for CastforgeConfig {
    fn default() -> Self {
        Self {
            cert: CertConfig::default(),
            network: NetworkConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl CastforgeConfig {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        info!(path = %path.display(), "loaded castforge configuration");
        Ok(config)
    }

    /// Try, in order: the `CASTFORGE_CONFIG` environment variable, then
    /// `/etc/castforge/castforge.toml`, then compiled-in defaults.
    pub fn load_or_default() -> Self {
        if let Ok(env_path) = std::env::var("CASTFORGE_CONFIG") {
            let path = Path::new(&env_path);
            match Self::load(path) {
                Ok(cfg) => return cfg,
                Err(e) => warn!(
                    path = %path.display(),
                    error = %e,
                    "CASTFORGE_CONFIG set but file could not be loaded, trying fallback"
                ),
            }
        }

        let system_path = Path::new("/etc/castforge/castforge.toml");
        if system_path.exists() {
            match Self::load(system_path) {
                Ok(cfg) => return cfg,
                Err(e) => warn!(
                    path = %system_path.display(),
                    error = %e,
                    "system config file exists but could not be loaded, using defaults"
                ),
            }
        }

        debug!("no config file found, using compiled-in defaults");
        Self::default()
    }
}

/// Where persisted key/cert material lives.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CertConfig {
    /// Directory holding `ca.crt` / `ca.key`. Overridden by `--cert-dir`.
    pub dir: PathBuf,
}

impl Default for CertConfig {
    fn default() -> Self {
        Self { dir: PathBuf::from(".") }
    }
}

/// Listener and mDNS advertisement configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// `host:port` to bind the TLS listener to. Port `0` picks an
    /// ephemeral port, matching the source tool's default.
    pub listen_address: String,
    /// Per-key overrides for the `_googlecast._tcp.local.` TXT record.
    /// An empty value deletes that key from the advertised record.
    pub txt_overrides: HashMap<String, String>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_address: "0.0.0.0:0".to_string(),
            txt_overrides: HashMap::new(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Minimum tracing level (`trace`, `debug`, `info`, `warn`, `error`).
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info".to_string() }
    }
}
