//! Configuration handling.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::core::Ticks;

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub general: GeneralConfig,
    pub capture: CaptureConfig,
    pub accounting: AccountingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Log filter when RUST_LOG is unset.
    pub log_level: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Interface to capture on. Empty means it must come from the CLI.
    pub device: String,
    /// Poll timeout; also bounds how quickly a stop request is noticed.
    pub read_timeout_ms: i32,
    pub snaplen: i32,
    pub promiscuous: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AccountingConfig {
    /// Directory for dated flow logs and error.log.
    pub log_dir: PathBuf,
    /// Directory for dated raw packet dumps. Empty disables the dump.
    pub packet_dump_dir: PathBuf,
    /// Idle window before a flow is written out, in 100 ns ticks.
    pub expiry_ticks: Ticks,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            device: String::new(),
            read_timeout_ms: 100,
            snaplen: 65_535,
            promiscuous: true,
        }
    }
}

impl Default for AccountingConfig {
    fn default() -> Self {
        Self {
            log_dir: PathBuf::from("logs"),
            packet_dump_dir: PathBuf::new(),
            expiry_ticks: 300_000_000, // 30 seconds
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            general: GeneralConfig::default(),
            capture: CaptureConfig::default(),
            accounting: AccountingConfig::default(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        info!(path = %path.display(), "loaded configuration");
        Ok(config)
    }

    /// Load from `path` if given, otherwise from the first candidate
    /// location that exists, otherwise fall back to defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        if let Some(path) = path {
            return Self::load(path);
        }
        for candidate in Self::candidate_paths() {
            if candidate.exists() {
                return Self::load(&candidate);
            }
        }
        debug!("no config file found, using defaults");
        Ok(Self::default())
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("failed to serialize config")?;
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(path, content)
            .with_context(|| format!("failed to write config file: {}", path.display()))?;
        info!(path = %path.display(), "wrote configuration");
        Ok(())
    }

    fn candidate_paths() -> Vec<PathBuf> {
        let mut paths = vec![PathBuf::from("/etc/netmon/config.toml")];
        if let Some(dir) = dirs_next::config_dir() {
            paths.push(dir.join("netmon").join("config.toml"));
        }
        paths.push(PathBuf::from("config.toml"));
        paths
    }

    /// Dump directory as an option, mapping the empty path to disabled.
    pub fn packet_dump_dir(&self) -> Option<&Path> {
        if self.accounting.packet_dump_dir.as_os_str().is_empty() {
            None
        } else {
            Some(&self.accounting.packet_dump_dir)
        }
    }
}
