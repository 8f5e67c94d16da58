// Chain configuration
//
// One TOML table per chain under `[chains.<name>]`. Parsing is all-or-nothing:
// any invalid chain rejects the whole file.

use crate::error::{FerryError, Result};
use crate::listener::ListenerOptions;
use crate::transfer::TransferSettings;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

fn default_transfer_req_timeout() -> f64 {
    30.0
}

fn default_req_timeout() -> f64 {
    5.0
}

fn default_restart_delay() -> f64 {
    1.0
}

/// The whole configuration file
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FerryConfig {
    #[serde(default)]
    pub chains: BTreeMap<String, ChainConfig>,
}

/// One named transfer chain
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChainConfig {
    /// Bus addresses (`host:port`); one listener each
    pub providers: Vec<String>,
    pub topics: Vec<String>,
    pub destination: PathBuf,
    #[serde(default)]
    pub login: Option<String>,
    /// Owner address used when a push carries none
    #[serde(default)]
    pub request_address: Option<String>,
    #[serde(default)]
    pub processing_delay: f64,
    #[serde(default)]
    pub heartbeat_timeout: Option<f64>,
    #[serde(default)]
    pub resubscribe_on_silence: bool,
    #[serde(default = "default_transfer_req_timeout")]
    pub transfer_req_timeout: f64,
    #[serde(default = "default_req_timeout")]
    pub req_timeout: f64,
    #[serde(default = "default_restart_delay")]
    pub restart_delay: f64,
}

impl FerryConfig {
    /// Read and validate a configuration file
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|e| {
            FerryError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::parse(&text)
            .map_err(|e| FerryError::Config(format!("{}: {}", path.display(), e)))
    }

    /// Parse and validate configuration text
    pub fn parse(text: &str) -> Result<Self> {
        let config: FerryConfig =
            toml::from_str(text).map_err(|e| FerryError::Config(e.to_string()))?;
        for (name, chain) in &config.chains {
            chain
                .validate()
                .map_err(|reason| FerryError::Config(format!("chain '{}': {}", name, reason)))?;
        }
        Ok(config)
    }
}

/// Upper bound on any configured duration (one year)
pub const MAX_SECONDS: f64 = 365.0 * 86_400.0;

fn check_seconds(key: &str, value: f64, allow_zero: bool) -> std::result::Result<(), String> {
    if !value.is_finite() || value < 0.0 {
        return Err(format!("{} must be a non-negative number of seconds", key));
    }
    if value > MAX_SECONDS || Duration::try_from_secs_f64(value).is_err() {
        return Err(format!("{} must be at most {} seconds", key, MAX_SECONDS));
    }
    if !allow_zero && value == 0.0 {
        return Err(format!("{} must be greater than zero", key));
    }
    Ok(())
}

fn seconds(value: f64) -> Duration {
    Duration::try_from_secs_f64(value).unwrap_or_default()
}

impl ChainConfig {
    fn validate(&self) -> std::result::Result<(), String> {
        if self.providers.is_empty() {
            return Err("providers must not be empty".to_string());
        }
        if self.providers.iter().any(|p| p.trim().is_empty()) {
            return Err("providers must not contain empty addresses".to_string());
        }
        if self.topics.is_empty() {
            return Err("topics must not be empty".to_string());
        }
        if self.destination.as_os_str().is_empty() {
            return Err("destination must not be empty".to_string());
        }

        check_seconds("processing_delay", self.processing_delay, true)?;
        if let Some(timeout) = self.heartbeat_timeout {
            check_seconds("heartbeat_timeout", timeout, false)?;
        }
        check_seconds("transfer_req_timeout", self.transfer_req_timeout, false)?;
        check_seconds("req_timeout", self.req_timeout, false)?;
        check_seconds("restart_delay", self.restart_delay, true)?;
        Ok(())
    }

    pub fn listener_options(&self) -> ListenerOptions {
        ListenerOptions {
            processing_delay: seconds(self.processing_delay),
            heartbeat_timeout: self.heartbeat_timeout.map(seconds),
            resubscribe_on_silence: self.resubscribe_on_silence,
        }
    }

    pub fn transfer_settings(&self) -> TransferSettings {
        TransferSettings {
            destination: self.destination.clone(),
            login: self.login.clone(),
            default_request_address: self.request_address.clone(),
            request_timeout: seconds(self.req_timeout),
            transfer_timeout: seconds(self.transfer_req_timeout),
        }
    }

    pub fn restart_delay(&self) -> Duration {
        seconds(self.restart_delay)
    }
}
