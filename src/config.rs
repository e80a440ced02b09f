//! Server configuration loaded from TOML.
//!
//! Every field has a default, so an absent file or an empty table is a valid
//! configuration. Zero or blank values fall back to their defaults; values
//! that cannot be right (bad key, bad region) are errors.
//!
//! ```toml
//! bind = "0.0.0.0:4242"
//! max_clients = 4
//! key = "000102...1e1f"
//!
//! [device]
//! region = "PL"
//! network_name = "home"
//! ```

use std::collections::hash_map::DefaultHasher;
use std::fs;
use std::hash::{Hash, Hasher};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::cipher::Cipher;
use crate::dispatcher::DeviceInfo;
use crate::error::{HomewireError, Result};
use crate::protocol::MAX_HEADER_DIGITS;
use crate::registry::RegistryConfig;
use crate::store::StoreConfig;

/// Smallest usable buffer: a maximal header plus a tiny JSON document.
pub const MIN_BUFFER_CAPACITY: usize = MAX_HEADER_DIGITS + 1 + 64;

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    #[serde(default = "ServerConfig::default_bind")]
    pub bind: SocketAddr,
    #[serde(default = "ServerConfig::default_max_clients")]
    pub max_clients: usize,
    #[serde(default = "ServerConfig::default_buffer_capacity")]
    pub buffer_capacity: usize,
    #[serde(default = "ServerConfig::default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    #[serde(default = "ServerConfig::default_frame_stale_ms")]
    pub frame_stale_ms: u64,
    #[serde(default = "ServerConfig::default_tick_ms")]
    pub tick_ms: u64,
    #[serde(default = "ServerConfig::default_interval_ms")]
    pub broadcast_interval_ms: u64,
    #[serde(default = "ServerConfig::default_interval_ms")]
    pub write_interval_ms: u64,
    #[serde(default = "ServerConfig::default_lockout_timeout_ms")]
    pub lockout_timeout_ms: u64,
    /// 64 hex characters; no key disables encryption.
    #[serde(default)]
    pub key: Option<String>,
    /// Flash image file; in-memory when absent.
    #[serde(default)]
    pub flash_path: Option<PathBuf>,
    #[serde(default)]
    pub device: DeviceConfig,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeviceConfig {
    #[serde(default = "DeviceConfig::default_region")]
    pub region: String,
    /// Hex serial; derived from the host name when absent.
    #[serde(default)]
    pub serial: Option<String>,
    #[serde(default)]
    pub network_name: String,
    #[serde(default)]
    pub watchdog_boot: bool,
}

impl DeviceConfig {
    fn default_region() -> String {
        "PL".to_string()
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: Self::default_bind(),
            max_clients: Self::default_max_clients(),
            buffer_capacity: Self::default_buffer_capacity(),
            idle_timeout_secs: Self::default_idle_timeout_secs(),
            frame_stale_ms: Self::default_frame_stale_ms(),
            tick_ms: Self::default_tick_ms(),
            broadcast_interval_ms: Self::default_interval_ms(),
            write_interval_ms: Self::default_interval_ms(),
            lockout_timeout_ms: Self::default_lockout_timeout_ms(),
            key: None,
            flash_path: None,
            device: DeviceConfig {
                region: DeviceConfig::default_region(),
                ..DeviceConfig::default()
            },
        }
    }
}

impl ServerConfig {
    fn default_bind() -> SocketAddr {
        SocketAddr::from(([0, 0, 0, 0], 4242))
    }
    fn default_max_clients() -> usize {
        4
    }
    fn default_buffer_capacity() -> usize {
        2048
    }
    fn default_idle_timeout_secs() -> u64 {
        60
    }
    fn default_frame_stale_ms() -> u64 {
        1500
    }
    fn default_tick_ms() -> u64 {
        20
    }
    fn default_interval_ms() -> u64 {
        1000
    }
    fn default_lockout_timeout_ms() -> u64 {
        2000
    }

    /// Load from `path`; a missing file yields the defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            tracing::info!(path = %path.display(), "Config file not found, using defaults");
            return Ok(Self::default());
        }
        let txt = fs::read_to_string(path)?;
        Self::from_toml(&txt)
    }

    /// Parse, normalize and validate a TOML document.
    pub fn from_toml(txt: &str) -> Result<Self> {
        let mut cfg: ServerConfig =
            toml::from_str(txt).map_err(|e| HomewireError::Config(e.to_string()))?;
        cfg.normalize();
        cfg.validate()?;
        Ok(cfg)
    }

    /// Replace zero or blank values with defaults.
    pub fn normalize(&mut self) {
        if self.buffer_capacity == 0 {
            self.buffer_capacity = Self::default_buffer_capacity();
        }
        if self.idle_timeout_secs == 0 {
            self.idle_timeout_secs = Self::default_idle_timeout_secs();
        }
        if self.frame_stale_ms == 0 {
            self.frame_stale_ms = Self::default_frame_stale_ms();
        }
        if self.tick_ms == 0 {
            self.tick_ms = Self::default_tick_ms();
        }
        if self.broadcast_interval_ms == 0 {
            self.broadcast_interval_ms = Self::default_interval_ms();
        }
        if self.write_interval_ms == 0 {
            self.write_interval_ms = Self::default_interval_ms();
        }
        if self.lockout_timeout_ms == 0 {
            self.lockout_timeout_ms = Self::default_lockout_timeout_ms();
        }
        if self.key.as_deref().is_some_and(|k| k.trim().is_empty()) {
            self.key = None;
        }
        if self.device.region.trim().is_empty() {
            self.device.region = DeviceConfig::default_region();
        }
        if self.device.serial.as_deref().is_some_and(|s| s.trim().is_empty()) {
            self.device.serial = None;
        }
    }

    /// Reject values that cannot be normalized.
    pub fn validate(&self) -> Result<()> {
        if self.max_clients == 0 {
            return Err(HomewireError::Config("max_clients must be at least 1".into()));
        }
        if self.buffer_capacity < MIN_BUFFER_CAPACITY {
            return Err(HomewireError::Config(format!(
                "buffer_capacity must be at least {MIN_BUFFER_CAPACITY} bytes"
            )));
        }
        let region = &self.device.region;
        if region.len() != 2 || !region.chars().all(|c| c.is_ascii_uppercase()) {
            return Err(HomewireError::Config(format!(
                "region must be two uppercase letters, got {region:?}"
            )));
        }
        if let Some(serial) = &self.device.serial {
            if hex::decode(serial).is_err() {
                return Err(HomewireError::Config(format!("serial {serial:?} is not hex")));
            }
        }
        self.cipher()?;
        Ok(())
    }

    /// Cipher for the configured key (pass-through without one).
    pub fn cipher(&self) -> Result<Cipher> {
        match &self.key {
            Some(key) => Cipher::from_hex(key).map_err(|e| HomewireError::Config(format!("key: {e}"))),
            None => Ok(Cipher::disabled()),
        }
    }

    pub fn registry_config(&self) -> RegistryConfig {
        RegistryConfig {
            max_clients: self.max_clients,
            buffer_capacity: self.buffer_capacity,
            stale_after: Duration::from_millis(self.frame_stale_ms),
        }
    }

    pub fn store_config(&self) -> StoreConfig {
        StoreConfig {
            write_interval: Duration::from_millis(self.write_interval_ms),
            lockout_timeout: Duration::from_millis(self.lockout_timeout_ms),
            ..StoreConfig::default()
        }
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }

    pub fn broadcast_interval(&self) -> Duration {
        Duration::from_millis(self.broadcast_interval_ms)
    }

    /// `INFO` description for a service of `service_type`.
    pub fn device_info(&self, service_type: u8) -> DeviceInfo {
        DeviceInfo {
            region: self.device.region.clone(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            serial: self
                .device
                .serial
                .clone()
                .map(|s| s.to_ascii_lowercase())
                .unwrap_or_else(host_serial),
            service_type,
            network: self.device.network_name.clone(),
            watchdog: self.device.watchdog_boot,
        }
    }
}

/// Stable 8-byte serial derived from the host name.
fn host_serial() -> String {
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "homewire".to_string());
    let mut hasher = DefaultHasher::new();
    host.hash(&mut hasher);
    hex::encode(hasher.finish().to_be_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_document_is_default() {
        let cfg = ServerConfig::from_toml("").unwrap();
        assert_eq!(cfg.bind, "0.0.0.0:4242".parse().unwrap());
        assert_eq!(cfg.max_clients, 4);
        assert_eq!(cfg.buffer_capacity, 2048);
        assert_eq!(cfg.idle_timeout(), Duration::from_secs(60));
        assert_eq!(cfg.registry_config().stale_after, Duration::from_millis(1500));
        assert_eq!(cfg.device.region, "PL");
        assert!(!cfg.cipher().unwrap().is_enabled());
    }

    #[test]
    fn test_missing_file_is_default() {
        let cfg = ServerConfig::load("/nonexistent/homewire.toml").unwrap();
        assert_eq!(cfg.max_clients, 4);
    }

    #[test]
    fn test_full_document() {
        let cfg = ServerConfig::from_toml(
            r#"
            bind = "127.0.0.1:5000"
            max_clients = 2
            buffer_capacity = 512
            tick_ms = 5
            key = "000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f"

            [device]
            region = "DE"
            serial = "E6614103E7452D2F"
            network_name = "attic"
            watchdog_boot = true
            "#,
        )
        .unwrap();

        assert_eq!(cfg.max_clients, 2);
        assert_eq!(cfg.tick(), Duration::from_millis(5));
        assert!(cfg.cipher().unwrap().is_enabled());

        let info = cfg.device_info(1);
        assert_eq!(info.region, "DE");
        assert_eq!(info.serial, "e6614103e7452d2f");
        assert_eq!(info.network, "attic");
        assert!(info.watchdog);
        assert_eq!(info.service_type, 1);
    }

    #[test]
    fn test_zero_values_normalized() {
        let cfg = ServerConfig::from_toml("tick_ms = 0\nidle_timeout_secs = 0\nkey = \"\"").unwrap();
        assert_eq!(cfg.tick_ms, 20);
        assert_eq!(cfg.idle_timeout_secs, 60);
        assert!(cfg.key.is_none());
    }

    #[test]
    fn test_invalid_values_rejected() {
        for doc in [
            "max_clients = 0",
            "buffer_capacity = 16",
            "key = \"abcd\"",
            "[device]\nregion = \"POL\"",
            "[device]\nserial = \"xyz\"",
            "unknown_field = 1",
        ] {
            assert!(
                matches!(ServerConfig::from_toml(doc), Err(HomewireError::Config(_))),
                "accepted {doc:?}"
            );
        }
    }

    #[test]
    fn test_host_serial_shape() {
        let info = ServerConfig::default().device_info(1);
        assert_eq!(info.serial.len(), 16);
        assert!(hex::decode(&info.serial).is_ok());
    }
}
