//! Configuration loading from `~/.nanolink/config.toml` with defaults.
//!
//! Every section and field is optional; anything missing falls back to the
//! defaults below.

use crate::error::{WireError, WireResult};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// Default registry port.
pub const DEFAULT_REGISTRY_PORT: u16 = 4345;

/// Largest frame accepted by default (16 MiB).
pub const DEFAULT_MAX_FRAME_SIZE: u64 = 16 * 1024 * 1024;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NanoConfig {
    pub transport: TransportConfig,
    pub registry: RegistryConfig,
    pub keys: KeyConfig,
}

/// Socket and framing settings for secure connections.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Rolling idle deadline of the receive loop.
    pub read_poll_ms: u64,
    /// Deadline for the rest of a frame once its first byte has arrived.
    pub frame_timeout_ms: u64,
    /// Per-frame write deadline, used only when the write deadline is enabled.
    pub write_timeout_ms: u64,
    /// Width of each length field in bytes (1..=8). Both ends must agree.
    pub length_width: usize,
    /// Frames announcing a larger body are rejected.
    pub max_frame_size: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            read_poll_ms: 250,
            frame_timeout_ms: 10_000,
            write_timeout_ms: 10_000,
            length_width: 8,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

impl TransportConfig {
    pub fn validate(&self) -> WireResult<()> {
        if !(1..=8).contains(&self.length_width) {
            return Err(WireError::Configuration(format!(
                "length_width must be between 1 and 8 bytes, got {}",
                self.length_width
            )));
        }
        if self.read_poll_ms == 0 || self.frame_timeout_ms == 0 || self.write_timeout_ms == 0 {
            return Err(WireError::Configuration(
                "transport timeouts must be non-zero".into(),
            ));
        }
        if self.max_frame_size == 0 {
            return Err(WireError::Configuration(
                "max_frame_size must be non-zero".into(),
            ));
        }
        Ok(())
    }

    pub fn read_poll(&self) -> Duration {
        Duration::from_millis(self.read_poll_ms)
    }

    pub fn frame_timeout(&self) -> Duration {
        Duration::from_millis(self.frame_timeout_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }
}

/// Discovery registry settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Address the registration listener binds to.
    pub listen_addr: SocketAddr,
    /// Interval between liveness sweeps.
    pub sweep_interval_ms: u64,
    /// Connect deadline of one liveness probe.
    pub probe_timeout_ms: u64,
    /// Bounded wait of one accept call.
    pub accept_timeout_ms: u64,
    /// Deadline for a registering client to deliver its whole payload.
    pub registration_timeout_ms: u64,
    /// Registration payloads larger than this are dropped.
    pub max_registration_size: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_REGISTRY_PORT)),
            sweep_interval_ms: 10_000,
            probe_timeout_ms: 2_000,
            accept_timeout_ms: 10_000,
            registration_timeout_ms: 10_000,
            max_registration_size: 1024 * 1024,
        }
    }
}

impl RegistryConfig {
    pub fn validate(&self) -> WireResult<()> {
        if self.sweep_interval_ms == 0 {
            return Err(WireError::Configuration(
                "sweep_interval_ms must be non-zero".into(),
            ));
        }
        if self.probe_timeout_ms == 0
            || self.accept_timeout_ms == 0
            || self.registration_timeout_ms == 0
        {
            return Err(WireError::Configuration(
                "registry timeouts must be non-zero".into(),
            ));
        }
        Ok(())
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn accept_timeout(&self) -> Duration {
        Duration::from_millis(self.accept_timeout_ms)
    }

    pub fn registration_timeout(&self) -> Duration {
        Duration::from_millis(self.registration_timeout_ms)
    }
}

/// Out-of-band provisioned keys, base64 encoded.
///
/// Either both keys are set or neither is.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct KeyConfig {
    pub encrypt_key: Option<String>,
    pub auth_key: Option<String>,
}

/// `~/.nanolink/config.toml`, or `./config.toml` when there is no home directory.
pub fn default_config_path() -> PathBuf {
    dirs::home_dir()
        .map(|h| h.join(".nanolink"))
        .unwrap_or_else(|| PathBuf::from("."))
        .join("config.toml")
}

/// Load configuration from a TOML file, with defaults.
///
/// Never fails: a missing, unreadable or invalid file is logged and the
/// defaults are returned instead.
pub fn load_config(path: Option<&Path>) -> NanoConfig {
    let config_path = path
        .map(|p| p.to_path_buf())
        .unwrap_or_else(default_config_path);

    if !config_path.exists() {
        info!(
            path = %config_path.display(),
            "Config file not found, using defaults"
        );
        return NanoConfig::default();
    }

    match std::fs::read_to_string(&config_path) {
        Ok(contents) => match toml::from_str::<NanoConfig>(&contents) {
            Ok(config) => {
                info!(path = %config_path.display(), "Loaded configuration");
                config
            }
            Err(e) => {
                warn!(
                    error = %e,
                    path = %config_path.display(),
                    "Failed to parse config, using defaults"
                );
                NanoConfig::default()
            }
        },
        Err(e) => {
            warn!(
                error = %e,
                path = %config_path.display(),
                "Failed to read config file, using defaults"
            );
            NanoConfig::default()
        }
    }
}
