//! Transport configuration.
//!
//! Values come from [`TransportConfig::default`], optionally a TOML or JSON
//! file, and finally the process environment:
//!
//! - `FABRIC_DELIVERY_MODE` selects the [`DeliveryMode`] stamped on every post.
//! - `FABRIC_CONTACT_FILE` names a file that receives this process's URL.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TransportError};
use crate::nic::Credentials;

/// Environment variable selecting the delivery mode.
pub const DELIVERY_MODE_ENV: &str = "FABRIC_DELIVERY_MODE";

/// Environment variable naming the contact file.
pub const CONTACT_FILE_ENV: &str = "FABRIC_CONTACT_FILE";

/// Routing policy requested from the NIC for each posted descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeliveryMode {
    /// Adaptive, hash-based routing; the hardware default.
    #[default]
    Performance,
    /// Strictly ordered delivery.
    InOrder,
    /// Adaptive routing disabled.
    NoAdapt,
    /// Hash-based routing disabled.
    NoHash,
    /// Adaptive retry disabled.
    NoRadapt,
}

impl DeliveryMode {
    /// Parses the environment spelling. Unknown values fall back to
    /// [`DeliveryMode::Performance`].
    pub fn from_env_value(value: &str) -> Self {
        match value.trim().to_ascii_uppercase().as_str() {
            "PERFORMANCE" => DeliveryMode::Performance,
            "IN_ORDER" => DeliveryMode::InOrder,
            "NO_ADAPT" => DeliveryMode::NoAdapt,
            "NO_HASH" => DeliveryMode::NoHash,
            "NO_RADAPT" => DeliveryMode::NoRadapt,
            other => {
                tracing::warn!(
                    value = other,
                    "unrecognized delivery mode, using PERFORMANCE"
                );
                DeliveryMode::Performance
            }
        }
    }

    /// The environment spelling of this mode.
    pub fn as_str(self) -> &'static str {
        match self {
            DeliveryMode::Performance => "PERFORMANCE",
            DeliveryMode::InOrder => "IN_ORDER",
            DeliveryMode::NoAdapt => "NO_ADAPT",
            DeliveryMode::NoHash => "NO_HASH",
            DeliveryMode::NoRadapt => "NO_RADAPT",
        }
    }
}

/// Configuration of one transport instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Host name or address the rendezvous listener binds to and advertises.
    pub listen_host: String,
    /// Listener port; 0 picks an ephemeral port.
    pub listen_port: u16,
    /// Protection tag of this process's domain.
    pub ptag: u32,
    /// Cookie of this process's domain.
    pub cookie: u32,
    /// Delivery mode stamped on every post.
    pub delivery_mode: DeliveryMode,
    /// File that receives this process's contact URL.
    pub contact_file: Option<PathBuf>,
    /// Longest single completion-queue poll in milliseconds.
    pub poll_interval_ms: u64,
    /// Pause between TCP connect attempts in milliseconds.
    pub connect_retry_ms: u64,
    /// Pause between non-blocking accept attempts in milliseconds.
    pub accept_interval_ms: u64,
    /// Read/write timeout on the rendezvous socket during a handshake.
    pub handshake_timeout_ms: u64,
    /// Budget for internal waits: slot claims, unblock waits, local completions.
    pub op_timeout_ms: u64,
    /// Depth of each completion queue the transport creates.
    pub cq_depth: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            listen_host: "127.0.0.1".to_string(),
            listen_port: 0,
            ptag: 1,
            cookie: 0,
            delivery_mode: DeliveryMode::Performance,
            contact_file: None,
            poll_interval_ms: 100,
            connect_retry_ms: 50,
            accept_interval_ms: 10,
            handshake_timeout_ms: 10_000,
            op_timeout_ms: 30_000,
            cq_depth: 64,
        }
    }
}

impl TransportConfig {
    /// Defaults overlaid with the process environment.
    pub fn from_env() -> Self {
        Self::default().with_env(|key| std::env::var(key).ok())
    }

    /// Overlays environment values obtained through `lookup`.
    pub fn with_env(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(mode) = lookup(DELIVERY_MODE_ENV) {
            self.delivery_mode = DeliveryMode::from_env_value(&mode);
        }
        if let Some(path) = lookup(CONTACT_FILE_ENV) {
            if !path.trim().is_empty() {
                self.contact_file = Some(PathBuf::from(path));
            }
        }
        self
    }

    /// Loads a configuration file; the format follows the extension.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        let config: TransportConfig = match ext.to_lowercase().as_str() {
            "toml" => toml::from_str(&contents).map_err(|e| TransportError::Config {
                reason: e.to_string(),
            })?,
            "json" => serde_json::from_str(&contents).map_err(|e| TransportError::Config {
                reason: e.to_string(),
            })?,
            _ => {
                return Err(TransportError::Config {
                    reason: format!("unsupported config file extension: {ext:?}"),
                })
            }
        };
        config.validate()?;
        Ok(config)
    }

    /// Rejects values the driver cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.listen_host.trim().is_empty() {
            return Err(TransportError::Config {
                reason: "listen_host is empty".to_string(),
            });
        }
        if self.poll_interval_ms == 0 {
            return Err(TransportError::Config {
                reason: "poll_interval_ms must be positive".to_string(),
            });
        }
        if self.cq_depth == 0 {
            return Err(TransportError::Config {
                reason: "cq_depth must be positive".to_string(),
            });
        }
        Ok(())
    }

    /// Credentials of this process's protection domain.
    pub fn credentials(&self) -> Credentials {
        Credentials {
            ptag: self.ptag,
            cookie: self.cookie,
        }
    }

    /// Longest single slice of a completion poll.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Pause between rendezvous connect attempts.
    pub fn connect_retry(&self) -> Duration {
        Duration::from_millis(self.connect_retry_ms.max(1))
    }

    /// How often the accept thread checks for shutdown.
    pub fn accept_interval(&self) -> Duration {
        Duration::from_millis(self.accept_interval_ms.max(1))
    }

    /// Read/write budget for each handshake step.
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    /// Budget for internal waits such as slot claims and acknowledgments.
    pub fn op_timeout(&self) -> Duration {
        Duration::from_millis(self.op_timeout_ms)
    }
}
