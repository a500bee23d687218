//! Connection configuration.
//!
//! [`ConnectionOptions`] holds the plain-data knobs and can be loaded from
//! TOML; [`ConnectionHooks`] holds the closures the connection calls back
//! into. Every option has a default, so an empty file is a valid config.

use crate::connection::Connection;
use crate::error::{DdpError, Result};
use crate::protocol::SUPPORTED_DDP_VERSIONS;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Tunables for one connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionOptions {
    /// Interval between heartbeat checks. 0 disables heartbeats.
    pub heartbeat_interval_ms: u64,
    /// How long to wait for a `pong` before declaring the connection lost.
    pub heartbeat_timeout_ms: u64,
    /// Reconnect automatically after the transport drops.
    pub retry: bool,
    /// Answer server `ping` frames with `pong`.
    pub respond_to_pings: bool,
    /// Quiet period after which buffered writes are flushed. 0 disables
    /// buffering and applies every write immediately.
    pub buffered_writes_interval_ms: u64,
    /// Upper bound on how long a buffered write may wait.
    pub buffered_writes_max_age_ms: u64,
    /// DDP versions to offer, most preferred first.
    pub supported_ddp_versions: Vec<String>,
    /// Allow hot-code migration while methods are outstanding.
    pub reload_with_outstanding: bool,
    /// Transport connect timeout.
    pub connect_timeout_ms: u64,
    /// Log a warning when one queued async stub runs longer than this.
    pub async_stub_warn_after_ms: u64,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 17_500,
            heartbeat_timeout_ms: 15_000,
            retry: true,
            respond_to_pings: true,
            buffered_writes_interval_ms: 5,
            buffered_writes_max_age_ms: 500,
            supported_ddp_versions: SUPPORTED_DDP_VERSIONS
                .iter()
                .map(|v| v.to_string())
                .collect(),
            reload_with_outstanding: false,
            connect_timeout_ms: 10_000,
            async_stub_warn_after_ms: 5_000,
        }
    }
}

impl ConnectionOptions {
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let options: Self = toml::from_str(raw).map_err(|e| DdpError::Config(e.to_string()))?;
        options.validate()?;
        Ok(options)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| DdpError::Config(format!("reading {}: {e}", path.display())))?;
        Self::from_toml_str(&raw)
    }

    /// `<config dir>/ddp-client/config.toml` on this platform, if a home
    /// directory can be determined.
    pub fn default_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("", "", "ddp-client")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    pub fn validate(&self) -> Result<()> {
        if self.supported_ddp_versions.is_empty() {
            return Err(DdpError::Config(
                "supported_ddp_versions must not be empty".into(),
            ));
        }
        if self.heartbeat_interval_ms > 0 && self.heartbeat_timeout_ms == 0 {
            return Err(DdpError::Config(
                "heartbeat_timeout_ms must be positive when heartbeats are enabled".into(),
            ));
        }
        Ok(())
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    pub fn buffered_writes_interval(&self) -> Duration {
        Duration::from_millis(self.buffered_writes_interval_ms)
    }

    pub fn buffered_writes_max_age(&self) -> Duration {
        Duration::from_millis(self.buffered_writes_max_age_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn async_stub_warn_after(&self) -> Duration {
        Duration::from_millis(self.async_stub_warn_after_ms)
    }
}

// ── Hooks ───────────────────────────────────────────────────────

pub type ConnectedHook = Box<dyn FnMut() + Send>;
pub type VersionFailureHook = Box<dyn FnMut(&str) + Send>;
/// Runs on every stream reset, before outstanding methods are resent.
/// Methods it calls are scheduled ahead of the old ones.
pub type ReconnectHook = Box<dyn FnMut(&mut Connection) + Send>;

/// Callbacks into application code.
pub struct ConnectionHooks {
    pub on_connected: Option<ConnectedHook>,
    pub on_ddp_version_negotiation_failure: VersionFailureHook,
    pub on_reconnect: Vec<ReconnectHook>,
}

impl Default for ConnectionHooks {
    fn default() -> Self {
        Self {
            on_connected: None,
            on_ddp_version_negotiation_failure: Box::new(|description| {
                tracing::error!("{description}");
            }),
            on_reconnect: Vec::new(),
        }
    }
}

impl ConnectionHooks {
    pub fn on_connected(mut self, f: impl FnMut() + Send + 'static) -> Self {
        self.on_connected = Some(Box::new(f));
        self
    }

    pub fn on_version_negotiation_failure(mut self, f: impl FnMut(&str) + Send + 'static) -> Self {
        self.on_ddp_version_negotiation_failure = Box::new(f);
        self
    }

    pub fn on_reconnect(mut self, f: impl FnMut(&mut Connection) + Send + 'static) -> Self {
        self.on_reconnect.push(Box::new(f));
        self
    }
}

impl std::fmt::Debug for ConnectionHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHooks")
            .field("on_connected", &self.on_connected.is_some())
            .field("on_reconnect", &self.on_reconnect.len())
            .finish_non_exhaustive()
    }
}

// ── Tests ───────────────────────────────────────────────────────
