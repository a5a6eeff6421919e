//! Configuration for a handover-managed service
//!
//! Layered with the `config` crate: built-in defaults, then an optional TOML
//! file, then `HANDOVER_*` environment variables. Command-line flags are
//! applied on top by the binary.

use crate::error::{HandoverError, Result};
use crate::registry::{NETWORK_TCP, NETWORK_UNIX};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Environment variable prefix (`HANDOVER_READY_TIMEOUT_SECS`, ...)
const ENV_PREFIX: &str = "HANDOVER";

/// Service configuration
#[derive(Debug, Clone, Deserialize)]
pub struct HandoverConfig {
    /// Shared coordination directory for every generation of the service
    pub coordination_dir: PathBuf,

    /// How long the old generation waits for a connected successor's readiness byte
    pub ready_timeout_secs: u64,

    /// How long the old generation lets in-flight connections finish after handoff
    pub drain_timeout_secs: u64,

    /// Listener specs, `tcp:<addr>:<label>` or `unix:<path>:<label>`
    #[serde(default)]
    pub listen: Vec<String>,
}

impl Default for HandoverConfig {
    fn default() -> Self {
        Self {
            coordination_dir: default_coordination_dir(),
            ready_timeout_secs: 30,
            drain_timeout_secs: 10,
            listen: Vec::new(),
        }
    }
}

/// Default coordination directory using the XDG runtime dir when available
pub fn default_coordination_dir() -> PathBuf {
    dirs::runtime_dir()
        .or_else(dirs::data_local_dir)
        .unwrap_or_else(std::env::temp_dir)
        .join("handover")
}

impl HandoverConfig {
    /// Load defaults, then `path` (if given), then the environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let defaults = Self::default();
        let mut builder = config::Config::builder()
            .set_default(
                "coordination_dir",
                defaults.coordination_dir.to_string_lossy().to_string(),
            )?
            .set_default("ready_timeout_secs", defaults.ready_timeout_secs)?
            .set_default("drain_timeout_secs", defaults.drain_timeout_secs)?;

        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }

        let config = builder
            .add_source(config::Environment::with_prefix(ENV_PREFIX))
            .build()?
            .try_deserialize()?;
        Ok(config)
    }

    /// Readiness timeout as a `Duration`
    pub fn ready_timeout(&self) -> Duration {
        Duration::from_secs(self.ready_timeout_secs)
    }

    /// Drain timeout as a `Duration`
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }

    /// Parsed listener specs
    pub fn listen_specs(&self) -> Result<Vec<ListenSpec>> {
        self.listen.iter().map(|spec| spec.parse()).collect()
    }
}

/// One listener the service wants, named the way it is inherited
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenSpec {
    /// TCP listener on `addr`
    Tcp { addr: String, label: String },
    /// Unix stream listener at `path`
    Unix { path: PathBuf, label: String },
}

impl ListenSpec {
    /// Label the listener is registered under
    pub fn label(&self) -> &str {
        match self {
            ListenSpec::Tcp { label, .. } | ListenSpec::Unix { label, .. } => label,
        }
    }
}

impl FromStr for ListenSpec {
    type Err = HandoverError;

    fn from_str(spec: &str) -> Result<Self> {
        let invalid = || {
            HandoverError::Other(format!(
                "Invalid listen spec '{}': expected <tcp|unix>:<address>:<label>",
                spec
            ))
        };

        let (network, rest) = spec.split_once(':').ok_or_else(invalid)?;
        let (address, label) = rest.rsplit_once(':').ok_or_else(invalid)?;
        if address.is_empty() || label.is_empty() {
            return Err(invalid());
        }

        match network {
            NETWORK_TCP => Ok(ListenSpec::Tcp {
                addr: address.to_string(),
                label: label.to_string(),
            }),
            NETWORK_UNIX => Ok(ListenSpec::Unix {
                path: PathBuf::from(address),
                label: label.to_string(),
            }),
            _ => Err(invalid()),
        }
    }
}
