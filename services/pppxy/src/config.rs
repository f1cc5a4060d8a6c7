//! pppxy configuration.
//!
//! The config file is YAML and lists one entry per relay:
//!
//! ```yaml
//! pppxy_group:
//!   - listen_addr: "0.0.0.0:8080"
//!     backend_addr: "backend.internal:80"
//!     proxy_protocol_version: 2
//! ```
//!
//! Everything is validated up front so that a bad entry stops the process
//! before any listener is bound.

use std::borrow::Cow;
use std::collections::HashSet;
use std::path::Path;

use serde::Deserialize;

use crate::error::{PppxyError, Result};
use crate::proxy::ProtocolVersion;

/// Configuration for a single relay.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ProxyConfig {
    /// Address to listen on (`host:port`, or `:port` for all interfaces).
    pub listen_addr: String,

    /// Backend to forward to (`host:port`). Resolved on every dial.
    pub backend_addr: String,

    /// PROXY protocol version to send to the backend.
    pub proxy_protocol_version: ProtocolVersion,
}

impl ProxyConfig {
    pub fn new(
        listen_addr: impl Into<String>,
        backend_addr: impl Into<String>,
        proxy_protocol_version: ProtocolVersion,
    ) -> Self {
        Self {
            listen_addr: listen_addr.into(),
            backend_addr: backend_addr.into(),
            proxy_protocol_version,
        }
    }

    /// Address handed to the socket bind call.
    ///
    /// A bare `:port` binds the IPv6 wildcard, which also accepts IPv4
    /// clients on a dual-stack host.
    pub fn bind_addr(&self) -> Cow<'_, str> {
        if self.is_wildcard() {
            Cow::Owned(format!("[::]{}", self.listen_addr))
        } else {
            Cow::Borrowed(&self.listen_addr)
        }
    }

    /// IPv4 wildcard to bind instead of `bind_addr` when the host has no IPv6.
    ///
    /// Only the `:port` shorthand has one.
    pub fn ipv4_fallback_addr(&self) -> Option<String> {
        self.is_wildcard()
            .then(|| format!("0.0.0.0{}", self.listen_addr))
    }

    fn is_wildcard(&self) -> bool {
        self.listen_addr.starts_with(':')
    }

    fn validate(&self) -> Result<()> {
        check_host_port("listen_addr", &self.listen_addr, true)?;
        check_host_port("backend_addr", &self.backend_addr, false)?;
        Ok(())
    }
}

/// Whole application configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Config {
    /// One entry per relay.
    pub pppxy_group: Vec<ProxyConfig>,
}

impl Config {
    /// Load and validate configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|source| PppxyError::ConfigRead {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&raw)
    }

    /// Parse and validate configuration from YAML text.
    pub fn from_yaml(raw: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.pppxy_group.is_empty() {
            return Err(PppxyError::ConfigInvalid(
                "pppxy_group must contain at least one entry".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for entry in &self.pppxy_group {
            entry.validate()?;
            if !seen.insert(entry.bind_addr()) {
                return Err(PppxyError::ConfigInvalid(format!(
                    "duplicate listen_addr {}",
                    entry.listen_addr
                )));
            }
        }

        Ok(())
    }
}

/// Check that `value` looks like `host:port` with a valid port.
///
/// The host may be empty only when `allow_empty_host` is set.
fn check_host_port(field: &str, value: &str, allow_empty_host: bool) -> Result<()> {
    let Some((host, port)) = value.rsplit_once(':') else {
        return Err(PppxyError::ConfigInvalid(format!(
            "{field} {value:?} must be in host:port form"
        )));
    };

    if host.is_empty() && !allow_empty_host {
        return Err(PppxyError::ConfigInvalid(format!(
            "{field} {value:?} is missing a host"
        )));
    }

    if port.parse::<u16>().is_err() {
        return Err(PppxyError::ConfigInvalid(format!(
            "{field} {value:?} has an invalid port"
        )));
    }

    Ok(())
}
