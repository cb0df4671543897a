//! Middleware configuration.
//!
//! The core loads a YAML file given with `-c`. Everything is optional;
//! absent sections fall back to defaults so a component can start a core
//! with no configuration at all.
//!
//! ```yaml
//! core:
//!   log_level: info
//!   modules:
//!     - name: tcp
//!       listen: 0.0.0.0:1505
//! rdc:
//!   - module: tcp
//!     address: 10.0.0.5:1506
//! ```

use std::path::Path;

use serde::Deserialize;

use crate::error::Result;

/// Top-level configuration document.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Core process settings.
    #[serde(default)]
    pub core: CoreSection,

    /// Resource-discovery components registered at startup.
    #[serde(default)]
    pub rdc: Vec<RdcTarget>,
}

/// Core section: logging and the transport modules to activate.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CoreSection {
    /// Log directive (overridden by the `COMMUX_LOG` environment variable).
    pub log_level: Option<String>,

    /// Transport modules activated at startup.
    #[serde(default)]
    pub modules: Vec<ModuleConfig>,
}

/// One transport module activation.
#[derive(Debug, Clone, Deserialize)]
pub struct ModuleConfig {
    /// Built-in module name (`tcp`, `unix`).
    pub name: String,

    /// Listen address for inbound peer connections, if any.
    pub listen: Option<String>,
}

/// A resource-discovery service address.
#[derive(Debug, Clone, Deserialize)]
pub struct RdcTarget {
    /// Transport module used to reach the RDC.
    pub module: String,

    /// RDC address on that transport.
    pub address: String,
}

impl Config {
    /// Loads a configuration file.
    ///
    /// # Errors
    ///
    /// Returns an error when the file cannot be read or parsed.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_yaml::from_str(&text)?)
    }

    /// Loads the file when a path is given, otherwise the defaults.
    ///
    /// # Errors
    ///
    /// Returns an error only for a present-but-invalid file.
    pub fn load_optional(path: Option<&Path>) -> Result<Self> {
        path.map_or_else(|| Ok(Self::default()), Self::load)
    }
}
