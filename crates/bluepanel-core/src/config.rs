//! Configuration types and parsing.
//!
//! The schema is small: adapter timing, the scan cycle and the pairing
//! agent's identity. Values are read once at startup and turned into
//! [`ModelSettings`](crate::model::ModelSettings) and
//! [`AgentSettings`](crate::agent::AgentSettings).

use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};
use toml::Table;

use crate::error::{Error, Result};

/// IO capabilities BlueZ accepts for an agent.
const VALID_CAPABILITIES: &[&str] = &[
    "DisplayOnly",
    "DisplayYesNo",
    "KeyboardOnly",
    "NoInputNoOutput",
    "KeyboardDisplay",
];

/// Default D-Bus method call timeout. Agent answers slower than this are
/// usually discarded by the caller.
const DBUS_CALL_TIMEOUT_SECS: u64 = 25;

/// Embedded default configuration TOML, compiled into the binary.
pub const DEFAULT_CONFIG_TOML: &str = include_str!("../../../config.toml");

/// Result of loading a configuration file.
#[derive(Debug)]
pub struct ConfigLoadResult {
    /// The loaded configuration.
    pub config: Config,
    /// Path where config was found, if any.
    pub source: Option<PathBuf>,
    /// Whether defaults were used (no config file found).
    pub used_defaults: bool,
}

/// Root configuration structure.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Local adapter behaviour.
    pub adapter: AdapterConfig,

    /// Periodic discovery.
    pub scan: ScanConfig,

    /// Pairing agent identity and timing.
    pub agent: AgentConfig,
}

impl Config {
    /// Load configuration from the embedded default TOML string.
    pub fn from_default_toml() -> Result<Self> {
        let config: Config = toml::from_str(DEFAULT_CONFIG_TOML)?;
        Ok(config)
    }

    /// Load configuration from a TOML file, merging with embedded defaults.
    ///
    /// Returns an error if the file doesn't exist or can't be parsed.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(Error::ConfigNotFound(path.to_path_buf()));
        }

        let content = std::fs::read_to_string(path)?;
        Self::load_with_defaults(&content)
    }

    /// Parse `user_toml` on top of the embedded defaults (user values win).
    pub fn load_with_defaults(user_toml: &str) -> Result<Self> {
        let mut base: Table = toml::from_str(DEFAULT_CONFIG_TOML)
            .expect("embedded DEFAULT_CONFIG_TOML should always be valid");

        let user: Table = toml::from_str(user_toml)?;

        deep_merge_toml(&mut base, user);

        let config: Config = base.try_into()?;
        Ok(config)
    }

    /// Find and load configuration using the XDG lookup chain.
    ///
    /// If `explicit_path` is `Some`, that path is used directly and an error
    /// is returned if it doesn't exist or can't be parsed (no fallback).
    ///
    /// If `explicit_path` is `None`, searches in order:
    /// 1. `$XDG_CONFIG_HOME/bluepanel/config.toml`
    /// 2. `~/.config/bluepanel/config.toml`
    /// 3. `./config.toml` (current working directory)
    ///
    /// If no config file is found, the embedded default is used.
    pub fn find_and_load(explicit_path: Option<&Path>) -> Result<ConfigLoadResult> {
        if let Some(path) = explicit_path {
            let config = Self::load(path)?;
            return Ok(ConfigLoadResult {
                config,
                source: Some(path.to_path_buf()),
                used_defaults: false,
            });
        }

        // A config file that exists but fails to load is an error, never a
        // silent fallback to defaults.
        let search_paths = Self::config_search_paths();
        for path in &search_paths {
            if !path.exists() {
                continue;
            }
            match Self::load(path) {
                Ok(config) => {
                    return Ok(ConfigLoadResult {
                        config,
                        source: Some(path.clone()),
                        used_defaults: false,
                    });
                }
                Err(e) => {
                    tracing::error!("Config file {:?} exists but failed to load: {}", path, e);
                    return Err(e);
                }
            }
        }

        tracing::info!("No config file found, using built-in default config");
        tracing::debug!(
            "Searched: {}",
            search_paths
                .iter()
                .map(|p| p.display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        );

        Ok(ConfigLoadResult {
            config: Self::from_default_toml()?,
            source: None,
            used_defaults: true,
        })
    }

    /// Get the list of paths to search for config files.
    pub fn config_search_paths() -> Vec<PathBuf> {
        let mut paths = Vec::new();

        if let Ok(xdg_config) = env::var("XDG_CONFIG_HOME") {
            paths.push(PathBuf::from(xdg_config).join("bluepanel/config.toml"));
        }

        if let Ok(home) = env::var("HOME") {
            paths.push(PathBuf::from(home).join(".config/bluepanel/config.toml"));
        }

        paths.push(PathBuf::from("config.toml"));

        paths
    }

    /// Validate the configuration, collecting every invalid value.
    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();

        if self.adapter.discoverable_timeout_secs == 0 {
            errors.push("adapter.discoverable_timeout_secs: must be greater than 0".to_string());
        }

        if self.scan.cycle {
            if self.scan.active_secs == 0 {
                errors.push("scan.active_secs: must be greater than 0".to_string());
            }
            if self.scan.idle_secs == 0 {
                errors.push("scan.idle_secs: must be greater than 0".to_string());
            }
        }

        if !VALID_CAPABILITIES.contains(&self.agent.capability.as_str()) {
            errors.push(format!(
                "agent.capability: invalid value '{}', expected one of: {}",
                self.agent.capability,
                VALID_CAPABILITIES.join(", ")
            ));
        }

        if !is_object_path(&self.agent.object_path) {
            errors.push(format!(
                "agent.object_path: invalid value '{}', expected a D-Bus object path like '/org/bluepanel/agent'",
                self.agent.object_path
            ));
        }

        if self.agent.response_timeout_secs == 0 {
            errors.push("agent.response_timeout_secs: must be greater than 0".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(Error::ConfigValidation(errors))
        }
    }

    /// Non-fatal issues that might indicate a mistake.
    pub fn warnings(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        let defaults = ScanConfig::default();

        if !self.scan.cycle
            && (self.scan.active_secs != defaults.active_secs
                || self.scan.idle_secs != defaults.idle_secs)
        {
            warnings.push(
                "scan: active_secs/idle_secs have no effect when cycle = false".to_string(),
            );
        }

        if self.agent.response_timeout_secs > DBUS_CALL_TIMEOUT_SECS {
            warnings.push(format!(
                "agent.response_timeout_secs: {}s is longer than the {}s D-Bus call timeout; \
                 the service may give up on a prompt before it expires",
                self.agent.response_timeout_secs, DBUS_CALL_TIMEOUT_SECS
            ));
        }

        warnings
    }

    /// A human-readable summary of the configuration.
    pub fn summary(&self) -> String {
        let mut lines = Vec::new();

        lines.push("Adapter:".to_string());
        lines.push(format!(
            "  discoverable timeout: {}s",
            self.adapter.discoverable_timeout_secs
        ));

        lines.push("\nScan:".to_string());
        if self.scan.cycle {
            lines.push(format!(
                "  cycle: {}s active, {}s idle",
                self.scan.active_secs, self.scan.idle_secs
            ));
        } else {
            lines.push("  cycle: disabled".to_string());
        }

        lines.push("\nAgent:".to_string());
        lines.push(format!("  object_path: {}", self.agent.object_path));
        lines.push(format!("  capability: {}", self.agent.capability));
        lines.push(format!(
            "  response timeout: {}s",
            self.agent.response_timeout_secs
        ));

        lines.join("\n")
    }
}

/// Deep merge two TOML tables, with `overlay` values taking precedence.
///
/// For nested tables, recursively merges. For arrays and other values,
/// the overlay value completely replaces the base value.
fn deep_merge_toml(base: &mut Table, overlay: Table) {
    for (key, overlay_value) in overlay {
        match (base.get_mut(&key), overlay_value) {
            (Some(toml::Value::Table(base_table)), toml::Value::Table(overlay_table)) => {
                deep_merge_toml(base_table, overlay_table);
            }
            (_, overlay_value) => {
                base.insert(key, overlay_value);
            }
        }
    }
}

/// `/` or `/segment(/segment)*` with `[A-Za-z0-9_]` segments.
fn is_object_path(path: &str) -> bool {
    if path == "/" {
        return true;
    }
    let Some(rest) = path.strip_prefix('/') else {
        return false;
    };
    rest.split('/').all(|segment| {
        !segment.is_empty()
            && segment
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_')
    })
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AdapterConfig {
    /// Seconds the adapter stays discoverable before reverting.
    pub discoverable_timeout_secs: u64,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            discoverable_timeout_secs: 120,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ScanConfig {
    /// Alternate between discovering and idle while powered.
    pub cycle: bool,
    pub active_secs: u64,
    pub idle_secs: u64,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            cycle: true,
            active_secs: 10,
            idle_secs: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AgentConfig {
    /// Object path the agent is registered under.
    pub object_path: String,
    /// IO capability announced when pairing.
    pub capability: String,
    /// Seconds a prompt waits for the user.
    pub response_timeout_secs: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            object_path: "/org/bluepanel/agent".to_string(),
            capability: "DisplayYesNo".to_string(),
            response_timeout_secs: 20,
        }
    }
}
