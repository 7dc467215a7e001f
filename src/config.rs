//! Provplan Configuration Module
//!
//! Manages persistent defaults for planning and applying.
//! Config is stored in `~/.config/provplan/config.toml`.
//!
//! ## Priority Order (highest to lowest)
//!
//! 1. CLI flags
//! 2. Environment variables (`AZURE_SUBSCRIPTION_ID`, `AZURE_ENV_NAME`,
//!    `AZURE_LOCATION`, `AZURE_PRINCIPAL_ID`)
//! 3. Config file (`~/.config/provplan/config.toml`)
//! 4. Defaults

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{PlanError, Result};
use crate::runtime::RunnerSettings;

pub const DEFAULT_SCOPE_ID: &str = "00000000-0000-0000-0000-000000000000";

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ProvplanConfig {
    /// Deployment target defaults
    #[serde(default)]
    pub target: Target,

    /// Apply-time runner settings
    #[serde(default)]
    pub runner: RunnerConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Target {
    /// Subscription-like scope id
    pub scope_id: Option<String>,
    pub environment: Option<String>,
    pub location: Option<String>,
    /// Principal granted registry push; empty skips the grant
    pub principal_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RunnerConfig {
    pub max_parallel: usize,
    pub fail_fast: bool,
    pub consistency_poll_ms: u64,
    pub consistency_max_attempts: u32,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        let settings = RunnerSettings::default();
        Self {
            max_parallel: settings.max_parallel,
            fail_fast: settings.fail_fast,
            consistency_poll_ms: settings.consistency_poll.as_millis() as u64,
            consistency_max_attempts: settings.consistency_max_attempts,
        }
    }
}

impl ProvplanConfig {
    /// Returns `~/.config/provplan/` on Unix, `%APPDATA%/provplan/` on Windows
    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("provplan")
    }

    pub fn config_path() -> PathBuf {
        Self::config_dir().join("config.toml")
    }

    /// Load configuration from the default path
    ///
    /// Returns default config if file doesn't exist.
    /// Returns error if file exists but is malformed.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path())
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path).map_err(|e| PlanError::ConfigError {
            reason: format!("Failed to read config file: {}", e),
        })?;

        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content).map_err(|e| PlanError::ConfigError {
            reason: format!("Failed to parse config file: {}", e),
        })?;
        config.check()?;
        Ok(config)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent().filter(|d| !d.exists()) {
            fs::create_dir_all(dir).map_err(|e| PlanError::ConfigError {
                reason: format!("Failed to create config directory: {}", e),
            })?;
        }

        let content = toml::to_string_pretty(self).map_err(|e| PlanError::ConfigError {
            reason: format!("Failed to serialize config: {}", e),
        })?;

        fs::write(path, content).map_err(|e| PlanError::ConfigError {
            reason: format!("Failed to write config file: {}", e),
        })?;

        Ok(())
    }

    /// Merge with environment variables
    ///
    /// Non-empty environment variables take precedence over file values.
    pub fn with_env(self) -> Self {
        self.with_vars(|name| std::env::var(name).ok())
    }

    /// Merge with an arbitrary variable source
    pub fn with_vars(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |name: &str| lookup(name).filter(|v| !v.is_empty());

        if let Some(v) = get("AZURE_SUBSCRIPTION_ID") {
            self.target.scope_id = Some(v);
        }
        if let Some(v) = get("AZURE_ENV_NAME") {
            self.target.environment = Some(v);
        }
        if let Some(v) = get("AZURE_LOCATION") {
            self.target.location = Some(v);
        }
        // An empty principal is meaningful (skip the push grant), so only unset is ignored
        if let Some(v) = lookup("AZURE_PRINCIPAL_ID") {
            self.target.principal_id = Some(v);
        }

        self
    }

    pub fn scope_id(&self) -> &str {
        self.target.scope_id.as_deref().unwrap_or(DEFAULT_SCOPE_ID)
    }

    pub fn environment(&self) -> Option<&str> {
        self.target.environment.as_deref()
    }

    pub fn location(&self) -> Option<&str> {
        self.target.location.as_deref()
    }

    pub fn principal_id(&self) -> &str {
        self.target.principal_id.as_deref().unwrap_or("")
    }

    pub fn runner_settings(&self) -> RunnerSettings {
        RunnerSettings {
            max_parallel: self.runner.max_parallel,
            fail_fast: self.runner.fail_fast,
            consistency_poll: Duration::from_millis(self.runner.consistency_poll_ms),
            consistency_max_attempts: self.runner.consistency_max_attempts,
            ..RunnerSettings::default()
        }
    }

    fn check(&self) -> Result<()> {
        if self.runner.max_parallel == 0 {
            return Err(PlanError::ConfigError {
                reason: "runner.max_parallel must be at least 1".to_string(),
            });
        }
        if self.runner.consistency_max_attempts == 0 {
            return Err(PlanError::ConfigError {
                reason: "runner.consistency_max_attempts must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn vars(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_config_path_contains_provplan() {
        let path = ProvplanConfig::config_path();
        assert!(path.to_string_lossy().contains("provplan"));
        assert!(path.to_string_lossy().ends_with("config.toml"));
        assert_eq!(path.parent().unwrap(), ProvplanConfig::config_dir());
    }

    #[test]
    fn test_defaults() {
        let config = ProvplanConfig::default();
        assert_eq!(config.scope_id(), DEFAULT_SCOPE_ID);
        assert_eq!(config.principal_id(), "");
        assert!(config.environment().is_none());

        let settings = config.runner_settings();
        assert_eq!(settings.max_parallel, 8);
        assert!(settings.fail_fast);
        assert_eq!(settings.consistency_poll, Duration::from_millis(500));
        assert_eq!(settings.consistency_max_attempts, 60);
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nested").join("config.toml");

        let config = ProvplanConfig {
            target: Target {
                scope_id: Some("sub-1".into()),
                environment: Some("dev".into()),
                location: Some("eastus".into()),
                principal_id: None,
            },
            runner: RunnerConfig {
                max_parallel: 2,
                fail_fast: false,
                consistency_poll_ms: 10,
                consistency_max_attempts: 3,
            },
        };

        config.save_to(&path).unwrap();
        let loaded = ProvplanConfig::load_from(&path).unwrap();
        assert_eq!(config, loaded);
    }

    #[test]
    fn test_missing_file_is_default() {
        let temp_dir = TempDir::new().unwrap();
        let loaded = ProvplanConfig::load_from(&temp_dir.path().join("absent.toml")).unwrap();
        assert_eq!(loaded, ProvplanConfig::default());
    }

    #[test]
    fn test_partial_runner_section_keeps_defaults() {
        let config = ProvplanConfig::parse("[runner]\nmax_parallel = 3\n").unwrap();
        assert_eq!(config.runner.max_parallel, 3);
        assert!(config.runner.fail_fast);
        assert_eq!(config.runner.consistency_max_attempts, 60);
    }

    #[test]
    fn test_malformed_file_is_config_error() {
        let err = ProvplanConfig::parse("[runner\nmax_parallel = ").unwrap_err();
        assert_eq!(err.code(), "PLAN-091");

        let err = ProvplanConfig::parse("[runner]\nmax_parallel = 0\n").unwrap_err();
        assert!(err.to_string().contains("max_parallel"));
    }

    #[test]
    fn test_env_overrides_file() {
        let config = ProvplanConfig {
            target: Target {
                environment: Some("from-file".into()),
                location: Some("westus".into()),
                ..Default::default()
            },
            ..Default::default()
        }
        .with_vars(vars(&[
            ("AZURE_ENV_NAME", "from-env"),
            ("AZURE_LOCATION", ""),
            ("AZURE_SUBSCRIPTION_ID", "sub-env"),
        ]));

        assert_eq!(config.environment(), Some("from-env"));
        // Empty values do not override
        assert_eq!(config.location(), Some("westus"));
        assert_eq!(config.scope_id(), "sub-env");
    }

    #[test]
    fn test_empty_principal_from_env_is_kept() {
        let config = ProvplanConfig {
            target: Target {
                principal_id: Some("11111111-1111-1111-1111-111111111111".into()),
                ..Default::default()
            },
            ..Default::default()
        }
        .with_vars(vars(&[("AZURE_PRINCIPAL_ID", "")]));

        assert_eq!(config.principal_id(), "");
    }

    #[test]
    fn test_toml_format() {
        let toml_str = toml::to_string_pretty(&ProvplanConfig::default()).unwrap();
        assert!(toml_str.contains("[runner]"));
        assert!(toml_str.contains("max_parallel = 8"));
    }
}
