// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Pipeline Settings
//
// Host-level tuning for the pipeline:
// - Admission ceiling and registry bounds
// - Event bus buffer size
// - Monte Carlo scenario defaults
// - VERIFY threshold and fallback confidence

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const CONFIG_PATH_ENV: &str = "STAGEGATE_CONFIG_PATH";
const CONFIG_FILE_NAME: &str = "stagegate-config.yaml";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineSettings {
    /// Maximum number of runs driven at the same time
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,

    /// Maximum number of runs kept in the in-memory registry
    #[serde(default = "default_registry_capacity")]
    pub registry_capacity: usize,

    /// Events buffered per subscriber before the oldest are dropped
    #[serde(default = "default_event_bus_capacity")]
    pub event_bus_capacity: usize,

    /// Iterations requested from the risk engine
    #[serde(default = "default_monte_carlo_samples")]
    pub monte_carlo_samples: u32,

    /// Base success rate sent in every risk scenario
    #[serde(default = "default_base_success_rate")]
    pub base_success_rate: f64,

    /// VERIFY fails below this confidence (percent)
    #[serde(default = "default_verify_threshold")]
    pub verify_threshold: f64,

    /// Confidence assumed when no Monte Carlo assessment is available (percent)
    #[serde(default = "default_confidence")]
    pub default_confidence: f64,

    /// Default page size for run listings
    #[serde(default = "default_list_limit")]
    pub default_list_limit: usize,
}

fn default_max_concurrent() -> usize {
    6
}

fn default_registry_capacity() -> usize {
    1000
}

fn default_event_bus_capacity() -> usize {
    1000
}

fn default_monte_carlo_samples() -> u32 {
    1000
}

fn default_base_success_rate() -> f64 {
    0.85
}

fn default_verify_threshold() -> f64 {
    60.0
}

fn default_confidence() -> f64 {
    85.0
}

fn default_list_limit() -> usize {
    20
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            registry_capacity: default_registry_capacity(),
            event_bus_capacity: default_event_bus_capacity(),
            monte_carlo_samples: default_monte_carlo_samples(),
            base_success_rate: default_base_success_rate(),
            verify_threshold: default_verify_threshold(),
            default_confidence: default_confidence(),
            default_list_limit: default_list_limit(),
        }
    }
}

impl PipelineSettings {
    /// Load settings from YAML file
    pub fn from_yaml_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let settings = serde_yaml::from_str(&content)?;
        Ok(settings)
    }

    /// Save settings to YAML file
    pub fn to_yaml_file(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let yaml = serde_yaml::to_string(self)?;
        std::fs::write(path, yaml)?;
        Ok(())
    }

    /// Parse settings from YAML string
    pub fn from_yaml_str(yaml: &str) -> anyhow::Result<Self> {
        let settings = serde_yaml::from_str(yaml)?;
        Ok(settings)
    }

    /// Candidate paths in discovery order (env var excluded)
    pub fn search_paths() -> Vec<PathBuf> {
        let mut paths = vec![PathBuf::from(format!("./{CONFIG_FILE_NAME}"))];
        if let Some(home) = dirs::home_dir() {
            paths.push(home.join(".stagegate").join("config.yaml"));
        }
        #[cfg(unix)]
        paths.push(PathBuf::from("/etc/stagegate/config.yaml"));
        #[cfg(windows)]
        paths.push(PathBuf::from("C:\\ProgramData\\Stagegate\\config.yaml"));
        paths
    }

    /// Discover a settings file using precedence order
    /// 1. STAGEGATE_CONFIG_PATH environment variable
    /// 2. ./stagegate-config.yaml (working directory)
    /// 3. ~/.stagegate/config.yaml (user home)
    /// 4. /etc/stagegate/config.yaml (system)
    pub fn discover_config() -> Option<PathBuf> {
        if let Ok(path) = std::env::var(CONFIG_PATH_ENV) {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        Self::search_paths().into_iter().find(|p| p.exists())
    }

    /// Load settings with discovery, fallback to defaults
    pub fn load_or_default(cli_path: Option<PathBuf>) -> anyhow::Result<Self> {
        // Explicit path must load
        if let Some(path) = cli_path {
            tracing::info!("Loading configuration from explicit path: {:?}", path);
            let mut settings = Self::from_yaml_file(&path)
                .map_err(|e| anyhow::anyhow!("Failed to load config at {:?}: {}", path, e))?;
            settings.apply_env_overrides();
            return Ok(settings);
        }

        let mut settings = match Self::discover_config() {
            Some(path) => {
                tracing::info!("Loading configuration from discovered path: {:?}", path);
                Self::from_yaml_file(path)?
            }
            None => {
                tracing::debug!("No configuration file found in standard locations. Using defaults.");
                Self::default()
            }
        };
        settings.apply_env_overrides();
        Ok(settings)
    }

    /// Apply environment variable overrides
    pub fn apply_env_overrides(&mut self) {
        override_from_env("STAGEGATE_MAX_CONCURRENT", &mut self.max_concurrent);
        override_from_env("STAGEGATE_REGISTRY_CAPACITY", &mut self.registry_capacity);
        override_from_env("STAGEGATE_MONTE_CARLO_SAMPLES", &mut self.monte_carlo_samples);
    }

    /// Validate settings
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_concurrent == 0 {
            anyhow::bail!("max_concurrent must be at least 1");
        }
        if self.registry_capacity == 0 {
            anyhow::bail!("registry_capacity must be at least 1");
        }
        if self.event_bus_capacity == 0 {
            anyhow::bail!("event_bus_capacity must be at least 1");
        }
        if self.monte_carlo_samples == 0 {
            anyhow::bail!("monte_carlo_samples must be at least 1");
        }
        if !(0.0..=1.0).contains(&self.base_success_rate) {
            anyhow::bail!(
                "base_success_rate must be within [0, 1], got {}",
                self.base_success_rate
            );
        }
        for (name, value) in [
            ("verify_threshold", self.verify_threshold),
            ("default_confidence", self.default_confidence),
        ] {
            if !(0.0..=100.0).contains(&value) {
                anyhow::bail!("{} must be within [0, 100], got {}", name, value);
            }
        }
        Ok(())
    }
}

fn override_from_env<T: std::str::FromStr>(var: &str, target: &mut T) {
    if let Ok(val) = std::env::var(var) {
        match val.parse::<T>() {
            Ok(parsed) => {
                tracing::info!("Environment override: {}={}", var, val);
                *target = parsed;
            }
            Err(_) => {
                tracing::warn!("Invalid value for {}: '{}'. Ignoring.", var, val);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings_validate() {
        let settings = PipelineSettings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.max_concurrent, 6);
        assert_eq!(settings.monte_carlo_samples, 1000);
        assert_eq!(settings.verify_threshold, 60.0);
    }

    #[test]
    fn test_partial_yaml_fills_defaults() {
        let settings = PipelineSettings::from_yaml_str("max_concurrent: 2\nverify_threshold: 75.5\n").unwrap();
        assert_eq!(settings.max_concurrent, 2);
        assert_eq!(settings.verify_threshold, 75.5);
        assert_eq!(settings.registry_capacity, 1000);
        assert_eq!(settings.default_confidence, 85.0);
    }

    #[test]
    fn test_validation() {
        let mut settings = PipelineSettings::default();
        settings.max_concurrent = 0;
        assert!(settings.validate().is_err());

        let mut settings = PipelineSettings::default();
        settings.base_success_rate = 1.5;
        assert!(settings.validate().is_err());

        let mut settings = PipelineSettings::default();
        settings.verify_threshold = 120.0;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_yaml_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        let mut settings = PipelineSettings::default();
        settings.registry_capacity = 12;
        settings.to_yaml_file(&path).unwrap();

        let loaded = PipelineSettings::load_or_default(Some(path)).unwrap();
        assert_eq!(loaded.registry_capacity, 12);
    }

    #[test]
    fn test_explicit_missing_path_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = PipelineSettings::load_or_default(Some(dir.path().join("nope.yaml")));
        assert!(result.is_err());
    }

    #[test]
    fn test_env_override_parsing() {
        let mut value = 3usize;
        std::env::set_var("STAGEGATE_TEST_OVERRIDE_OK", "9");
        override_from_env("STAGEGATE_TEST_OVERRIDE_OK", &mut value);
        assert_eq!(value, 9);

        std::env::set_var("STAGEGATE_TEST_OVERRIDE_BAD", "nine");
        override_from_env("STAGEGATE_TEST_OVERRIDE_BAD", &mut value);
        assert_eq!(value, 9);
    }
}
