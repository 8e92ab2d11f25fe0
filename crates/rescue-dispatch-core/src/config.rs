//! Configuration with layered loading.
//!
//! # Load Order
//!
//! 1. Default values (compile-time)
//! 2. TOML file (if given)
//! 3. Environment variables (`RESCUE_*`)
//!
//! Each layer overrides the previous.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::geo::Coordinate;
use crate::models::ResponderKind;

/// Configuration error type.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file.
    #[error("failed to read config file '{path}': {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Failed to parse TOML.
    #[error("failed to parse config file '{path}': {source}")]
    ParseToml {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    /// Invalid environment variable value.
    #[error("invalid value for environment variable '{name}': {message}")]
    InvalidEnvVar { name: String, message: String },

    /// A value that parsed but makes no sense.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl ConfigError {
    pub fn invalid_env_var(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidEnvVar {
            name: name.into(),
            message: message.into(),
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub storage: StorageConfig,
    pub dispatch: DispatchConfig,
    pub estimation: EstimationConfig,
    pub events: EventBusConfig,
    pub logging: LoggingConfig,
    /// Startup wiring of agents to event types
    pub subscriptions: Vec<SubscriptionConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// SQLite database file
    pub path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("rescue-dispatch.db"),
        }
    }
}

/// Ranking parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Assumed average speed of field units
    pub field_unit_speed_kmh: f64,
    /// Assumed average speed for facility response
    pub facility_speed_kmh: f64,
    /// Nearest field units considered per case
    pub field_unit_candidates: usize,
    /// Nearest facilities considered per case
    pub facility_candidates: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            field_unit_speed_kmh: 40.0,
            facility_speed_kmh: 30.0,
            field_unit_candidates: 5,
            facility_candidates: 5,
        }
    }
}

impl DispatchConfig {
    /// Assumed speed for a candidate type.
    pub fn speed_for(&self, kind: ResponderKind) -> f64 {
        match kind {
            ResponderKind::FieldUnit => self.field_unit_speed_kmh,
            ResponderKind::Facility => self.facility_speed_kmh,
        }
    }
}

/// Placement of facilities without a geocode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EstimationConfig {
    /// Used when a facility has neither geocode nor area
    pub anchor: Option<Coordinate>,
    pub radius_meters: f64,
}

impl Default for EstimationConfig {
    fn default() -> Self {
        Self {
            anchor: None,
            radius_meters: 3000.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventBusConfig {
    /// Period of the recovery scan
    pub recovery_interval_secs: u64,
    /// A `processing` claim older than this is treated as a crashed delivery
    pub stale_claim_secs: u64,
    /// Upper bound for a single handler invocation
    pub handler_timeout_secs: u64,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            recovery_interval_secs: 30,
            stale_claim_secs: 300,
            handler_timeout_secs: 60,
        }
    }
}

impl EventBusConfig {
    pub fn recovery_interval(&self) -> Duration {
        Duration::from_secs(self.recovery_interval_secs)
    }

    pub fn stale_claim_after(&self) -> Duration {
        Duration::from_secs(self.stale_claim_secs)
    }

    pub fn handler_timeout(&self) -> Duration {
        Duration::from_secs(self.handler_timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive when RUST_LOG is unset
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "warn".to_string(),
        }
    }
}

/// Route events of one type to a registered agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionConfig {
    pub event: String,
    pub agent: String,
}

impl AppConfig {
    /// Parse a TOML document.
    pub fn from_toml_str(source: &str, origin: &Path) -> Result<Self, ConfigError> {
        toml::from_str(source).map_err(|e| ConfigError::ParseToml {
            path: origin.to_path_buf(),
            source: e,
        })
    }

    /// Reject values the engine cannot work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, speed) in [
            ("field_unit_speed_kmh", self.dispatch.field_unit_speed_kmh),
            ("facility_speed_kmh", self.dispatch.facility_speed_kmh),
        ] {
            if !speed.is_finite() {
                return Err(ConfigError::Invalid(format!("{} must be finite", name)));
            }
        }
        if self.dispatch.field_unit_candidates == 0 || self.dispatch.facility_candidates == 0 {
            return Err(ConfigError::Invalid(
                "candidate limits must be at least 1".into(),
            ));
        }
        if !self.estimation.radius_meters.is_finite() || self.estimation.radius_meters < 0.0 {
            return Err(ConfigError::Invalid(
                "estimation radius must be a non-negative number".into(),
            ));
        }
        if let Some(anchor) = self.estimation.anchor {
            anchor
                .validated()
                .map_err(|e| ConfigError::Invalid(format!("estimation anchor: {}", e)))?;
        }
        if self.events.recovery_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "recovery_interval_secs must be at least 1".into(),
            ));
        }
        if self.events.handler_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "handler_timeout_secs must be at least 1".into(),
            ));
        }
        // A claim released while its handlers still run gets delivered twice
        if self.events.stale_claim_secs <= self.events.handler_timeout_secs {
            return Err(ConfigError::Invalid(format!(
                "stale_claim_secs ({}) must exceed handler_timeout_secs ({})",
                self.events.stale_claim_secs, self.events.handler_timeout_secs
            )));
        }
        Ok(())
    }
}

/// Configuration loader with builder pattern.
///
/// # Example
///
/// ```ignore
/// use rescue_dispatch_core::config::ConfigLoader;
///
/// let config = ConfigLoader::new()
///     .with_file("/etc/rescue-dispatch.toml")
///     .skip_env_vars() // For testing
///     .load()?;
/// ```
#[derive(Debug, Clone, Default)]
pub struct ConfigLoader {
    file: Option<PathBuf>,
    skip_env: bool,
}

impl ConfigLoader {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Layer a TOML file over the defaults.
    #[must_use]
    pub fn with_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.file = Some(path.into());
        self
    }

    /// Skip environment variable loading.
    #[must_use]
    pub fn skip_env_vars(mut self) -> Self {
        self.skip_env = true;
        self
    }

    /// Load, merge and validate.
    pub fn load(&self) -> Result<AppConfig, ConfigError> {
        let mut config = match &self.file {
            Some(path) => {
                let source = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
                    path: path.clone(),
                    source: e,
                })?;
                debug!("Loaded config file {}", path.display());
                AppConfig::from_toml_str(&source, path)?
            }
            None => AppConfig::default(),
        };

        if !self.skip_env {
            apply_env_overrides(&mut config, |name| std::env::var(name).ok())?;
        }

        config.validate()?;
        Ok(config)
    }
}

/// Apply `RESCUE_*` overrides read through `lookup`.
fn apply_env_overrides<F>(config: &mut AppConfig, lookup: F) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(path) = lookup("RESCUE_DB_PATH") {
        config.storage.path = PathBuf::from(path);
    }
    if let Some(level) = lookup("RESCUE_LOG_LEVEL") {
        config.logging.level = level;
    }
    if let Some(value) = lookup("RESCUE_FIELD_UNIT_SPEED_KMH") {
        config.dispatch.field_unit_speed_kmh = parse_env("RESCUE_FIELD_UNIT_SPEED_KMH", &value)?;
    }
    if let Some(value) = lookup("RESCUE_FACILITY_SPEED_KMH") {
        config.dispatch.facility_speed_kmh = parse_env("RESCUE_FACILITY_SPEED_KMH", &value)?;
    }
    if let Some(value) = lookup("RESCUE_RECOVERY_INTERVAL_SECS") {
        config.events.recovery_interval_secs = parse_env("RESCUE_RECOVERY_INTERVAL_SECS", &value)?;
    }
    Ok(())
}

fn parse_env<T>(name: &str, value: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e: T::Err| ConfigError::invalid_env_var(name, e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.dispatch.speed_for(ResponderKind::FieldUnit), 40.0);
        assert_eq!(config.dispatch.speed_for(ResponderKind::Facility), 30.0);
        assert_eq!(config.events.recovery_interval(), Duration::from_secs(30));
    }

    #[test]
    fn test_parse_partial_toml() {
        let source = r#"
            [dispatch]
            field_unit_speed_kmh = 55.0

            [estimation]
            anchor = { latitude = 24.8607, longitude = 67.0011 }

            [[subscriptions]]
            event = "CaseCreated"
            agent = "pattern"
        "#;
        let config = AppConfig::from_toml_str(source, Path::new("test.toml")).unwrap();
        assert_eq!(config.dispatch.field_unit_speed_kmh, 55.0);
        assert_eq!(config.dispatch.facility_speed_kmh, 30.0);
        assert_eq!(config.estimation.anchor.unwrap().latitude, 24.8607);
        assert_eq!(config.subscriptions.len(), 1);
        assert_eq!(config.subscriptions[0].agent, "pattern");
    }

    #[test]
    fn test_parse_error_names_file() {
        let err = AppConfig::from_toml_str("[dispatch", Path::new("broken.toml")).unwrap_err();
        assert!(err.to_string().contains("broken.toml"));
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("RESCUE_DB_PATH", "/tmp/x.db"),
            ("RESCUE_FIELD_UNIT_SPEED_KMH", " 60 "),
            ("RESCUE_RECOVERY_INTERVAL_SECS", "5"),
        ]
        .into_iter()
        .collect();

        let mut config = AppConfig::default();
        apply_env_overrides(&mut config, |name| vars.get(name).map(|v| v.to_string())).unwrap();

        assert_eq!(config.storage.path, PathBuf::from("/tmp/x.db"));
        assert_eq!(config.dispatch.field_unit_speed_kmh, 60.0);
        assert_eq!(config.events.recovery_interval_secs, 5);
    }

    #[test]
    fn test_invalid_env_value() {
        let mut config = AppConfig::default();
        let err = apply_env_overrides(&mut config, |name| {
            (name == "RESCUE_FACILITY_SPEED_KMH").then(|| "fast".to_string())
        })
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidEnvVar { .. }));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = AppConfig::default();
        config.dispatch.facility_candidates = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.events.recovery_interval_secs = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.dispatch.field_unit_speed_kmh = f64::NAN;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.events.handler_timeout_secs = 0;
        assert!(config.validate().is_err());

        // Zero speed is allowed: it ranks as unreachable
        let mut config = AppConfig::default();
        config.dispatch.facility_speed_kmh = 0.0;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_stale_claim_must_outlast_handler_timeout() {
        let mut config = AppConfig::default();
        config.events.stale_claim_secs = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("stale_claim_secs"));

        config.events.stale_claim_secs = config.events.handler_timeout_secs;
        assert!(config.validate().is_err());

        config.events.stale_claim_secs = config.events.handler_timeout_secs + 1;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rescue.toml");
        std::fs::write(&path, "[events]\nhandler_timeout_secs = 7\n").unwrap();

        let config = ConfigLoader::new()
            .with_file(&path)
            .skip_env_vars()
            .load()
            .unwrap();
        assert_eq!(config.events.handler_timeout(), Duration::from_secs(7));
    }

    #[test]
    fn test_missing_file() {
        let err = ConfigLoader::new()
            .with_file("/definitely/not/here.toml")
            .skip_env_vars()
            .load()
            .unwrap_err();
        assert!(matches!(err, ConfigError::ReadFile { .. }));
    }
}
