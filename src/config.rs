//! Layered configuration for the serial engine.
//!
//! Values are read from `.serialforge/engine.toml`, then overridden by
//! environment variables (a `.env` file is loaded first if present), then by
//! CLI flags in the binary.
//!
//! # Configuration File Format
//!
//! ```toml
//! [engine]
//! generation_interval_secs = 5
//! monitor_interval_secs = 30
//! settle_delay_secs = 2
//! max_consecutive_errors = 10
//!
//! [allocator]
//! default_digits = 5
//! default_has_space = true
//! max_attempts = 3
//! backoff_base_ms = 1000
//! backoff_cap_ms = 10000
//! timeout_secs = 10
//!
//! [lookup]
//! enabled = true
//! base_url = "https://tgsouthernpower.org"
//! timeout_secs = 30
//! max_attempts = 3
//! retry_delay_ms = 1000
//!
//! [recorder]
//! backend = "sheets"
//! sheet_id = "1AbC..."
//!
//! [store]
//! path = ".serialforge/engine.db"
//!
//! [logging]
//! level = "info"
//! json = false
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::ConfigError;
use crate::store::models::MAX_DIGITS;

pub const CONFIG_DIR: &str = ".serialforge";
pub const CONFIG_FILE: &str = "engine.toml";

/// Scheduler, monitor and circuit-breaker timing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineSection {
    pub generation_interval_secs: u64,
    pub monitor_interval_secs: u64,
    pub settle_delay_secs: u64,
    pub max_consecutive_errors: u32,
    /// Timeout for the scheduler's own store reads and status writes.
    pub store_timeout_secs: u64,
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            generation_interval_secs: 5,
            monitor_interval_secs: 30,
            settle_delay_secs: 2,
            max_consecutive_errors: 10,
            store_timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AllocatorSection {
    pub default_digits: u32,
    pub default_has_space: bool,
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
    pub timeout_secs: u64,
}

impl Default for AllocatorSection {
    fn default() -> Self {
        Self {
            default_digits: 5,
            default_has_space: true,
            max_attempts: 3,
            backoff_base_ms: 1000,
            backoff_cap_ms: 10_000,
            timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LookupSection {
    pub enabled: bool,
    pub base_url: String,
    pub timeout_secs: u64,
    pub max_attempts: u32,
    pub retry_delay_ms: u64,
}

impl Default for LookupSection {
    fn default() -> Self {
        Self {
            enabled: true,
            base_url: "https://tgsouthernpower.org".to_string(),
            timeout_secs: 30,
            max_attempts: 3,
            retry_delay_ms: 1000,
        }
    }
}

/// Where positive findings are written.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum RecorderBackend {
    /// Local JSONL file.
    #[default]
    File,
    /// Google Sheets `values:append`.
    Sheets,
}

impl std::str::FromStr for RecorderBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "file" => Ok(Self::File),
            "sheets" => Ok(Self::Sheets),
            other => Err(format!("Invalid recorder backend '{}'. Valid values: file, sheets", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RecorderSection {
    pub backend: RecorderBackend,
    /// JSONL output for the file backend, relative to the project directory.
    pub path: PathBuf,
    pub sheet_id: Option<String>,
    pub sheets_api_url: String,
    /// OAuth bearer token; usually supplied through `SERIALFORGE_SHEETS_TOKEN`.
    #[serde(skip_serializing)]
    pub access_token: Option<String>,
    pub timeout_secs: u64,
    pub max_attempts: u32,
    pub retry_delay_ms: u64,
}

impl Default for RecorderSection {
    fn default() -> Self {
        Self {
            backend: RecorderBackend::File,
            path: PathBuf::from(CONFIG_DIR).join("results.jsonl"),
            sheet_id: None,
            sheets_api_url: "https://sheets.googleapis.com/v4".to_string(),
            access_token: None,
            timeout_secs: 30,
            max_attempts: 3,
            retry_delay_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StoreSection {
    pub path: PathBuf,
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            path: PathBuf::from(CONFIG_DIR).join("engine.db"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
    /// Directory for a daily rolling log file; stdout only when unset.
    pub file_dir: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            file_dir: None,
        }
    }
}

/// Complete engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    pub engine: EngineSection,
    pub allocator: AllocatorSection,
    pub lookup: LookupSection,
    pub recorder: RecorderSection,
    pub store: StoreSection,
    pub logging: LoggingConfig,
}

impl EngineConfig {
    pub fn config_path(project_dir: &Path) -> PathBuf {
        project_dir.join(CONFIG_DIR).join(CONFIG_FILE)
    }

    /// Load file then environment layers for a project directory.
    pub fn load(project_dir: &Path) -> Result<Self, ConfigError> {
        let path = Self::config_path(project_dir);
        let mut config = if path.exists() {
            Self::from_file(&path)?
        } else {
            Self::default()
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.resolve_paths(project_dir);
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn parse(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Apply `SERIALFORGE_*` overrides. `lookup` abstracts the environment
    /// so tests can inject values.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(path) = lookup("SERIALFORGE_DB_PATH") {
            self.store.path = PathBuf::from(path);
        }
        if let Some(raw) = lookup("SERIALFORGE_GENERATION_INTERVAL") {
            self.engine.generation_interval_secs =
                raw.trim().parse().map_err(|_| ConfigError::Invalid {
                    field: "SERIALFORGE_GENERATION_INTERVAL",
                    message: format!("'{}' is not a whole number of seconds", raw),
                })?;
        }
        if let Some(url) = lookup("SERIALFORGE_LOOKUP_URL") {
            self.lookup.base_url = url;
        }
        if let Some(raw) = lookup("SERIALFORGE_LOOKUP_ENABLED") {
            self.lookup.enabled = raw.trim() != "false" && raw.trim() != "0";
        }
        if let Some(raw) = lookup("SERIALFORGE_RECORDER") {
            self.recorder.backend = raw.parse().map_err(|message| ConfigError::Invalid {
                field: "SERIALFORGE_RECORDER",
                message,
            })?;
        }
        if let Some(id) = lookup("SERIALFORGE_SHEET_ID") {
            self.recorder.sheet_id = Some(id);
        }
        if let Some(token) = lookup("SERIALFORGE_SHEETS_TOKEN") {
            self.recorder.access_token = Some(token);
        }
        if let Some(level) = lookup("SERIALFORGE_LOG_LEVEL") {
            self.logging.level = level;
        }
        Ok(())
    }

    /// Anchor relative store/result/log paths at the project directory.
    pub fn resolve_paths(&mut self, project_dir: &Path) {
        if self.store.path.is_relative() {
            self.store.path = project_dir.join(&self.store.path);
        }
        if self.recorder.path.is_relative() {
            self.recorder.path = project_dir.join(&self.recorder.path);
        }
        if let Some(dir) = &self.logging.file_dir {
            if dir.is_relative() {
                self.logging.file_dir = Some(project_dir.join(dir));
            }
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        fn invalid(field: &'static str, message: &str) -> ConfigError {
            ConfigError::Invalid {
                field,
                message: message.to_string(),
            }
        }

        if self.engine.generation_interval_secs == 0 {
            return Err(invalid("engine.generation_interval_secs", "must be greater than zero"));
        }
        if self.engine.monitor_interval_secs == 0 {
            return Err(invalid("engine.monitor_interval_secs", "must be greater than zero"));
        }
        if self.engine.max_consecutive_errors == 0 {
            return Err(invalid("engine.max_consecutive_errors", "must be greater than zero"));
        }
        if self.allocator.default_digits == 0 || self.allocator.default_digits > MAX_DIGITS {
            return Err(invalid("allocator.default_digits", "must be between 1 and 12"));
        }
        if self.allocator.max_attempts == 0 {
            return Err(invalid("allocator.max_attempts", "must be at least 1"));
        }
        if self.allocator.backoff_cap_ms < self.allocator.backoff_base_ms {
            return Err(invalid("allocator.backoff_cap_ms", "must not be below backoff_base_ms"));
        }
        if !(5..=120).contains(&self.lookup.timeout_secs) {
            return Err(invalid("lookup.timeout_secs", "must be between 5 and 120"));
        }
        if !(1..=10).contains(&self.lookup.max_attempts) {
            return Err(invalid("lookup.max_attempts", "must be between 1 and 10"));
        }
        if self.recorder.max_attempts == 0 {
            return Err(invalid("recorder.max_attempts", "must be at least 1"));
        }
        if self.recorder.backend == RecorderBackend::Sheets && self.recorder.sheet_id.is_none() {
            return Err(invalid("recorder.sheet_id", "required for the sheets backend"));
        }
        Ok(())
    }

    pub fn generation_interval(&self) -> Duration {
        Duration::from_secs(self.engine.generation_interval_secs)
    }

    pub fn to_toml(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults_validate() {
        let config = EngineConfig::default();
        config.validate().unwrap();
        assert_eq!(config.engine.generation_interval_secs, 5);
        assert_eq!(config.engine.monitor_interval_secs, 30);
        assert_eq!(config.engine.max_consecutive_errors, 10);
        assert_eq!(config.allocator.max_attempts, 3);
        assert_eq!(config.allocator.default_digits, 5);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config = EngineConfig::parse(
            r#"
            [engine]
            generation_interval_secs = 1

            [allocator]
            default_digits = 4
            "#,
        )
        .unwrap();
        assert_eq!(config.engine.generation_interval_secs, 1);
        assert_eq!(config.engine.monitor_interval_secs, 30);
        assert_eq!(config.allocator.default_digits, 4);
        assert!(config.allocator.default_has_space);
    }

    #[test]
    fn test_env_overrides_file() {
        let env: HashMap<&str, &str> = [
            ("SERIALFORGE_GENERATION_INTERVAL", "9"),
            ("SERIALFORGE_RECORDER", "sheets"),
            ("SERIALFORGE_SHEET_ID", "sheet-123"),
            ("SERIALFORGE_LOOKUP_ENABLED", "false"),
        ]
        .into_iter()
        .collect();
        let mut config = EngineConfig::default();
        config
            .apply_env(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.engine.generation_interval_secs, 9);
        assert_eq!(config.recorder.backend, RecorderBackend::Sheets);
        assert_eq!(config.recorder.sheet_id.as_deref(), Some("sheet-123"));
        assert!(!config.lookup.enabled);
        config.validate().unwrap();
    }

    #[test]
    fn test_bad_env_interval_is_rejected() {
        let mut config = EngineConfig::default();
        let err = config
            .apply_env(|k| (k == "SERIALFORGE_GENERATION_INTERVAL").then(|| "soon".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains("SERIALFORGE_GENERATION_INTERVAL"));
    }

    #[test]
    fn test_validate_rejects_out_of_range_values() {
        let mut config = EngineConfig::default();
        config.allocator.default_digits = 13;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.lookup.timeout_secs = 2;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.recorder.backend = RecorderBackend::Sheets;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_relative_paths_resolve_against_project_dir() {
        let mut config = EngineConfig::default();
        config.resolve_paths(Path::new("/srv/app"));
        assert_eq!(config.store.path, PathBuf::from("/srv/app/.serialforge/engine.db"));
        assert_eq!(
            config.recorder.path,
            PathBuf::from("/srv/app/.serialforge/results.jsonl")
        );
    }

    #[test]
    fn test_load_reads_project_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join(CONFIG_DIR)).unwrap();
        std::fs::write(
            EngineConfig::config_path(dir.path()),
            "[engine]\nsettle_delay_secs = 7\n",
        )
        .unwrap();
        let config = EngineConfig::from_file(&EngineConfig::config_path(dir.path())).unwrap();
        assert_eq!(config.engine.settle_delay_secs, 7);
    }

    #[test]
    fn test_toml_round_trip_omits_token() {
        let mut config = EngineConfig::default();
        config.recorder.access_token = Some("secret".into());
        let text = config.to_toml().unwrap();
        assert!(!text.contains("secret"));
        let parsed = EngineConfig::parse(&text).unwrap();
        assert_eq!(parsed.engine, config.engine);
    }
}
