//! TOML configuration with environment overrides.
//!
//! Every section and field is optional; omitted values take the defaults
//! below. `PERCH_LOG_LEVEL` and `PERCH_STORAGE_PATH` override the file.

use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use serde::Deserialize;
use tracing::info;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config is not valid TOML (line {line}, column {column}): {message}")]
    InvalidToml {
        line: usize,
        column: usize,
        message: String,
    },

    #[error("config value {field} is invalid: {message}")]
    InvalidValue { field: String, message: String },

    #[error("could not read or write config file: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub account: AccountConfig,
    pub logging: LoggingConfig,
    pub event_bus: EventBusConfig,
    pub storage: StorageConfig,
    pub ingest: IngestConfig,
    pub queue: QueueConfig,
}

/// The bot's own identity, used for self detection before credentials arrive.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AccountConfig {
    pub id: Option<String>,
    pub lid: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EventBusConfig {
    pub channel_capacity: usize,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 1024,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub path: Option<String>,
}

/// A hysteresis window: grows up to `cap`, then trims to the `keep` newest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct WindowConfig {
    pub cap: usize,
    pub keep: usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    pub batch_size: usize,
    pub message_window: WindowConfig,
    pub quoted_window: WindowConfig,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            message_window: WindowConfig { cap: 20, keep: 15 },
            quoted_window: WindowConfig { cap: 30, keep: 20 },
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub aux_capacity: usize,
    pub noise_capacity: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            aux_capacity: 4096,
            noise_capacity: 1024,
        }
    }
}

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

const DEFAULT_CONFIG_TOML: &str = r#"[account]
# id = "15551234567@s.whatsapp.net"
# lid = "881273900001@lid"

[logging]
level = "info"
json = false

[event_bus]
channel_capacity = 1024

[storage]
# path = "~/.local/share/perch/perch.db"

[ingest]
batch_size = 10
message_window = { cap = 20, keep = 15 }
quoted_window = { cap = 30, keep = 20 }

[queue]
aux_capacity = 4096
noise_capacity = 1024
"#;

impl Config {
    /// Parse and validate without consulting the environment.
    pub fn parse(source: &str) -> Result<Self, ConfigError> {
        Self::parse_with_env(source, |_| None)
    }

    fn parse_with_env(
        source: &str,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let mut config: Config = toml::from_str(source).map_err(|error| {
            let offset = error.span().map_or(0, |span| span.start);
            let (line, column) = position(source, offset);
            ConfigError::InvalidToml {
                line,
                column,
                message: error.message().to_string(),
            }
        })?;

        if let Some(level) = env("PERCH_LOG_LEVEL") {
            config.logging.level = level;
        }
        if let Some(path) = env("PERCH_STORAGE_PATH") {
            config.storage.path = Some(path);
        }

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |field: &str, message: String| ConfigError::InvalidValue {
            field: field.to_string(),
            message,
        };

        if !LOG_LEVELS.contains(&self.logging.level.as_str()) {
            return Err(invalid(
                "logging.level",
                format!("expected one of {}", LOG_LEVELS.join(", ")),
            ));
        }
        if self.ingest.batch_size == 0 {
            return Err(invalid("ingest.batch_size", "must be at least 1".into()));
        }
        let windows = [
            ("ingest.message_window", self.ingest.message_window),
            ("ingest.quoted_window", self.ingest.quoted_window),
        ];
        for (field, WindowConfig { cap, keep }) in windows {
            if keep == 0 || keep > cap {
                return Err(invalid(field, format!("keep {keep} is outside 1..={cap}")));
            }
        }
        Ok(())
    }
}

/// 1-based line and column of a byte offset.
fn position(source: &str, offset: usize) -> (usize, usize) {
    let before = &source[..offset.min(source.len())];
    let line = before.matches('\n').count() + 1;
    let column = match before.rfind('\n') {
        Some(newline) => offset - newline,
        None => offset + 1,
    };
    (line, column)
}

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("com", "perch", "perch")
}

/// The platform config file location.
pub fn config_path() -> PathBuf {
    project_dirs().map_or_else(
        || PathBuf::from("config.toml"),
        |dirs| dirs.config_dir().join("config.toml"),
    )
}

/// The platform database location, used when neither the CLI nor the config
/// names one.
pub fn default_storage_path() -> PathBuf {
    project_dirs().map_or_else(
        || PathBuf::from("perch.db"),
        |dirs| dirs.data_dir().join("perch.db"),
    )
}

pub fn load_config() -> Result<Config, ConfigError> {
    load_config_from(config_path())
}

/// Load from `path`, writing the default file first if there is none.
pub fn load_config_from(path: PathBuf) -> Result<Config, ConfigError> {
    let source = read_or_create(&path)?;
    Config::parse_with_env(&source, env_var)
}

/// Parse a TOML string, applying environment overrides.
pub fn load_config_from_str(source: &str) -> Result<Config, ConfigError> {
    Config::parse_with_env(source, env_var)
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok()
}

fn read_or_create(path: &Path) -> Result<String, ConfigError> {
    match std::fs::read_to_string(path) {
        Ok(source) => Ok(source),
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(path, DEFAULT_CONFIG_TOML)?;
            info!(path = %path.display(), "wrote default configuration");
            Ok(DEFAULT_CONFIG_TOML.to_string())
        }
        Err(error) => Err(error.into()),
    }
}
