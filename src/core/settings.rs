//! Daemon settings read from `settings.toml` in the data directory.
//! Every field is optional; a missing file yields the defaults.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::core::prober::retry::{Backoff, RetryPolicy};

pub const SETTINGS_FILE: &str = "settings.toml";

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("invalid setting {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    pub schedule: ScheduleSettings,
    pub probe: ProbeSettings,
    pub execution: ExecutionSettings,
    pub github: GithubSettings,
    pub logging: LoggingSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct ScheduleSettings {
    pub repo_check_interval_secs: u64,
    pub server_check_interval_secs: u64,
}

impl Default for ScheduleSettings {
    fn default() -> Self {
        Self {
            repo_check_interval_secs: 24 * 60 * 60,
            server_check_interval_secs: 12 * 60 * 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct ProbeSettings {
    pub max_attempts: u32,
    pub retry_delay_secs: u64,
    pub backoff: Backoff,
    pub connect_timeout_secs: u64,
    pub liveness_command: String,
}

impl Default for ProbeSettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_delay_secs: 300,
            backoff: Backoff::Fixed,
            connect_timeout_secs: 10,
            liveness_command: "uptime".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct ExecutionSettings {
    pub timeout_secs: u64,
    pub remote_base_dir: String,
}

impl Default for ExecutionSettings {
    fn default() -> Self {
        Self {
            timeout_secs: 60 * 60,
            remote_base_dir: "~/rpr".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct GithubSettings {
    pub api_base_url: String,
    pub clone_base_url: String,
    pub request_timeout_secs: u64,
}

impl Default for GithubSettings {
    fn default() -> Self {
        Self {
            api_base_url: "https://api.github.com".to_string(),
            clone_base_url: "https://github.com".to_string(),
            request_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingSettings {
    pub level: String,
    pub retention_days: usize,
    pub dir: PathBuf,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            retention_days: 7,
            dir: PathBuf::from("logs"),
        }
    }
}

impl Settings {
    pub fn load(data_dir: &Path) -> Result<Self, SettingsError> {
        let path = data_dir.join(SETTINGS_FILE);
        let raw = match std::fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(source) => return Err(SettingsError::Io { path, source }),
        };
        Self::parse(&raw).map_err(|e| match e {
            SettingsError::Parse { source, .. } => SettingsError::Parse { path, source },
            other => other,
        })
    }

    pub fn parse(raw: &str) -> Result<Self, SettingsError> {
        let settings: Settings = toml::from_str(raw).map_err(|source| SettingsError::Parse {
            path: PathBuf::from(SETTINGS_FILE),
            source,
        })?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), SettingsError> {
        let nonzero = [
            ("schedule.repo_check_interval_secs", self.schedule.repo_check_interval_secs),
            ("schedule.server_check_interval_secs", self.schedule.server_check_interval_secs),
            ("probe.max_attempts", u64::from(self.probe.max_attempts)),
            ("probe.connect_timeout_secs", self.probe.connect_timeout_secs),
            ("execution.timeout_secs", self.execution.timeout_secs),
            ("github.request_timeout_secs", self.github.request_timeout_secs),
            ("logging.retention_days", self.logging.retention_days as u64),
        ];
        for (field, value) in nonzero {
            if value == 0 {
                return Err(SettingsError::Invalid {
                    field,
                    reason: "must be greater than zero".to_string(),
                });
            }
        }
        if self.probe.liveness_command.trim().is_empty() {
            return Err(SettingsError::Invalid {
                field: "probe.liveness_command",
                reason: "must not be empty".to_string(),
            });
        }
        Ok(())
    }

    pub fn repo_check_interval(&self) -> Duration {
        Duration::from_secs(self.schedule.repo_check_interval_secs)
    }

    pub fn server_check_interval(&self) -> Duration {
        Duration::from_secs(self.schedule.server_check_interval_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.probe.connect_timeout_secs)
    }

    pub fn execution_timeout(&self) -> Duration {
        Duration::from_secs(self.execution.timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.github.request_timeout_secs)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.probe.max_attempts,
            delay: Duration::from_secs(self.probe.retry_delay_secs),
            backoff: self.probe.backoff,
        }
    }

    /// Relative log directories resolve against the data directory.
    pub fn log_dir(&self, data_dir: &Path) -> PathBuf {
        if self.logging.dir.is_absolute() {
            self.logging.dir.clone()
        } else {
            data_dir.join(&self.logging.dir)
        }
    }
}
