//! Runtime settings.
//!
//! Settings come from an optional JSON file and are then overridden by
//! `AGENT_RELAY_*` environment variables. Every field has a default, so a
//! missing file is not an error.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::archive::ArchiveLimits;
use crate::tracker::DEFAULT_EXCLUDED_PATTERNS;

/// Environment variable naming an explicit settings file.
pub const CONFIG_PATH_ENV: &str = "AGENT_RELAY_CONFIG";
const ENV_PREFIX: &str = "AGENT_RELAY_";
const MIB: u64 = 1024 * 1024;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("JSON error in {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("Invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },
}

/// Version-control target used by `/publish`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PublishSettings {
    /// Local checkout the session files are copied into.
    pub repo_path: PathBuf,
    /// Cloned into `repo_path` when the checkout does not exist yet.
    pub remote_url: Option<String>,
    pub ssh_key_path: Option<PathBuf>,
    pub git_user_name: String,
    pub git_user_email: String,
}

impl Default for PublishSettings {
    fn default() -> Self {
        Self {
            repo_path: PathBuf::from("published"),
            remote_url: None,
            ssh_key_path: None,
            git_user_name: "agent-relay".to_string(),
            git_user_email: "agent-relay@localhost".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Base URL of the agent's HTTP API.
    pub agent_api_url: String,
    /// Executable launched for every invocation.
    pub agent_command: String,
    /// Parent directory of all session folders.
    pub work_dir: PathBuf,
    /// Changed-file count up to which files are sent one by one.
    pub max_files_before_archive: usize,
    pub max_file_size_mb: u64,
    pub max_archive_size_mb: u64,
    pub excluded_file_patterns: Vec<String>,
    pub invocation_timeout_secs: u64,
    pub http_timeout_secs: u64,
    pub publish: PublishSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            agent_api_url: "http://localhost:8000".to_string(),
            agent_command: "opencode".to_string(),
            work_dir: PathBuf::from("work_place"),
            max_files_before_archive: 10,
            max_file_size_mb: 45,
            max_archive_size_mb: 45,
            excluded_file_patterns: DEFAULT_EXCLUDED_PATTERNS
                .iter()
                .map(|p| p.to_string())
                .collect(),
            invocation_timeout_secs: 300,
            http_timeout_secs: 60,
            publish: PublishSettings::default(),
        }
    }
}

impl Settings {
    pub fn max_file_size_bytes(&self) -> u64 {
        self.max_file_size_mb * MIB
    }

    pub fn max_archive_size_bytes(&self) -> u64 {
        self.max_archive_size_mb * MIB
    }

    pub fn invocation_timeout(&self) -> Duration {
        Duration::from_secs(self.invocation_timeout_secs)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    pub fn archive_limits(&self) -> ArchiveLimits {
        ArchiveLimits {
            max_file_size: self.max_file_size_bytes(),
            max_archive_size: self.max_archive_size_bytes(),
            max_individual_files: self.max_files_before_archive,
        }
    }
}

/// Default settings file location: `<config dir>/agent-relay/settings.json`.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("agent-relay").join("settings.json"))
}

/// Load settings from the configured file (if any) plus the process environment.
pub fn load() -> Result<Settings, ConfigError> {
    let path = std::env::var_os(CONFIG_PATH_ENV)
        .map(PathBuf::from)
        .or_else(default_config_path);

    let settings = match path {
        Some(path) => load_from(&path)?,
        None => Settings::default(),
    };
    apply_overrides(settings, std::env::vars())
}

/// Read a settings file. A missing file yields the defaults.
pub fn load_from(path: &Path) -> Result<Settings, ConfigError> {
    if !path.exists() {
        log::debug!("No settings file at {}, using defaults", path.display());
        return Ok(Settings::default());
    }

    let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&content).map_err(|source| ConfigError::Json {
        path: path.to_path_buf(),
        source,
    })
}

/// Apply `AGENT_RELAY_*` overrides. Unknown keys are ignored.
pub fn apply_overrides<I>(mut settings: Settings, vars: I) -> Result<Settings, ConfigError>
where
    I: IntoIterator<Item = (String, String)>,
{
    for (key, value) in vars {
        let Some(name) = key.strip_prefix(ENV_PREFIX) else {
            continue;
        };
        match name {
            "API_URL" => settings.agent_api_url = value,
            "COMMAND" => settings.agent_command = value,
            "WORK_DIR" => settings.work_dir = PathBuf::from(value),
            "MAX_FILES_BEFORE_ARCHIVE" => {
                settings.max_files_before_archive = parse_number(&key, &value)?
            }
            "MAX_FILE_SIZE_MB" => settings.max_file_size_mb = parse_number(&key, &value)?,
            "MAX_ARCHIVE_SIZE_MB" => settings.max_archive_size_mb = parse_number(&key, &value)?,
            "TIMEOUT_SECS" => settings.invocation_timeout_secs = parse_number(&key, &value)?,
            "HTTP_TIMEOUT_SECS" => settings.http_timeout_secs = parse_number(&key, &value)?,
            "EXCLUDED_PATTERNS" => {
                settings.excluded_file_patterns = value
                    .split(',')
                    .map(str::trim)
                    .filter(|p| !p.is_empty())
                    .map(str::to_string)
                    .collect()
            }
            "PUBLISH_REPO" => settings.publish.repo_path = PathBuf::from(value),
            "PUBLISH_REMOTE" => settings.publish.remote_url = Some(value),
            "PUBLISH_SSH_KEY" => settings.publish.ssh_key_path = Some(PathBuf::from(value)),
            _ => {}
        }
    }
    Ok(settings)
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    })
}
