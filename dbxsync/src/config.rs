use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono_tz::Tz;
use dbx_core::OAuthToken;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use serde_json::ser::PrettyFormatter;
use thiserror::Error;

use crate::sync::transfer::{DEFAULT_BUCKET_SIZE, DEFAULT_PROGRESS_INTERVAL};

pub const CONFIG_ENV: &str = "DBXSYNC_CONFIG";
const CONFIG_DIR_NAME: &str = "dbxsync";
const CONFIG_FILE_NAME: &str = "config.json";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file {0} does not exist")]
    Missing(PathBuf),
    #[error("failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("malformed config {path}: {source}")]
    Malformed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("DROPBOX_LOCATION is not set")]
    MissingLocation,
    #[error("unknown time zone: {0}")]
    UnknownTimeZone(String),
    #[error("no config directory available; set {CONFIG_ENV}")]
    NoConfigDir,
}

/// The persisted JSON document. Keys this program does not know about are
/// carried through unchanged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigDocument {
    #[serde(rename = "DROPBOX_LOCATION", default, skip_serializing_if = "Option::is_none")]
    pub dropbox_location: Option<String>,
    #[serde(rename = "TIME_ZONE", default, skip_serializing_if = "Option::is_none")]
    pub time_zone: Option<String>,
    #[serde(rename = "APP_KEY", default, skip_serializing_if = "Option::is_none")]
    pub app_key: Option<String>,
    #[serde(rename = "APP_SECRET", default, skip_serializing_if = "Option::is_none")]
    pub app_secret: Option<String>,
    #[serde(rename = "ACCESS_TOKEN", default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    #[serde(rename = "REFRESH_TOKEN", default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(rename = "GITIGNORE_OVERRIDES", default)]
    pub ignore_overrides: BTreeSet<String>,
    #[serde(rename = "DBX_IGNORE", default)]
    pub always_ignore: BTreeSet<String>,
    #[serde(rename = "TIME_LAST_SYNCED_FROM_CLOUD", default)]
    pub synced_from_cloud: BTreeMap<String, String>,
    #[serde(rename = "TIME_LAST_SYNCED_FROM_LOCAL", default)]
    pub synced_from_local: BTreeMap<String, String>,
    /// Pre-split push map, migrated away on the next ledger save.
    #[serde(rename = "SYNCED_PATHS", default, skip_serializing_if = "Option::is_none")]
    pub legacy_synced_paths: Option<BTreeMap<String, String>>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl ConfigDocument {
    /// Document written once the setup flow has obtained a token.
    pub fn new_from_setup(
        dropbox_location: impl Into<String>,
        time_zone: impl Into<String>,
        app_key: impl Into<String>,
        app_secret: impl Into<String>,
        token: &OAuthToken,
    ) -> Self {
        Self {
            dropbox_location: Some(dropbox_location.into()),
            time_zone: Some(time_zone.into()),
            app_key: Some(app_key.into()),
            app_secret: Some(app_secret.into()),
            access_token: Some(token.access_token.clone()),
            refresh_token: token.refresh_token.clone(),
            ..Self::default()
        }
    }

    pub fn read(path: &Path) -> Result<Self, ConfigError> {
        let raw = match std::fs::read(path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(ConfigError::Missing(path.to_path_buf()));
            }
            Err(source) => {
                return Err(ConfigError::Io {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };
        serde_json::from_slice(&raw).map_err(|source| ConfigError::Malformed {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Writes the document with four-space indentation via a temp file and rename.
    pub fn write(&self, path: &Path) -> Result<(), ConfigError> {
        let io_err = |source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        };
        let mut buf = Vec::new();
        let mut serializer =
            serde_json::Serializer::with_formatter(&mut buf, PrettyFormatter::with_indent(b"    "));
        self.serialize(&mut serializer)
            .map_err(|source| ConfigError::Malformed {
                path: path.to_path_buf(),
                source,
            })?;
        buf.push(b'\n');

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        let mut tmp_name = path.file_name().unwrap_or_default().to_os_string();
        tmp_name.push(".tmp");
        let tmp = path.with_file_name(tmp_name);
        std::fs::write(&tmp, &buf).map_err(io_err)?;
        std::fs::rename(&tmp, path).map_err(io_err)?;
        Ok(())
    }

    /// Configured zone; `UTC` when unset.
    pub fn time_zone(&self) -> Result<Tz, ConfigError> {
        match self.time_zone.as_deref().map(str::trim) {
            None | Some("") => Ok(chrono_tz::UTC),
            Some(name) => name
                .parse::<Tz>()
                .map_err(|_| ConfigError::UnknownTimeZone(name.to_string())),
        }
    }
}

/// Runtime settings derived from the config document and the environment.
#[derive(Debug, Clone)]
pub struct SyncSettings {
    pub config_path: PathBuf,
    pub local_root: PathBuf,
    pub time_zone: Tz,
    pub bucket_size: u64,
    pub progress_interval: Duration,
}

impl SyncSettings {
    pub fn load() -> Result<(Self, ConfigDocument), ConfigError> {
        let path = default_config_path()?;
        let document = ConfigDocument::read(&path)?;
        let settings = Self::from_document(path, &document)?;
        Ok((settings, document))
    }

    pub fn from_document(config_path: PathBuf, document: &ConfigDocument) -> Result<Self, ConfigError> {
        let location = document
            .dropbox_location
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .ok_or(ConfigError::MissingLocation)?;
        let local_root = match dirs::home_dir() {
            Some(home) => expand_with_home(location, &home),
            None => PathBuf::from(location),
        };
        Ok(Self {
            config_path,
            local_root,
            time_zone: document.time_zone()?,
            bucket_size: read_u64_env("DBXSYNC_BUCKET_SIZE", DEFAULT_BUCKET_SIZE),
            progress_interval: Duration::from_millis(read_u64_env(
                "DBXSYNC_PROGRESS_INTERVAL_MS",
                DEFAULT_PROGRESS_INTERVAL.as_millis() as u64,
            )),
        })
    }
}

pub fn default_config_path() -> Result<PathBuf, ConfigError> {
    if let Some(path) = std::env::var_os(CONFIG_ENV).filter(|value| !value.is_empty()) {
        return Ok(PathBuf::from(path));
    }
    dirs::config_dir()
        .map(|dir| dir.join(CONFIG_DIR_NAME).join(CONFIG_FILE_NAME))
        .ok_or(ConfigError::NoConfigDir)
}

fn expand_with_home(value: &str, home: &Path) -> PathBuf {
    if value == "~" {
        return home.to_path_buf();
    }
    if let Some(rest) = value.strip_prefix("~/") {
        return home.join(rest);
    }
    PathBuf::from(value)
}

fn read_u64_env(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(default)
}
