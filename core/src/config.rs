use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{ExplodeError, Result};

/// Subdirectory of the storage root holding the content-store repository.
pub const REPO_SUBDIR: &str = ".repo";

/// Default blob source: a docker registry's storage mounted locally.
pub const DEFAULT_BLOB_SOURCE: &str = "file:///registry/";

/// Default storage root.
pub const DEFAULT_STORAGE_ROOT: &str = "/explode/";

/// Default interval at which the watch collaborator re-delivers every stream.
pub const DEFAULT_RESYNC_SECS: u64 = 600;

/// Service account mount providing the API token inside a pod.
pub const SERVICE_ACCOUNT_DIR: &str = "/var/run/secrets/kubernetes.io/serviceaccount";

/// Controller configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExplodeConfig {
    /// Base URL of the API server (e.g. `https://172.30.0.1:443`)
    pub api_url: String,

    /// Bearer token for the API
    #[serde(skip_serializing)]
    pub token: String,

    /// Namespace to watch (None = all namespaces)
    pub namespace: Option<String>,

    /// Root of the on-disk state (pointers, checkouts, repository)
    pub storage_root: PathBuf,

    /// Where layer blobs are read from
    pub blob_source: BlobSourceUrl,

    /// Skip TLS certificate validation towards the API
    pub insecure: bool,

    /// `host:port` of the locally-owned registry, used for pullthrough filtering
    pub registry_host: String,

    /// How often the full stream list is re-delivered
    pub resync_interval: Duration,

    /// Log level
    pub log_level: LogLevel,
}

impl ExplodeConfig {
    /// Path of the content-store repository.
    pub fn repo_path(&self) -> PathBuf {
        self.storage_root.join(REPO_SUBDIR)
    }

    /// Validate cross-field constraints.
    pub fn validate(&self) -> Result<()> {
        if self.api_url.is_empty() {
            return Err(ExplodeError::ConfigError("API URL must not be empty".to_string()));
        }
        if self.storage_root.as_os_str().is_empty() {
            return Err(ExplodeError::ConfigError(
                "Storage root must not be empty".to_string(),
            ));
        }
        if self.token.trim().is_empty() {
            return Err(ExplodeError::AuthError("No available token".to_string()));
        }
        Ok(())
    }
}

/// API base URL from the service host and port.
pub fn api_url(host: &str, port: &str) -> Result<String> {
    if host.is_empty() {
        return Err(ExplodeError::ConfigError(
            "KUBERNETES_SERVICE_HOST is not set".to_string(),
        ));
    }
    if port.is_empty() {
        Ok(format!("https://{}", host))
    } else {
        Ok(format!("https://{}:{}", host, port))
    }
}

/// Read the service-account token from a pod's secret mount.
pub fn token_from_pod(dir: &Path) -> Result<String> {
    let path = dir.join("token");
    std::fs::read_to_string(&path)
        .map(|t| t.trim().to_string())
        .map_err(|e| {
            ExplodeError::AuthError(format!("No available token at {}: {}", path.display(), e))
        })
}

/// Location layer blobs are read from.
///
/// Only `file://` is supported; other schemes fail at parse time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BlobSourceUrl {
    url: String,
    path: PathBuf,
}

impl BlobSourceUrl {
    pub fn parse(raw: &str) -> Result<Self> {
        let url = reqwest::Url::parse(raw).map_err(|e| {
            ExplodeError::ConfigError(format!("Couldn't parse blob source {:?}: {}", raw, e))
        })?;
        match url.scheme() {
            "file" => {
                let path = url.to_file_path().map_err(|_| {
                    ExplodeError::ConfigError(format!("Blob source {:?} is not a local path", raw))
                })?;
                Ok(Self {
                    url: url.to_string(),
                    path,
                })
            }
            scheme => Err(ExplodeError::ConfigError(format!(
                "BlobSource scheme not implemented: {}",
                scheme
            ))),
        }
    }

    /// Local root of the registry storage.
    pub fn local_path(&self) -> &Path {
        &self.path
    }

    pub fn as_str(&self) -> &str {
        &self.url
    }
}

impl Default for BlobSourceUrl {
    fn default() -> Self {
        Self {
            url: DEFAULT_BLOB_SOURCE.to_string(),
            path: PathBuf::from("/registry/"),
        }
    }
}

impl TryFrom<String> for BlobSourceUrl {
    type Error = ExplodeError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<BlobSourceUrl> for String {
    fn from(source: BlobSourceUrl) -> Self {
        source.url
    }
}

impl std::str::FromStr for BlobSourceUrl {
    type Err = ExplodeError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// Log level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for tracing::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Error => tracing::Level::ERROR,
        }
    }
}

impl std::str::FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            "warn" | "warning" => Ok(Self::Warn),
            "error" => Ok(Self::Error),
            _ => Err(format!(
                "unknown log level: '{}' (supported: debug, info, warn, error)",
                s
            )),
        }
    }
}
