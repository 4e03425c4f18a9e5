//! Controller options, read from flags or the environment.

use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::builder::BoolishValueParser;
use clap::{Args, ValueEnum};
use explode_core::config::{
    api_url, token_from_pod, BlobSourceUrl, ExplodeConfig, LogLevel, DEFAULT_BLOB_SOURCE,
    DEFAULT_RESYNC_SECS, DEFAULT_STORAGE_ROOT, SERVICE_ACCOUNT_DIR,
};
use explode_core::error::{ExplodeError, Result};
use explode_core::ImageReference;

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Options shared by every command.
#[derive(Args, Debug, Clone)]
pub struct ControllerArgs {
    /// API server host
    #[arg(long, global = true, env = "KUBERNETES_SERVICE_HOST", default_value = "")]
    pub api_host: String,

    /// API server port
    #[arg(long, global = true, env = "KUBERNETES_SERVICE_PORT", default_value = "")]
    pub api_port: String,

    /// Bearer token (default: the pod's service-account token)
    #[arg(long, global = true, env = "KUBERNETES_SERVICE_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    /// Namespace to watch (empty = all namespaces)
    #[arg(long, global = true, env = "OS_WATCH_NAMESPACE", default_value = "")]
    pub namespace: String,

    /// Storage root holding pointers, checkouts and the repository
    #[arg(long, global = true, env = "OSTREE_REPO_PATH", default_value = DEFAULT_STORAGE_ROOT)]
    pub storage_root: PathBuf,

    /// Where layer blobs are read from (only file:// is supported)
    #[arg(long, global = true, env = "OS_IMAGE_BLOB_SOURCE", default_value = DEFAULT_BLOB_SOURCE)]
    pub blob_source: String,

    /// Skip TLS certificate validation towards the API
    #[arg(
        long,
        global = true,
        env = "OS_WATCH_INSECURE",
        num_args = 0..=1,
        default_value = "false",
        default_missing_value = "true",
        value_parser = BoolishValueParser::new()
    )]
    pub insecure: bool,

    /// Local registry service host, for pullthrough filtering
    #[arg(long, global = true, env = "DOCKER_REGISTRY_SERVICE_HOST", default_value = "")]
    pub registry_host: String,

    /// Local registry service port, for pullthrough filtering
    #[arg(long, global = true, env = "DOCKER_REGISTRY_SERVICE_PORT", default_value = "")]
    pub registry_port: String,

    /// Seconds between full re-deliveries of all image streams
    #[arg(long, global = true, env = "OS_WATCH_RESYNC_SECS", default_value_t = DEFAULT_RESYNC_SECS)]
    pub resync_secs: u64,

    /// Log level when RUST_LOG is unset
    #[arg(long, global = true, env = "OS_EXPLODE_LOG_LEVEL", default_value = "info")]
    pub log_level: LogLevel,

    /// Log format
    #[arg(long, global = true, env = "OS_EXPLODE_LOG_FORMAT", value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,
}

impl ControllerArgs {
    /// Build and validate the controller configuration, reading the token
    /// from the pod's service account when none was given.
    pub fn into_config(self) -> Result<ExplodeConfig> {
        self.into_config_with_pod_dir(Path::new(SERVICE_ACCOUNT_DIR))
    }

    pub fn into_config_with_pod_dir(self, pod_dir: &Path) -> Result<ExplodeConfig> {
        let api_url = api_url(&self.api_host, &self.api_port)?;
        let blob_source = BlobSourceUrl::parse(&self.blob_source)?;
        let token = match self.token.filter(|t| !t.trim().is_empty()) {
            Some(token) => token,
            None => token_from_pod(pod_dir)?,
        };

        let config = ExplodeConfig {
            api_url,
            token,
            namespace: Some(self.namespace).filter(|ns| !ns.is_empty()),
            storage_root: self.storage_root,
            blob_source,
            insecure: self.insecure,
            registry_host: format!("{}:{}", self.registry_host, self.registry_port),
            resync_interval: Duration::from_secs(self.resync_secs.max(1)),
            log_level: self.log_level,
        };
        config.validate()?;
        Ok(config)
    }
}

/// Parse `namespace/name/tag`.
pub fn parse_reference(raw: &str) -> Result<ImageReference> {
    let parts: Vec<&str> = raw.split('/').collect();
    match parts.as_slice() {
        [namespace, name, tag] => ImageReference::new(*namespace, *name, *tag),
        _ => Err(ExplodeError::InvalidReference(format!(
            "{:?}: expected namespace/name/tag",
            raw
        ))),
    }
}
