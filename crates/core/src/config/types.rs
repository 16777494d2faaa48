use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::time::Duration;

use crate::params::{GenerationParams, ParameterOverrides, TextureSize};

/// Root configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub processing: ProcessingConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub api: ApiConfig,
}

/// Remote generation service endpoints and connection policy.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// WebSocket endpoint of the generation service. `/ws` is appended when missing.
    #[serde(default = "default_websocket_url")]
    pub websocket_url: String,
    /// REST endpoint used for side fetches of artifact references.
    #[serde(default = "default_rest_api_url")]
    pub rest_api_url: String,
    /// Channel acquisition and submission acknowledgment timeout.
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
    /// Reconnection attempts before in-flight tasks are failed.
    #[serde(default = "default_reconnect_attempts")]
    pub reconnect_attempts: u32,
    /// Fixed delay between reconnection attempts.
    #[serde(default = "default_reconnect_delay_seconds")]
    pub reconnect_delay_seconds: u64,
    /// A channel with no traffic and no routed tasks for this long is closed.
    #[serde(default = "default_idle_timeout_seconds")]
    pub idle_timeout_seconds: u64,
    /// Wall-clock ceiling for a single task, from submission to completion.
    #[serde(default = "default_task_timeout_seconds")]
    pub task_timeout_seconds: u64,
}

impl ServerConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_seconds)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_seconds)
    }

    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.task_timeout_seconds)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            websocket_url: default_websocket_url(),
            rest_api_url: default_rest_api_url(),
            timeout_seconds: default_timeout_seconds(),
            reconnect_attempts: default_reconnect_attempts(),
            reconnect_delay_seconds: default_reconnect_delay_seconds(),
            idle_timeout_seconds: default_idle_timeout_seconds(),
            task_timeout_seconds: default_task_timeout_seconds(),
        }
    }
}

fn default_websocket_url() -> String {
    "ws://localhost:5000".to_string()
}

fn default_rest_api_url() -> String {
    "http://localhost:8000".to_string()
}

fn default_timeout_seconds() -> u64 {
    60
}

fn default_reconnect_attempts() -> u32 {
    3
}

fn default_reconnect_delay_seconds() -> u64 {
    2
}

fn default_idle_timeout_seconds() -> u64 {
    300
}

fn default_task_timeout_seconds() -> u64 {
    1800
}

/// Generation parameter defaults and named presets.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProcessingConfig {
    #[serde(default)]
    pub default_parameters: GenerationParams,
    #[serde(default = "default_presets")]
    pub parameter_presets: BTreeMap<String, ParameterOverrides>,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            default_parameters: GenerationParams::default(),
            parameter_presets: default_presets(),
        }
    }
}

fn default_presets() -> BTreeMap<String, ParameterOverrides> {
    let preset = |sparse_steps, slat_steps, texture_size: TextureSize| ParameterOverrides {
        sparse_steps: Some(sparse_steps),
        slat_steps: Some(slat_steps),
        texture_size: Some(texture_size.pixels()),
        ..Default::default()
    };

    BTreeMap::from([
        ("fast".to_string(), preset(8, 8, TextureSize::Px512)),
        ("balanced".to_string(), preset(12, 12, TextureSize::Px1024)),
        ("quality".to_string(), preset(20, 16, TextureSize::Px2048)),
    ])
}

/// Local directories and cache policy.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
    #[serde(default = "default_download_dir")]
    pub download_dir: PathBuf,
    /// Artifacts fetched over the REST side channel land here before caching.
    #[serde(default = "default_api_download_dir")]
    pub api_download_dir: PathBuf,
    #[serde(default = "default_session_dir")]
    pub session_dir: PathBuf,
    #[serde(default = "default_metadata_dir")]
    pub metadata_dir: PathBuf,
    /// Cached artifacts older than this are purged by the periodic sweep.
    #[serde(default = "default_cleanup_hours")]
    pub cleanup_temp_files_hours: u64,
    #[serde(default = "default_max_cache_size_mb")]
    pub max_cache_size_mb: u64,
    /// Artifacts younger than this are never evicted for size.
    #[serde(default = "default_min_retention_seconds")]
    pub min_retention_seconds: u64,
    #[serde(default = "default_sweep_interval_minutes")]
    pub sweep_interval_minutes: u64,
}

impl StorageConfig {
    pub fn max_cache_bytes(&self) -> u64 {
        self.max_cache_size_mb.saturating_mul(1024 * 1024)
    }

    pub fn max_age(&self) -> Duration {
        Duration::from_secs(self.cleanup_temp_files_hours.saturating_mul(3600))
    }

    pub fn min_retention(&self) -> Duration {
        Duration::from_secs(self.min_retention_seconds)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_minutes.saturating_mul(60))
    }

    /// Same settings with every directory rebased under `root`. Used by tests.
    pub fn rooted_at(root: &std::path::Path) -> Self {
        Self {
            download_dir: root.join(default_download_dir()),
            api_download_dir: root.join(default_api_download_dir()),
            session_dir: root.join(default_session_dir()),
            metadata_dir: root.join(default_metadata_dir()),
            ..Default::default()
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            download_dir: default_download_dir(),
            api_download_dir: default_api_download_dir(),
            session_dir: default_session_dir(),
            metadata_dir: default_metadata_dir(),
            cleanup_temp_files_hours: default_cleanup_hours(),
            max_cache_size_mb: default_max_cache_size_mb(),
            min_retention_seconds: default_min_retention_seconds(),
            sweep_interval_minutes: default_sweep_interval_minutes(),
        }
    }
}

fn default_download_dir() -> PathBuf {
    PathBuf::from("trellis_downloads")
}

fn default_api_download_dir() -> PathBuf {
    PathBuf::from("trellis_api_downloads")
}

fn default_session_dir() -> PathBuf {
    PathBuf::from("trellis_sessions")
}

fn default_metadata_dir() -> PathBuf {
    PathBuf::from("trellis_metadata")
}

fn default_cleanup_hours() -> u64 {
    24
}

fn default_max_cache_size_mb() -> u64 {
    1024
}

fn default_min_retention_seconds() -> u64 {
    10
}

fn default_sweep_interval_minutes() -> u64 {
    30
}

/// Log output settings. `RUST_LOG` takes precedence over `level`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Emit JSON lines instead of the human-readable format.
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Local HTTP API served by the `trellis` binary.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ApiConfig {
    #[serde(default = "default_api_host")]
    pub host: IpAddr,
    #[serde(default = "default_api_port")]
    pub port: u16,
    /// Largest accepted request body; submissions carry base64 images.
    #[serde(default = "default_max_request_body_mb")]
    pub max_request_body_mb: u64,
}

impl ApiConfig {
    pub fn max_request_body_bytes(&self) -> usize {
        usize::try_from(self.max_request_body_mb.saturating_mul(1024 * 1024)).unwrap_or(usize::MAX)
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_api_host(),
            port: default_api_port(),
            max_request_body_mb: default_max_request_body_mb(),
        }
    }
}

fn default_api_host() -> IpAddr {
    IpAddr::V4(Ipv4Addr::LOCALHOST)
}

fn default_api_port() -> u16 {
    8190
}

fn default_max_request_body_mb() -> u64 {
    64
}

/// Config for API responses. URLs lose credentials and query strings.
#[derive(Debug, Clone, Serialize)]
pub struct SanitizedConfig {
    pub server: SanitizedServerConfig,
    pub processing: ProcessingConfig,
    pub storage: StorageConfig,
    pub api: ApiConfig,
}

#[derive(Debug, Clone, Serialize)]
pub struct SanitizedServerConfig {
    pub websocket_url: String,
    pub rest_api_url: String,
    pub timeout_seconds: u64,
    pub reconnect_attempts: u32,
    pub reconnect_delay_seconds: u64,
    pub idle_timeout_seconds: u64,
    pub task_timeout_seconds: u64,
}

impl From<&Config> for SanitizedConfig {
    fn from(config: &Config) -> Self {
        let server = &config.server;
        Self {
            server: SanitizedServerConfig {
                websocket_url: redact_url(&server.websocket_url),
                rest_api_url: redact_url(&server.rest_api_url),
                timeout_seconds: server.timeout_seconds,
                reconnect_attempts: server.reconnect_attempts,
                reconnect_delay_seconds: server.reconnect_delay_seconds,
                idle_timeout_seconds: server.idle_timeout_seconds,
                task_timeout_seconds: server.task_timeout_seconds,
            },
            processing: config.processing.clone(),
            storage: config.storage.clone(),
            api: config.api.clone(),
        }
    }
}

/// Strip `user:pass@` and `?query` from a URL.
fn redact_url(url: &str) -> String {
    let without_query = url.split(['?', '#']).next().unwrap_or(url);
    match without_query.split_once("://") {
        Some((scheme, rest)) => {
            let (authority, path) = match rest.find('/') {
                Some(idx) => rest.split_at(idx),
                None => (rest, ""),
            };
            let host = authority.rsplit('@').next().unwrap_or(authority);
            format!("{}://{}{}", scheme, host, path)
        }
        None => without_query.to_string(),
    }
}
