use std::{io::ErrorKind, path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::error::ApiError;

const DEFAULT_TTL_SECONDS: u64 = 15 * 60;
const DEFAULT_SWEEP_INTERVAL_SECONDS: u64 = 60;
const DEFAULT_INFO_TIMEOUT_SECONDS: u64 = 30;
const DEFAULT_DOWNLOAD_TIMEOUT_SECONDS: u64 = 180;
const DEFAULT_MAX_CONCURRENT_DOWNLOADS: usize = 3;

/// On-disk shape of `config.json`. Created with a fresh API key on first run.
#[derive(Debug, Serialize, Deserialize)]
struct ConfigFile {
    api_key: String,
    #[serde(default = "default_ttl_seconds")]
    ttl_seconds: u64,
    #[serde(default = "default_sweep_interval_seconds")]
    sweep_interval_seconds: u64,
}

fn default_ttl_seconds() -> u64 {
    DEFAULT_TTL_SECONDS
}

fn default_sweep_interval_seconds() -> u64 {
    DEFAULT_SWEEP_INTERVAL_SECONDS
}

/// Runtime configuration, built once at startup and passed by reference into
/// handlers and the reaper. No module-level state.
#[derive(Debug, Clone)]
pub struct Config {
    pub api_key: String,
    pub bind_addr: String,
    pub downloads_dir: PathBuf,
    pub ttl: Duration,
    pub sweep_interval: Duration,
    pub info_timeout: Duration,
    pub download_timeout: Duration,
    pub max_concurrent_downloads: usize,
}

impl Config {
    /// Reads `config.json` next to the working directory, creating it with a
    /// generated API key when absent. A filesystem failure here is fatal to
    /// startup; everything past this point is recoverable per request.
    pub async fn load_or_create(path: &std::path::Path) -> Result<Self, ApiError> {
        let file = match tokio::fs::read_to_string(path).await {
            Ok(contents) => serde_json::from_str::<ConfigFile>(&contents).map_err(|error| {
                ApiError::internal(format!("Invalid config file {path:?}: {error}"))
            })?,
            Err(error) if error.kind() == ErrorKind::NotFound => {
                let file = ConfigFile {
                    api_key: Uuid::new_v4().to_string(),
                    ttl_seconds: DEFAULT_TTL_SECONDS,
                    sweep_interval_seconds: DEFAULT_SWEEP_INTERVAL_SECONDS,
                };
                let payload = serde_json::to_string_pretty(&file).map_err(|error| {
                    ApiError::internal(format!("Could not serialize config: {error}"))
                })?;
                tokio::fs::write(path, payload).await.map_err(|error| {
                    ApiError::internal(format!("Could not write config file {path:?}: {error}"))
                })?;
                info!("Generated new API key {} in {path:?}", file.api_key);
                file
            }
            Err(error) => {
                return Err(ApiError::internal(format!(
                    "Could not open config file {path:?}: {error}"
                )));
            }
        };

        let downloads_dir = std::env::var("DOWNLOADS_DIR")
            .ok()
            .and_then(|value| non_empty(&value).map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from("downloads"));

        let max_concurrent_downloads = read_usize_env("MAX_CONCURRENT_DOWNLOADS")
            .filter(|value| *value > 0)
            .unwrap_or(DEFAULT_MAX_CONCURRENT_DOWNLOADS);

        Ok(Self {
            api_key: file.api_key,
            bind_addr: resolve_bind_addr(),
            downloads_dir,
            ttl: Duration::from_secs(file.ttl_seconds),
            sweep_interval: Duration::from_secs(file.sweep_interval_seconds.max(1)),
            info_timeout: Duration::from_secs(DEFAULT_INFO_TIMEOUT_SECONDS),
            download_timeout: Duration::from_secs(DEFAULT_DOWNLOAD_TIMEOUT_SECONDS),
            max_concurrent_downloads,
        })
    }
}

fn read_usize_env(name: &str) -> Option<usize> {
    std::env::var(name)
        .ok()
        .and_then(|value| value.trim().parse::<usize>().ok())
}

fn resolve_bind_addr() -> String {
    if let Some(configured) = std::env::var("APP_ADDR")
        .ok()
        .and_then(|value| non_empty(&value).map(ToString::to_string))
    {
        return configured;
    }

    if let Some(port) = std::env::var("PORT")
        .ok()
        .and_then(|value| value.trim().parse::<u16>().ok())
    {
        return format!("0.0.0.0:{port}");
    }

    "127.0.0.1:5000".to_string()
}

pub fn non_empty(value: &str) -> Option<&str> {
    let trimmed = value.trim();
    if trimmed.is_empty() { None } else { Some(trimmed) }
}
