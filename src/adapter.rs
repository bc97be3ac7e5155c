use std::{io::ErrorKind, path::Path, path::PathBuf, time::Duration};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::{process::Command, time::timeout};
use tracing::warn;
use url::Url;

use crate::error::ApiError;

const COOKIES_FILE: &str = "cookies.txt";
const OEMBED_ENDPOINT: &str = "https://www.youtube.com/oembed";
const OEMBED_TIMEOUT_SECONDS: u64 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Mp4,
    Mp3,
}

impl MediaKind {
    pub fn label(self) -> &'static str {
        match self {
            Self::Mp4 => "Highest MP4 (video + audio)",
            Self::Mp3 => "Highest MP3 (audio only)",
        }
    }
}

#[derive(Debug, Clone)]
pub struct MediaInfo {
    pub title: String,
    pub thumbnail: Option<String>,
}

/// Seam around the external media tool. Handlers only see this trait, so
/// tests can swap in a stub and assert it was (or was not) invoked.
#[async_trait]
pub trait MediaFetcher: Send + Sync {
    /// Metadata-only call; must finish within `limit` or fail.
    async fn probe(&self, url: &str, limit: Duration) -> Result<MediaInfo, ApiError>;

    /// Download call; writes exactly one media file into `dest_dir`.
    async fn fetch(
        &self,
        url: &str,
        kind: MediaKind,
        dest_dir: &Path,
        limit: Duration,
    ) -> Result<(), ApiError>;
}

/// Real implementation shelling out to `yt-dlp`.
pub struct YtDlpFetcher {
    http_client: reqwest::Client,
    cookies_file: PathBuf,
    ffmpeg_location: Option<PathBuf>,
}

impl YtDlpFetcher {
    pub fn new() -> Result<Self, ApiError> {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(OEMBED_TIMEOUT_SECONDS))
            .build()
            .map_err(|error| ApiError::internal(format!("Could not build HTTP client: {error}")))?;

        Ok(Self {
            http_client,
            cookies_file: PathBuf::from(COOKIES_FILE),
            ffmpeg_location: find_in_path("ffmpeg"),
        })
    }

    /// Last-resort metadata lookup via the YouTube oEmbed endpoint, used when
    /// the tool cannot produce parseable metadata for a YouTube URL.
    async fn oembed_info(&self, url: &str) -> Result<MediaInfo, ApiError> {
        #[derive(Debug, Deserialize)]
        struct OembedResponse {
            title: Option<String>,
            thumbnail_url: Option<String>,
        }

        let response = self
            .http_client
            .get(OEMBED_ENDPOINT)
            .query(&[("url", url), ("format", "json")])
            .send()
            .await
            .map_err(|error| ApiError::upstream(format!("oEmbed request failed: {error}")))?;

        if !response.status().is_success() {
            return Err(ApiError::upstream(format!(
                "oEmbed lookup failed with status {}",
                response.status()
            )));
        }

        let parsed: OembedResponse = response.json().await.map_err(|error| {
            ApiError::upstream_protocol(format!("Invalid oEmbed response: {error}"))
        })?;

        Ok(MediaInfo {
            title: parsed.title.unwrap_or_else(|| "YouTube Video".to_string()),
            thumbnail: parsed.thumbnail_url,
        })
    }
}

#[async_trait]
impl MediaFetcher for YtDlpFetcher {
    async fn probe(&self, url: &str, limit: Duration) -> Result<MediaInfo, ApiError> {
        let args = vec![
            "-J".to_string(),
            "--no-playlist".to_string(),
            "--no-warnings".to_string(),
            url.to_string(),
        ];

        let info = match run_yt_dlp(args, limit).await {
            Ok(output) => parse_probe_output(&output.stdout),
            Err(error) if error.code == Some("UPSTREAM_TIMEOUT") => return Err(error),
            Err(error) => Err(error),
        };

        match info {
            Ok(info) => Ok(info),
            Err(error) if is_youtube_url(url) => {
                warn!(
                    "yt-dlp metadata failed for {url:?} ({}); falling back to oEmbed",
                    error.message
                );
                self.oembed_info(url).await
            }
            Err(error) => Err(error),
        }
    }

    async fn fetch(
        &self,
        url: &str,
        kind: MediaKind,
        dest_dir: &Path,
        limit: Duration,
    ) -> Result<(), ApiError> {
        let cookies = self
            .cookies_file
            .exists()
            .then_some(self.cookies_file.as_path());
        let args = build_fetch_args(url, kind, dest_dir, cookies, self.ffmpeg_location.as_deref());
        run_yt_dlp(args, limit).await.map(|_| ())
    }
}

/// Resolves a binary on PATH once at startup, the way the original locates
/// ffmpeg before handing it to the tool.
fn find_in_path(binary: &str) -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(binary))
        .find(|candidate| candidate.is_file())
}

/// Argument vector for a download invocation. Inputs are always passed as
/// separate argv entries; nothing here goes through a shell.
fn build_fetch_args(
    url: &str,
    kind: MediaKind,
    dest_dir: &Path,
    cookies: Option<&Path>,
    ffmpeg: Option<&Path>,
) -> Vec<String> {
    let mut args = vec![
        "-o".to_string(),
        format!("{}/%(title).140B.%(ext)s", dest_dir.to_string_lossy()),
        "--no-playlist".to_string(),
        "--no-warnings".to_string(),
        "--geo-bypass".to_string(),
        "--retries".to_string(),
        "3".to_string(),
        "--socket-timeout".to_string(),
        "15".to_string(),
    ];

    if let Some(cookies) = cookies {
        args.push("--cookies".to_string());
        args.push(cookies.to_string_lossy().into_owned());
    }

    if let Some(ffmpeg) = ffmpeg {
        args.push("--ffmpeg-location".to_string());
        args.push(ffmpeg.to_string_lossy().into_owned());
    }

    match kind {
        MediaKind::Mp4 => {
            args.push("-f".to_string());
            args.push("bestvideo[ext=mp4]+bestaudio[ext=m4a]/best".to_string());
            args.push("--merge-output-format".to_string());
            args.push("mp4".to_string());
        }
        MediaKind::Mp3 => {
            args.push("-f".to_string());
            args.push("bestaudio/best".to_string());
            args.push("--extract-audio".to_string());
            args.push("--audio-format".to_string());
            args.push("mp3".to_string());
            args.push("--audio-quality".to_string());
            args.push("192K".to_string());
        }
    }

    args.push(url.to_string());
    args
}

async fn run_yt_dlp(args: Vec<String>, limit: Duration) -> Result<std::process::Output, ApiError> {
    let command_future = Command::new("yt-dlp")
        .args(args)
        .kill_on_drop(true)
        .output();

    let output = timeout(limit, command_future)
        .await
        .map_err(|_| ApiError::upstream_timeout())?
        .map_err(|error| {
            if error.kind() == ErrorKind::NotFound {
                ApiError::internal(
                    "yt-dlp is not installed. Install yt-dlp and restart the server.",
                )
            } else {
                ApiError::internal(format!("Could not run yt-dlp: {error}"))
            }
        })?;

    if !output.status.success() {
        return Err(ApiError::upstream(diagnostic_from_stderr(&output.stderr)));
    }

    Ok(output)
}

fn parse_probe_output(stdout: &[u8]) -> Result<MediaInfo, ApiError> {
    #[derive(Debug, Deserialize)]
    struct YtDlpProbe {
        title: Option<String>,
        thumbnail: Option<String>,
    }

    let probe: YtDlpProbe = serde_json::from_slice(stdout)
        .map_err(|error| ApiError::upstream_protocol(format!("Invalid yt-dlp output: {error}")))?;

    Ok(MediaInfo {
        title: probe
            .title
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| "Untitled".to_string()),
        thumbnail: probe.thumbnail,
    })
}

/// Picks the last non-empty stderr line as the client-facing diagnostic.
fn diagnostic_from_stderr(stderr: &[u8]) -> String {
    let message = String::from_utf8_lossy(stderr)
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .next_back()
        .unwrap_or("yt-dlp could not complete the operation")
        .to_string();

    if message.to_ascii_lowercase().contains("unsupported url") {
        "The URL is not supported for download.".to_string()
    } else {
        message
    }
}

fn is_youtube_url(input: &str) -> bool {
    let Ok(parsed) = Url::parse(input) else {
        return false;
    };
    let Some(host) = parsed.host_str().map(str::to_ascii_lowercase) else {
        return false;
    };

    ["youtube.com", "youtu.be"]
        .iter()
        .any(|domain| host == *domain || host.ends_with(&format!(".{domain}")))
}
