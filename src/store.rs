use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::warn;
use uuid::Uuid;

use crate::error::ApiError;

const MAX_STEM_CHARS: usize = 140;
const STAGING_PREFIX: &str = ".staging-";

const AUDIO_EXTENSIONS: [&str; 7] = ["mp3", "m4a", "aac", "wav", "ogg", "opus", "flac"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactKind {
    Video,
    Audio,
}

/// One produced file currently living in the store.
#[derive(Debug, Clone, Serialize)]
pub struct Artifact {
    pub name: String,
    #[serde(skip)]
    pub path: PathBuf,
    pub kind: ArtifactKind,
    pub size_bytes: u64,
    pub modified_at: DateTime<Utc>,
}

/// Directory of downloaded files shared between request handlers and the
/// retention reaper.
///
/// Writes go through a per-call staging directory and land under their final
/// name with an atomic rename, so `list` and `open` never observe a partial
/// file. Deleting a file that a client holds open only unlinks the directory
/// entry; the open handle keeps streaming the old contents.
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub async fn new(root: impl Into<PathBuf>) -> Result<Self, ApiError> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await.map_err(|error| {
            ApiError::internal(format!("Could not create downloads directory: {error}"))
        })?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Runs `produce` against a fresh staging directory, then publishes the
    /// single file it wrote under a sanitized name. On any failure the staging
    /// directory is removed and nothing becomes visible.
    pub async fn put<F, Fut>(&self, produce: F) -> Result<Artifact, ApiError>
    where
        F: FnOnce(PathBuf) -> Fut,
        Fut: Future<Output = Result<(), ApiError>>,
    {
        let staging = self
            .root
            .join(format!("{STAGING_PREFIX}{}", Uuid::new_v4()));
        tokio::fs::create_dir_all(&staging).await.map_err(|error| {
            ApiError::store_write_failed(format!("Could not prepare staging directory: {error}"))
        })?;

        let result = self.publish(&staging, produce(staging.clone()).await).await;
        remove_dir_best_effort(&staging).await;
        result
    }

    async fn publish(
        &self,
        staging: &Path,
        produced: Result<(), ApiError>,
    ) -> Result<Artifact, ApiError> {
        produced?;

        let source = newest_file(staging)
            .await?
            .ok_or_else(|| ApiError::store_write_failed("The download produced no file."))?;

        let metadata = tokio::fs::metadata(&source).await.map_err(|error| {
            ApiError::store_write_failed(format!("Could not inspect downloaded file: {error}"))
        })?;
        if metadata.len() == 0 {
            return Err(ApiError::store_write_failed(
                "The download produced an empty file.",
            ));
        }

        let name = sanitize_file_name(
            source
                .file_name()
                .and_then(|value| value.to_str())
                .unwrap_or("download.bin"),
        );
        let target = self.root.join(&name);

        // Atomic within one filesystem; a reader of a replaced file keeps its
        // open handle on the old inode.
        tokio::fs::rename(&source, &target).await.map_err(|error| {
            ApiError::store_write_failed(format!("Could not publish downloaded file: {error}"))
        })?;

        let modified_at = metadata
            .modified()
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());

        Ok(Artifact {
            kind: kind_for_name(&name),
            size_bytes: metadata.len(),
            path: target,
            name,
            modified_at,
        })
    }

    /// Enumerates all published artifacts. Staging directories and anything
    /// else hidden are skipped.
    pub async fn list(&self) -> Result<Vec<Artifact>, ApiError> {
        let mut entries = tokio::fs::read_dir(&self.root).await.map_err(|error| {
            ApiError::internal(format!("Could not read downloads directory: {error}"))
        })?;

        let mut artifacts = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(|error| {
            ApiError::internal(format!("Could not list downloads directory: {error}"))
        })? {
            let Some(name) = entry.file_name().to_str().map(ToString::to_string) else {
                continue;
            };
            // Only names that open/delete would accept; anything else dropped
            // into the directory out-of-band is not ours to manage.
            if !is_safe_name(&name) {
                continue;
            }

            let metadata = match entry.metadata().await {
                Ok(metadata) if metadata.is_file() => metadata,
                Ok(_) => continue,
                Err(error) => {
                    warn!("Could not read metadata of {:?}: {error}", entry.path());
                    continue;
                }
            };

            let modified_at = metadata
                .modified()
                .map(DateTime::<Utc>::from)
                .unwrap_or_else(|_| Utc::now());

            artifacts.push(Artifact {
                kind: kind_for_name(&name),
                size_bytes: metadata.len(),
                path: entry.path(),
                name,
                modified_at,
            });
        }

        Ok(artifacts)
    }

    /// Opens an artifact for streaming. The file handle is acquired before
    /// returning, so a delete racing with the stream cannot truncate it.
    pub async fn open(&self, name: &str) -> Result<(tokio::fs::File, Artifact), ApiError> {
        let path = self.resolve(name)?;

        let file = match tokio::fs::File::open(&path).await {
            Ok(file) => file,
            Err(error) if error.kind() == ErrorKind::NotFound => {
                return Err(ApiError::not_found());
            }
            Err(error) => {
                return Err(ApiError::internal(format!(
                    "Could not open downloaded file: {error}"
                )));
            }
        };

        let metadata = file.metadata().await.map_err(|error| {
            ApiError::internal(format!("Could not read downloaded file metadata: {error}"))
        })?;
        if !metadata.is_file() {
            return Err(ApiError::not_found());
        }

        let modified_at = metadata
            .modified()
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());

        let artifact = Artifact {
            name: name.to_string(),
            kind: kind_for_name(name),
            size_bytes: metadata.len(),
            path,
            modified_at,
        };

        Ok((file, artifact))
    }

    /// Removes an artifact. Deleting a name that no longer exists is fine.
    pub async fn delete(&self, name: &str) -> Result<(), ApiError> {
        let path = self.resolve(name)?;

        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(error) if error.kind() == ErrorKind::NotFound => Ok(()),
            Err(error) => Err(ApiError::internal(format!(
                "Could not delete {name:?}: {error}"
            ))),
        }
    }

    fn resolve(&self, name: &str) -> Result<PathBuf, ApiError> {
        if !is_safe_name(name) {
            return Err(ApiError::not_found());
        }
        Ok(self.root.join(name))
    }
}

/// Shared by `resolve` and `list` so every enumerated name is also one that
/// `open` and `delete` accept.
fn is_safe_name(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with('.')
        && !name.contains('/')
        && !name.contains('\\')
        && !name.contains("..")
}

async fn newest_file(dir: &Path) -> Result<Option<PathBuf>, ApiError> {
    let mut entries = tokio::fs::read_dir(dir).await.map_err(|error| {
        ApiError::store_write_failed(format!("Could not open staging directory: {error}"))
    })?;

    let mut newest: Option<(std::time::SystemTime, PathBuf)> = None;
    while let Some(entry) = entries.next_entry().await.map_err(|error| {
        ApiError::store_write_failed(format!("Could not read staging directory: {error}"))
    })? {
        let Ok(metadata) = entry.metadata().await else {
            continue;
        };
        if !metadata.is_file() {
            continue;
        }

        let modified = metadata
            .modified()
            .unwrap_or(std::time::SystemTime::UNIX_EPOCH);
        if newest
            .as_ref()
            .is_none_or(|(current, _)| modified > *current)
        {
            newest = Some((modified, entry.path()));
        }
    }

    Ok(newest.map(|(_, path)| path))
}

async fn remove_dir_best_effort(dir: &Path) {
    if let Err(error) = tokio::fs::remove_dir_all(dir).await
        && error.kind() != ErrorKind::NotFound
    {
        warn!("Could not clean staging directory {dir:?}: {error}");
    }
}

fn kind_for_name(name: &str) -> ArtifactKind {
    let extension = Path::new(name)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
        .unwrap_or_default();

    if AUDIO_EXTENSIONS.contains(&extension.as_str()) {
        ArtifactKind::Audio
    } else {
        ArtifactKind::Video
    }
}

/// Restricts a tool-derived filename to a safe character set and bounded
/// length before it touches the filesystem or a header.
pub fn sanitize_file_name(value: &str) -> String {
    let path = Path::new(value);
    let stem = path
        .file_stem()
        .and_then(|value| value.to_str())
        .unwrap_or("download");
    let extension = path
        .extension()
        .and_then(|value| value.to_str())
        .map(|ext| ext.to_ascii_lowercase());

    let mut sanitized: String = stem
        .chars()
        .map(|character| {
            if character.is_ascii_alphanumeric()
                || matches!(character, '-' | '_' | ' ' | '(' | ')')
            {
                character
            } else {
                '_'
            }
        })
        .take(MAX_STEM_CHARS)
        .collect();

    sanitized = sanitized.trim().trim_matches('_').trim().to_string();
    if sanitized.is_empty() {
        sanitized = "download".to_string();
    }

    match extension {
        Some(extension) if !extension.is_empty() => format!("{sanitized}.{extension}"),
        _ => sanitized,
    }
}
