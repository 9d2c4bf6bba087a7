//! Post-delivery file handling: archive folder and retention sweep.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::cache::policy::ArchivePolicy;
use crate::core::data::FileReference;
use crate::core::error::Result;

/// How often the retention sweep runs. A startup sweep runs first, so
/// files that expired while the gateway was down do not wait an hour.
const SWEEP_INTERVAL: Duration = Duration::from_secs(3600);

/// Moves or deletes files after successful delivery and enforces the
/// archive retention window.
pub struct Archiver {
    connector_id: String,
    policy: ArchivePolicy,
    archive_dir: PathBuf,
}

impl Archiver {
    /// Create an archiver storing files under `<cache_dir>/archive`.
    pub fn new(connector_id: impl Into<String>, policy: ArchivePolicy, cache_dir: &Path) -> Self {
        Self {
            connector_id: connector_id.into(),
            policy,
            archive_dir: cache_dir.join("archive"),
        }
    }

    /// Where archived files land.
    pub fn archive_dir(&self) -> &Path {
        &self.archive_dir
    }

    /// Dispose of a staged file after its entry was delivered.
    ///
    /// With archiving enabled the file moves into the archive folder;
    /// otherwise it is deleted. A file that is already gone counts as
    /// finalized.
    pub async fn finalize(&self, file: &FileReference) -> Result<()> {
        if self.policy.enabled {
            tokio::fs::create_dir_all(&self.archive_dir).await?;
            let dest = self.archive_dir.join(file.file_name().unwrap_or("file"));
            match tokio::fs::rename(&file.path, &dest).await {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                // Rename fails across filesystems; fall back to copy.
                Err(_) => {
                    tokio::fs::copy(&file.path, &dest).await?;
                    tokio::fs::remove_file(&file.path).await?;
                    Ok(())
                }
            }
        } else {
            match tokio::fs::remove_file(&file.path).await {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(e.into()),
            }
        }
    }

    /// Delete archived files older than the retention window.
    ///
    /// Returns how many files were removed. Zero retention keeps
    /// archived files forever.
    pub async fn sweep_once(&self) -> Result<usize> {
        if !self.policy.enabled || self.policy.retention.is_zero() {
            return Ok(0);
        }
        let mut dir = match tokio::fs::read_dir(&self.archive_dir).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let now = SystemTime::now();
        let mut removed = 0usize;
        while let Some(entry) = dir.next_entry().await? {
            let path = entry.path();
            let modified = match entry.metadata().await.and_then(|m| m.modified()) {
                Ok(t) => t,
                Err(e) => {
                    tracing::warn!("Skipping archived file {:?}: {}", path, e);
                    continue;
                }
            };
            let age = now.duration_since(modified).unwrap_or_default();
            if age > self.policy.retention {
                match tokio::fs::remove_file(&path).await {
                    Ok(()) => removed += 1,
                    Err(e) => tracing::warn!("Failed to delete archived file {:?}: {}", path, e),
                }
            }
        }
        if removed > 0 {
            tracing::info!(
                "Connector '{}' retention sweep removed {} archived file(s)",
                self.connector_id,
                removed
            );
        }
        Ok(removed)
    }

    /// Run the retention sweep now and then once per hour until
    /// cancelled.
    pub fn spawn_sweeper(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let archiver = self.clone();
        tokio::spawn(async move {
            loop {
                if let Err(e) = archiver.sweep_once().await {
                    tracing::warn!(
                        "Connector '{}' retention sweep failed: {}",
                        archiver.connector_id,
                        e
                    );
                }
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(SWEEP_INTERVAL) => {}
                }
            }
        })
    }
}

impl std::fmt::Debug for Archiver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Archiver")
            .field("connector_id", &self.connector_id)
            .field("enabled", &self.policy.enabled)
            .field("archive_dir", &self.archive_dir)
            .finish()
    }
}
