use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::io::AsyncReadExt;
use tracing::{debug, info, warn};

use super::archive::{self, ArchiveError, Extracted};
use super::content_hash::content_hash_file;
use super::progress::ProgressPoller;
use crate::remote::{RemoteEntry, RemoteError, RemoteStore};

/// 50 MB, in decimal units.
pub const DEFAULT_BUCKET_SIZE: u64 = 50 * 1000 * 1000;
pub const DEFAULT_PROGRESS_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("remote error: {0}")]
    Remote(#[from] RemoteError),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("archive error: {0}")]
    Archive(#[from] ArchiveError),
    #[error("download integrity check failed: expected {expected}, got {actual}")]
    IntegrityMismatch { expected: String, actual: String },
    #[error("background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error("{0} changed size during upload")]
    ShortRead(PathBuf),
}

impl TransferError {
    /// Whether the same transfer may succeed when tried again later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, TransferError::Remote(err) if err.is_retryable())
    }
}

/// How a file of a given size goes over the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadPlan {
    Single,
    /// Lengths of every append, in order. Never ends with an empty bucket.
    Session(Vec<u64>),
}

pub fn upload_plan(size: u64, bucket_size: u64) -> UploadPlan {
    let bucket_size = bucket_size.max(1);
    if size < bucket_size {
        return UploadPlan::Single;
    }
    let full = size / bucket_size;
    let remainder = size % bucket_size;
    let mut buckets = vec![bucket_size; full as usize];
    if remainder > 0 {
        buckets.push(remainder);
    }
    UploadPlan::Session(buckets)
}

/// Cursor for one chunked upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadSession {
    pub session_id: String,
    pub offset: u64,
    pub bucket_size: u64,
}

#[derive(Clone)]
pub struct TransferClient {
    remote: Arc<dyn RemoteStore>,
    bucket_size: u64,
    progress_interval: Duration,
}

impl TransferClient {
    pub fn new(remote: Arc<dyn RemoteStore>) -> Self {
        Self {
            remote,
            bucket_size: DEFAULT_BUCKET_SIZE,
            progress_interval: DEFAULT_PROGRESS_INTERVAL,
        }
    }

    pub fn with_bucket_size(mut self, bucket_size: u64) -> Self {
        self.bucket_size = bucket_size.max(1);
        self
    }

    pub fn with_progress_interval(mut self, interval: Duration) -> Self {
        self.progress_interval = interval;
        self
    }

    pub fn remote(&self) -> &Arc<dyn RemoteStore> {
        &self.remote
    }

    /// Uploads `local` to `remote`, overwriting it. Large files go through an
    /// upload session; a failed session is abandoned for the server to expire.
    pub async fn upload(&self, local: &Path, remote: &str) -> Result<RemoteEntry, TransferError> {
        let size = tokio::fs::metadata(local).await?.len();
        match upload_plan(size, self.bucket_size) {
            UploadPlan::Single => {
                let contents = tokio::fs::read(local).await?;
                debug!(path = %local.display(), size, "single upload");
                Ok(self.remote.upload(contents, remote).await?)
            }
            UploadPlan::Session(buckets) => {
                let session_id = self.remote.upload_session_start().await?;
                let mut session = UploadSession {
                    session_id,
                    offset: 0,
                    bucket_size: self.bucket_size,
                };
                match self.upload_buckets(local, remote, &mut session, &buckets).await {
                    Ok(entry) => Ok(entry),
                    Err(err) => {
                        warn!(
                            session_id = %session.session_id,
                            offset = session.offset,
                            path = %local.display(),
                            "upload session abandoned"
                        );
                        Err(err)
                    }
                }
            }
        }
    }

    async fn upload_buckets(
        &self,
        local: &Path,
        remote: &str,
        session: &mut UploadSession,
        buckets: &[u64],
    ) -> Result<RemoteEntry, TransferError> {
        let mut file = tokio::fs::File::open(local).await?;
        for &length in buckets {
            let mut chunk = Vec::with_capacity(length as usize);
            let read = (&mut file).take(length).read_to_end(&mut chunk).await?;
            if read as u64 != length {
                return Err(TransferError::ShortRead(local.to_path_buf()));
            }
            self.remote
                .upload_session_append(&session.session_id, session.offset, chunk)
                .await?;
            session.offset += length;
            debug!(session_id = %session.session_id, offset = session.offset, "bucket appended");
        }
        Ok(self
            .remote
            .upload_session_finish(&session.session_id, session.offset, remote)
            .await?)
    }

    /// Downloads a file into `local`, or a folder's subtree into
    /// `local.parent()` by way of a temporary archive.
    pub async fn download(
        &self,
        remote: &str,
        local: &Path,
        is_file: bool,
    ) -> Result<Downloaded, TransferError> {
        if is_file {
            self.download_file(remote, local).await.map(Downloaded::File)
        } else {
            self.download_folder(remote, local, |_, _| false)
                .await
                .map(Downloaded::Folder)
        }
    }

    pub async fn download_file(
        &self,
        remote: &str,
        local: &Path,
    ) -> Result<RemoteEntry, TransferError> {
        if let Some(parent) = local.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let partial = partial_path(local);
        let total = self.remote.get_metadata(remote).await?.size;
        let poller = ProgressPoller::spawn(partial.clone(), total, self.progress_interval);
        let result = self.remote.download_to_file(&partial, remote).await;
        poller.finish().await;

        let entry = match result {
            Ok(entry) => entry,
            Err(err) => {
                let _ = tokio::fs::remove_file(&partial).await;
                return Err(err.into());
            }
        };
        if let Some(expected) = entry.content_hash.as_deref() {
            let check = partial.clone();
            let actual = tokio::task::spawn_blocking(move || content_hash_file(&check)).await??;
            if actual != expected {
                let _ = tokio::fs::remove_file(&partial).await;
                return Err(TransferError::IntegrityMismatch {
                    expected: expected.to_string(),
                    actual,
                });
            }
        }
        tokio::fs::rename(&partial, local).await?;
        info!(path = %local.display(), "downloaded");
        Ok(entry)
    }

    /// Fetches the folder as `<local>.zip`, expands it next to `local` and
    /// removes the archive. Entries `skip` rejects are not written.
    pub async fn download_folder<F>(
        &self,
        remote: &str,
        local: &Path,
        skip: F,
    ) -> Result<Extracted, TransferError>
    where
        F: FnMut(&Path, bool) -> bool + Send + 'static,
    {
        let destination = local
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        tokio::fs::create_dir_all(&destination).await?;
        let archive_path = archive_path(local);

        let total: u64 = self
            .remote
            .list_folder(remote, true)
            .await?
            .iter()
            .filter(|entry| entry.is_file)
            .map(|entry| entry.size)
            .sum();
        let poller = ProgressPoller::spawn(archive_path.clone(), total, self.progress_interval);
        let result = self
            .remote
            .download_archive_to_file(&archive_path, remote)
            .await;
        poller.finish().await;
        if let Err(err) = result {
            let _ = tokio::fs::remove_file(&archive_path).await;
            return Err(err.into());
        }

        let source = archive_path.clone();
        let extracted = tokio::task::spawn_blocking(move || {
            archive::extract(&source, &destination, skip)
        })
        .await?;
        tokio::fs::remove_file(&archive_path).await?;
        let extracted = extracted?;
        info!(
            path = %local.display(),
            files = extracted.files.len(),
            skipped = extracted.skipped,
            "folder expanded"
        );
        Ok(extracted)
    }
}

#[derive(Debug)]
pub enum Downloaded {
    File(RemoteEntry),
    Folder(Extracted),
}

pub fn partial_path(target: &Path) -> PathBuf {
    suffixed(target, "partial")
}

pub fn archive_path(target: &Path) -> PathBuf {
    suffixed(target, "zip")
}

fn suffixed(target: &Path, suffix: &str) -> PathBuf {
    let mut name = target.file_name().unwrap_or_default().to_os_string();
    name.push(".");
    name.push(suffix);
    target.with_file_name(name)
}
