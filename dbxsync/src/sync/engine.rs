use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono_tz::Tz;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::ignore::{IgnoreError, IgnoreLists, IgnoreMatcher};
use super::ledger::{Ledger, LedgerDelta, LedgerError, LedgerStore};
use super::paths::{PathError, join_remote, local_path_for, remote_path_for};
use super::timestamp::{Timestamp, from_system_time};
use super::transfer::{Downloaded, TransferClient, TransferError};
use super::walker::{LocalEntry, LocalWalker, WalkError};
use crate::config::SyncSettings;
use crate::remote::{RemoteError, RemoteStore};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),
    #[error("walk error: {0}")]
    Walk(#[from] WalkError),
    #[error("ignore rules error: {0}")]
    Ignore(#[from] IgnoreError),
    #[error("path error: {0}")]
    Path(#[from] PathError),
    #[error("transfer error: {0}")]
    Transfer(#[from] TransferError),
    #[error("remote error: {0}")]
    Remote(#[from] RemoteError),
    #[error("background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error("{0} has no server modification time")]
    MissingServerTime(String),
}

/// What happened to one candidate path during a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemState {
    Ignored,
    Unchanged,
    Transferred,
    Failed,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub transferred: Vec<String>,
    pub unchanged: usize,
    pub ignored: usize,
    /// Path and reason for every item whose transfer failed.
    pub failed: Vec<(String, String)>,
}

impl SyncReport {
    fn note(&mut self, path: &str, state: ItemState) {
        match state {
            ItemState::Ignored => self.ignored += 1,
            ItemState::Unchanged => self.unchanged += 1,
            ItemState::Transferred => self.transferred.push(path.to_string()),
            ItemState::Failed => {}
        }
    }

    fn fail(&mut self, path: &str, reason: impl ToString) {
        self.failed.push((path.to_string(), reason.to_string()));
    }
}

/// Drives push and pull runs between the local sync root and the remote
/// store, recording what was reconciled in the ledger.
pub struct SyncEngine {
    transfer: TransferClient,
    store: Arc<dyn LedgerStore>,
    root: PathBuf,
    time_zone: Tz,
}

impl SyncEngine {
    pub fn new(
        remote: Arc<dyn RemoteStore>,
        store: Arc<dyn LedgerStore>,
        root: impl Into<PathBuf>,
        time_zone: Tz,
    ) -> Self {
        Self {
            transfer: TransferClient::new(remote),
            store,
            root: root.into(),
            time_zone,
        }
    }

    pub fn from_settings(
        remote: Arc<dyn RemoteStore>,
        store: Arc<dyn LedgerStore>,
        settings: &SyncSettings,
    ) -> Self {
        Self::new(remote, store, settings.local_root.clone(), settings.time_zone).with_transfer(
            |transfer| {
                transfer
                    .with_bucket_size(settings.bucket_size)
                    .with_progress_interval(settings.progress_interval)
            },
        )
    }

    pub fn with_transfer(mut self, configure: impl FnOnce(TransferClient) -> TransferClient) -> Self {
        self.transfer = configure(self.transfer);
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn remote(&self) -> &Arc<dyn RemoteStore> {
        self.transfer.remote()
    }

    /// Uploads every non-ignored file under `local` that is new or modified
    /// since it was last pushed.
    pub async fn push(&self, local: &Path) -> Result<SyncReport, EngineError> {
        let ledger = self.store.load()?;
        let lists = self.store.ignore_lists(&self.root)?;
        let (entries, ignored) = self.walk(lists, local).await?;

        let mut report = SyncReport {
            ignored,
            ..SyncReport::default()
        };
        let mut delta = LedgerDelta::default();
        for entry in entries.iter().filter(|entry| entry.is_file) {
            let state = self.push_file(entry, &ledger, &mut delta, &mut report).await;
            report.note(&entry.remote_path, state);
        }
        self.commit(&delta)?;
        info!(
            path = %local.display(),
            uploaded = report.transferred.len(),
            unchanged = report.unchanged,
            failed = report.failed.len(),
            "push finished"
        );
        Ok(report)
    }

    async fn push_file(
        &self,
        entry: &LocalEntry,
        ledger: &Ledger,
        delta: &mut LedgerDelta,
        report: &mut SyncReport,
    ) -> ItemState {
        let mtime = match self.mtime(&entry.path).await {
            Ok(mtime) => mtime,
            Err(err) => {
                warn!(path = %entry.remote_path, error = %err, "cannot stat file");
                report.fail(&entry.remote_path, &err);
                return ItemState::Failed;
            }
        };
        if let Some(last) = ledger.pushed_at(&entry.remote_path) {
            if mtime <= *last {
                debug!(path = %entry.remote_path, "unchanged since last push");
                return ItemState::Unchanged;
            }
        }
        match self.transfer.upload(&entry.path, &entry.remote_path).await {
            Ok(_) => {
                let recorded = self.mtime(&entry.path).await.unwrap_or(mtime).max(mtime);
                delta.record_push(entry.remote_path.clone(), recorded);
                info!(path = %entry.remote_path, "uploaded");
                ItemState::Transferred
            }
            Err(err) => {
                warn!(
                    path = %entry.remote_path,
                    error = %err,
                    retryable = err.is_retryable(),
                    "upload failed"
                );
                report.fail(&entry.remote_path, &err);
                ItemState::Failed
            }
        }
    }

    /// Downloads `remote` when it changed on the server since the last pull.
    /// Folders are always fetched whole.
    pub async fn pull(&self, remote: &str) -> Result<SyncReport, EngineError> {
        let metadata = self.transfer.remote().get_metadata(remote).await?;
        let local = local_path_for(&self.root, &metadata.path)?;
        let mut report = SyncReport::default();
        let mut delta = LedgerDelta::default();

        if metadata.is_file {
            let server_modified = metadata
                .server_modified
                .ok_or_else(|| EngineError::MissingServerTime(metadata.path.clone()))?;
            let ledger = self.store.load()?;
            let mut matcher = IgnoreMatcher::new(self.root.clone(), self.store.ignore_lists(&self.root)?);
            matcher.prime(&local)?;
            let state = match ledger.pulled_at(&metadata.path) {
                _ if matcher.is_ignored(&local, false) => {
                    debug!(path = %metadata.path, "ignored");
                    ItemState::Ignored
                }
                Some(last) if *last >= server_modified => {
                    debug!(path = %metadata.path, "unchanged since last pull");
                    ItemState::Unchanged
                }
                _ => match self.transfer.download_file(&metadata.path, &local).await {
                    Ok(_) => {
                        delta.record_pull(metadata.path.clone(), server_modified);
                        match self.mtime(&local).await {
                            Ok(mtime) => delta.record_push(metadata.path.clone(), mtime),
                            Err(err) => {
                                warn!(path = %metadata.path, error = %err, "cannot stat downloaded file")
                            }
                        }
                        ItemState::Transferred
                    }
                    Err(err) => {
                        warn!(
                            path = %metadata.path,
                            error = %err,
                            retryable = err.is_retryable(),
                            "download failed"
                        );
                        report.fail(&metadata.path, &err);
                        ItemState::Failed
                    }
                },
            };
            report.note(&metadata.path, state);
        } else {
            let skip = self.archive_filter(self.store.ignore_lists(&self.root)?);
            match self.transfer.download_folder(&metadata.path, &local, skip).await {
                Ok(extracted) => {
                    report.ignored += extracted.skipped;
                    // Only what the archive wrote matches the server.
                    for path in &extracted.files {
                        let remote_path = match remote_path_for(&self.root, path) {
                            Ok(remote_path) => remote_path,
                            Err(err) => {
                                warn!(path = %path.display(), error = %err, "extracted outside sync root");
                                continue;
                            }
                        };
                        match self.mtime(path).await {
                            Ok(mtime) => {
                                delta.record_push(remote_path.clone(), mtime);
                                report.note(&remote_path, ItemState::Transferred);
                            }
                            Err(err) => {
                                warn!(path = %remote_path, error = %err, "cannot stat extracted file");
                                report.fail(&remote_path, &err);
                            }
                        }
                    }
                }
                Err(err) => {
                    warn!(
                        path = %metadata.path,
                        error = %err,
                        retryable = err.is_retryable(),
                        "folder download failed"
                    );
                    report.fail(&metadata.path, &err);
                }
            }
        }

        self.commit(&delta)?;
        info!(
            path = %metadata.path,
            downloaded = report.transferred.len(),
            unchanged = report.unchanged,
            failed = report.failed.len(),
            "pull finished"
        );
        Ok(report)
    }

    /// Records the current mtime of every non-ignored file under `local` as
    /// pushed, without transferring anything.
    pub async fn mark_synced(&self, local: &Path) -> Result<usize, EngineError> {
        let lists = self.store.ignore_lists(&self.root)?;
        let (entries, _) = self.walk(lists, local).await?;
        let mut delta = LedgerDelta::default();
        let mut marked = 0;
        for entry in entries.iter().filter(|entry| entry.is_file) {
            match self.mtime(&entry.path).await {
                Ok(mtime) => {
                    delta.record_push(entry.remote_path.clone(), mtime);
                    marked += 1;
                }
                Err(err) => warn!(path = %entry.remote_path, error = %err, "cannot stat file"),
            }
        }
        self.commit(&delta)?;
        info!(path = %local.display(), marked, "marked as synced");
        Ok(marked)
    }

    /// Drops push entries whose local file is gone. Returns how many were removed.
    pub fn clean_ledger(&self) -> Result<usize, EngineError> {
        let mut removed = 0;
        self.store.update(&mut |ledger: &mut Ledger| {
            let before = ledger.from_local.len();
            ledger
                .from_local
                .retain(|path, _| self.local_file_exists(path));
            removed = before - ledger.from_local.len();
        })?;
        info!(removed, "ledger cleaned");
        Ok(removed)
    }

    /// Push-ledger paths whose local file no longer exists.
    pub fn missing_local_paths(&self) -> Result<Vec<String>, EngineError> {
        let ledger = self.store.load()?;
        Ok(ledger
            .from_local
            .keys()
            .filter(|path| !self.local_file_exists(path))
            .cloned()
            .collect())
    }

    /// Deletes `paths` remotely in one batch and forgets them in the ledger.
    pub async fn delete_remote_batch(&self, paths: &[String]) -> Result<Option<String>, EngineError> {
        if paths.is_empty() {
            return Ok(None);
        }
        let job = self.transfer.remote().delete_batch(paths).await?;
        info!(count = paths.len(), job = job.as_deref().unwrap_or("-"), "batch delete submitted");
        let mut delta = LedgerDelta::default();
        for path in paths {
            delta.forget(path.clone());
        }
        self.commit(&delta)?;
        Ok(job)
    }

    pub async fn upload_file(&self, local: &Path, remote: &str) -> Result<(), EngineError> {
        self.transfer.upload(local, remote).await?;
        info!(path = %remote, "uploaded");
        Ok(())
    }

    /// Uploads the contents of `local` so that `local/x` lands at `remote/x`.
    pub async fn upload_folder(&self, local: &Path, remote: &str) -> Result<SyncReport, EngineError> {
        let matcher = if local.starts_with(&self.root) {
            IgnoreMatcher::new(self.root.clone(), self.store.ignore_lists(&self.root)?)
        } else {
            IgnoreMatcher::new(local.to_path_buf(), IgnoreLists::default())
        };
        let start = local.to_path_buf();
        let (entries, ignored) = tokio::task::spawn_blocking(move || collect(matcher, &start)).await??;

        let mut report = SyncReport {
            ignored,
            ..SyncReport::default()
        };
        for entry in entries.iter().filter(|entry| entry.is_file) {
            let relative = entry.path.strip_prefix(local).unwrap_or(entry.path.as_path());
            let target = join_remote(remote, relative);
            match self.transfer.upload(&entry.path, &target).await {
                Ok(_) => report.note(&target, ItemState::Transferred),
                Err(err) => {
                    warn!(path = %target, error = %err, retryable = err.is_retryable(), "upload failed");
                    report.fail(&target, &err);
                }
            }
        }
        Ok(report)
    }

    pub async fn download(&self, remote: &str, local: &Path, is_file: bool) -> Result<(), EngineError> {
        match self.transfer.download(remote, local, is_file).await? {
            Downloaded::File(_) => info!(path = %remote, "downloaded"),
            Downloaded::Folder(extracted) => {
                info!(path = %remote, files = extracted.files.len(), "folder downloaded")
            }
        }
        Ok(())
    }

    fn commit(&self, delta: &LedgerDelta) -> Result<(), EngineError> {
        if !delta.is_empty() {
            self.store.commit(delta)?;
        }
        Ok(())
    }

    async fn walk(&self, lists: IgnoreLists, start: &Path) -> Result<(Vec<LocalEntry>, usize), EngineError> {
        let matcher = IgnoreMatcher::new(self.root.clone(), lists);
        let start = start.to_path_buf();
        Ok(tokio::task::spawn_blocking(move || collect(matcher, &start)).await??)
    }

    async fn mtime(&self, path: &Path) -> Result<Timestamp, EngineError> {
        let io_err = |source| EngineError::Io {
            path: path.to_path_buf(),
            source,
        };
        let modified = tokio::fs::metadata(path)
            .await
            .and_then(|meta| meta.modified())
            .map_err(io_err)?;
        Ok(from_system_time(modified, self.time_zone))
    }

    fn local_file_exists(&self, remote_path: &str) -> bool {
        local_path_for(&self.root, remote_path).is_ok_and(|path| path.is_file())
    }

    fn archive_filter(&self, lists: IgnoreLists) -> impl FnMut(&Path, bool) -> bool + Send + 'static {
        let mut matcher = IgnoreMatcher::new(self.root.clone(), lists);
        move |path: &Path, is_dir: bool| {
            if let Err(err) = matcher.prime(path) {
                debug!(path = %path.display(), error = %err, "ignore rules unreadable");
            }
            matcher.is_ignored(path, is_dir)
        }
    }
}

fn collect(matcher: IgnoreMatcher, start: &Path) -> Result<(Vec<LocalEntry>, usize), WalkError> {
    let mut walker = LocalWalker::new(matcher, start)?;
    let entries = walker.by_ref().collect::<Result<Vec<_>, _>>()?;
    Ok((entries, walker.ignored()))
}
