use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Background sampler that reports how much of a download has landed on disk.
///
/// It stops on a flag rather than a callback, so it keeps polling at a fixed
/// interval and treats a not-yet-created target as zero progress.
pub struct ProgressPoller {
    finished: Arc<AtomicBool>,
    percent: Arc<AtomicU64>,
    handle: JoinHandle<()>,
}

impl ProgressPoller {
    pub fn spawn(target: PathBuf, total: u64, interval: Duration) -> Self {
        let finished = Arc::new(AtomicBool::new(false));
        let percent = Arc::new(AtomicU64::new(0));
        let handle = tokio::spawn(poll(
            target,
            total,
            interval,
            Arc::clone(&finished),
            Arc::clone(&percent),
        ));
        Self {
            finished,
            percent,
            handle,
        }
    }

    /// Last sampled percentage.
    pub fn percent(&self) -> u64 {
        self.percent.load(Ordering::Relaxed)
    }

    pub async fn finish(self) {
        self.finished.store(true, Ordering::Release);
        if let Err(err) = self.handle.await {
            debug!(error = %err, "progress poller did not shut down cleanly");
        }
    }
}

async fn poll(
    target: PathBuf,
    total: u64,
    interval: Duration,
    finished: Arc<AtomicBool>,
    percent: Arc<AtomicU64>,
) {
    let mut reported = None;
    while !finished.load(Ordering::Acquire) {
        tokio::time::sleep(interval).await;
        let written = match tokio::fs::metadata(&target).await {
            Ok(meta) => meta.len(),
            Err(_) => continue,
        };
        let current = percentage(written, total);
        percent.store(current, Ordering::Relaxed);
        if reported != Some(current) {
            info!(path = %target.display(), "downloaded {current}%");
            reported = Some(current);
        }
    }
}

pub fn percentage(done: u64, total: u64) -> u64 {
    if total == 0 {
        return 100;
    }
    (done.saturating_mul(100) / total).min(100)
}
