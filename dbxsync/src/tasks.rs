//! Fire-and-forget execution of user-triggered operations.
//!
//! Every submission runs as its own tokio task; there is no queue and no
//! limit on how many run at once. Progress is observable two ways: each
//! [`TaskHandle`] carries a status watch, and the runner broadcasts every
//! transition as a [`TaskEvent`] on one channel.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::explorer::{Explorer, ExplorerError};
use crate::sync::engine::{EngineError, SyncEngine, SyncReport};

#[derive(Debug, Error)]
pub enum TaskError {
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Explorer(#[from] ExplorerError),
    #[error("task panicked or was aborted: {0}")]
    Join(#[from] tokio::task::JoinError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Local,
    Remote,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncDirection {
    /// Local to remote.
    Push,
    /// Remote to local.
    Pull,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskAction {
    CreateFolder { side: Side, path: String },
    Delete { side: Side, path: String },
    Rename { side: Side, path: String, new_path: String },
    Open { side: Side, path: String },
    Download { remote: String, local: PathBuf, is_file: bool },
    UploadFile { local: PathBuf, remote: String },
    UploadFolder { local: PathBuf, remote: String },
    Sync { direction: SyncDirection, path: String },
    MarkSynced { local: PathBuf },
    CleanLedger,
    FindMissing,
    DeleteRemote { paths: Vec<String> },
}

impl TaskAction {
    pub fn description(&self) -> String {
        match self {
            TaskAction::CreateFolder { path, .. } => format!("Create folder \"{path}\""),
            TaskAction::Delete { path, .. } => format!("Delete \"{path}\""),
            TaskAction::Rename { path, new_path, .. } => {
                format!("Rename \"{path}\" to \"{new_path}\"")
            }
            TaskAction::Open { path, .. } => format!("Open \"{path}\""),
            TaskAction::Download { remote, .. } => format!("Download \"{remote}\""),
            TaskAction::UploadFile { local, .. } | TaskAction::UploadFolder { local, .. } => {
                format!("Upload \"{}\"", local.display())
            }
            TaskAction::Sync {
                direction: SyncDirection::Push,
                ..
            } => "Syncing to cloud".to_string(),
            TaskAction::Sync {
                direction: SyncDirection::Pull,
                ..
            } => "Syncing to local".to_string(),
            TaskAction::MarkSynced { local } => format!("Mark \"{}\" as synced", local.display()),
            TaskAction::CleanLedger => "Clean sync ledger".to_string(),
            TaskAction::FindMissing => "Find deleted local paths".to_string(),
            TaskAction::DeleteRemote { paths } => format!("Delete {} paths in the cloud", paths.len()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Queued,
    Running,
    Done,
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TaskStatus::Queued => "QUEUED",
            TaskStatus::Running => "RUNNING",
            TaskStatus::Done => "DONE",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutput {
    Nothing,
    Report(SyncReport),
    Count(usize),
    Paths(Vec<String>),
    Job(Option<String>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskEvent {
    pub id: u64,
    pub description: String,
    pub status: TaskStatus,
    /// Set on the `Done` event of a failed task.
    pub error: Option<String>,
}

pub struct TaskHandle {
    pub id: u64,
    pub description: String,
    status: watch::Receiver<TaskStatus>,
    join: JoinHandle<Result<TaskOutput, TaskError>>,
}

impl TaskHandle {
    pub fn status(&self) -> TaskStatus {
        *self.status.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<TaskStatus> {
        self.status.clone()
    }

    pub async fn wait(self) -> Result<TaskOutput, TaskError> {
        self.join.await?
    }
}

#[derive(Clone)]
pub struct TaskRunner {
    inner: Arc<Inner>,
}

struct Inner {
    engine: Arc<SyncEngine>,
    local: Arc<dyn Explorer>,
    remote: Arc<dyn Explorer>,
    events: mpsc::UnboundedSender<TaskEvent>,
    next_id: AtomicU64,
}

impl TaskRunner {
    pub fn new(
        engine: Arc<SyncEngine>,
        local: Arc<dyn Explorer>,
        remote: Arc<dyn Explorer>,
    ) -> (Self, mpsc::UnboundedReceiver<TaskEvent>) {
        let (events, receiver) = mpsc::unbounded_channel();
        let inner = Inner {
            engine,
            local,
            remote,
            events,
            next_id: AtomicU64::new(1),
        };
        (
            Self {
                inner: Arc::new(inner),
            },
            receiver,
        )
    }

    /// Starts `action` immediately on its own task.
    pub fn submit(&self, action: TaskAction) -> TaskHandle {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let description = action.description();
        let (status_tx, status_rx) = watch::channel(TaskStatus::Queued);
        self.inner.emit(id, &description, TaskStatus::Queued, None);

        let inner = Arc::clone(&self.inner);
        let task_description = description.clone();
        let join = tokio::spawn(async move {
            status_tx.send_replace(TaskStatus::Running);
            inner.emit(id, &task_description, TaskStatus::Running, None);

            let result = inner.run(action).await;
            let error = match &result {
                Ok(_) => {
                    info!(task = id, description = %task_description, "task finished");
                    None
                }
                Err(err) => {
                    warn!(task = id, description = %task_description, error = %err, "task failed");
                    Some(err.to_string())
                }
            };
            status_tx.send_replace(TaskStatus::Done);
            inner.emit(id, &task_description, TaskStatus::Done, error);
            result
        });

        TaskHandle {
            id,
            description,
            status: status_rx,
            join,
        }
    }
}

impl Inner {
    fn emit(&self, id: u64, description: &str, status: TaskStatus, error: Option<String>) {
        // Nobody listening is fine.
        let _ = self.events.send(TaskEvent {
            id,
            description: description.to_string(),
            status,
            error,
        });
    }

    fn explorer(&self, side: Side) -> &dyn Explorer {
        match side {
            Side::Local => self.local.as_ref(),
            Side::Remote => self.remote.as_ref(),
        }
    }

    async fn run(&self, action: TaskAction) -> Result<TaskOutput, TaskError> {
        let engine = &self.engine;
        let output = match action {
            TaskAction::CreateFolder { side, path } => {
                self.explorer(side).create_folder(&path).await?;
                TaskOutput::Nothing
            }
            TaskAction::Delete { side, path } => {
                self.explorer(side).delete(&path).await?;
                TaskOutput::Nothing
            }
            TaskAction::Rename {
                side,
                path,
                new_path,
            } => {
                self.explorer(side).rename(&path, &new_path).await?;
                TaskOutput::Nothing
            }
            TaskAction::Open { side, path } => {
                self.explorer(side).open(&path)?;
                TaskOutput::Nothing
            }
            TaskAction::Download {
                remote,
                local,
                is_file,
            } => {
                engine.download(&remote, &local, is_file).await?;
                TaskOutput::Nothing
            }
            TaskAction::UploadFile { local, remote } => {
                engine.upload_file(&local, &remote).await?;
                TaskOutput::Nothing
            }
            TaskAction::UploadFolder { local, remote } => {
                TaskOutput::Report(engine.upload_folder(&local, &remote).await?)
            }
            TaskAction::Sync {
                direction: SyncDirection::Push,
                path,
            } => TaskOutput::Report(engine.push(&PathBuf::from(path)).await?),
            TaskAction::Sync {
                direction: SyncDirection::Pull,
                path,
            } => TaskOutput::Report(engine.pull(&path).await?),
            TaskAction::MarkSynced { local } => TaskOutput::Count(engine.mark_synced(&local).await?),
            TaskAction::CleanLedger => TaskOutput::Count(engine.clean_ledger()?),
            TaskAction::FindMissing => TaskOutput::Paths(engine.missing_local_paths()?),
            TaskAction::DeleteRemote { paths } => {
                TaskOutput::Job(engine.delete_remote_batch(&paths).await?)
            }
        };
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::explorer::tests::RecordingLauncher;
    use crate::explorer::{LocalExplorer, RemoteExplorer};
    use crate::sync::ledger::JsonConfigStore;
    use crate::testing::{Call, FakeRemote};
    use serde_json::json;
    use tempfile::{TempDir, tempdir};

    fn runner() -> (TempDir, Arc<FakeRemote>, TaskRunner, mpsc::UnboundedReceiver<TaskEvent>) {
        let dir = tempdir().unwrap();
        let root = dir.path().join("Dropbox");
        std::fs::create_dir_all(&root).unwrap();
        let config = dir.path().join("config.json");
        std::fs::write(
            &config,
            json!({ "DROPBOX_LOCATION": root.to_string_lossy() }).to_string(),
        )
        .unwrap();

        let remote = Arc::new(FakeRemote::default());
        let launcher = Arc::new(RecordingLauncher::default());
        let engine = Arc::new(SyncEngine::new(
            remote.clone(),
            Arc::new(JsonConfigStore::new(config)),
            root,
            chrono_tz::UTC,
        ));
        let (runner, events) = TaskRunner::new(
            engine,
            Arc::new(LocalExplorer::new(launcher.clone())),
            Arc::new(RemoteExplorer::new(remote.clone(), launcher)),
        );
        (dir, remote, runner, events)
    }

    fn drain(events: &mut mpsc::UnboundedReceiver<TaskEvent>) -> Vec<TaskEvent> {
        let mut out = Vec::new();
        while let Ok(event) = events.try_recv() {
            out.push(event);
        }
        out
    }

    #[tokio::test]
    async fn emits_queued_running_done_in_order() {
        let (_dir, remote, runner, mut events) = runner();

        let handle = runner.submit(TaskAction::CreateFolder {
            side: Side::Remote,
            path: "/New".into(),
        });
        let id = handle.id;
        let output = handle.wait().await.unwrap();

        assert_eq!(output, TaskOutput::Nothing);
        assert!(remote.calls().contains(&Call::CreateFolder("/New".into())));
        let statuses: Vec<_> = drain(&mut events)
            .into_iter()
            .filter(|event| event.id == id)
            .map(|event| event.status)
            .collect();
        assert_eq!(
            statuses,
            vec![TaskStatus::Queued, TaskStatus::Running, TaskStatus::Done]
        );
    }

    #[tokio::test]
    async fn failure_is_reported_on_done_event() {
        let (dir, _remote, runner, mut events) = runner();
        let missing = dir.path().join("nope").to_string_lossy().into_owned();

        let handle = runner.submit(TaskAction::Delete {
            side: Side::Local,
            path: missing.clone(),
        });
        let mut status = handle.subscribe();
        assert!(handle.wait().await.is_err());
        assert_eq!(*status.borrow_and_update(), TaskStatus::Done);

        let done = drain(&mut events)
            .into_iter()
            .find(|event| event.status == TaskStatus::Done)
            .unwrap();
        assert_eq!(done.description, format!("Delete \"{missing}\""));
        assert!(done.error.is_some());
    }

    #[tokio::test]
    async fn concurrent_submissions_run_independently() {
        let (_dir, remote, runner, _events) = runner();
        remote.put_file("/a.txt", b"a", "2024-02-01T10:00:00Z");
        remote.put_file("/b.txt", b"b", "2024-02-01T10:00:00Z");

        let first = runner.submit(TaskAction::Sync {
            direction: SyncDirection::Pull,
            path: "/a.txt".into(),
        });
        let second = runner.submit(TaskAction::Sync {
            direction: SyncDirection::Pull,
            path: "/b.txt".into(),
        });
        assert_ne!(first.id, second.id);

        let first = first.wait().await.unwrap();
        let second = second.wait().await.unwrap();
        assert!(matches!(first, TaskOutput::Report(r) if r.transferred == vec!["/a.txt"]));
        assert!(matches!(second, TaskOutput::Report(r) if r.transferred == vec!["/b.txt"]));
    }

    #[test]
    fn descriptions_match_user_facing_labels() {
        let rename = TaskAction::Rename {
            side: Side::Local,
            path: "/a".into(),
            new_path: "/b".into(),
        };
        assert_eq!(rename.description(), "Rename \"/a\" to \"/b\"");
        let pull = TaskAction::Sync {
            direction: SyncDirection::Pull,
            path: "/".into(),
        };
        assert_eq!(pull.description(), "Syncing to local");
        assert_eq!(TaskStatus::Running.to_string(), "RUNNING");
    }
}
