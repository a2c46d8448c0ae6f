use std::io;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;
use url::Url;

use crate::remote::{RemoteError, RemoteStore};

const REMOTE_WEB_BASE: &str = "https://www.dropbox.com/home";

#[derive(Debug, Error)]
pub enum ExplorerError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("remote error: {0}")]
    Remote(#[from] RemoteError),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("failed to launch opener: {0}")]
    Launch(#[source] io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExplorerItem {
    pub path: String,
    pub is_file: bool,
}

/// File-manager operations shared by the local tree and the remote store.
#[async_trait]
pub trait Explorer: Send + Sync {
    async fn list(&self, dir: &str) -> Result<Vec<ExplorerItem>, ExplorerError>;
    async fn create_folder(&self, path: &str) -> Result<(), ExplorerError>;
    async fn delete(&self, path: &str) -> Result<(), ExplorerError>;
    async fn rename(&self, path: &str, new_path: &str) -> Result<(), ExplorerError>;
    fn open(&self, path: &str) -> Result<(), ExplorerError>;
}

/// Hands a path or URL to the desktop environment.
pub trait Launcher: Send + Sync {
    fn launch(&self, target: &str) -> io::Result<()>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemLauncher;

impl Launcher for SystemLauncher {
    fn launch(&self, target: &str) -> io::Result<()> {
        let mut command = if cfg!(target_os = "macos") {
            Command::new("open")
        } else if cfg!(windows) {
            let mut cmd = Command::new("cmd");
            cmd.args(["/C", "start", ""]);
            cmd
        } else {
            Command::new("xdg-open")
        };
        command
            .arg(target)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()?;
        Ok(())
    }
}

pub struct LocalExplorer {
    launcher: Arc<dyn Launcher>,
}

impl LocalExplorer {
    pub fn new(launcher: Arc<dyn Launcher>) -> Self {
        Self { launcher }
    }
}

fn io_error(path: &str) -> impl FnOnce(io::Error) -> ExplorerError + '_ {
    move |source| ExplorerError::Io {
        path: PathBuf::from(path),
        source,
    }
}

#[async_trait]
impl Explorer for LocalExplorer {
    async fn list(&self, dir: &str) -> Result<Vec<ExplorerItem>, ExplorerError> {
        let mut reader = tokio::fs::read_dir(dir).await.map_err(io_error(dir))?;
        let mut items = Vec::new();
        while let Some(entry) = reader.next_entry().await.map_err(io_error(dir))? {
            let file_type = entry.file_type().await.map_err(io_error(dir))?;
            items.push(ExplorerItem {
                path: entry.path().to_string_lossy().into_owned(),
                is_file: file_type.is_file(),
            });
        }
        items.sort_by_cached_key(|item| {
            Path::new(&item.path)
                .file_name()
                .map(|name| name.to_string_lossy().to_lowercase())
                .unwrap_or_default()
        });
        Ok(items)
    }

    async fn create_folder(&self, path: &str) -> Result<(), ExplorerError> {
        tokio::fs::create_dir_all(path).await.map_err(io_error(path))
    }

    /// Files are removed outright; folders only when empty.
    async fn delete(&self, path: &str) -> Result<(), ExplorerError> {
        let meta = tokio::fs::metadata(path).await.map_err(io_error(path))?;
        if meta.is_file() {
            tokio::fs::remove_file(path).await.map_err(io_error(path))
        } else {
            tokio::fs::remove_dir(path).await.map_err(io_error(path))
        }
    }

    async fn rename(&self, path: &str, new_path: &str) -> Result<(), ExplorerError> {
        tokio::fs::rename(path, new_path).await.map_err(io_error(path))
    }

    fn open(&self, path: &str) -> Result<(), ExplorerError> {
        debug!(path, "opening local path");
        self.launcher.launch(path).map_err(ExplorerError::Launch)
    }
}

pub struct RemoteExplorer {
    remote: Arc<dyn RemoteStore>,
    launcher: Arc<dyn Launcher>,
}

impl RemoteExplorer {
    pub fn new(remote: Arc<dyn RemoteStore>, launcher: Arc<dyn Launcher>) -> Self {
        Self { remote, launcher }
    }
}

pub fn web_url(path: &str) -> Result<Url, ExplorerError> {
    Ok(Url::parse(&format!("{REMOTE_WEB_BASE}{path}"))?)
}

#[async_trait]
impl Explorer for RemoteExplorer {
    async fn list(&self, dir: &str) -> Result<Vec<ExplorerItem>, ExplorerError> {
        Ok(self
            .remote
            .list_folder(dir, false)
            .await?
            .into_iter()
            .map(|entry| ExplorerItem {
                path: entry.path,
                is_file: entry.is_file,
            })
            .collect())
    }

    async fn create_folder(&self, path: &str) -> Result<(), ExplorerError> {
        Ok(self.remote.create_folder(path).await?)
    }

    async fn delete(&self, path: &str) -> Result<(), ExplorerError> {
        Ok(self.remote.delete(path).await?)
    }

    async fn rename(&self, path: &str, new_path: &str) -> Result<(), ExplorerError> {
        Ok(self.remote.move_entry(path, new_path).await?)
    }

    fn open(&self, path: &str) -> Result<(), ExplorerError> {
        let url = web_url(path)?;
        debug!(%url, "opening remote path");
        self.launcher
            .launch(url.as_str())
            .map_err(ExplorerError::Launch)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::testing::{Call, FakeRemote};
    use std::sync::Mutex;
    use tempfile::tempdir;

    #[derive(Default)]
    pub(crate) struct RecordingLauncher {
        pub launched: Mutex<Vec<String>>,
    }

    impl Launcher for RecordingLauncher {
        fn launch(&self, target: &str) -> io::Result<()> {
            self.launched.lock().unwrap().push(target.to_string());
            Ok(())
        }
    }

    #[tokio::test]
    async fn local_listing_is_sorted_case_insensitively() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("b.txt"), "").unwrap();
        std::fs::write(dir.path().join("A.txt"), "").unwrap();
        std::fs::create_dir(dir.path().join("c")).unwrap();

        let explorer = LocalExplorer::new(Arc::new(RecordingLauncher::default()));
        let items = explorer.list(&dir.path().to_string_lossy()).await.unwrap();
        let names: Vec<_> = items
            .iter()
            .map(|item| Path::new(&item.path).file_name().unwrap().to_string_lossy().into_owned())
            .collect();

        assert_eq!(names, vec!["A.txt", "b.txt", "c"]);
        assert!(!items[2].is_file);
    }

    #[tokio::test]
    async fn local_create_rename_delete() {
        let dir = tempdir().unwrap();
        let explorer = LocalExplorer::new(Arc::new(RecordingLauncher::default()));
        let folder = dir.path().join("new");
        let renamed = dir.path().join("renamed");

        explorer.create_folder(&folder.to_string_lossy()).await.unwrap();
        explorer
            .rename(&folder.to_string_lossy(), &renamed.to_string_lossy())
            .await
            .unwrap();
        std::fs::write(renamed.join("f.txt"), "x").unwrap();

        assert!(explorer.delete(&renamed.to_string_lossy()).await.is_err());
        explorer
            .delete(&renamed.join("f.txt").to_string_lossy())
            .await
            .unwrap();
        explorer.delete(&renamed.to_string_lossy()).await.unwrap();
        assert!(!renamed.exists());
    }

    #[tokio::test]
    async fn remote_operations_go_through_the_store() {
        let remote = Arc::new(FakeRemote::default());
        remote.put_file("/Docs/b.txt", b"b", "2024-01-01T00:00:00Z");
        remote.put_folder("/Docs/A");
        let explorer = RemoteExplorer::new(remote.clone(), Arc::new(RecordingLauncher::default()));

        let items = explorer.list("/Docs").await.unwrap();
        assert_eq!(
            items,
            vec![
                ExplorerItem { path: "/Docs/A".into(), is_file: false },
                ExplorerItem { path: "/Docs/b.txt".into(), is_file: true },
            ]
        );

        explorer.rename("/Docs/b.txt", "/Docs/c.txt").await.unwrap();
        explorer.delete("/Docs/A").await.unwrap();
        let calls = remote.calls();
        assert!(calls.contains(&Call::Move("/Docs/b.txt".into(), "/Docs/c.txt".into())));
        assert!(calls.contains(&Call::Delete("/Docs/A".into())));
    }

    #[test]
    fn remote_open_launches_web_url() {
        let launcher = Arc::new(RecordingLauncher::default());
        let explorer = RemoteExplorer::new(Arc::new(FakeRemote::default()), launcher.clone());

        explorer.open("/My Docs/a.txt").unwrap();

        assert_eq!(
            launcher.launched.lock().unwrap().as_slice(),
            ["https://www.dropbox.com/home/My%20Docs/a.txt"]
        );
    }
}
