//! In-memory remote store used by the orchestrator and task tests.

use std::collections::{BTreeMap, BTreeSet};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use zip::ZipWriter;
use zip::write::SimpleFileOptions;

use crate::remote::{RemoteEntry, RemoteError, RemoteStore};
use crate::sync::content_hash::content_hash;
use crate::sync::paths::is_same_or_under;
use crate::sync::timestamp::{Timestamp, parse_server_time};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    List(String),
    Metadata(String),
    Upload { path: String, len: usize },
    SessionStart,
    Append { session_id: String, offset: u64, len: usize },
    Finish { session_id: String, offset: u64, path: String },
    Download(String),
    DownloadArchive(String),
    Delete(String),
    Move(String, String),
    CreateFolder(String),
    DeleteBatch(Vec<String>),
}

#[derive(Default)]
pub struct FakeState {
    pub files: BTreeMap<String, (Vec<u8>, Timestamp)>,
    pub folders: BTreeSet<String>,
    pub calls: Vec<Call>,
    pub failing: BTreeSet<String>,
    /// Session appends starting at these offsets fail.
    pub failing_appends: BTreeSet<u64>,
    /// Downloads of these paths deliver bytes that do not match their hash.
    pub corrupted: BTreeSet<String>,
    /// Local files removed as soon as the keyed remote path is uploaded.
    pub remove_after_upload: BTreeMap<String, PathBuf>,
    sessions: BTreeMap<String, Vec<u8>>,
}

pub struct FakeRemote {
    state: Mutex<FakeState>,
    clock: Timestamp,
}

impl Default for FakeRemote {
    fn default() -> Self {
        Self {
            state: Mutex::new(FakeState::default()),
            clock: ts("2024-06-01T00:00:00Z"),
        }
    }
}

pub fn ts(value: &str) -> Timestamp {
    parse_server_time(value).unwrap()
}

impl FakeRemote {
    pub fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    pub fn put_file(&self, path: &str, contents: &[u8], modified: &str) {
        self.state()
            .files
            .insert(path.to_string(), (contents.to_vec(), ts(modified)));
    }

    pub fn put_folder(&self, path: &str) {
        self.state().folders.insert(path.to_string());
    }

    /// Uploads and downloads of `path` fail from now on.
    pub fn fail(&self, path: &str) {
        self.state().failing.insert(path.to_string());
    }

    pub fn fail_append_at(&self, offset: u64) {
        self.state().failing_appends.insert(offset);
    }

    pub fn corrupt(&self, path: &str) {
        self.state().corrupted.insert(path.to_string());
    }

    pub fn remove_after_upload(&self, remote: &str, local: PathBuf) {
        self.state()
            .remove_after_upload
            .insert(remote.to_string(), local);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state().calls.clone()
    }

    pub fn uploaded_paths(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Upload { path, .. } | Call::Finish { path, .. } => Some(path),
                _ => None,
            })
            .collect()
    }

    pub fn append_lengths(&self) -> Vec<usize> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Append { len, .. } => Some(len),
                _ => None,
            })
            .collect()
    }

    fn record(&self, call: Call) -> MutexGuard<'_, FakeState> {
        let mut state = self.state();
        state.calls.push(call);
        state
    }

    fn check(state: &FakeState, path: &str) -> Result<(), RemoteError> {
        if state.failing.contains(path) {
            return Err(RemoteError::Io(io::Error::other(format!("injected failure for {path}"))));
        }
        Ok(())
    }

    fn not_found(path: &str) -> RemoteError {
        RemoteError::Io(io::Error::new(io::ErrorKind::NotFound, path.to_string()))
    }

    fn entry(state: &FakeState, path: &str) -> Option<RemoteEntry> {
        if path == "/" || state.folders.contains(path) {
            return Some(RemoteEntry::folder(path));
        }
        state.files.get(path).map(|(data, modified)| {
            RemoteEntry::file(path, data.len() as u64, *modified)
        })
    }
}

#[async_trait]
impl RemoteStore for FakeRemote {
    async fn list_folder(&self, path: &str, recursive: bool) -> Result<Vec<RemoteEntry>, RemoteError> {
        let state = self.record(Call::List(path.to_string()));
        let direct = |candidate: &str| {
            candidate != path
                && is_same_or_under(candidate, path)
                && (recursive
                    || candidate[path.trim_end_matches('/').len() + 1..]
                        .find('/')
                        .is_none())
        };
        let mut entries: Vec<RemoteEntry> = state
            .folders
            .iter()
            .filter(|folder| direct(folder))
            .map(|folder| RemoteEntry::folder(folder.as_str()))
            .chain(state.files.iter().filter(|(file, _)| direct(file)).map(
                |(file, (data, modified))| RemoteEntry::file(file.as_str(), data.len() as u64, *modified),
            ))
            .collect();
        entries.sort_by_cached_key(|entry| entry.path.to_lowercase());
        Ok(entries)
    }

    async fn get_metadata(&self, path: &str) -> Result<RemoteEntry, RemoteError> {
        let state = self.record(Call::Metadata(path.to_string()));
        Self::entry(&state, path).ok_or_else(|| Self::not_found(path))
    }

    async fn upload(&self, contents: Vec<u8>, path: &str) -> Result<RemoteEntry, RemoteError> {
        let mut state = self.record(Call::Upload {
            path: path.to_string(),
            len: contents.len(),
        });
        Self::check(&state, path)?;
        let size = contents.len() as u64;
        state.files.insert(path.to_string(), (contents, self.clock));
        if let Some(local) = state.remove_after_upload.remove(path) {
            std::fs::remove_file(local)?;
        }
        Ok(RemoteEntry::file(path, size, self.clock))
    }

    async fn upload_session_start(&self) -> Result<String, RemoteError> {
        let mut state = self.record(Call::SessionStart);
        let id = format!("session-{}", state.sessions.len() + 1);
        state.sessions.insert(id.clone(), Vec::new());
        Ok(id)
    }

    async fn upload_session_append(
        &self,
        session_id: &str,
        offset: u64,
        chunk: Vec<u8>,
    ) -> Result<(), RemoteError> {
        let mut state = self.record(Call::Append {
            session_id: session_id.to_string(),
            offset,
            len: chunk.len(),
        });
        if state.failing_appends.contains(&offset) {
            return Err(RemoteError::Io(io::Error::other(format!(
                "injected append failure at {offset}"
            ))));
        }
        let buffer = state
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| Self::not_found(session_id))?;
        if buffer.len() as u64 != offset {
            return Err(RemoteError::Io(io::Error::other("incorrect offset")));
        }
        buffer.extend_from_slice(&chunk);
        Ok(())
    }

    async fn upload_session_finish(
        &self,
        session_id: &str,
        offset: u64,
        path: &str,
    ) -> Result<RemoteEntry, RemoteError> {
        let mut state = self.record(Call::Finish {
            session_id: session_id.to_string(),
            offset,
            path: path.to_string(),
        });
        Self::check(&state, path)?;
        let data = state
            .sessions
            .remove(session_id)
            .ok_or_else(|| Self::not_found(session_id))?;
        let size = data.len() as u64;
        state.files.insert(path.to_string(), (data, self.clock));
        Ok(RemoteEntry::file(path, size, self.clock))
    }

    async fn download_to_file(&self, local: &Path, remote: &str) -> Result<RemoteEntry, RemoteError> {
        let (data, entry) = {
            let state = self.record(Call::Download(remote.to_string()));
            Self::check(&state, remote)?;
            let (data, modified) = state.files.get(remote).ok_or_else(|| Self::not_found(remote))?;
            let mut entry = RemoteEntry::file(remote, data.len() as u64, *modified);
            entry.content_hash = Some(content_hash(data));
            let mut delivered = data.clone();
            if state.corrupted.contains(remote) {
                delivered.push(b'!');
            }
            (delivered, entry)
        };
        tokio::fs::write(local, data).await?;
        Ok(entry)
    }

    async fn download_archive_to_file(&self, local: &Path, remote: &str) -> Result<(), RemoteError> {
        let files: Vec<(String, Vec<u8>)> = {
            let state = self.record(Call::DownloadArchive(remote.to_string()));
            Self::check(&state, remote)?;
            // Archive entries are named relative to the folder's parent.
            let parent_len = remote.rfind('/').map(|i| i + 1).unwrap_or(0);
            state
                .files
                .iter()
                .filter(|(path, _)| is_same_or_under(path, remote))
                .map(|(path, (data, _))| (path[parent_len..].to_string(), data.clone()))
                .collect()
        };
        let mut writer = ZipWriter::new(std::fs::File::create(local)?);
        for (name, data) in files {
            writer
                .start_file(name, SimpleFileOptions::default())
                .map_err(io::Error::other)?;
            writer.write_all(&data)?;
        }
        writer.finish().map_err(io::Error::other)?;
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<(), RemoteError> {
        let mut state = self.record(Call::Delete(path.to_string()));
        state.files.retain(|file, _| !is_same_or_under(file, path));
        state.folders.retain(|folder| !is_same_or_under(folder, path));
        Ok(())
    }

    async fn move_entry(&self, from: &str, to: &str) -> Result<(), RemoteError> {
        let mut state = self.record(Call::Move(from.to_string(), to.to_string()));
        if let Some(file) = state.files.remove(from) {
            state.files.insert(to.to_string(), file);
        } else if state.folders.remove(from) {
            state.folders.insert(to.to_string());
        } else {
            return Err(Self::not_found(from));
        }
        Ok(())
    }

    async fn create_folder(&self, path: &str) -> Result<(), RemoteError> {
        let mut state = self.record(Call::CreateFolder(path.to_string()));
        state.folders.insert(path.to_string());
        Ok(())
    }

    async fn delete_batch(&self, paths: &[String]) -> Result<Option<String>, RemoteError> {
        let mut state = self.record(Call::DeleteBatch(paths.to_vec()));
        for path in paths {
            state.files.remove(path);
        }
        Ok(Some("dbjid:fake".to_string()))
    }
}
