use std::io;
use std::path::Path;

use async_trait::async_trait;
use dbx_core::{DbxError, DeleteBatchLaunch, DropboxClient, Metadata};
use futures_util::StreamExt;
use thiserror::Error;
use tokio::io::AsyncWriteExt;

use crate::sync::paths::api_path;
use crate::sync::timestamp::{Timestamp, TimestampError, parse_server_time};

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("api error: {0}")]
    Api(#[from] DbxError),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("invalid server timestamp: {0}")]
    Timestamp(#[from] TimestampError),
    #[error("{0} has been deleted")]
    Deleted(String),
}

impl RemoteError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, RemoteError::Api(err) if err.is_retryable())
    }
}

/// One entry of a remote listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEntry {
    pub path: String,
    pub is_file: bool,
    pub size: u64,
    /// Only files carry a modification time.
    pub server_modified: Option<Timestamp>,
    pub content_hash: Option<String>,
}

impl RemoteEntry {
    pub fn file(path: impl Into<String>, size: u64, server_modified: Timestamp) -> Self {
        Self {
            path: path.into(),
            is_file: true,
            size,
            server_modified: Some(server_modified),
            content_hash: None,
        }
    }

    pub fn folder(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            is_file: false,
            size: 0,
            server_modified: None,
            content_hash: None,
        }
    }

    pub fn from_metadata(metadata: Metadata) -> Result<Self, RemoteError> {
        let path = metadata.path().to_string();
        match metadata {
            Metadata::File {
                size,
                server_modified,
                content_hash,
                ..
            } => Ok(Self {
                path,
                is_file: true,
                size,
                server_modified: Some(parse_server_time(&server_modified)?),
                content_hash,
            }),
            Metadata::Folder { .. } => Ok(Self::folder(path)),
            Metadata::Deleted { .. } => Err(RemoteError::Deleted(path)),
        }
    }
}

/// The operations the sync core needs from the remote object store. Paths
/// are absolute remote paths; `/` addresses the root.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Full listing with continuation pages merged, sorted by lowercase path.
    async fn list_folder(&self, path: &str, recursive: bool)
    -> Result<Vec<RemoteEntry>, RemoteError>;

    async fn get_metadata(&self, path: &str) -> Result<RemoteEntry, RemoteError>;

    /// Single-shot upload that overwrites the destination.
    async fn upload(&self, contents: Vec<u8>, path: &str) -> Result<RemoteEntry, RemoteError>;

    async fn upload_session_start(&self) -> Result<String, RemoteError>;

    async fn upload_session_append(
        &self,
        session_id: &str,
        offset: u64,
        chunk: Vec<u8>,
    ) -> Result<(), RemoteError>;

    async fn upload_session_finish(
        &self,
        session_id: &str,
        offset: u64,
        path: &str,
    ) -> Result<RemoteEntry, RemoteError>;

    /// Streams a file into `local`, returning the metadata sent with it.
    async fn download_to_file(&self, local: &Path, remote: &str)
    -> Result<RemoteEntry, RemoteError>;

    /// Streams a zip archive of the folder subtree into `local`.
    async fn download_archive_to_file(&self, local: &Path, remote: &str)
    -> Result<(), RemoteError>;

    async fn delete(&self, path: &str) -> Result<(), RemoteError>;

    async fn move_entry(&self, from: &str, to: &str) -> Result<(), RemoteError>;

    async fn create_folder(&self, path: &str) -> Result<(), RemoteError>;

    /// Starts an asynchronous batch delete. Returns the job id when the
    /// server deferred the work.
    async fn delete_batch(&self, paths: &[String]) -> Result<Option<String>, RemoteError>;
}

#[derive(Clone)]
pub struct DropboxRemote {
    client: DropboxClient,
}

impl DropboxRemote {
    pub fn new(client: DropboxClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl RemoteStore for DropboxRemote {
    async fn list_folder(
        &self,
        path: &str,
        recursive: bool,
    ) -> Result<Vec<RemoteEntry>, RemoteError> {
        let mut page = self.client.list_folder(api_path(path), recursive).await?;
        let mut entries = Vec::new();
        loop {
            for metadata in page.entries {
                if matches!(metadata, Metadata::Deleted { .. }) {
                    continue;
                }
                entries.push(RemoteEntry::from_metadata(metadata)?);
            }
            if !page.has_more {
                break;
            }
            page = self.client.list_folder_continue(&page.cursor).await?;
        }
        entries.sort_by_cached_key(|entry| entry.path.to_lowercase());
        Ok(entries)
    }

    async fn get_metadata(&self, path: &str) -> Result<RemoteEntry, RemoteError> {
        RemoteEntry::from_metadata(self.client.get_metadata(path).await?)
    }

    async fn upload(&self, contents: Vec<u8>, path: &str) -> Result<RemoteEntry, RemoteError> {
        RemoteEntry::from_metadata(self.client.upload(contents, path).await?)
    }

    async fn upload_session_start(&self) -> Result<String, RemoteError> {
        Ok(self.client.upload_session_start().await?.session_id)
    }

    async fn upload_session_append(
        &self,
        session_id: &str,
        offset: u64,
        chunk: Vec<u8>,
    ) -> Result<(), RemoteError> {
        Ok(self
            .client
            .upload_session_append(session_id, offset, chunk)
            .await?)
    }

    async fn upload_session_finish(
        &self,
        session_id: &str,
        offset: u64,
        path: &str,
    ) -> Result<RemoteEntry, RemoteError> {
        let metadata = self
            .client
            .upload_session_finish(session_id, offset, path)
            .await?;
        RemoteEntry::from_metadata(metadata)
    }

    async fn download_to_file(
        &self,
        local: &Path,
        remote: &str,
    ) -> Result<RemoteEntry, RemoteError> {
        let (metadata, response) = self.client.download(remote).await?;
        write_body(local, response).await?;
        RemoteEntry::from_metadata(metadata)
    }

    async fn download_archive_to_file(
        &self,
        local: &Path,
        remote: &str,
    ) -> Result<(), RemoteError> {
        let response = self.client.download_zip(remote).await?;
        write_body(local, response).await
    }

    async fn delete(&self, path: &str) -> Result<(), RemoteError> {
        self.client.delete(path).await?;
        Ok(())
    }

    async fn move_entry(&self, from: &str, to: &str) -> Result<(), RemoteError> {
        self.client.move_entry(from, to).await?;
        Ok(())
    }

    async fn create_folder(&self, path: &str) -> Result<(), RemoteError> {
        self.client.create_folder(path).await?;
        Ok(())
    }

    async fn delete_batch(&self, paths: &[String]) -> Result<Option<String>, RemoteError> {
        match self.client.delete_batch(paths).await? {
            DeleteBatchLaunch::AsyncJobId { async_job_id } => Ok(Some(async_job_id)),
            DeleteBatchLaunch::Complete | DeleteBatchLaunch::Other => Ok(None),
        }
    }
}

async fn write_body(target: &Path, response: reqwest::Response) -> Result<(), RemoteError> {
    let mut file = tokio::fs::File::create(target).await?;
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(DbxError::from)?;
        file.write_all(&chunk).await?;
    }
    file.flush().await?;
    file.sync_all().await?;
    Ok(())
}
