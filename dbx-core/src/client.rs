use std::time::SystemTime;

use reqwest::header::{CONTENT_TYPE, HeaderMap, RETRY_AFTER};
use reqwest::{Body, Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;
use url::Url;

const DEFAULT_API_URL: &str = "https://api.dropboxapi.com";
const DEFAULT_CONTENT_URL: &str = "https://content.dropboxapi.com";
const API_ARG_HEADER: &str = "Dropbox-API-Arg";
const API_RESULT_HEADER: &str = "Dropbox-API-Result";

#[derive(Debug, Error)]
pub enum DbxError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("api returned {status}: {body}")]
    Api {
        status: StatusCode,
        body: String,
        retry_after: Option<u64>,
    },
    #[error("content response is missing the Dropbox-API-Result header")]
    MissingResultHeader,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiErrorClass {
    Auth,
    RateLimit,
    Transient,
    Permanent,
}

#[derive(Clone)]
pub struct DropboxClient {
    http: Client,
    api_url: Url,
    content_url: Url,
    token: String,
}

impl DropboxClient {
    pub fn new(token: impl Into<String>) -> Result<Self, DbxError> {
        Self::with_base_urls(DEFAULT_API_URL, DEFAULT_CONTENT_URL, token)
    }

    /// Points both the RPC and the content endpoints at custom hosts.
    pub fn with_base_urls(
        api_url: &str,
        content_url: &str,
        token: impl Into<String>,
    ) -> Result<Self, DbxError> {
        Ok(Self {
            http: Client::new(),
            api_url: Url::parse(api_url)?,
            content_url: Url::parse(content_url)?,
            token: token.into(),
        })
    }

    pub fn with_base_url(base_url: &str, token: impl Into<String>) -> Result<Self, DbxError> {
        Self::with_base_urls(base_url, base_url, token)
    }

    pub async fn get_current_account(&self) -> Result<Account, DbxError> {
        self.rpc("/2/users/get_current_account", &Value::Null).await
    }

    pub async fn list_folder(&self, path: &str, recursive: bool) -> Result<ListFolderPage, DbxError> {
        self.rpc(
            "/2/files/list_folder",
            &json!({ "path": path, "recursive": recursive }),
        )
        .await
    }

    pub async fn list_folder_continue(&self, cursor: &str) -> Result<ListFolderPage, DbxError> {
        self.rpc("/2/files/list_folder/continue", &json!({ "cursor": cursor }))
            .await
    }

    pub async fn get_metadata(&self, path: &str) -> Result<Metadata, DbxError> {
        self.rpc("/2/files/get_metadata", &json!({ "path": path }))
            .await
    }

    pub async fn create_folder(&self, path: &str) -> Result<Metadata, DbxError> {
        let result: MetadataResult = self
            .rpc(
                "/2/files/create_folder_v2",
                &json!({ "path": path, "autorename": false }),
            )
            .await?;
        Ok(result.metadata)
    }

    pub async fn delete(&self, path: &str) -> Result<Metadata, DbxError> {
        let result: MetadataResult = self
            .rpc("/2/files/delete_v2", &json!({ "path": path }))
            .await?;
        Ok(result.metadata)
    }

    pub async fn move_entry(&self, from: &str, to: &str) -> Result<Metadata, DbxError> {
        let result: MetadataResult = self
            .rpc(
                "/2/files/move_v2",
                &json!({ "from_path": from, "to_path": to, "autorename": false }),
            )
            .await?;
        Ok(result.metadata)
    }

    pub async fn delete_batch(&self, paths: &[String]) -> Result<DeleteBatchLaunch, DbxError> {
        let entries: Vec<Value> = paths.iter().map(|p| json!({ "path": p })).collect();
        self.rpc("/2/files/delete_batch", &json!({ "entries": entries }))
            .await
    }

    /// Single-shot upload, always overwriting the destination.
    pub async fn upload(&self, body: impl Into<Body>, path: &str) -> Result<Metadata, DbxError> {
        let response = self
            .content_request(
                "/2/files/upload",
                &json!({ "path": path, "mode": "overwrite", "mute": true }),
            )?
            .header(CONTENT_TYPE, "application/octet-stream")
            .body(body)
            .send()
            .await?;
        Self::handle_response(response).await
    }

    pub async fn upload_session_start(&self) -> Result<UploadSessionStart, DbxError> {
        let response = self
            .content_request("/2/files/upload_session/start", &json!({ "close": false }))?
            .header(CONTENT_TYPE, "application/octet-stream")
            .body(Vec::new())
            .send()
            .await?;
        Self::handle_response(response).await
    }

    pub async fn upload_session_append(
        &self,
        session_id: &str,
        offset: u64,
        body: impl Into<Body>,
    ) -> Result<(), DbxError> {
        let response = self
            .content_request(
                "/2/files/upload_session/append_v2",
                &json!({
                    "cursor": { "session_id": session_id, "offset": offset },
                    "close": false
                }),
            )?
            .header(CONTENT_TYPE, "application/octet-stream")
            .body(body)
            .send()
            .await?;
        Self::handle_empty_response(response).await
    }

    pub async fn upload_session_finish(
        &self,
        session_id: &str,
        offset: u64,
        path: &str,
    ) -> Result<Metadata, DbxError> {
        let response = self
            .content_request(
                "/2/files/upload_session/finish",
                &json!({
                    "cursor": { "session_id": session_id, "offset": offset },
                    "commit": { "path": path, "mode": "overwrite", "mute": true }
                }),
            )?
            .header(CONTENT_TYPE, "application/octet-stream")
            .body(Vec::new())
            .send()
            .await?;
        Self::handle_response(response).await
    }

    /// Starts a file download. The body is left unread so callers can stream it.
    pub async fn download(&self, path: &str) -> Result<(Metadata, Response), DbxError> {
        let response = self
            .content_request("/2/files/download", &json!({ "path": path }))?
            .send()
            .await?;
        let response = Self::check_status(response).await?;
        let metadata = result_header(response.headers())?;
        Ok((metadata, response))
    }

    /// Starts a zip download of a whole folder subtree.
    pub async fn download_zip(&self, path: &str) -> Result<Response, DbxError> {
        let response = self
            .content_request("/2/files/download_zip", &json!({ "path": path }))?
            .send()
            .await?;
        Self::check_status(response).await
    }

    fn auth_header_value(&self) -> String {
        format!("Bearer {}", self.token)
    }

    async fn rpc<T: DeserializeOwned>(&self, endpoint: &str, arg: &Value) -> Result<T, DbxError> {
        let url = self.api_url.join(endpoint)?;
        let response = self
            .http
            .post(url)
            .header("Authorization", self.auth_header_value())
            .json(arg)
            .send()
            .await?;
        Self::handle_response(response).await
    }

    fn content_request(
        &self,
        endpoint: &str,
        arg: &Value,
    ) -> Result<reqwest::RequestBuilder, DbxError> {
        let url = self.content_url.join(endpoint)?;
        Ok(self
            .http
            .post(url)
            .header("Authorization", self.auth_header_value())
            .header(API_ARG_HEADER, api_arg_header(arg)?))
    }

    async fn check_status(response: Response) -> Result<Response, DbxError> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status();
        let retry_after = retry_after_secs(response.headers());
        let body = response.text().await.unwrap_or_default();
        Err(DbxError::Api {
            status,
            body,
            retry_after,
        })
    }

    async fn handle_response<T: DeserializeOwned>(response: Response) -> Result<T, DbxError> {
        let response = Self::check_status(response).await?;
        Ok(response.json::<T>().await?)
    }

    async fn handle_empty_response(response: Response) -> Result<(), DbxError> {
        Self::check_status(response).await?;
        Ok(())
    }
}

impl DbxError {
    pub fn classification(&self) -> Option<ApiErrorClass> {
        match self {
            DbxError::Api { status, .. } => Some(classify_api_status(*status)),
            _ => None,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self.classification(),
            Some(ApiErrorClass::RateLimit | ApiErrorClass::Transient)
        )
    }

    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            DbxError::Api { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

fn classify_api_status(status: StatusCode) -> ApiErrorClass {
    if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
        ApiErrorClass::Auth
    } else if status == StatusCode::TOO_MANY_REQUESTS {
        ApiErrorClass::RateLimit
    } else if status.is_server_error() || status == StatusCode::REQUEST_TIMEOUT {
        ApiErrorClass::Transient
    } else {
        // 409 carries endpoint-specific errors (path/not_found, ...).
        ApiErrorClass::Permanent
    }
}

fn retry_after_secs(headers: &HeaderMap) -> Option<u64> {
    let value = headers.get(RETRY_AFTER)?.to_str().ok()?.trim();
    if let Ok(seconds) = value.parse::<u64>() {
        return Some(seconds);
    }
    let at = httpdate::parse_http_date(value).ok()?;
    Some(
        at.duration_since(SystemTime::now())
            .map(|d| d.as_secs())
            .unwrap_or(0),
    )
}

/// HTTP headers must stay ASCII, so non-ASCII characters are sent as `\uXXXX` escapes.
fn api_arg_header(arg: &Value) -> Result<String, DbxError> {
    let raw = serde_json::to_string(arg)?;
    let mut out = String::with_capacity(raw.len());
    for ch in raw.chars() {
        if ch.is_ascii() && ch != '\x7f' {
            out.push(ch);
        } else {
            let mut units = [0u16; 2];
            for unit in ch.encode_utf16(&mut units) {
                out.push_str(&format!("\\u{unit:04x}"));
            }
        }
    }
    Ok(out)
}

fn result_header(headers: &HeaderMap) -> Result<Metadata, DbxError> {
    let raw = headers
        .get(API_RESULT_HEADER)
        .ok_or(DbxError::MissingResultHeader)?
        .as_bytes();
    Ok(serde_json::from_slice(raw)?)
}

#[derive(Debug, Deserialize, Serialize)]
pub struct Account {
    pub account_id: String,
    #[serde(default)]
    pub email: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(tag = ".tag", rename_all = "lowercase")]
pub enum Metadata {
    File {
        name: String,
        #[serde(default)]
        path_lower: Option<String>,
        #[serde(default)]
        path_display: Option<String>,
        #[serde(default)]
        id: Option<String>,
        #[serde(default)]
        client_modified: Option<String>,
        server_modified: String,
        #[serde(default)]
        rev: Option<String>,
        size: u64,
        #[serde(default)]
        content_hash: Option<String>,
    },
    Folder {
        name: String,
        #[serde(default)]
        path_lower: Option<String>,
        #[serde(default)]
        path_display: Option<String>,
        #[serde(default)]
        id: Option<String>,
    },
    Deleted {
        name: String,
        #[serde(default)]
        path_lower: Option<String>,
        #[serde(default)]
        path_display: Option<String>,
    },
}

impl Metadata {
    pub fn name(&self) -> &str {
        match self {
            Metadata::File { name, .. }
            | Metadata::Folder { name, .. }
            | Metadata::Deleted { name, .. } => name,
        }
    }

    /// Display path, falling back to the lowercased path and then the bare name.
    pub fn path(&self) -> &str {
        let (display, lower) = match self {
            Metadata::File {
                path_display,
                path_lower,
                ..
            }
            | Metadata::Folder {
                path_display,
                path_lower,
                ..
            }
            | Metadata::Deleted {
                path_display,
                path_lower,
                ..
            } => (path_display, path_lower),
        };
        display
            .as_deref()
            .or(lower.as_deref())
            .unwrap_or_else(|| self.name())
    }

    pub fn path_lower(&self) -> String {
        match self {
            Metadata::File { path_lower, .. }
            | Metadata::Folder { path_lower, .. }
            | Metadata::Deleted { path_lower, .. } => path_lower
                .clone()
                .unwrap_or_else(|| self.path().to_lowercase()),
        }
    }

    pub fn is_file(&self) -> bool {
        matches!(self, Metadata::File { .. })
    }
}

#[derive(Debug, Deserialize, Serialize)]
pub struct ListFolderPage {
    pub entries: Vec<Metadata>,
    pub cursor: String,
    pub has_more: bool,
}

#[derive(Debug, Deserialize, Serialize)]
struct MetadataResult {
    metadata: Metadata,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct UploadSessionStart {
    pub session_id: String,
}

#[derive(Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(tag = ".tag", rename_all = "snake_case")]
pub enum DeleteBatchLaunch {
    AsyncJobId { async_job_id: String },
    Complete,
    #[serde(other)]
    Other,
}
