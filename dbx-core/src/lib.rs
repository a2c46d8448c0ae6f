mod client;
mod oauth;

pub use client::{
    Account, ApiErrorClass, DbxError, DeleteBatchLaunch, DropboxClient, ListFolderPage, Metadata,
    UploadSessionStart,
};
pub use oauth::{OAuthClient, OAuthError, OAuthToken};
