use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

const DEFAULT_AUTHORIZE_URL: &str = "https://www.dropbox.com";
const DEFAULT_TOKEN_URL: &str = "https://api.dropboxapi.com";

#[derive(Debug, Error)]
pub enum OAuthError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid base url: {0}")]
    Url(#[from] url::ParseError),
    #[error("api returned {status}: {body}")]
    Api { status: StatusCode, body: String },
}

#[derive(Clone)]
pub struct OAuthClient {
    http: Client,
    authorize_url: Url,
    token_url: Url,
    app_key: String,
    app_secret: String,
}

impl OAuthClient {
    pub fn new(app_key: impl Into<String>, app_secret: impl Into<String>) -> Result<Self, OAuthError> {
        Self::with_base_urls(DEFAULT_AUTHORIZE_URL, DEFAULT_TOKEN_URL, app_key, app_secret)
    }

    pub fn with_base_urls(
        authorize_url: &str,
        token_url: &str,
        app_key: impl Into<String>,
        app_secret: impl Into<String>,
    ) -> Result<Self, OAuthError> {
        Ok(Self {
            http: Client::new(),
            authorize_url: Url::parse(authorize_url)?,
            token_url: Url::parse(token_url)?,
            app_key: app_key.into(),
            app_secret: app_secret.into(),
        })
    }

    /// Code-flow URL that asks for an offline (refreshable) token.
    pub fn authorize_url(&self) -> Result<Url, OAuthError> {
        let mut url = self.authorize_url.join("/oauth2/authorize")?;
        url.query_pairs_mut()
            .append_pair("response_type", "code")
            .append_pair("client_id", &self.app_key)
            .append_pair("token_access_type", "offline");
        Ok(url)
    }

    pub async fn exchange_code(&self, code: &str) -> Result<OAuthToken, OAuthError> {
        self.token_request(&[("grant_type", "authorization_code"), ("code", code)])
            .await
    }

    pub async fn refresh_token(&self, refresh_token: &str) -> Result<OAuthToken, OAuthError> {
        self.token_request(&[
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
        ])
        .await
    }

    async fn token_request(&self, form: &[(&str, &str)]) -> Result<OAuthToken, OAuthError> {
        let url = self.token_url.join("/oauth2/token")?;
        let response = self
            .http
            .post(url)
            .basic_auth(&self.app_key, Some(&self.app_secret))
            .form(form)
            .send()
            .await?;
        if response.status().is_success() {
            Ok(response.json::<OAuthToken>().await?)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(OAuthError::Api { status, body })
        }
    }
}

#[derive(Debug, Deserialize, Serialize)]
pub struct OAuthToken {
    pub access_token: String,
    pub token_type: String,
    #[serde(default)]
    pub expires_in: Option<u64>,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub account_id: Option<String>,
}
