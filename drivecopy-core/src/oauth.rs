use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use crate::auth::{CredentialError, TokenSource};

const DEFAULT_BASE_URL: &str = "https://login.microsoftonline.com";
pub const DEFAULT_SCOPE: &str = "https://graph.microsoft.com/.default";

#[derive(Debug, Error)]
pub enum OAuthError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid base url: {0}")]
    Url(#[from] url::ParseError),
    #[error("token endpoint returned {status}: {body}")]
    Api { status: StatusCode, body: String },
}

#[derive(Clone)]
pub struct OAuthClient {
    http: Client,
    base_url: Url,
    tenant: String,
    client_id: String,
    client_secret: String,
}

impl OAuthClient {
    pub fn new(
        tenant: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
    ) -> Result<Self, OAuthError> {
        Self::with_base_url(DEFAULT_BASE_URL, tenant, client_id, client_secret)
    }

    pub fn with_base_url(
        base_url: &str,
        tenant: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
    ) -> Result<Self, OAuthError> {
        Ok(Self {
            http: Client::new(),
            base_url: Url::parse(base_url)?,
            tenant: tenant.into(),
            client_id: client_id.into(),
            client_secret: client_secret.into(),
        })
    }

    pub fn tenant(&self) -> &str {
        &self.tenant
    }

    pub fn token_url(&self) -> Result<Url, OAuthError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| url::ParseError::RelativeUrlWithCannotBeABaseBase)?
            .pop_if_empty()
            .extend([self.tenant.as_str(), "oauth2", "v2.0", "token"]);
        Ok(url)
    }

    /// Client-credentials grant: app identity only, no user and no refresh token.
    pub async fn client_credentials(&self, scope: &str) -> Result<OAuthToken, OAuthError> {
        let url = self.token_url()?;
        let form = [
            ("grant_type", "client_credentials"),
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
            ("scope", scope),
        ];

        let response = self.http.post(url).form(&form).send().await?;
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
}

/// Token source backed by the client-credentials grant.
#[derive(Clone)]
pub struct ClientCredentials {
    client: OAuthClient,
    scope: String,
}

impl ClientCredentials {
    pub fn new(client: OAuthClient) -> Self {
        Self::with_scope(client, DEFAULT_SCOPE)
    }

    pub fn with_scope(client: OAuthClient, scope: impl Into<String>) -> Self {
        Self {
            client,
            scope: scope.into(),
        }
    }
}

#[async_trait]
impl TokenSource for ClientCredentials {
    async fn fetch_token(&self) -> Result<String, CredentialError> {
        let token = self.client.client_credentials(&self.scope).await?;
        Ok(token.access_token)
    }
}
