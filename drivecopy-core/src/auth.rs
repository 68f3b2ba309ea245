use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("token request failed: {0}")]
    OAuth(#[from] crate::oauth::OAuthError),
    #[error("credentials are not configured: {0}")]
    Missing(String),
}

/// Produces a fresh bearer token on every call. Caching lives one level up.
#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn fetch_token(&self) -> Result<String, CredentialError>;
}

/// Bearer token handed in from outside (environment, tests).
#[derive(Debug, Clone)]
pub struct StaticToken(String);

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }
}

#[async_trait]
impl TokenSource for StaticToken {
    async fn fetch_token(&self) -> Result<String, CredentialError> {
        Ok(self.0.clone())
    }
}

/// What the call layer needs from a credential provider: a (cached) token
/// and a way to drop the cache so the next call fetches a new one.
#[async_trait]
pub trait Credentials: Send + Sync {
    async fn bearer_token(&self) -> Result<String, CredentialError>;

    async fn invalidate(&self) -> Result<(), CredentialError>;
}
