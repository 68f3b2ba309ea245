use std::sync::Arc;

use async_trait::async_trait;
use drivecopy_core::{CredentialError, Credentials, TokenSource};
use tokio::sync::Mutex;

/// Caches the bearer token of a [`TokenSource`] until the call layer asks
/// for it to be dropped.
pub struct TokenProvider {
    source: Arc<dyn TokenSource>,
    cached: Mutex<Option<String>>,
}

impl TokenProvider {
    pub fn new(source: Arc<dyn TokenSource>) -> Self {
        Self {
            source,
            cached: Mutex::new(None),
        }
    }

    pub async fn valid_access_token(&self) -> Result<String, CredentialError> {
        let mut cached = self.cached.lock().await;
        if let Some(token) = cached.as_ref() {
            return Ok(token.clone());
        }
        let token = self.source.fetch_token().await?;
        *cached = Some(token.clone());
        Ok(token)
    }
}

#[async_trait]
impl Credentials for TokenProvider {
    async fn bearer_token(&self) -> Result<String, CredentialError> {
        self.valid_access_token().await
    }

    async fn invalidate(&self) -> Result<(), CredentialError> {
        self.cached.lock().await.take();
        Ok(())
    }
}
