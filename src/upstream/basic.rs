use super::UpstreamCredential;
use crate::challenge::Scope;
use crate::error::Result;

/// Fixed Basic credential from configuration. No network calls, no cache.
pub struct BasicBroker {
    username: String,
    password: String,
}

impl BasicBroker {
    pub fn new(username: String, password: String) -> Self {
        Self { username, password }
    }

    pub async fn acquire(&self, _scopes: &[Scope]) -> Result<UpstreamCredential> {
        Ok(UpstreamCredential::Basic {
            username: self.username.clone(),
            password: self.password.clone(),
        })
    }

    pub async fn reacquire(&self, scopes: &[Scope]) -> Result<UpstreamCredential> {
        self.acquire(scopes).await
    }
}
