//! Adapter around the external identity service: turns a user identity and
//! a list of required permissions into an allow/deny decision. The wire
//! format of the identity service is out of scope (spec.md §6); this
//! module only needs to expose the two operations the rest of the proxy
//! depends on.

use crate::error::{ProxyError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// The action required on a platform resource. Ordered so that holding a
/// stronger action satisfies a weaker requirement: `Manage > Write > Read`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Read,
    Write,
    Manage,
}

impl Action {
    fn rank(self) -> u8 {
        match self {
            Action::Read => 0,
            Action::Write => 1,
            Action::Manage => 2,
        }
    }

    pub fn satisfies(self, required: Action) -> bool {
        self.rank() >= required.rank()
    }
}

impl PartialOrd for Action {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.rank().cmp(&other.rank()))
    }
}

impl Ord for Action {
    fn cmp(&self, other: &Self) -> Ordering {
        self.rank().cmp(&other.rank())
    }
}

/// A required or held permission on a platform resource:
/// `image://<cluster>/<org?>/<project>/<repo>` plus an action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Permission {
    pub uri: String,
    pub action: Action,
}

impl Permission {
    pub fn new(uri: impl Into<String>, action: Action) -> Self {
        Self {
            uri: uri.into(),
            action,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckOutcome {
    Allowed,
    Denied { missing: Vec<String> },
}

/// Adapter around the identity service. Calls are idempotent; a single
/// inbound proxy request performs exactly one `check` call, batching every
/// permission it needs (e.g. cross-repository blob mount needs both a
/// source `read` and a destination `write`, checked together).
#[async_trait]
pub trait PermissionChecker: Send + Sync {
    /// Check whether `user_token` holds every permission in `required`.
    async fn check(&self, user_token: &str, required: &[Permission]) -> Result<CheckOutcome>;

    /// List every `image://<cluster>/...` permission URI `user_token` holds
    /// `read` (or stronger) on, used to synthesize the virtualized catalog
    /// for non-admin callers.
    async fn list_readable(&self, user_token: &str, cluster: &str) -> Result<Vec<String>>;
}

#[derive(Debug, Serialize)]
struct CheckRequest<'a> {
    user_token: &'a str,
    permissions: &'a [Permission],
}

#[derive(Debug, Deserialize)]
struct CheckResponse {
    allowed: bool,
    #[serde(default)]
    missing: Vec<String>,
}

#[derive(Debug, Serialize)]
struct ListRequest<'a> {
    user_token: &'a str,
    cluster: &'a str,
}

#[derive(Debug, Deserialize)]
struct ListResponse {
    #[serde(default)]
    permissions: Vec<String>,
}

/// HTTP-backed `PermissionChecker` calling the configured identity service,
/// authenticating itself with the proxy's own service-account bearer token.
pub struct HttpPermissionChecker {
    client: reqwest::Client,
    base_url: String,
    service_token: String,
}

impl HttpPermissionChecker {
    pub fn new(base_url: String, service_token: String) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(std::time::Duration::from_secs(5))
            .timeout(std::time::Duration::from_secs(60))
            .build()
            .unwrap_or_default();

        Self {
            client,
            base_url,
            service_token,
        }
    }
}

#[async_trait]
impl PermissionChecker for HttpPermissionChecker {
    async fn check(&self, user_token: &str, required: &[Permission]) -> Result<CheckOutcome> {
        let url = format!("{}/v1/check-permissions", self.base_url);

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.service_token)
            .json(&CheckRequest {
                user_token,
                permissions: required,
            })
            .send()
            .await
            .map_err(ProxyError::Upstream)?;

        if !response.status().is_success() {
            return Err(ProxyError::Internal(format!(
                "identity service returned {}",
                response.status()
            )));
        }

        let body: CheckResponse = response.json().await.map_err(ProxyError::Upstream)?;

        Ok(if body.allowed {
            CheckOutcome::Allowed
        } else {
            CheckOutcome::Denied {
                missing: body.missing,
            }
        })
    }

    async fn list_readable(&self, user_token: &str, cluster: &str) -> Result<Vec<String>> {
        let url = format!("{}/v1/list-image-permissions", self.base_url);

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.service_token)
            .json(&ListRequest { user_token, cluster })
            .send()
            .await
            .map_err(ProxyError::Upstream)?;

        if !response.status().is_success() {
            return Err(ProxyError::Internal(format!(
                "identity service returned {}",
                response.status()
            )));
        }

        let body: ListResponse = response.json().await.map_err(ProxyError::Upstream)?;
        Ok(body.permissions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manage_satisfies_read_and_write() {
        assert!(Action::Manage.satisfies(Action::Read));
        assert!(Action::Manage.satisfies(Action::Write));
        assert!(Action::Manage.satisfies(Action::Manage));
    }

    #[test]
    fn write_does_not_satisfy_manage() {
        assert!(!Action::Write.satisfies(Action::Manage));
    }

    #[test]
    fn read_only_satisfies_read() {
        assert!(Action::Read.satisfies(Action::Read));
        assert!(!Action::Read.satisfies(Action::Write));
    }
}
