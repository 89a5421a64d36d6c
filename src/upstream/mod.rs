//! The upstream credential broker (spec.md §4.B): three variants sharing
//! one `acquire(scopes) -> UpstreamCredential` contract, modeled as a
//! tagged enum per design note §9 rather than via inheritance.

pub mod aws_ecr;
pub mod basic;
pub mod oauth;
mod single_flight;

use crate::challenge::Scope;
use crate::config::UpstreamConfig;
use crate::error::{ProxyError, Result};
use chrono::{DateTime, Utc};
use reqwest::header::AUTHORIZATION;
use reqwest::RequestBuilder;
use std::time::Duration;

/// Expiry skew applied to every cached credential: a credential within
/// `SKEW` of its `expires_at` is treated as already expired (spec.md §4.B,
/// invariant 4: skew >= 10 seconds).
pub const EXPIRY_SKEW: chrono::Duration = chrono::Duration::seconds(10);

const RETRY_BACKOFFS: &[Duration] = &[Duration::from_millis(200), Duration::from_millis(800)];

/// An upstream credential, tagged by the flavor of upstream that issued it.
#[derive(Debug, Clone)]
pub enum UpstreamCredential {
    Basic {
        username: String,
        password: String,
    },
    Bearer {
        token: String,
        expires_at: DateTime<Utc>,
    },
    /// An ECR authorization token: base64(`user:pass`), presented to the
    /// upstream as an ordinary `Authorization: Basic <token>` header.
    AwsEcrToken {
        basic_b64: String,
        expires_at: DateTime<Utc>,
    },
}

impl UpstreamCredential {
    /// Attach this credential to an outbound request the way its flavor
    /// requires, so callers never need to match on the variant.
    pub fn apply(&self, req: RequestBuilder) -> RequestBuilder {
        match self {
            UpstreamCredential::Basic { username, password } => req.basic_auth(username, Some(password)),
            UpstreamCredential::Bearer { token, .. } => req.bearer_auth(token),
            UpstreamCredential::AwsEcrToken { basic_b64, .. } => {
                req.header(AUTHORIZATION, format!("Basic {}", basic_b64))
            }
        }
    }

    fn is_fresh(expires_at: &DateTime<Utc>) -> bool {
        Utc::now() + EXPIRY_SKEW < *expires_at
    }
}

/// A normalized, order-independent cache key for a scope set.
pub type ScopeKey = Vec<String>;

pub fn scope_key(scopes: &[Scope]) -> ScopeKey {
    let mut key: Vec<String> = scopes.iter().map(Scope::to_wire).collect();
    key.sort_unstable();
    key
}

/// Run `attempt` with up to `RETRY_BACKOFFS.len()` retries on a retriable
/// failure (network error or HTTP >= 500), sleeping the configured backoff
/// between attempts. A non-retriable failure (HTTP 4xx) is returned
/// immediately.
pub(crate) async fn retry_with_backoff<T, F, Fut>(mut attempt: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut last_err = None;

    for backoff in std::iter::once(None).chain(RETRY_BACKOFFS.iter().copied().map(Some)) {
        if let Some(delay) = backoff {
            tokio::time::sleep(delay).await;
        }

        match attempt().await {
            Ok(value) => return Ok(value),
            Err(err) if is_retriable(&err) => last_err = Some(err),
            Err(err) => return Err(err),
        }
    }

    Err(last_err.unwrap_or_else(|| ProxyError::Internal("retry loop produced no attempts".into())))
}

fn is_retriable(err: &ProxyError) -> bool {
    match err {
        ProxyError::Upstream(e) => e.is_timeout() || e.is_connect() || e.status().map(|s| s.is_server_error()).unwrap_or(true),
        ProxyError::UpstreamUnavailable(_) => true,
        _ => false,
    }
}

/// Tagged union over the three upstream credential flavors, constructed
/// once at startup from `UpstreamConfig` and shared across all requests.
pub enum UpstreamClient {
    Basic(basic::BasicBroker),
    Oauth(oauth::OauthBroker),
    AwsEcr(aws_ecr::AwsEcrBroker),
}

impl UpstreamClient {
    pub fn from_config(config: &UpstreamConfig) -> Self {
        match config {
            UpstreamConfig::Basic {
                basic_username,
                basic_password,
                ..
            } => UpstreamClient::Basic(basic::BasicBroker::new(
                basic_username.clone(),
                basic_password.clone(),
            )),
            UpstreamConfig::Oauth {
                token_url,
                service,
                username,
                password,
                ..
            } => UpstreamClient::Oauth(oauth::OauthBroker::new(
                token_url.clone(),
                service.clone(),
                username.clone(),
                password.clone(),
            )),
            UpstreamConfig::AwsEcr { region, .. } => {
                UpstreamClient::AwsEcr(aws_ecr::AwsEcrBroker::new(region.clone()))
            }
        }
    }

    /// Acquire a credential carrying `scopes`, serving from cache when
    /// fresh and coalescing concurrent misses for the same scope set.
    pub async fn acquire(&self, scopes: &[Scope]) -> Result<UpstreamCredential> {
        match self {
            UpstreamClient::Basic(broker) => broker.acquire(scopes).await,
            UpstreamClient::Oauth(broker) => broker.acquire(scopes).await,
            UpstreamClient::AwsEcr(broker) => broker.acquire(scopes).await,
        }
    }

    /// Discard any cached credential for `scopes` and acquire a fresh one,
    /// used after a 401 challenge names a scope set (spec.md §4.F).
    pub async fn reacquire(&self, scopes: &[Scope]) -> Result<UpstreamCredential> {
        match self {
            UpstreamClient::Basic(broker) => broker.reacquire(scopes).await,
            UpstreamClient::Oauth(broker) => broker.reacquire(scopes).await,
            UpstreamClient::AwsEcr(broker) => broker.reacquire(scopes).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scope_key_is_order_independent() {
        let a = vec![
            Scope::new("repository", "a/x", vec!["pull".to_string()]),
            Scope::new("repository", "b/y", vec!["push".to_string()]),
        ];
        let b = vec![a[1].clone(), a[0].clone()];
        assert_eq!(scope_key(&a), scope_key(&b));
    }

    #[tokio::test]
    async fn retry_gives_up_after_configured_backoffs() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        let attempts = AtomicUsize::new(0);

        let result: Result<()> = retry_with_backoff(|| {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err(ProxyError::UpstreamUnavailable("down".into())) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), RETRY_BACKOFFS.len() + 1);
    }

    #[tokio::test]
    async fn non_retriable_failure_returns_immediately() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        let attempts = AtomicUsize::new(0);

        let result: Result<()> = retry_with_backoff(|| {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err(ProxyError::BadRequest("nope".into())) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }
}
