use super::single_flight::SingleFlight;
use super::{retry_with_backoff, UpstreamCredential};
use crate::challenge::Scope;
use crate::error::{ProxyError, Result};
use aws_config::{meta::region::RegionProviderChain, BehaviorVersion, Region};
use chrono::{DateTime, Utc};
use tokio::sync::{OnceCell, RwLock};

/// ECR authorization-token broker. Cached under the single key "ecr";
/// refresh follows the token's `expiresAt` with the standard expiry skew.
pub struct AwsEcrBroker {
    region: String,
    client: OnceCell<aws_sdk_ecr::Client>,
    ready: RwLock<Option<(String, DateTime<Utc>)>>,
    single_flight: SingleFlight<(), (String, DateTime<Utc>)>,
}

impl AwsEcrBroker {
    pub fn new(region: String) -> Self {
        Self {
            region,
            client: OnceCell::new(),
            ready: RwLock::new(None),
            single_flight: SingleFlight::new(),
        }
    }

    pub async fn acquire(&self, _scopes: &[Scope]) -> Result<UpstreamCredential> {
        if let Some(cred) = self.cached().await {
            return Ok(cred);
        }
        self.refresh().await
    }

    pub async fn reacquire(&self, scopes: &[Scope]) -> Result<UpstreamCredential> {
        *self.ready.write().await = None;
        self.acquire(scopes).await
    }

    async fn cached(&self) -> Option<UpstreamCredential> {
        let ready = self.ready.read().await;
        let (token, expires_at) = ready.as_ref()?;
        if UpstreamCredential::is_fresh(expires_at) {
            Some(UpstreamCredential::AwsEcrToken {
                basic_b64: token.clone(),
                expires_at: *expires_at,
            })
        } else {
            None
        }
    }

    async fn refresh(&self) -> Result<UpstreamCredential> {
        let client = self.client().await.clone();

        let (token, expires_at) = self
            .single_flight
            .run((), async move { retry_with_backoff(|| fetch_ecr_token(&client)).await })
            .await?;

        *self.ready.write().await = Some((token.clone(), expires_at));

        Ok(UpstreamCredential::AwsEcrToken {
            basic_b64: token,
            expires_at,
        })
    }

    async fn client(&self) -> &aws_sdk_ecr::Client {
        self.client
            .get_or_init(|| async {
                let region = RegionProviderChain::first_try(Region::new(self.region.clone()));
                let config = aws_config::defaults(BehaviorVersion::latest())
                    .region(region)
                    .load()
                    .await;
                aws_sdk_ecr::Client::new(&config)
            })
            .await
    }
}

async fn fetch_ecr_token(client: &aws_sdk_ecr::Client) -> Result<(String, DateTime<Utc>)> {
    let response = client
        .get_authorization_token()
        .send()
        .await
        .map_err(|e| ProxyError::UpstreamAuth(format!("ECR GetAuthorizationToken failed: {}", e)))?;

    let data = response
        .authorization_data()
        .first()
        .ok_or_else(|| ProxyError::UpstreamAuth("ECR returned no authorization data".into()))?;

    let token = data
        .authorization_token()
        .ok_or_else(|| ProxyError::UpstreamAuth("ECR authorization data missing token".into()))?
        .to_string();

    let expires_at = data
        .expires_at()
        .and_then(|t| DateTime::from_timestamp(t.secs(), 0))
        .unwrap_or_else(|| Utc::now() + chrono::Duration::hours(12));

    Ok((token, expires_at))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broker_starts_with_no_cached_token() {
        let broker = AwsEcrBroker::new("us-east-1".to_string());
        assert!(broker.ready.try_read().unwrap().is_none());
    }
}
