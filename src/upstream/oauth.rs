use super::single_flight::SingleFlight;
use super::{retry_with_backoff, scope_key, ScopeKey, UpstreamCredential};
use crate::challenge::Scope;
use crate::error::{ProxyError, Result};
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::debug;

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: Option<String>,
    access_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    issued_at: Option<DateTime<Utc>>,
}

/// Distribution token-protocol broker (used by GCR and any other
/// token-service upstream). `GET <token_url>?service=<svc>&scope=<s>...`
/// with HTTP Basic toward the configured token-service account.
pub struct OauthBroker {
    client: Client,
    token_url: String,
    service: String,
    username: String,
    password: String,
    ready: RwLock<HashMap<ScopeKey, (String, DateTime<Utc>)>>,
    single_flight: SingleFlight<ScopeKey, (String, DateTime<Utc>)>,
}

impl OauthBroker {
    pub fn new(token_url: String, service: String, username: String, password: String) -> Self {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(60))
            .build()
            .unwrap_or_default();

        Self {
            client,
            token_url,
            service,
            username,
            password,
            ready: RwLock::new(HashMap::new()),
            single_flight: SingleFlight::new(),
        }
    }

    pub async fn acquire(&self, scopes: &[Scope]) -> Result<UpstreamCredential> {
        let key = scope_key(scopes);

        if let Some(cred) = self.cached(&key).await {
            return Ok(cred);
        }

        self.refresh(key, scopes.to_vec()).await
    }

    pub async fn reacquire(&self, scopes: &[Scope]) -> Result<UpstreamCredential> {
        let key = scope_key(scopes);
        self.ready.write().await.remove(&key);
        self.refresh(key, scopes.to_vec()).await
    }

    async fn cached(&self, key: &ScopeKey) -> Option<UpstreamCredential> {
        let ready = self.ready.read().await;
        let (token, expires_at) = ready.get(key)?;
        if UpstreamCredential::is_fresh(expires_at) {
            Some(UpstreamCredential::Bearer {
                token: token.clone(),
                expires_at: *expires_at,
            })
        } else {
            None
        }
    }

    async fn refresh(&self, key: ScopeKey, scopes: Vec<Scope>) -> Result<UpstreamCredential> {
        let client = self.client.clone();
        let token_url = self.token_url.clone();
        let service = self.service.clone();
        let username = self.username.clone();
        let password = self.password.clone();

        let (token, expires_at) = self
            .single_flight
            .run(key.clone(), async move {
                retry_with_backoff(|| {
                    fetch_token(&client, &token_url, &service, &username, &password, &scopes)
                })
                .await
            })
            .await?;

        self.ready.write().await.insert(key, (token.clone(), expires_at));

        Ok(UpstreamCredential::Bearer { token, expires_at })
    }
}

async fn fetch_token(
    client: &Client,
    token_url: &str,
    service: &str,
    username: &str,
    password: &str,
    scopes: &[Scope],
) -> Result<(String, DateTime<Utc>)> {
    let mut url = reqwest::Url::parse(token_url)
        .map_err(|e| ProxyError::Internal(format!("invalid token_url: {}", e)))?;

    {
        let mut query = url.query_pairs_mut();
        query.append_pair("service", service);
        for scope in scopes {
            query.append_pair("scope", &scope.to_wire());
        }
    }

    debug!("requesting upstream token from {}", url);

    let response = client
        .get(url)
        .basic_auth(username, Some(password))
        .send()
        .await
        .map_err(ProxyError::Upstream)?;

    let status = response.status();
    if status.is_server_error() {
        return Err(ProxyError::UpstreamUnavailable(format!(
            "token service returned {}",
            status
        )));
    }
    if status == StatusCode::UNAUTHORIZED || status.is_client_error() {
        return Err(ProxyError::UpstreamAuth(format!(
            "token service returned {}",
            status
        )));
    }

    let body: TokenResponse = response.json().await.map_err(ProxyError::Upstream)?;

    let token = body
        .token
        .or(body.access_token)
        .ok_or_else(|| ProxyError::UpstreamAuth("token response missing token".into()))?;

    let issued_at = body.issued_at.unwrap_or_else(Utc::now);
    let expires_in = body.expires_in.unwrap_or(300);
    let expires_at = issued_at + chrono::Duration::seconds(expires_in);

    Ok((token, expires_at))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_response_accepts_either_field_name() {
        let via_token: TokenResponse =
            serde_json::from_str(r#"{"token":"abc","expires_in":300}"#).unwrap();
        assert_eq!(via_token.token.as_deref(), Some("abc"));

        let via_access_token: TokenResponse =
            serde_json::from_str(r#"{"access_token":"xyz"}"#).unwrap();
        assert_eq!(via_access_token.access_token.as_deref(), Some("xyz"));
    }
}
