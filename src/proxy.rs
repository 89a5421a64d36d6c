//! HTTP entry point (spec.md §4.E): decodes client credentials, derives and
//! enforces the required access, acquires an upstream credential, forwards
//! the request with path/header rewriting, and streams the response back.

use crate::authorizer::Authorizer;
use crate::challenge::parse_www_authenticate;
use crate::config::Config;
use crate::error::{ProxyError, Result};
use crate::permissions::PermissionChecker;
use crate::repo_name::{self, Operation, RepoName};
use crate::upstream::UpstreamClient;
use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use reqwest::header as upstream_header;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::info;

pub struct ProxyState {
    pub config: Config,
    pub upstream: UpstreamClient,
    pub authorizer: Authorizer<dyn PermissionChecker>,
    pub http: reqwest::Client,
}

/// Headers that must never be forwarded to the upstream as-is: hop-by-hop
/// headers per RFC 7230 §6.1, plus `Authorization`/`Host` which carry the
/// client's platform credential and this proxy's own authority.
const STRIPPED_REQUEST_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
    "authorization",
    "host",
];

fn decode_basic_auth(headers: &HeaderMap) -> Result<(String, String)> {
    let raw = headers
        .get(header::AUTHORIZATION)
        .ok_or(ProxyError::Unauthenticated)?
        .to_str()
        .map_err(|_| ProxyError::BadRequest("Authorization header is not valid UTF-8".into()))?;

    let encoded = raw
        .strip_prefix("Basic ")
        .ok_or_else(|| ProxyError::BadRequest("Authorization header is not Basic".into()))?;

    let decoded = BASE64
        .decode(encoded)
        .map_err(|_| ProxyError::BadRequest("Authorization header is not valid base64".into()))?;
    let decoded = String::from_utf8(decoded)
        .map_err(|_| ProxyError::BadRequest("Authorization header is not valid UTF-8".into()))?;

    let (user, token) = decoded
        .split_once(':')
        .ok_or_else(|| ProxyError::BadRequest("Authorization header missing ':'".into()))?;

    if user.is_empty() || token.is_empty() {
        return Err(ProxyError::Unauthenticated);
    }

    Ok((user.to_string(), token.to_string()))
}

fn forwarded_request_headers(headers: &HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::new();
    for (name, value) in headers.iter() {
        if STRIPPED_REQUEST_HEADERS.contains(&name.as_str()) {
            continue;
        }
        out.append(name.clone(), value.clone());
    }
    out
}

pub async fn handle_version(State(state): State<Arc<ProxyState>>, headers: HeaderMap) -> Result<Response> {
    decode_basic_auth(&headers)?;
    Ok(Json(serde_json::json!({})).into_response())
}

#[derive(Debug, Deserialize)]
pub struct CatalogQuery {
    n: Option<usize>,
    last: Option<String>,
    org: Option<String>,
    project: Option<String>,
}

#[derive(Debug, Deserialize, Serialize)]
struct CatalogBody {
    repositories: Vec<String>,
    #[serde(flatten)]
    extra: Map<String, Value>,
}

#[derive(Debug, Deserialize, Serialize)]
struct TagsBody {
    name: String,
    tags: Vec<String>,
    #[serde(flatten)]
    extra: Map<String, Value>,
}

pub async fn handle_catalog(
    State(state): State<Arc<ProxyState>>,
    headers: HeaderMap,
    Query(query): Query<CatalogQuery>,
) -> Result<Response> {
    let (_user, token) = decode_basic_auth(&headers)?;

    if state.authorizer.is_cluster_admin(&token).await? {
        info!("admin catalog request, forwarding to upstream");
        let repos = fetch_admin_catalog(&state, query.n).await?;
        return Ok(Json(serde_json::json!({ "repositories": repos })).into_response());
    }

    let mut readable = state.authorizer.readable_repos(&token).await?;

    if let Some(org) = &query.org {
        readable.retain(|r| r.org.as_deref() == Some(org.as_str()));
    }
    if let Some(project) = &query.project {
        readable.retain(|r| r.project == *project);
    }

    let mut names: Vec<String> = readable.iter().map(RepoName::tenant_path).collect();
    names.sort();
    names.dedup();

    let page = paginate(&names, query.last.as_deref(), query.n);

    Ok(Json(serde_json::json!({ "repositories": page })).into_response())
}

/// Alphabetical cursor pagination: skip everything up to and including
/// `last`, then take at most `n` entries.
fn paginate(names: &[String], last: Option<&str>, n: Option<usize>) -> Vec<String> {
    let start = match last {
        Some(cursor) => names.iter().position(|name| name == cursor).map(|i| i + 1).unwrap_or(0),
        None => 0,
    };
    let slice = &names[start.min(names.len())..];
    match n {
        Some(limit) => slice.iter().take(limit).cloned().collect(),
        None => slice.to_vec(),
    }
}

async fn fetch_admin_catalog(state: &ProxyState, requested_n: Option<usize>) -> Result<Vec<String>> {
    let common = state.config.upstream.common();
    let cluster = state.authorizer.cluster();
    let limit = requested_n.unwrap_or(common.max_catalog_entries).min(common.max_catalog_entries);

    let scope = crate::challenge::Scope::new(
        "registry",
        "catalog",
        common.catalog_scope.splitn(3, ':').last().unwrap_or("*").split(',').map(String::from),
    );
    let credential = state.upstream.acquire(std::slice::from_ref(&scope)).await?;

    let mut collected = Vec::new();
    let mut next_url = format!("{}/v2/_catalog?n={}", common.url.trim_end_matches('/'), limit);

    while collected.len() < limit {
        let mut request = state.http.get(&next_url);
        request = credential.apply(request);
        let response = request.send().await.map_err(ProxyError::Upstream)?;

        if !response.status().is_success() {
            return Err(ProxyError::UpstreamUnavailable(format!(
                "upstream catalog returned {}",
                response.status()
            )));
        }

        let link = response
            .headers()
            .get(upstream_header::LINK)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let body: CatalogBody = response.json().await.map_err(ProxyError::Upstream)?;

        for upstream_name in &body.repositories {
            if collected.len() >= limit {
                break;
            }
            match RepoName::from_upstream_path(cluster, &common.project, upstream_name) {
                Ok(repo) => collected.push(repo.tenant_path()),
                Err(_) => continue,
            }
        }

        match link.and_then(|l| extract_link_next(&l)) {
            Some(next) => next_url = next,
            None => break,
        }
    }

    Ok(collected)
}

fn extract_link_next(link_header: &str) -> Option<String> {
    let url_part = link_header.split(';').next()?.trim();
    url_part.strip_prefix('<').and_then(|s| s.strip_suffix('>')).map(str::to_string)
}

#[derive(Debug, Deserialize)]
pub struct MountQuery {
    mount: Option<String>,
    from: Option<String>,
}

pub async fn handle_repo(
    method: Method,
    State(state): State<Arc<ProxyState>>,
    headers: HeaderMap,
    Path(rest): Path<String>,
    Query(mount): Query<MountQuery>,
    body: Body,
) -> Result<Response> {
    let (name, operation) =
        repo_name::parse_request_path(&rest).ok_or_else(|| ProxyError::BadRequest(format!("unrecognized path: {}", rest)))?;

    let cluster = state.authorizer.cluster();
    let repo = RepoName::parse_tenant(cluster, &name).map_err(|e| ProxyError::BadRequest(e.to_string()))?;

    let (_user, token) = decode_basic_auth(&headers)?;

    let common = state.config.upstream.common();
    let upstream_prefix = &common.project;
    let scope_actions = &common.repository_scope_actions;

    let required = if matches!(operation, Operation::BlobUploadInit) && mount.mount.is_some() && mount.from.is_some() {
        let from = mount.from.as_ref().unwrap();
        let src = RepoName::parse_tenant(cluster, from).map_err(|e| ProxyError::BadRequest(e.to_string()))?;
        state.authorizer.for_cross_repo_mount(&repo, &src, upstream_prefix, scope_actions)
    } else {
        state.authorizer.for_repo_request(&repo, &method, upstream_prefix, scope_actions)
    };

    state.authorizer.enforce(&token, &required).await?;

    let upstream_suffix = match &operation {
        Operation::Manifest(reference) => format!("/manifests/{}", reference),
        Operation::Blob(digest) => format!("/blobs/{}", digest),
        Operation::BlobUploadInit => "/blobs/uploads/".to_string(),
        Operation::BlobUploadSession(uuid) => format!("/blobs/uploads/{}", uuid),
        Operation::Tags => "/tags/list".to_string(),
    };

    let mut upstream_url = Url::parse(&format!(
        "{}/v2/{}{}",
        common.url.trim_end_matches('/'),
        repo.upstream_path(upstream_prefix),
        upstream_suffix
    ))
    .map_err(|e| ProxyError::Internal(format!("invalid upstream url: {}", e)))?;

    if let Some(mount_digest) = &mount.mount {
        upstream_url.query_pairs_mut().append_pair("mount", mount_digest);
        if let Some(from) = &mount.from {
            let src = RepoName::parse_tenant(cluster, from).map_err(|e| ProxyError::BadRequest(e.to_string()))?;
            upstream_url
                .query_pairs_mut()
                .append_pair("from", &src.upstream_path(upstream_prefix));
        }
    }

    let proxy_base = Url::parse(&format!(
        "http://{}",
        headers.get(header::HOST).and_then(|h| h.to_str().ok()).unwrap_or("localhost")
    ))
    .map_err(|e| ProxyError::Internal(format!("invalid host header: {}", e)))?;

    let fwd_headers = forwarded_request_headers(&headers);

    let credential = state.upstream.acquire(&required.upstream_scopes).await?;
    let has_body = matches!(method, Method::PUT | Method::POST | Method::PATCH);
    let response = send_streaming(&state, &method, &upstream_url, &fwd_headers, body, &credential).await?;

    let response = if response.status() == reqwest::StatusCode::UNAUTHORIZED {
        if let Some(challenge) = response
            .headers()
            .get(upstream_header::WWW_AUTHENTICATE)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_www_authenticate)
        {
            if has_body {
                // Body already streamed to the upstream, can't replay it. Reacquire
                // for the next attempt and surface this one as a failure.
                state.upstream.reacquire(&challenge.scopes).await?;
                return Err(ProxyError::UpstreamAuth(
                    "upstream rejected credentials after the request body was already sent".into(),
                ));
            }
            let credential = state.upstream.reacquire(&challenge.scopes).await?;
            let retried =
                send_with_bytes(&state, &method, &upstream_url, &fwd_headers, bytes::Bytes::new(), &credential).await?;
            if retried.status() == reqwest::StatusCode::UNAUTHORIZED {
                return Err(ProxyError::UpstreamAuth("upstream rejected credentials twice".into()));
            }
            retried
        } else {
            response
        }
    } else {
        response
    };

    build_response(&state, cluster, upstream_prefix, &proxy_base, &operation, response).await
}

async fn send_with_bytes(
    state: &ProxyState,
    method: &Method,
    url: &Url,
    headers: &HeaderMap,
    body: bytes::Bytes,
    credential: &crate::upstream::UpstreamCredential,
) -> Result<reqwest::Response> {
    let mut request = state.http.request(to_upstream_method(method), url.clone());
    request = copy_headers(request, headers);
    request = credential.apply(request);
    request = request.body(body);
    request.send().await.map_err(ProxyError::Upstream)
}

async fn send_streaming(
    state: &ProxyState,
    method: &Method,
    url: &Url,
    headers: &HeaderMap,
    body: Body,
    credential: &crate::upstream::UpstreamCredential,
) -> Result<reqwest::Response> {
    let mut request = state.http.request(to_upstream_method(method), url.clone());
    request = copy_headers(request, headers);
    request = credential.apply(request);

    let stream = body.into_data_stream();
    request = request.body(reqwest::Body::wrap_stream(stream));

    request.send().await.map_err(ProxyError::Upstream)
}

fn copy_headers(mut request: reqwest::RequestBuilder, headers: &HeaderMap) -> reqwest::RequestBuilder {
    for (name, value) in headers.iter() {
        request = request.header(name.as_str(), value.as_bytes());
    }
    request
}

/// axum and reqwest pin different major versions of the `http` crate, so
/// `axum::http::Method` and `reqwest::Method` are distinct types; convert by
/// round-tripping through the method name.
fn to_upstream_method(method: &Method) -> reqwest::Method {
    reqwest::Method::from_bytes(method.as_str().as_bytes()).unwrap_or(reqwest::Method::GET)
}

async fn build_response(
    state: &ProxyState,
    cluster: &str,
    upstream_prefix: &str,
    proxy_base: &Url,
    operation: &Operation,
    response: reqwest::Response,
) -> Result<Response> {
    let status = StatusCode::from_u16(response.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
    let mut response_headers = HeaderMap::new();

    for (name, value) in response.headers().iter() {
        let name_str = name.as_str();
        if name_str.eq_ignore_ascii_case("location") {
            if let Ok(rewritten) = repo_name::rewrite_upstream_url(
                value.to_str().unwrap_or_default(),
                proxy_base,
                cluster,
                upstream_prefix,
            ) {
                if let Ok(header_value) = HeaderValue::from_str(&rewritten) {
                    response_headers.insert(header::LOCATION, header_value);
                }
            }
            continue;
        }
        if name_str.eq_ignore_ascii_case("link") {
            if let Some(rewritten) = rewrite_link_header(value.to_str().unwrap_or_default(), proxy_base, cluster, upstream_prefix) {
                if let Ok(header_value) = HeaderValue::from_str(&rewritten) {
                    if let Ok(header_name) = HeaderName::from_bytes(b"link") {
                        response_headers.insert(header_name, header_value);
                    }
                }
            }
            continue;
        }
        if name_str.eq_ignore_ascii_case("transfer-encoding") || name_str.eq_ignore_ascii_case("connection") {
            continue;
        }
        if let (Ok(header_name), header_value) = (HeaderName::from_bytes(name.as_str().as_bytes()), value.clone()) {
            response_headers.append(header_name, header_value);
        }
    }

    if !status.is_success() {
        let bytes = response.bytes().await.map_err(ProxyError::Upstream)?;
        let mut builder = Response::builder().status(status);
        *builder.headers_mut().unwrap() = response_headers;
        return Ok(builder.body(Body::from(bytes)).unwrap());
    }

    match operation {
        Operation::Tags => {
            let bytes = response.bytes().await.map_err(ProxyError::Upstream)?;
            let mut body: TagsBody = serde_json::from_slice(&bytes)
                .map_err(|e| ProxyError::Internal(format!("invalid upstream tags body: {}", e)))?;
            if let Ok(repo) = RepoName::from_upstream_path(cluster, upstream_prefix, &body.name) {
                body.name = repo.tenant_path();
            }
            let encoded = serde_json::to_vec(&body)
                .map_err(|e| ProxyError::Internal(format!("failed to encode tags body: {}", e)))?;
            let mut builder = Response::builder().status(status);
            *builder.headers_mut().unwrap() = response_headers;
            builder.headers_mut().unwrap().remove(header::CONTENT_LENGTH);
            Ok(builder.body(Body::from(encoded)).unwrap())
        }
        _ => {
            let stream = response.bytes_stream();
            let mut builder = Response::builder().status(status);
            *builder.headers_mut().unwrap() = response_headers;
            Ok(builder.body(Body::from_stream(stream)).unwrap())
        }
    }
}

fn rewrite_link_header(raw: &str, proxy_base: &Url, cluster: &str, upstream_prefix: &str) -> Option<String> {
    let url_part = raw.split(';').next()?.trim();
    let rest = &raw[url_part.len()..];
    let inner = url_part.strip_prefix('<')?.strip_suffix('>')?;
    let rewritten = repo_name::rewrite_upstream_url(inner, proxy_base, cluster, upstream_prefix).ok()?;
    Some(format!("<{}>{}", rewritten, rest))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_well_formed_basic_auth() {
        let mut headers = HeaderMap::new();
        let encoded = BASE64.encode("alice:sometoken");
        headers.insert(header::AUTHORIZATION, format!("Basic {}", encoded).parse().unwrap());
        let (user, token) = decode_basic_auth(&headers).unwrap();
        assert_eq!(user, "alice");
        assert_eq!(token, "sometoken");
    }

    #[test]
    fn missing_authorization_header_is_unauthenticated() {
        let headers = HeaderMap::new();
        assert!(matches!(decode_basic_auth(&headers), Err(ProxyError::Unauthenticated)));
    }

    #[test]
    fn non_basic_scheme_is_bad_request() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, "Bearer abc".parse().unwrap());
        assert!(matches!(decode_basic_auth(&headers), Err(ProxyError::BadRequest(_))));
    }

    #[test]
    fn strips_hop_by_hop_and_auth_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, "Basic abc".parse().unwrap());
        headers.insert(header::HOST, "proxy.example.com".parse().unwrap());
        headers.insert(header::CONTENT_TYPE, "application/json".parse().unwrap());
        let forwarded = forwarded_request_headers(&headers);
        assert!(forwarded.get(header::AUTHORIZATION).is_none());
        assert!(forwarded.get(header::HOST).is_none());
        assert!(forwarded.get(header::CONTENT_TYPE).is_some());
    }

    #[test]
    fn paginate_skips_past_cursor_and_limits_page_size() {
        let names = vec!["a".to_string(), "b".to_string(), "c".to_string(), "d".to_string()];
        let page = paginate(&names, Some("b"), Some(2));
        assert_eq!(page, vec!["c".to_string(), "d".to_string()]);
    }

    #[test]
    fn paginate_without_cursor_starts_at_beginning() {
        let names = vec!["a".to_string(), "b".to_string()];
        let page = paginate(&names, None, Some(1));
        assert_eq!(page, vec!["a".to_string()]);
    }

    #[test]
    fn extracts_next_url_from_link_header() {
        let link = r#"<https://up/v2/_catalog?n=2&last=x>; rel="next""#;
        assert_eq!(
            extract_link_next(link),
            Some("https://up/v2/_catalog?n=2&last=x".to_string())
        );
    }

    #[test]
    fn rewrites_link_header_preserving_rel_param() {
        let proxy_base = Url::parse("https://proxy.example.com").unwrap();
        let link = r#"<https://up.example.com/v2/registry/alice/alpine/tags/list?n=10&last=v1>; rel="next""#;
        let rewritten = rewrite_link_header(link, &proxy_base, "c1", "registry").unwrap();
        assert!(rewritten.starts_with("<https://proxy.example.com/v2/alice/alpine/tags/list"));
        assert!(rewritten.ends_with(r#"; rel="next""#));
    }
}
