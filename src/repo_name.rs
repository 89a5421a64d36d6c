//! Pure, stateless mapping between the tenant-facing repository namespace
//! and the upstream registry's namespace.
//!
//! A tenant repository name is `<org?>/<project>/<repo>`. The upstream sees
//! `<upstream_prefix>/<org?>/<project>/<repo>`, where `<upstream_prefix>` is
//! empty for `basic`/`aws_ecr` upstreams and a configured project id for
//! token-service upstreams such as GCR. Rewriting is a bijection on the set
//! of well-formed client paths: `reverse(rewrite(p)) == p`.

use reqwest::Url;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RewriteError {
    #[error("empty path segment")]
    EmptySegment,
    #[error("invalid character in repository name segment: {0}")]
    InvalidSegment(String),
    #[error("repository path too deep: {0}")]
    TooDeep(String),
    #[error("repository path too shallow: {0}")]
    TooShallow(String),
    #[error("upstream name does not begin with configured prefix")]
    PrefixMismatch,
    #[error("could not locate a Registry v2 name segment in path: {0}")]
    NoNameSegment(String),
    #[error("invalid URL: {0}")]
    InvalidUrl(String),
}

/// A logical 4-tuple identifying a repository: the fixed per-deployment
/// cluster, an optional org/team namespace, a project, and a repo.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoName {
    pub cluster: String,
    pub org: Option<String>,
    pub project: String,
    pub repo: String,
}

impl RepoName {
    /// Parse a tenant-facing `<name>` path component (already split on '/',
    /// with no leading/trailing slash) into a `RepoName`.
    pub fn parse_tenant(cluster: &str, name: &str) -> Result<Self, RewriteError> {
        let segments: Vec<&str> = name.split('/').collect();
        for seg in &segments {
            validate_segment(seg)?;
        }

        match segments.as_slice() {
            [project, repo] => Ok(RepoName {
                cluster: cluster.to_string(),
                org: None,
                project: project.to_string(),
                repo: repo.to_string(),
            }),
            [org, project, repo] => Ok(RepoName {
                cluster: cluster.to_string(),
                org: Some(org.to_string()),
                project: project.to_string(),
                repo: repo.to_string(),
            }),
            [] | [_] => Err(RewriteError::TooShallow(name.to_string())),
            _ => Err(RewriteError::TooDeep(name.to_string())),
        }
    }

    /// The tenant-facing `<name>` path component: `<org?>/<project>/<repo>`.
    pub fn tenant_path(&self) -> String {
        match &self.org {
            Some(org) => format!("{}/{}/{}", org, self.project, self.repo),
            None => format!("{}/{}", self.project, self.repo),
        }
    }

    /// The upstream-facing path component: `<upstream_prefix>/<org?>/<project>/<repo>`.
    pub fn upstream_path(&self, upstream_prefix: &str) -> String {
        let tenant = self.tenant_path();
        if upstream_prefix.is_empty() {
            tenant
        } else {
            format!("{}/{}", upstream_prefix, tenant)
        }
    }

    /// Reverse of `upstream_path`: strip the configured prefix from an
    /// upstream-facing path and parse the remainder as a tenant name.
    /// Rejects names not beginning with the prefix.
    pub fn from_upstream_path(
        cluster: &str,
        upstream_prefix: &str,
        upstream_name: &str,
    ) -> Result<Self, RewriteError> {
        let stripped = if upstream_prefix.is_empty() {
            upstream_name
        } else {
            upstream_name
                .strip_prefix(upstream_prefix)
                .and_then(|s| s.strip_prefix('/'))
                .ok_or(RewriteError::PrefixMismatch)?
        };
        Self::parse_tenant(cluster, stripped)
    }

    /// The permission URI: `image://<cluster>/<org?>/<project>/<repo>`.
    pub fn permission_uri(&self) -> String {
        format!("image://{}/{}", self.cluster, self.tenant_path())
    }

    /// Parse a permission URI of the form `image://<cluster>/<name>` back
    /// into a `RepoName`, used to turn the identity service's
    /// "permissions this caller holds" list into repository names for
    /// catalog virtualization.
    pub fn from_permission_uri(uri: &str) -> Option<Self> {
        let rest = uri.strip_prefix("image://")?;
        let (cluster, name) = rest.split_once('/')?;
        Self::parse_tenant(cluster, name).ok()
    }

    /// The permission URI for the cluster as a whole (used for the global
    /// catalog and admin checks): `image://<cluster>`.
    pub fn cluster_permission_uri(cluster: &str) -> String {
        format!("image://{}", cluster)
    }
}

fn validate_segment(segment: &str) -> Result<(), RewriteError> {
    if segment.is_empty() {
        return Err(RewriteError::EmptySegment);
    }
    if !segment
        .bytes()
        .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || matches!(b, b'.' | b'_' | b'-'))
    {
        return Err(RewriteError::InvalidSegment(segment.to_string()));
    }
    Ok(())
}

/// Markers that delimit a Registry v2 `<name>` path component from the
/// fixed operation suffix that follows it.
const NAME_SUFFIX_MARKERS: &[&str] = &[
    "/blobs/uploads/",
    "/blobs/uploads",
    "/blobs/",
    "/manifests/",
    "/tags/list",
];

/// Split a `/v2/...`-rooted path (without the `/v2/` prefix) into its
/// `<name>` component and the operation suffix that follows it, using the
/// known Registry v2 route shapes as delimiters.
fn split_name_and_suffix(path: &str) -> Option<(&str, &str)> {
    for marker in NAME_SUFFIX_MARKERS {
        if let Some(idx) = path.find(marker) {
            return Some((&path[..idx], &path[idx..]));
        }
    }
    None
}

/// The Registry v2 operation a request path names, alongside its `<name>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    Manifest(String),
    Blob(String),
    BlobUploadInit,
    BlobUploadSession(String),
    Tags,
}

/// Parse a `/v2/`-rooted request path (without the leading `/v2/`) into its
/// `<name>` component and the operation it addresses. Returns `None` if no
/// known Registry v2 route shape matches.
pub fn parse_request_path(path: &str) -> Option<(String, Operation)> {
    let (name, suffix) = split_name_and_suffix(path)?;
    let name = name.trim_end_matches('/').to_string();

    let op = if let Some(reference) = suffix.strip_prefix("/manifests/") {
        Operation::Manifest(reference.to_string())
    } else if let Some(uuid) = suffix.strip_prefix("/blobs/uploads/") {
        Operation::BlobUploadSession(uuid.to_string())
    } else if suffix == "/blobs/uploads" || suffix == "/blobs/uploads/" {
        Operation::BlobUploadInit
    } else if let Some(digest) = suffix.strip_prefix("/blobs/") {
        Operation::Blob(digest.to_string())
    } else if suffix == "/tags/list" {
        Operation::Tags
    } else {
        return None;
    };

    Some((name, op))
}

/// Rewrite the path of an absolute or relative upstream URL (as found in a
/// `Location` or `Link` response header) from upstream-space back into
/// tenant-space, replacing the authority with the proxy's own.
///
/// `raw_url` may be an absolute URL or a path-only relative reference, as
/// both are legal for `Location` per the Distribution spec.
pub fn rewrite_upstream_url(
    raw_url: &str,
    proxy_base: &Url,
    cluster: &str,
    upstream_prefix: &str,
) -> Result<String, RewriteError> {
    let parsed = if raw_url.starts_with("http://") || raw_url.starts_with("https://") {
        Url::parse(raw_url).map_err(|e| RewriteError::InvalidUrl(e.to_string()))?
    } else {
        proxy_base
            .join(raw_url)
            .map_err(|e| RewriteError::InvalidUrl(e.to_string()))?
    };

    let path = parsed.path();
    let rest = path
        .strip_prefix("/v2/")
        .ok_or_else(|| RewriteError::NoNameSegment(path.to_string()))?;

    let (name, suffix) =
        split_name_and_suffix(rest).ok_or_else(|| RewriteError::NoNameSegment(rest.to_string()))?;

    let repo = RepoName::from_upstream_path(cluster, upstream_prefix, name)?;

    let mut rewritten = proxy_base.clone();
    rewritten.set_path(&format!("/v2/{}{}", repo.tenant_path(), suffix));
    rewritten.set_query(parsed.query());

    Ok(rewritten.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_two_segment_name() {
        let repo = RepoName::parse_tenant("c1", "alice/alpine").unwrap();
        assert_eq!(repo.org, None);
        let upstream = repo.upstream_path("registry");
        assert_eq!(upstream, "registry/alice/alpine");
        let back = RepoName::from_upstream_path("c1", "registry", &upstream).unwrap();
        assert_eq!(back, repo);
        assert_eq!(back.tenant_path(), "alice/alpine");
    }

    #[test]
    fn round_trips_three_segment_name_with_org() {
        let repo = RepoName::parse_tenant("c1", "teamA/alice/alpine").unwrap();
        assert_eq!(repo.org.as_deref(), Some("teamA"));
        let upstream = repo.upstream_path("");
        assert_eq!(upstream, "teamA/alice/alpine");
        let back = RepoName::from_upstream_path("c1", "", &upstream).unwrap();
        assert_eq!(back, repo);
    }

    #[test]
    fn empty_upstream_prefix_is_identity() {
        let repo = RepoName::parse_tenant("c1", "alice/alpine").unwrap();
        assert_eq!(repo.upstream_path(""), "alice/alpine");
    }

    #[test]
    fn rejects_empty_segments() {
        assert_eq!(
            RepoName::parse_tenant("c1", "alice//alpine").unwrap_err(),
            RewriteError::EmptySegment
        );
    }

    #[test]
    fn rejects_uppercase() {
        assert!(matches!(
            RepoName::parse_tenant("c1", "Alice/alpine"),
            Err(RewriteError::InvalidSegment(_))
        ));
    }

    #[test]
    fn rejects_paths_deeper_than_org_project_repo() {
        assert!(matches!(
            RepoName::parse_tenant("c1", "a/b/c/d"),
            Err(RewriteError::TooDeep(_))
        ));
    }

    #[test]
    fn rejects_paths_shallower_than_project_repo() {
        assert!(matches!(
            RepoName::parse_tenant("c1", "alpine"),
            Err(RewriteError::TooShallow(_))
        ));
    }

    #[test]
    fn reverse_rejects_names_missing_prefix() {
        let err = RepoName::from_upstream_path("c1", "registry", "other/alice/alpine").unwrap_err();
        assert_eq!(err, RewriteError::PrefixMismatch);
    }

    #[test]
    fn permission_uri_includes_cluster_and_org() {
        let repo = RepoName::parse_tenant("c1", "teamA/alice/alpine").unwrap();
        assert_eq!(repo.permission_uri(), "image://c1/teamA/alice/alpine");
    }

    #[test]
    fn rewrites_absolute_location_header() {
        let proxy_base = Url::parse("https://proxy.example.com").unwrap();
        let rewritten = rewrite_upstream_url(
            "https://upstream.example.com/v2/registry/alice/alpine/blobs/uploads/abc-123",
            &proxy_base,
            "c1",
            "registry",
        )
        .unwrap();
        let url = Url::parse(&rewritten).unwrap();
        assert_eq!(url.host_str(), Some("proxy.example.com"));
        assert_eq!(url.path(), "/v2/alice/alpine/blobs/uploads/abc-123");
    }

    #[test]
    fn rewrites_relative_location_header() {
        let proxy_base = Url::parse("https://proxy.example.com").unwrap();
        let rewritten = rewrite_upstream_url(
            "/v2/alice/alpine/blobs/uploads/abc-123?_state=xyz",
            &proxy_base,
            "c1",
            "",
        )
        .unwrap();
        let url = Url::parse(&rewritten).unwrap();
        assert_eq!(url.host_str(), Some("proxy.example.com"));
        assert_eq!(url.path(), "/v2/alice/alpine/blobs/uploads/abc-123");
        assert_eq!(url.query(), Some("_state=xyz"));
    }

    #[test]
    fn rejects_urls_missing_the_v2_root() {
        let proxy_base = Url::parse("https://proxy.example.com").unwrap();
        let rewritten = rewrite_upstream_url(
            "https://up/registry/alice/alpine/manifests/sha256:deadbeef",
            &proxy_base,
            "c1",
            "registry",
        );
        assert!(rewritten.is_err());
    }

    #[test]
    fn permission_uri_round_trips_through_parse() {
        let repo = RepoName::parse_tenant("c1", "teamA/alice/alpine").unwrap();
        let uri = repo.permission_uri();
        let parsed = RepoName::from_permission_uri(&uri).unwrap();
        assert_eq!(parsed, repo);
    }

    #[test]
    fn parses_manifest_request_path() {
        let (name, op) = parse_request_path("alice/alpine/manifests/latest").unwrap();
        assert_eq!(name, "alice/alpine");
        assert_eq!(op, Operation::Manifest("latest".to_string()));
    }

    #[test]
    fn parses_blob_request_path() {
        let (name, op) = parse_request_path("alice/alpine/blobs/sha256:abc").unwrap();
        assert_eq!(name, "alice/alpine");
        assert_eq!(op, Operation::Blob("sha256:abc".to_string()));
    }

    #[test]
    fn parses_blob_upload_init_and_session() {
        let (name, op) = parse_request_path("alice/alpine/blobs/uploads/").unwrap();
        assert_eq!(name, "alice/alpine");
        assert_eq!(op, Operation::BlobUploadInit);

        let (name, op) = parse_request_path("alice/alpine/blobs/uploads/uuid-1").unwrap();
        assert_eq!(name, "alice/alpine");
        assert_eq!(op, Operation::BlobUploadSession("uuid-1".to_string()));
    }

    #[test]
    fn parses_tags_list_request_path() {
        let (name, op) = parse_request_path("alice/alpine/tags/list").unwrap();
        assert_eq!(name, "alice/alpine");
        assert_eq!(op, Operation::Tags);
    }
}
