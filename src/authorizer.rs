//! Maps a parsed Registry v2 request to required platform permissions and
//! upstream scopes, enforces them against the identity service, and
//! synthesizes the virtualized catalog view (spec.md §4.D).

use crate::challenge::Scope;
use crate::config::RepositoryScopeActions;
use crate::error::{ProxyError, Result};
use crate::permissions::{Action, CheckOutcome, Permission, PermissionChecker};
use crate::repo_name::RepoName;
use axum::http::Method;
use std::sync::Arc;
use tracing::warn;

/// The platform permissions and mirrored upstream scopes a request needs.
pub struct RequiredAccess {
    pub permissions: Vec<Permission>,
    pub upstream_scopes: Vec<Scope>,
}

pub struct Authorizer<C: PermissionChecker + ?Sized> {
    checker: Arc<C>,
    cluster: String,
}

impl<C: PermissionChecker + ?Sized> Authorizer<C> {
    pub fn new(checker: Arc<C>, cluster: String) -> Self {
        Self { checker, cluster }
    }

    pub fn cluster(&self) -> &str {
        &self.cluster
    }

    fn action_for_method(method: &Method) -> Action {
        match *method {
            Method::GET | Method::HEAD => Action::Read,
            Method::DELETE => Action::Manage,
            _ => Action::Write,
        }
    }

    fn scope_action(action: Action, actions: &RepositoryScopeActions) -> String {
        match action {
            Action::Read => actions.pull.clone(),
            Action::Write => actions.push.clone(),
            Action::Manage => actions.manage.clone(),
        }
    }

    /// Required access for an ordinary `/v2/<name>/...` request.
    pub fn for_repo_request(
        &self,
        repo: &RepoName,
        method: &Method,
        upstream_prefix: &str,
        scope_actions: &RepositoryScopeActions,
    ) -> RequiredAccess {
        let action = Self::action_for_method(method);
        let permission = Permission::new(repo.permission_uri(), action);
        let scope = Scope::new(
            "repository",
            repo.upstream_path(upstream_prefix),
            vec![Self::scope_action(action, scope_actions)],
        );
        RequiredAccess {
            permissions: vec![permission],
            upstream_scopes: vec![scope],
        }
    }

    /// Required access for a cross-repository blob mount: `read` on the
    /// source and `write` on the destination, checked together.
    pub fn for_cross_repo_mount(
        &self,
        dst: &RepoName,
        src: &RepoName,
        upstream_prefix: &str,
        scope_actions: &RepositoryScopeActions,
    ) -> RequiredAccess {
        let permissions = vec![
            Permission::new(src.permission_uri(), Action::Read),
            Permission::new(dst.permission_uri(), Action::Write),
        ];
        let upstream_scopes = vec![
            Scope::new(
                "repository",
                src.upstream_path(upstream_prefix),
                vec![Self::scope_action(Action::Read, scope_actions)],
            ),
            Scope::new(
                "repository",
                dst.upstream_path(upstream_prefix),
                vec![Self::scope_action(Action::Write, scope_actions)],
            ),
        ];
        RequiredAccess {
            permissions,
            upstream_scopes,
        }
    }

    /// `manage` on the cluster as a whole, required to list the global
    /// catalog unfiltered.
    pub fn cluster_manage_permission(&self) -> Permission {
        Permission::new(RepoName::cluster_permission_uri(&self.cluster), Action::Manage)
    }

    /// Enforce `required` against the identity service. Returns
    /// `ProxyError::Forbidden` carrying the missing permission URIs on
    /// denial.
    pub async fn enforce(&self, user_token: &str, required: &RequiredAccess) -> Result<()> {
        match self.checker.check(user_token, &required.permissions).await? {
            CheckOutcome::Allowed => Ok(()),
            CheckOutcome::Denied { missing } => Err(ProxyError::Forbidden(missing)),
        }
    }

    /// Whether the caller holds `manage` on the cluster as a whole.
    pub async fn is_cluster_admin(&self, user_token: &str) -> Result<bool> {
        let required = vec![self.cluster_manage_permission()];
        match self.checker.check(user_token, &required).await? {
            CheckOutcome::Allowed => Ok(true),
            CheckOutcome::Denied { .. } => Ok(false),
        }
    }

    /// Every repository the caller may read, for catalog virtualization.
    /// Permission URIs the identity service returns that don't parse as a
    /// well-formed repository name are skipped and logged, not fatal.
    pub async fn readable_repos(&self, user_token: &str) -> Result<Vec<RepoName>> {
        let uris = self.checker.list_readable(user_token, &self.cluster).await?;
        let mut repos: Vec<RepoName> = Vec::with_capacity(uris.len());
        for uri in uris {
            match RepoName::from_permission_uri(&uri) {
                Some(repo) => repos.push(repo),
                None => warn!("identity service returned unparseable permission uri: {}", uri),
            }
        }
        Ok(repos)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::permissions::CheckOutcome;
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct FakeChecker {
        allow: bool,
        missing: Vec<String>,
        readable: Vec<String>,
        calls: Mutex<Vec<Vec<Permission>>>,
    }

    #[async_trait]
    impl PermissionChecker for FakeChecker {
        async fn check(&self, _user_token: &str, required: &[Permission]) -> Result<CheckOutcome> {
            self.calls.lock().unwrap().push(required.to_vec());
            if self.allow {
                Ok(CheckOutcome::Allowed)
            } else {
                Ok(CheckOutcome::Denied {
                    missing: self.missing.clone(),
                })
            }
        }

        async fn list_readable(&self, _user_token: &str, _cluster: &str) -> Result<Vec<String>> {
            Ok(self.readable.clone())
        }
    }

    fn default_actions() -> RepositoryScopeActions {
        RepositoryScopeActions {
            pull: "pull".to_string(),
            push: "push".to_string(),
            manage: "*".to_string(),
        }
    }

    #[tokio::test]
    async fn get_requires_read_and_maps_to_pull_scope() {
        let checker = Arc::new(FakeChecker {
            allow: true,
            missing: vec![],
            readable: vec![],
            calls: Mutex::new(vec![]),
        });
        let authorizer = Authorizer::new(checker, "c1".to_string());
        let repo = RepoName::parse_tenant("c1", "alice/alpine").unwrap();

        let required = authorizer.for_repo_request(&repo, &Method::GET, "", &default_actions());
        assert_eq!(required.permissions[0].action, Action::Read);
        assert_eq!(required.upstream_scopes[0].to_wire(), "repository:alice/alpine:pull");

        authorizer.enforce("token", &required).await.unwrap();
    }

    #[tokio::test]
    async fn put_requires_write_and_maps_to_push_scope() {
        let checker = Arc::new(FakeChecker {
            allow: true,
            missing: vec![],
            readable: vec![],
            calls: Mutex::new(vec![]),
        });
        let authorizer = Authorizer::new(checker, "c1".to_string());
        let repo = RepoName::parse_tenant("c1", "alice/alpine").unwrap();

        let required = authorizer.for_repo_request(&repo, &Method::PUT, "", &default_actions());
        assert_eq!(required.permissions[0].action, Action::Write);
        assert_eq!(required.upstream_scopes[0].to_wire(), "repository:alice/alpine:push");
    }

    #[tokio::test]
    async fn delete_requires_manage() {
        let checker = Arc::new(FakeChecker {
            allow: true,
            missing: vec![],
            readable: vec![],
            calls: Mutex::new(vec![]),
        });
        let authorizer = Authorizer::new(checker, "c1".to_string());
        let repo = RepoName::parse_tenant("c1", "alice/alpine").unwrap();

        let required = authorizer.for_repo_request(&repo, &Method::DELETE, "", &default_actions());
        assert_eq!(required.permissions[0].action, Action::Manage);
    }

    #[tokio::test]
    async fn cross_repo_mount_requires_read_on_source_and_write_on_destination() {
        let checker = Arc::new(FakeChecker {
            allow: false,
            missing: vec!["image://c1/alice/x".to_string()],
            readable: vec![],
            calls: Mutex::new(vec![]),
        });
        let authorizer = Authorizer::new(checker, "c1".to_string());
        let src = RepoName::parse_tenant("c1", "alice/x").unwrap();
        let dst = RepoName::parse_tenant("c1", "bob/x").unwrap();

        let required = authorizer.for_cross_repo_mount(&dst, &src, "", &default_actions());
        assert_eq!(required.permissions.len(), 2);
        assert_eq!(required.permissions[0].uri, "image://c1/alice/x");
        assert_eq!(required.permissions[1].uri, "image://c1/bob/x");

        let err = authorizer.enforce("token", &required).await.unwrap_err();
        match err {
            ProxyError::Forbidden(missing) => assert_eq!(missing, vec!["image://c1/alice/x".to_string()]),
            _ => panic!("expected forbidden"),
        }
    }

    #[tokio::test]
    async fn readable_repos_skips_unparseable_uris_without_failing() {
        let checker = Arc::new(FakeChecker {
            allow: true,
            missing: vec![],
            readable: vec![
                "image://c1/alice/alpine".to_string(),
                "not-a-uri".to_string(),
            ],
            calls: Mutex::new(vec![]),
        });
        let authorizer = Authorizer::new(checker, "c1".to_string());

        let repos = authorizer.readable_repos("token").await.unwrap();
        assert_eq!(repos.len(), 1);
        assert_eq!(repos[0].tenant_path(), "alice/alpine");
    }
}
