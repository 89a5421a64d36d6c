use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub cluster_name: String,
    #[serde(default)]
    pub server: ServerConfig,
    pub auth: AuthConfig,
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub cors: CorsConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_port(),
        }
    }
}

/// Identity service connection: `auth.url` is the base URL of the
/// `PermissionChecker` HTTP API, `auth.token` the proxy's own service
/// account bearer token used to call it.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AuthConfig {
    pub url: String,
    pub token: String,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct CorsConfig {
    #[serde(default)]
    pub origins: Vec<String>,
}

/// Upstream registry connection, tagged by flavor per design note §9: each
/// variant owns only the configuration it needs.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UpstreamConfig {
    Basic {
        #[serde(flatten)]
        common: CommonUpstreamConfig,
        basic_username: String,
        basic_password: String,
    },
    Oauth {
        #[serde(flatten)]
        common: CommonUpstreamConfig,
        token_url: String,
        service: String,
        username: String,
        password: String,
    },
    AwsEcr {
        #[serde(flatten)]
        common: CommonUpstreamConfig,
        region: String,
    },
}

impl UpstreamConfig {
    pub fn common(&self) -> &CommonUpstreamConfig {
        match self {
            UpstreamConfig::Basic { common, .. } => common,
            UpstreamConfig::Oauth { common, .. } => common,
            UpstreamConfig::AwsEcr { common, .. } => common,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CommonUpstreamConfig {
    pub url: String,
    #[serde(default)]
    pub project: String,
    #[serde(default = "default_max_catalog_entries")]
    pub max_catalog_entries: usize,
    #[serde(default = "default_catalog_scope")]
    pub catalog_scope: String,
    #[serde(default = "default_repository_scope_actions")]
    pub repository_scope_actions: RepositoryScopeActions,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RepositoryScopeActions {
    #[serde(default = "default_pull_action")]
    pub pull: String,
    #[serde(default = "default_push_action")]
    pub push: String,
    #[serde(default = "default_manage_action")]
    pub manage: String,
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    5000
}

fn default_max_catalog_entries() -> usize {
    1000
}

fn default_catalog_scope() -> String {
    "registry:catalog:*".to_string()
}

fn default_pull_action() -> String {
    "pull".to_string()
}

fn default_push_action() -> String {
    "push".to_string()
}

fn default_manage_action() -> String {
    "*".to_string()
}

fn default_repository_scope_actions() -> RepositoryScopeActions {
    RepositoryScopeActions {
        pull: default_pull_action(),
        push: default_push_action(),
        manage: default_manage_action(),
    }
}

impl Config {
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&content)?;
        config.apply_env_overlay();
        config.validate()?;
        Ok(config)
    }

    /// Overlay secrets from the environment so they need not live in the
    /// TOML file on disk. `APP_AUTH_TOKEN` overrides `auth.token`;
    /// `APP_CLUSTER_NAME` overrides `cluster_name`.
    fn apply_env_overlay(&mut self) {
        if let Ok(token) = std::env::var("APP_AUTH_TOKEN") {
            self.auth.token = token;
        }
        if let Ok(cluster) = std::env::var("APP_CLUSTER_NAME") {
            self.cluster_name = cluster;
        }
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.cluster_name.is_empty() {
            anyhow::bail!("cluster_name must not be empty");
        }
        if self.cluster_name.contains('/') {
            anyhow::bail!("cluster_name must not contain '/'");
        }
        Ok(())
    }
}
