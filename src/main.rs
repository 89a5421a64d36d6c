mod authorizer;
mod challenge;
mod config;
mod error;
mod permissions;
mod proxy;
mod repo_name;
mod upstream;

use crate::config::Config;
use crate::permissions::HttpPermissionChecker;
use crate::proxy::ProxyState;
use crate::upstream::UpstreamClient;
use axum::{
    routing::{any, get},
    Router,
};
use std::sync::Arc;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "registry_gatekeeper=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config_path = std::env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
    let config = Config::from_file(&config_path)?;

    info!("Starting registry gatekeeper for cluster {}", config.cluster_name);
    info!("Upstream: {}", config.upstream.common().url);

    let upstream = UpstreamClient::from_config(&config.upstream);
    let checker: Arc<dyn permissions::PermissionChecker> = Arc::new(HttpPermissionChecker::new(
        config.auth.url.clone(),
        config.auth.token.clone(),
    ));
    let authorizer = authorizer::Authorizer::new(checker, config.cluster_name.clone());

    let http = reqwest::Client::builder()
        .connect_timeout(std::time::Duration::from_secs(5))
        .timeout(std::time::Duration::from_secs(60))
        .build()?;

    let cors = if config.cors.origins.is_empty() {
        CorsLayer::new()
    } else {
        let origins: Vec<_> = config
            .cors
            .origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        CorsLayer::new().allow_origin(AllowOrigin::list(origins))
    };

    let bind_addr = format!("{}:{}", config.server.bind_address, config.server.port);

    let state = Arc::new(ProxyState {
        config,
        upstream,
        authorizer,
        http,
    });

    let app = Router::new()
        .route("/v2/", get(proxy::handle_version))
        .route("/v2/_catalog", get(proxy::handle_catalog))
        .route("/v2/*rest", any(proxy::handle_repo))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    info!("Listening on {}", bind_addr);
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
