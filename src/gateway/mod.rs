//! The gateway: the only surface callers talk to.
//!
//! Every route authenticates the caller, checks that they own the project
//! they name and confines the project id before anything reaches the
//! sandbox host.

pub mod auth;
pub mod projects;
pub mod proxy;
pub mod store;

use crate::config::GatewayConfig;
use crate::error::{Error, Result};
use crate::path_guard::PathGuard;
use auth::IdentityVerifier;
use axum::{
    routing::{get, patch, post},
    Json, Router,
};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use store::ProjectStore;
use tower_http::trace::TraceLayer;
use tracing::info;

#[derive(Clone)]
pub struct GatewayState {
    pub config: Arc<GatewayConfig>,
    pub guard: PathGuard,
    pub verifier: Arc<dyn IdentityVerifier>,
    pub projects: Arc<dyn ProjectStore>,
    pub http: reqwest::Client,
}

impl GatewayState {
    pub fn new(
        config: GatewayConfig,
        verifier: Arc<dyn IdentityVerifier>,
        projects: Arc<dyn ProjectStore>,
    ) -> Result<Self> {
        let guard = PathGuard::new(&config.workspace_root)?;
        let http = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .build()
            .map_err(|e| Error::Upstream(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            config: Arc::new(config),
            guard,
            verifier,
            projects,
            http,
        })
    }
}

pub fn router(state: GatewayState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route(
            "/projects",
            get(projects::list_projects).post(projects::create_project),
        )
        .route(
            "/projects/:id",
            patch(projects::rename_project).delete(projects::delete_project),
        )
        .route("/agent/run", post(projects::agent_run))
        .route("/terminal", get(proxy::terminal))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn run_server(
    addr: SocketAddr,
    state: GatewayState,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    let sandbox_url = state.config.sandbox_url.clone();
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Gateway listening on http://{}", addr);
    info!("Sandbox host: {}", sandbox_url);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
}

async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::auth::{Identity, IdentityVerifier};
    use super::store::{FileProjectStore, Project};
    use super::*;
    use async_trait::async_trait;
    use std::time::Duration;

    /// Accepts tokens of the form `user:<sub>`.
    pub struct StaticVerifier;

    #[async_trait]
    impl IdentityVerifier for StaticVerifier {
        async fn verify(&self, token: &str) -> Result<Identity> {
            let sub = token
                .strip_prefix("user:")
                .filter(|sub| !sub.is_empty())
                .ok_or_else(|| Error::Unauthorized("Invalid token".into()))?;
            Ok(Identity {
                sub: sub.to_string(),
                email: None,
                role: None,
            })
        }
    }

    pub fn project(id: &str, owner: &str) -> Project {
        Project {
            id: id.to_string(),
            user_id: owner.to_string(),
            repo_url: format!("https://github.com/o/{}", id),
            name: id.to_string(),
            created_at: chrono::Utc::now(),
        }
    }

    pub fn gateway(sandbox_url: &str, workspace_root: &std::path::Path) -> GatewayState {
        let config = GatewayConfig {
            sandbox_url: sandbox_url.to_string(),
            workspace_root: workspace_root.to_path_buf(),
            agent_timeout: Duration::from_secs(5),
            ..Default::default()
        };
        GatewayState::new(
            config,
            Arc::new(StaticVerifier),
            Arc::new(FileProjectStore::in_memory()),
        )
        .unwrap()
    }
}
