//! HTTP + WebSocket server of the sandbox host.

use crate::error::{Error, Result};
use crate::process::{self, RunConfig};
use crate::relay;
use crate::state::AppState;
use crate::terminal;
use crate::validate::parse_json;
use axum::{
    body::Bytes,
    extract::{ws::WebSocketUpgrade, Query, State},
    http::header,
    response::{IntoResponse, Response, Sse},
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fs;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::path::Path;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

// Request/Response types
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CloneRequest {
    #[serde(default)]
    project_id: String,
    #[serde(default)]
    repo_url: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RunRequest {
    #[serde(default)]
    project_id: String,
    #[serde(default)]
    prompt: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeleteRequest {
    #[serde(default)]
    project_id: String,
}

#[derive(Deserialize)]
struct TerminalQuery {
    #[serde(rename = "projectId")]
    project_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ProjectListing {
    pub project_id: String,
    pub repo_url: String,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/list", get(list_projects))
        .route("/clone", post(clone_project))
        .route("/run", post(run_agent))
        .route("/delete", delete(delete_project))
        .route("/terminal", get(terminal_upgrade))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Run the sandbox host until `shutdown` resolves, then kill any shell that
/// is still attached.
pub async fn run_server(
    addr: SocketAddr,
    state: AppState,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    let app = router(state.clone());
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Sandbox host listening on http://{}", addr);
    info!("Terminal WebSocket: ws://{}/terminal", addr);
    info!("Workspace: {}", state.guard.root().display());

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;

    terminal::kill_all(&state.sessions);
    Ok(())
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "workspace": state.guard.root().display().to_string(),
    }))
}

async fn list_projects(State(state): State<AppState>) -> Result<Json<Value>> {
    let root = state.guard.root().to_path_buf();
    let projects = tokio::task::spawn_blocking(move || scan_workspaces(&root))
        .await
        .map_err(|e| Error::Io(std::io::Error::new(ErrorKind::Other, e)))?
        .map_err(|e| {
            warn!(error = %e, "list failed");
            e
        })?;
    Ok(Json(json!({ "projects": projects })))
}

/// Every directory under the root, with the origin URL from its git config
/// when there is one.
pub fn scan_workspaces(root: &Path) -> Result<Vec<ProjectListing>> {
    let entries = match fs::read_dir(root) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut projects = Vec::new();
    for entry in entries {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let project_id = entry.file_name().to_string_lossy().into_owned();
        let repo_url = fs::read_to_string(entry.path().join(".git").join("config"))
            .ok()
            .and_then(|config| origin_url(&config))
            .unwrap_or_default();
        projects.push(ProjectListing {
            project_id,
            repo_url,
        });
    }
    projects.sort_by(|a, b| a.project_id.cmp(&b.project_id));
    Ok(projects)
}

fn origin_url(git_config: &str) -> Option<String> {
    git_config.lines().find_map(|line| {
        let (key, value) = line.trim().split_once('=')?;
        (key.trim() == "url").then(|| value.trim().to_string())
    })
}

async fn clone_project(State(state): State<AppState>, body: Bytes) -> Result<Json<Value>> {
    let req: CloneRequest = parse_json(&body)?;
    let project_path = state.guard.confine(&req.project_id)?;
    if req.repo_url.is_empty() {
        return Err(Error::InvalidInput("repoUrl is required".into()));
    }
    if project_path.exists() {
        return Err(Error::Conflict("Project directory already exists".into()));
    }

    let path_arg = project_path.display().to_string();
    // `--` keeps a hostile URL from being read as a git option.
    let config = RunConfig::new(
        "git",
        ["clone", "--depth=1", "--", req.repo_url.as_str(), path_arg.as_str()],
    )
    .set_env("GIT_TERMINAL_PROMPT", "0")
    .timeout(state.config.git_timeout);

    match process::run(&config).await {
        Ok(_) => {
            info!(project_id = %req.project_id, repo_url = %req.repo_url, "cloned");
            Ok(Json(json!({ "status": "cloned", "path": path_arg })))
        }
        Err(e) => {
            warn!(project_id = %req.project_id, error = %e, "clone failed");
            if let Err(cleanup) = tokio::fs::remove_dir_all(&project_path).await {
                if cleanup.kind() != ErrorKind::NotFound {
                    warn!(path = %project_path.display(), error = %cleanup, "clone cleanup failed");
                }
            }
            Err(Error::Unprocessable(format!("Clone failed: {}", e)))
        }
    }
}

async fn run_agent(State(state): State<AppState>, body: Bytes) -> Result<Response> {
    let req: RunRequest = parse_json(&body)?;
    let prompt = req
        .prompt
        .ok_or_else(|| Error::InvalidInput("prompt is required".into()))?;
    info!(project_id = %req.project_id, "POST /run");

    let frames = {
        let state = state.clone();
        let project_id = req.project_id.clone();
        tokio::task::spawn_blocking(move || {
            relay::run_agent(&state.guard, &state.config, &project_id, &prompt)
        })
        .await
        .map_err(|e| Error::Io(std::io::Error::new(ErrorKind::Other, e)))??
    };

    Ok((
        [(header::CACHE_CONTROL, "no-cache")],
        Sse::new(relay::sse_stream(frames)),
    )
        .into_response())
}

async fn delete_project(State(state): State<AppState>, body: Bytes) -> Result<Json<Value>> {
    let req: DeleteRequest = parse_json(&body)?;
    let project_path = state.guard.confine(&req.project_id)?;
    if !project_path.exists() {
        return Ok(Json(json!({ "status": "not_found" })));
    }
    tokio::fs::remove_dir_all(&project_path)
        .await
        .map_err(|e| Error::Io(std::io::Error::new(e.kind(), format!("Delete failed: {}", e))))?;
    info!(project_id = %req.project_id, "deleted");
    Ok(Json(json!({ "status": "deleted" })))
}

async fn terminal_upgrade(
    ws: WebSocketUpgrade,
    Query(query): Query<TerminalQuery>,
    State(state): State<AppState>,
) -> Response {
    info!(project_id = ?query.project_id, "new terminal connection");
    ws.on_upgrade(move |socket| terminal::run_session(socket, state, query.project_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SandboxConfig;
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    fn app(root: &Path) -> Router {
        let config = SandboxConfig {
            workspace_root: root.to_path_buf(),
            agent_binaries: Vec::new(),
            ..Default::default()
        };
        router(AppState::new(config).unwrap())
    }

    fn json_request(method: &str, uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_json(response: Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let root = tempfile::tempdir().unwrap();
        let response = app(root.path())
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn test_clone_existing_directory_conflicts() {
        let root = tempfile::tempdir().unwrap();
        fs::create_dir(root.path().join("taken")).unwrap();
        fs::write(root.path().join("taken/keep.txt"), "x").unwrap();

        let response = app(root.path())
            .oneshot(json_request(
                "POST",
                "/clone",
                json!({ "projectId": "taken", "repoUrl": "https://github.com/a/b" }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
        assert_eq!(
            body_json(response).await["message"],
            "Project directory already exists"
        );
        assert!(root.path().join("taken/keep.txt").exists());
    }

    #[tokio::test]
    async fn test_clone_rejects_traversal_and_bad_json() {
        let root = tempfile::tempdir().unwrap();
        let response = app(root.path())
            .oneshot(json_request(
                "POST",
                "/clone",
                json!({ "projectId": "../../etc", "repoUrl": "https://github.com/a/b" }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = app(root.path())
            .oneshot(
                Request::post("/clone")
                    .body(Body::from("not json"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["message"], "Invalid JSON body");
    }

    #[tokio::test]
    async fn test_failed_clone_cleans_up() {
        let root = tempfile::tempdir().unwrap();
        let missing_repo = root.path().join("no-such-repo");
        let response = app(root.path())
            .oneshot(json_request(
                "POST",
                "/clone",
                json!({ "projectId": "fresh", "repoUrl": missing_repo.display().to_string() }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        let message = body_json(response).await["message"].as_str().unwrap().to_string();
        assert!(message.starts_with("Clone failed:"), "{}", message);
        assert!(!root.path().join("fresh").exists());
    }

    #[tokio::test]
    async fn test_list_reads_git_origin() {
        let root = tempfile::tempdir().unwrap();
        fs::create_dir_all(root.path().join("b-proj/.git")).unwrap();
        fs::write(
            root.path().join("b-proj/.git/config"),
            "[core]\n\tbare = false\n[remote \"origin\"]\n\turl = https://github.com/o/r.git\n",
        )
        .unwrap();
        fs::create_dir(root.path().join("a-proj")).unwrap();
        fs::write(root.path().join("stray-file"), "").unwrap();

        let response = app(root.path())
            .oneshot(Request::get("/list").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            body_json(response).await,
            json!({ "projects": [
                { "projectId": "a-proj", "repoUrl": "" },
                { "projectId": "b-proj", "repoUrl": "https://github.com/o/r.git" },
            ]})
        );
    }

    #[tokio::test]
    async fn test_list_without_root_is_empty() {
        let root = tempfile::tempdir().unwrap();
        let projects = scan_workspaces(&root.path().join("missing")).unwrap();
        assert!(projects.is_empty());
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let root = tempfile::tempdir().unwrap();
        fs::create_dir_all(root.path().join("gone/src")).unwrap();

        let response = app(root.path())
            .oneshot(json_request("DELETE", "/delete", json!({ "projectId": "gone" })))
            .await
            .unwrap();
        assert_eq!(body_json(response).await["status"], "deleted");
        assert!(!root.path().join("gone").exists());

        let response = app(root.path())
            .oneshot(json_request("DELETE", "/delete", json!({ "projectId": "gone" })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["status"], "not_found");
    }

    #[tokio::test]
    async fn test_run_missing_workspace_is_404() {
        let root = tempfile::tempdir().unwrap();
        let response = app(root.path())
            .oneshot(json_request(
                "POST",
                "/run",
                json!({ "projectId": "nowhere", "prompt": "hi" }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_run_streams_events_until_done() {
        let root = tempfile::tempdir().unwrap();
        fs::create_dir(root.path().join("proj")).unwrap();
        fs::write(root.path().join("proj/lib.rs"), "").unwrap();

        let response = app(root.path())
            .oneshot(json_request(
                "POST",
                "/run",
                json!({ "projectId": "proj", "prompt": "explain" }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "text/event-stream"
        );

        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.contains("data: lib.rs\n\n"));
        assert!(text.contains("data: [Exit code: 0]\n\n"));
        assert!(text.ends_with("data: [DONE]\n\n"));
        assert_eq!(text.matches("data: [DONE]").count(), 1);
    }
}
