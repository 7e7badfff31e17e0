//! Project CRUD and agent runs, forwarded to the sandbox host.

use super::auth::{Authenticated, Identity};
use super::store::{assert_owner, Project};
use super::GatewayState;
use crate::error::{Error, Result};
use crate::http_server::ProjectListing;
use crate::path_guard::validate_id;
use crate::validate::{parse_json, repo_name, validate_prompt, validate_repo_url};
use axum::{
    body::{Body, Bytes},
    extract::{Path, State},
    http::{header, HeaderName, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info, warn};
use uuid::Uuid;

const X_ACCEL_BUFFERING: HeaderName = HeaderName::from_static("x-accel-buffering");

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateProjectRequest {
    #[serde(default)]
    repo_url: String,
}

#[derive(Deserialize)]
struct RenameRequest {
    #[serde(default)]
    name: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AgentRunRequest {
    #[serde(default)]
    project_id: String,
    #[serde(default)]
    prompt: String,
}

#[derive(Deserialize)]
struct SandboxListing {
    #[serde(default)]
    projects: Vec<ProjectListing>,
}

fn unreachable(e: reqwest::Error) -> Error {
    warn!(error = %e, "sandbox request failed");
    Error::Unreachable("Sandbox unreachable".into())
}

async fn sandbox_message(response: reqwest::Response) -> String {
    let status = response.status();
    response
        .json::<Value>()
        .await
        .ok()
        .and_then(|body| body["message"].as_str().map(str::to_string))
        .unwrap_or_else(|| format!("Sandbox error ({})", status))
}

pub async fn list_projects(
    State(state): State<GatewayState>,
    Authenticated(identity): Authenticated,
) -> Result<Json<Vec<Project>>> {
    if let Err(e) = adopt_orphans(&state, &identity).await {
        warn!(error = %e, "failed to sync with sandbox");
    }

    let mut projects: Vec<Project> = state
        .projects
        .list()
        .await?
        .into_iter()
        .filter(|project| project.user_id == identity.sub)
        .collect();
    projects.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    Ok(Json(projects))
}

/// Record workspaces that exist on the sandbox host but have no owner yet,
/// assigning them to the caller.
async fn adopt_orphans(state: &GatewayState, identity: &Identity) -> Result<()> {
    let response = state
        .http
        .get(state.config.sandbox_endpoint("/list"))
        .send()
        .await
        .map_err(unreachable)?;
    if !response.status().is_success() {
        return Err(Error::Upstream(sandbox_message(response).await));
    }
    let listing: SandboxListing = response
        .json()
        .await
        .map_err(|e| Error::Upstream(format!("Invalid sandbox listing: {}", e)))?;

    for entry in listing.projects {
        if validate_id(&entry.project_id).is_err() {
            continue;
        }
        if state.projects.get(&entry.project_id).await?.is_some() {
            continue;
        }
        let name = repo_name(&entry.repo_url).unwrap_or_else(|| entry.project_id.clone());
        info!(project_id = %entry.project_id, user = %identity.sub, "adopting orphaned workspace");
        state
            .projects
            .put(Project {
                id: entry.project_id,
                user_id: identity.sub.clone(),
                repo_url: entry.repo_url,
                name,
                created_at: Utc::now(),
            })
            .await?;
    }
    Ok(())
}

pub async fn create_project(
    State(state): State<GatewayState>,
    Authenticated(identity): Authenticated,
    body: Bytes,
) -> Result<(StatusCode, Json<Project>)> {
    let req: CreateProjectRequest = parse_json(&body)?;
    let repo_url = validate_repo_url(&req.repo_url)?;
    let id = Uuid::new_v4().to_string();
    state.guard.confine(&id)?;

    let response = state
        .http
        .post(state.config.sandbox_endpoint("/clone"))
        .json(&json!({ "projectId": id, "repoUrl": repo_url }))
        .send()
        .await
        .map_err(unreachable)?;
    if !response.status().is_success() {
        return Err(Error::Upstream(sandbox_message(response).await));
    }

    let project = Project {
        name: repo_name(&repo_url).unwrap_or_else(|| id.clone()),
        id,
        user_id: identity.sub,
        repo_url,
        created_at: Utc::now(),
    };
    state.projects.put(project.clone()).await?;
    info!(project_id = %project.id, user = %project.user_id, "project created");
    Ok((StatusCode::CREATED, Json(project)))
}

pub async fn delete_project(
    State(state): State<GatewayState>,
    Authenticated(identity): Authenticated,
    Path(id): Path<String>,
) -> Result<StatusCode> {
    assert_owner(state.projects.as_ref(), &identity, &id).await?;
    state.guard.confine(&id)?;

    // Removing the workspace is best effort; the record goes regardless.
    let http = state.http.clone();
    let url = state.config.sandbox_endpoint("/delete");
    let project_id = id.clone();
    tokio::spawn(async move {
        match http
            .delete(url)
            .json(&json!({ "projectId": project_id }))
            .send()
            .await
        {
            Ok(response) if response.status().is_success() => {
                debug!(%project_id, "sandbox workspace removed");
            }
            Ok(response) => {
                warn!(%project_id, status = %response.status(), "sandbox delete failed");
            }
            Err(e) => warn!(%project_id, error = %e, "sandbox delete failed"),
        }
    });

    state.projects.delete(&id).await?;
    info!(project_id = %id, user = %identity.sub, "project deleted");
    Ok(StatusCode::NO_CONTENT)
}

pub async fn rename_project(
    State(state): State<GatewayState>,
    Authenticated(identity): Authenticated,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<Json<Project>> {
    let req: RenameRequest = parse_json(&body)?;
    let name = req
        .name
        .as_deref()
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .ok_or_else(|| Error::InvalidInput("Name is required".into()))?
        .to_string();

    let mut project = assert_owner(state.projects.as_ref(), &identity, &id).await?;
    project.name = name;
    state.projects.put(project.clone()).await?;
    Ok(Json(project))
}

/// Forward an agent run to the sandbox host and stream its events back
/// unchanged.
pub async fn agent_run(
    State(state): State<GatewayState>,
    Authenticated(identity): Authenticated,
    body: Bytes,
) -> Result<Response> {
    let req: AgentRunRequest = parse_json(&body)?;
    if req.project_id.is_empty() {
        return Err(Error::InvalidInput("projectId is required".into()));
    }
    assert_owner(state.projects.as_ref(), &identity, &req.project_id).await?;
    let project_path = state.guard.confine(&req.project_id)?;
    let prompt = validate_prompt(&req.prompt)?;

    info!(project_id = %req.project_id, user = %identity.sub, "agent run");
    let send = state
        .http
        .post(state.config.sandbox_endpoint("/run"))
        .json(&json!({
            "projectId": req.project_id,
            "projectPath": project_path.display().to_string(),
            "prompt": prompt,
        }))
        .send();

    let response = match tokio::time::timeout(state.config.agent_timeout, send).await {
        Err(_) => {
            warn!(project_id = %req.project_id, "agent run timed out");
            return Err(Error::Timeout("Agent execution timed out".into()));
        }
        Ok(Err(e)) => return Err(unreachable(e)),
        Ok(Ok(response)) => response,
    };
    if !response.status().is_success() {
        return Err(Error::Upstream(sandbox_message(response).await));
    }

    Ok((
        [
            (header::CONTENT_TYPE, "text/event-stream"),
            (header::CACHE_CONTROL, "no-cache"),
            (X_ACCEL_BUFFERING, "no"),
        ],
        Body::from_stream(response.bytes_stream()),
    )
        .into_response())
}
