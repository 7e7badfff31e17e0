//! Project ownership records.

use super::auth::Identity;
use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::PathBuf;
use tokio::sync::RwLock;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    pub id: String,
    pub user_id: String,
    pub repo_url: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

/// Get/put/delete of project records by id.
#[async_trait]
pub trait ProjectStore: Send + Sync + 'static {
    async fn get(&self, id: &str) -> Result<Option<Project>>;
    async fn put(&self, project: Project) -> Result<()>;
    async fn delete(&self, id: &str) -> Result<Option<Project>>;
    async fn list(&self) -> Result<Vec<Project>>;
}

/// Fetch `id` and check that `identity` owns it.
pub async fn assert_owner(
    store: &dyn ProjectStore,
    identity: &Identity,
    id: &str,
) -> Result<Project> {
    let project = store
        .get(id)
        .await?
        .ok_or_else(|| Error::NotFound("Project not found".into()))?;
    if project.user_id != identity.sub {
        warn!(project_id = id, user = %identity.sub, "ownership check failed");
        return Err(Error::Forbidden);
    }
    Ok(project)
}

/// In-memory map, optionally written through to a JSON file on every
/// mutation.
pub struct FileProjectStore {
    path: Option<PathBuf>,
    projects: RwLock<HashMap<String, Project>>,
}

impl FileProjectStore {
    pub fn in_memory() -> Self {
        Self {
            path: None,
            projects: RwLock::new(HashMap::new()),
        }
    }

    /// Load `path` if it exists. An unreadable file is logged and the store
    /// starts empty.
    pub async fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let projects = match tokio::fs::read(&path).await {
            Ok(bytes) => match serde_json::from_slice::<HashMap<String, Project>>(&bytes) {
                Ok(projects) => {
                    info!(path = %path.display(), count = projects.len(), "loaded project store");
                    projects
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "failed to parse project store");
                    HashMap::new()
                }
            },
            Err(e) if e.kind() == ErrorKind::NotFound => HashMap::new(),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to read project store");
                HashMap::new()
            }
        };
        Self {
            path: Some(path),
            projects: RwLock::new(projects),
        }
    }

    async fn persist(&self, projects: &HashMap<String, Project>) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let bytes = serde_json::to_vec_pretty(projects)
            .map_err(|e| Error::Io(std::io::Error::new(ErrorKind::InvalidData, e)))?;
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }
}

#[async_trait]
impl ProjectStore for FileProjectStore {
    async fn get(&self, id: &str) -> Result<Option<Project>> {
        Ok(self.projects.read().await.get(id).cloned())
    }

    async fn put(&self, project: Project) -> Result<()> {
        let mut projects = self.projects.write().await;
        projects.insert(project.id.clone(), project);
        self.persist(&projects).await
    }

    async fn delete(&self, id: &str) -> Result<Option<Project>> {
        let mut projects = self.projects.write().await;
        let removed = projects.remove(id);
        if removed.is_some() {
            self.persist(&projects).await?;
        }
        Ok(removed)
    }

    async fn list(&self) -> Result<Vec<Project>> {
        Ok(self.projects.read().await.values().cloned().collect())
    }
}
