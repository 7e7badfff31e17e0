//! Confinement of workspace ids to directories under a fixed root.

use crate::error::{Error, Result};
use std::path::{Component, Path, PathBuf};
use tracing::warn;

/// Longest accepted workspace id.
pub const MAX_ID_LEN: usize = 64;

/// Maps workspace ids onto directories below a single confinement root.
///
/// `confine` never touches the filesystem: the format check runs first and
/// the joined path is then normalised lexically and checked to still live
/// under the root.
#[derive(Debug, Clone)]
pub struct PathGuard {
    root: PathBuf,
}

impl PathGuard {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        if !root.is_absolute() {
            return Err(Error::InvalidInput(format!(
                "Workspace root must be absolute: {}",
                root.display()
            )));
        }
        Ok(Self {
            root: normalize(&root),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve `workspace_id` to its directory, refusing anything that could
    /// escape the root.
    pub fn confine(&self, workspace_id: &str) -> Result<PathBuf> {
        validate_id(workspace_id)?;

        let resolved = normalize(&self.root.join(workspace_id));
        // Path::starts_with compares whole components, so `/root-evil` never
        // matches `/root`.
        if resolved != self.root && !resolved.starts_with(&self.root) {
            warn!(
                workspace_id,
                resolved = %resolved.display(),
                "path traversal attempt"
            );
            return Err(Error::Traversal(resolved.display().to_string()));
        }
        Ok(resolved)
    }
}

/// Format check for workspace ids: 1-64 chars of `[A-Za-z0-9_-]`.
pub fn validate_id(workspace_id: &str) -> Result<()> {
    if workspace_id.is_empty() {
        return Err(Error::InvalidInput("Invalid projectId".into()));
    }
    let well_formed = workspace_id.len() <= MAX_ID_LEN
        && workspace_id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-');
    if !well_formed {
        warn!(len = workspace_id.len(), "rejected malformed workspace id");
        return Err(Error::InvalidInput(
            "Invalid projectId format - only alphanumeric, hyphens and underscores allowed".into(),
        ));
    }
    Ok(())
}

/// Lexical normalisation: drops `.`, folds `..` without climbing above `/`.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Prefix(p) => out.push(p.as_os_str()),
            Component::RootDir => out.push(Component::RootDir.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            Component::Normal(part) => out.push(part),
        }
    }
    out
}
