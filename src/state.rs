//! Shared state of the sandbox host.

use crate::config::SandboxConfig;
use crate::error::Result;
use crate::path_guard::PathGuard;
use crate::registry::Registry;
use crate::terminal::Sessions;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub guard: PathGuard,
    pub config: Arc<SandboxConfig>,
    /// Live terminal sessions, each holding a kill handle for its shell.
    pub sessions: Sessions,
}

impl AppState {
    pub fn new(config: SandboxConfig) -> Result<Self> {
        Ok(Self {
            guard: PathGuard::new(&config.workspace_root)?,
            config: Arc::new(config),
            sessions: Registry::new(),
        })
    }
}
