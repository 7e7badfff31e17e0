//! Runtime configuration for the sandbox host and the gateway.

use std::path::PathBuf;
use std::time::Duration;

/// Fixed directory under which every workspace lives.
pub const DEFAULT_WORKSPACE_ROOT: &str = "/workspace/projects";

/// Bound for quick utility commands such as `git clone`.
pub const GIT_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Bound for unattended agent runs on the sandbox host.
pub const AGENT_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Absolute lifetime of an interactive terminal session.
pub const TERMINAL_TIMEOUT: Duration = Duration::from_secs(60 * 60);

/// How long the gateway waits for the sandbox to start answering `/run`.
pub const GATEWAY_AGENT_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Bound on opening any connection to the sandbox host, HTTP or WebSocket
/// handshake included.
pub const SANDBOX_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Frames held for a terminal whose sandbox leg is still connecting.
pub const PENDING_QUEUE_LIMIT: usize = 1024;

#[derive(Debug, Clone)]
pub struct SandboxConfig {
    pub workspace_root: PathBuf,
    pub git_timeout: Duration,
    pub agent_timeout: Duration,
    pub terminal_timeout: Duration,
    /// System-wide locations probed for the agent CLI after the
    /// workspace-local install.
    pub agent_binaries: Vec<PathBuf>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            workspace_root: PathBuf::from(DEFAULT_WORKSPACE_ROOT),
            git_timeout: GIT_TIMEOUT,
            agent_timeout: AGENT_TIMEOUT,
            terminal_timeout: TERMINAL_TIMEOUT,
            agent_binaries: vec![PathBuf::from("/usr/local/bin/opencode")],
        }
    }
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Base HTTP URL of the sandbox host, e.g. `http://sandbox:4000`.
    pub sandbox_url: String,
    pub workspace_root: PathBuf,
    pub agent_timeout: Duration,
    pub connect_timeout: Duration,
    pub pending_queue_limit: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            sandbox_url: "http://sandbox:4000".to_string(),
            workspace_root: PathBuf::from(DEFAULT_WORKSPACE_ROOT),
            agent_timeout: GATEWAY_AGENT_TIMEOUT,
            connect_timeout: SANDBOX_CONNECT_TIMEOUT,
            pending_queue_limit: PENDING_QUEUE_LIMIT,
        }
    }
}

impl GatewayConfig {
    pub fn sandbox_endpoint(&self, path: &str) -> String {
        format!("{}{}", self.sandbox_url.trim_end_matches('/'), path)
    }

    /// WebSocket URL of the sandbox terminal for an already validated id.
    pub fn terminal_url(&self, project_id: &str) -> String {
        let base = self.sandbox_url.trim_end_matches('/');
        let ws_base = match base.strip_prefix("http") {
            Some(rest) => format!("ws{}", rest),
            None => base.to_string(),
        };
        format!("{}/terminal?projectId={}", ws_base, project_id)
    }
}
