//! Per-workspace home directory and process environment.
//!
//! Every workspace gets its own `.home` so that tools a user installs from
//! the terminal (or the agent installs for itself) stay inside that
//! workspace.

use crate::error::Result;
use crate::path_guard::PathGuard;
use crate::process::SYSTEM_PATH;
use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

pub const HOME_DIR: &str = ".home";
pub const SANDBOX_USER: &str = "sandboxuser";

const BASHRC: &str = r#"# Per-workspace shell config
# Tools installed here only affect THIS workspace

# Workspace-local tools take priority
export PATH="$HOME/.opencode/bin:$HOME/.local/bin:$PATH"

export PS1="\[\033[01;32m\]sandbox\[\033[00m\]:\[\033[01;34m\]\w\[\033[00m\]\$ "
"#;

/// Return the workspace's home directory, creating and seeding it on first
/// use. Later calls leave an existing `.bashrc` untouched.
pub fn ensure_home(guard: &PathGuard, workspace_id: &str) -> Result<PathBuf> {
    let home = guard.confine(workspace_id)?.join(HOME_DIR);
    fs::create_dir_all(&home)?;

    // create_new makes the seeding race-free between concurrent sessions.
    match OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(home.join(".bashrc"))
    {
        Ok(mut file) => {
            file.write_all(BASHRC.as_bytes())?;
            debug!(workspace_id, home = %home.display(), "seeded workspace home");
        }
        Err(e) if e.kind() == ErrorKind::AlreadyExists => {}
        Err(e) => return Err(e.into()),
    }
    Ok(home)
}

/// Environment for processes acting on behalf of a workspace. Nothing from
/// the host environment leaks in; `extra` wins over the defaults.
pub fn project_env(home: &Path, extra: &[(&str, &str)]) -> HashMap<String, String> {
    let home_str = home.display().to_string();
    let mut env = HashMap::from([
        ("HOME".to_string(), home_str.clone()),
        ("USER".to_string(), SANDBOX_USER.to_string()),
        ("TERM".to_string(), "xterm-256color".to_string()),
        ("COLORTERM".to_string(), "truecolor".to_string()),
        ("LANG".to_string(), "C.UTF-8".to_string()),
        (
            "PATH".to_string(),
            format!(
                "{home}/.opencode/bin:{home}/.local/bin:{sys}",
                home = home_str,
                sys = SYSTEM_PATH
            ),
        ),
    ]);
    for (key, value) in extra {
        env.insert(key.to_string(), value.to_string());
    }
    env
}
