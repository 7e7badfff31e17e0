//! Process supervision: argv-only spawning, explicit environments and
//! wall-clock deadlines.

use crate::error::{Error, Result};
use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::{getpgid, getsid, Pid};
use std::collections::HashMap;
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};
use tokio::io::AsyncReadExt;
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tracing::{debug, info, warn};

pub const SYSTEM_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// Configuration for running a command.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    /// The complete environment of the child. Nothing is inherited.
    pub env: HashMap<String, String>,
    pub timeout: Duration,
}

impl RunConfig {
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            cwd: None,
            env: default_env(),
            timeout: crate::config::GIT_TIMEOUT,
        }
    }

    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn env(mut self, env: HashMap<String, String>) -> Self {
        self.env = env;
        self
    }

    pub fn set_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Minimal environment used when the caller supplies none.
pub fn default_env() -> HashMap<String, String> {
    HashMap::from([
        ("HOME".to_string(), "/home/sandboxuser".to_string()),
        ("PATH".to_string(), SYSTEM_PATH.to_string()),
    ])
}

/// Captured output of a command that exited successfully.
#[derive(Debug, Clone, serde::Serialize)]
pub struct RunResult {
    pub stdout: String,
    pub stderr: String,
}

/// A running child with its deadline.
///
/// The child runs in its own process group so that a kill also reaches
/// anything it forked. Dropping the handle kills the child.
#[derive(Debug)]
pub struct ManagedProcess {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub started_at: Instant,
    pub deadline: tokio::time::Instant,
    child: Child,
    exited: Option<ExitStatus>,
}

impl ManagedProcess {
    pub fn spawn(config: &RunConfig) -> Result<Self> {
        info!(program = %config.program, args = ?config.args, cwd = ?config.cwd, "spawn");

        let mut cmd = Command::new(&config.program);
        cmd.args(&config.args)
            .env_clear()
            .envs(&config.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true);
        if let Some(cwd) = &config.cwd {
            cmd.current_dir(cwd);
        }

        let child = cmd.spawn().map_err(|source| Error::Spawn {
            command: config.program.clone(),
            source,
        })?;

        Ok(Self {
            program: config.program.clone(),
            args: config.args.clone(),
            cwd: config.cwd.clone(),
            started_at: Instant::now(),
            deadline: tokio::time::Instant::now() + config.timeout,
            child,
            exited: None,
        })
    }

    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.child.stdout.take()
    }

    pub fn take_stderr(&mut self) -> Option<ChildStderr> {
        self.child.stderr.take()
    }

    pub async fn wait(&mut self) -> std::io::Result<ExitStatus> {
        let status = self.child.wait().await?;
        self.exited = Some(status);
        Ok(status)
    }

    /// SIGKILL the whole process group and reap the child. Safe to call on
    /// an already exited process.
    pub async fn kill(&mut self) -> Option<ExitStatus> {
        if let Some(status) = self.exited {
            return Some(status);
        }
        if let Some(pid) = self.child.id() {
            if let Err(e) = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
                debug!(pid, error = %e, "killpg failed");
            }
        }
        if let Err(e) = self.child.kill().await {
            warn!(program = %self.program, error = %e, "kill failed");
        }
        match self.child.try_wait() {
            Ok(status) => {
                self.exited = status;
                status
            }
            Err(_) => None,
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }
}

/// SIGKILL every process group in the session led by `leader`.
///
/// An interactive shell puts each job in its own group, so signalling the
/// leader's group alone would leave jobs running. Members are found by
/// their session id under `/proc`; a session with no live members is left
/// alone.
pub fn kill_session(leader: u32) {
    let leader = Pid::from_raw(leader as i32);
    let mut groups = Vec::new();
    match std::fs::read_dir("/proc") {
        Ok(entries) => {
            for entry in entries.flatten() {
                let Some(pid) = entry.file_name().to_str().and_then(|name| name.parse().ok()) else {
                    continue;
                };
                let pid = Pid::from_raw(pid);
                if getsid(Some(pid)) != Ok(leader) {
                    continue;
                }
                if let Ok(pgid) = getpgid(Some(pid)) {
                    if !groups.contains(&pgid) {
                        groups.push(pgid);
                    }
                }
            }
        }
        Err(e) => {
            debug!(error = %e, "cannot scan /proc, signalling leader group only");
            groups.push(leader);
        }
    }
    for pgid in groups {
        match killpg(pgid, Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(e) => debug!(pgid = pgid.as_raw(), error = %e, "killpg failed"),
        }
    }
}

/// Exit code as a shell would report it: signals become `128 + signo`.
pub fn exit_code(status: ExitStatus) -> i32 {
    status
        .code()
        .unwrap_or_else(|| status.signal().map_or(-1, |sig| 128 + sig))
}

pub fn timeout_error(timeout: Duration) -> Error {
    Error::Timeout(format!("Command timed out after {}ms", timeout.as_millis()))
}

/// Run a command to completion, capturing its output.
///
/// Exit code 0 resolves to the captured output; any other code fails with
/// stderr (or stdout when stderr is empty) attached. On deadline expiry the
/// process group is killed and a timeout error returned.
pub async fn run(config: &RunConfig) -> Result<RunResult> {
    let mut process = ManagedProcess::spawn(config)?;
    let mut stdout = process.take_stdout();
    let mut stderr = process.take_stderr();
    let deadline = process.deadline;

    let collected = tokio::time::timeout_at(deadline, async {
        let read_out = async {
            let mut buf = Vec::new();
            if let Some(out) = stdout.as_mut() {
                out.read_to_end(&mut buf).await?;
            }
            Ok::<_, std::io::Error>(buf)
        };
        let read_err = async {
            let mut buf = Vec::new();
            if let Some(err) = stderr.as_mut() {
                err.read_to_end(&mut buf).await?;
            }
            Ok::<_, std::io::Error>(buf)
        };
        let (out, err) = tokio::try_join!(read_out, read_err)?;
        let status = process.wait().await?;
        Ok::<_, std::io::Error>((out, err, status))
    })
    .await;

    let (out, err, status) = match collected {
        Ok(result) => result?,
        Err(_) => {
            process.kill().await;
            warn!(program = %config.program, timeout_ms = config.timeout.as_millis() as u64, "command timed out");
            return Err(timeout_error(config.timeout));
        }
    };

    let stdout = String::from_utf8_lossy(&out).into_owned();
    let stderr = String::from_utf8_lossy(&err).into_owned();
    let code = exit_code(status);
    info!(program = %config.program, exit = code, elapsed_ms = process.elapsed().as_millis() as u64, "command finished");

    if code == 0 {
        Ok(RunResult { stdout, stderr })
    } else {
        let output = if stderr.trim().is_empty() { stdout } else { stderr };
        Err(Error::ProcessFailed {
            code,
            output: output.trim().to_string(),
        })
    }
}
