//! One-shot command output relayed as a line-framed event stream.
//!
//! Every stream ends with an exit-code frame and then exactly one
//! [`StreamFrame::Done`], whether the process exited on its own, was killed
//! at its deadline or never started.

use crate::config::SandboxConfig;
use crate::error::{Error, Result};
use crate::path_guard::PathGuard;
use crate::process::{exit_code, timeout_error, ManagedProcess, RunConfig};
use crate::workspace;
use std::convert::Infallible;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;
use tracing::{info, warn};

/// End-of-stream sentinel payload.
pub const DONE: &str = "[DONE]";

const STDERR_PREFIX: &str = "[stderr] ";
const CHUNK_SIZE: usize = 4096;
/// A line longer than this is emitted in pieces rather than buffered.
const MAX_LINE: usize = 64 * 1024;
const FRAME_BUFFER: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamFrame {
    Stdout(String),
    Stderr(String),
    Error(String),
    Exit(i32),
    Done,
}

impl StreamFrame {
    pub fn is_done(&self) -> bool {
        matches!(self, StreamFrame::Done)
    }
}

impl fmt::Display for StreamFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            // A process printing the sentinel itself must not end the stream.
            StreamFrame::Stdout(line) if line == DONE => write!(f, "[stdout] {}", line),
            StreamFrame::Stdout(line) => f.write_str(line),
            StreamFrame::Stderr(line) => write!(f, "{}{}", STDERR_PREFIX, line),
            StreamFrame::Error(message) => {
                write!(f, "[ERROR] {}", message.replace(['\r', '\n'], " "))
            }
            StreamFrame::Exit(code) => write!(f, "[Exit code: {}]", code),
            StreamFrame::Done => f.write_str(DONE),
        }
    }
}

/// Splits a byte stream into lines, carrying partial lines across chunks.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    /// Feed a chunk; returns the non-empty lines it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        for &byte in chunk {
            if byte == b'\n' {
                self.take_line(&mut lines);
            } else {
                self.pending.push(byte);
                if self.pending.len() >= MAX_LINE {
                    self.take_line(&mut lines);
                }
            }
        }
        lines
    }

    /// Remaining partial line at end of input.
    pub fn finish(&mut self) -> Option<String> {
        let mut lines = Vec::new();
        self.take_line(&mut lines);
        lines.pop()
    }

    fn take_line(&mut self, lines: &mut Vec<String>) {
        let raw = std::mem::take(&mut self.pending);
        let line = String::from_utf8_lossy(&raw);
        let line = line.trim_end_matches('\r');
        if !line.is_empty() {
            lines.push(line.to_string());
        }
    }
}

/// Run `config` and relay its output. The returned receiver yields frames
/// until (and including) the sentinel.
pub fn spawn_relay(config: RunConfig) -> mpsc::Receiver<StreamFrame> {
    let (tx, rx) = mpsc::channel(FRAME_BUFFER);
    tokio::spawn(run_relay(config, tx));
    rx
}

async fn run_relay(config: RunConfig, tx: mpsc::Sender<StreamFrame>) {
    let code = match ManagedProcess::spawn(&config) {
        Ok(process) => supervise(process, &config, &tx).await,
        Err(e) => {
            warn!(program = %config.program, error = %e, "relay spawn failed");
            send(&tx, StreamFrame::Error(e.to_string())).await;
            -1
        }
    };
    send(&tx, StreamFrame::Exit(code)).await;
    send(&tx, StreamFrame::Done).await;
}

async fn supervise(
    mut process: ManagedProcess,
    config: &RunConfig,
    tx: &mpsc::Sender<StreamFrame>,
) -> i32 {
    let stdout = process.take_stdout();
    let stderr = process.take_stderr();
    let deadline = process.deadline;

    let outcome = tokio::time::timeout_at(deadline, async {
        tokio::join!(
            pump(stdout, tx, StreamFrame::Stdout),
            pump(stderr, tx, StreamFrame::Stderr)
        );
        process.wait().await
    })
    .await;

    match outcome {
        Ok(Ok(status)) => {
            let code = exit_code(status);
            info!(program = %config.program, exit = code, "relay finished");
            code
        }
        Ok(Err(e)) => {
            send(tx, StreamFrame::Error(e.to_string())).await;
            process.kill().await.map_or(-1, exit_code)
        }
        Err(_) => {
            warn!(program = %config.program, timeout_ms = config.timeout.as_millis() as u64, "relay deadline expired");
            let status = process.kill().await;
            send(tx, StreamFrame::Error(timeout_error(config.timeout).to_string())).await;
            status.map_or(-1, exit_code)
        }
    }
}

/// Forward one output channel line by line. Keeps draining after the
/// consumer has gone so the child never blocks on a full pipe.
async fn pump<R>(reader: Option<R>, tx: &mpsc::Sender<StreamFrame>, frame: fn(String) -> StreamFrame)
where
    R: AsyncRead + Unpin,
{
    let Some(mut reader) = reader else { return };
    let mut lines = LineBuffer::default();
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                for line in lines.push(&buf[..n]) {
                    send(tx, frame(line)).await;
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                warn!(error = %e, "relay read failed");
                break;
            }
        }
    }
    if let Some(line) = lines.finish() {
        send(tx, frame(line)).await;
    }
}

async fn send(tx: &mpsc::Sender<StreamFrame>, frame: StreamFrame) {
    // A closed receiver only means the consumer left; the process keeps
    // running until exit or deadline.
    let _ = tx.send(frame).await;
}

/// Start the agent for `workspace_id` with `prompt`.
///
/// Uses the agent CLI installed in the workspace home or one of the
/// configured system locations; without one, a read-only listing of the
/// workspace stands in so callers still get a well-formed stream.
pub fn run_agent(
    guard: &PathGuard,
    config: &SandboxConfig,
    workspace_id: &str,
    prompt: &str,
) -> Result<mpsc::Receiver<StreamFrame>> {
    let dir = guard.confine(workspace_id)?;
    if !dir.is_dir() {
        return Err(Error::NotFound("Project directory not found".into()));
    }
    let home = workspace::ensure_home(guard, workspace_id)?;
    let env = workspace::project_env(&home, &[]);

    let installed = std::iter::once(home.join(".opencode/bin/opencode"))
        .chain(config.agent_binaries.iter().cloned())
        .find(|candidate| candidate.is_file());

    match installed {
        Some(binary) => {
            let dir_arg = dir.display().to_string();
            let run = RunConfig::new(
                binary.display().to_string(),
                [
                    "--path",
                    dir_arg.as_str(),
                    "--prompt",
                    prompt,
                    "--no-interactive",
                ],
            )
            .cwd(&dir)
            .env(env)
            .timeout(config.agent_timeout);
            Ok(spawn_relay(run))
        }
        None => {
            info!(workspace_id, "agent not installed, streaming workspace overview");
            Ok(spawn_introspection(dir, prompt.to_string()))
        }
    }
}

fn spawn_introspection(dir: PathBuf, prompt: String) -> mpsc::Receiver<StreamFrame> {
    let (tx, rx) = mpsc::channel(FRAME_BUFFER);
    tokio::spawn(async move {
        let listing = tokio::task::spawn_blocking(move || introspect(&dir, &prompt)).await;
        let code = match listing {
            Ok(lines) => {
                for line in lines {
                    send(&tx, StreamFrame::Stdout(line)).await;
                }
                0
            }
            Err(e) => {
                send(&tx, StreamFrame::Error(e.to_string())).await;
                1
            }
        };
        send(&tx, StreamFrame::Exit(code)).await;
        send(&tx, StreamFrame::Done).await;
    });
    rx
}

/// Degraded agent: describe the workspace without touching it.
pub fn introspect(dir: &Path, prompt: &str) -> Vec<String> {
    let mut lines = vec![
        "=== Agent (read-only preview) ===".to_string(),
        format!("Project: {}", dir.display()),
        format!("Prompt received: {}", prompt.replace(['\r', '\n'], " ")),
        "Project structure:".to_string(),
    ];
    list_tree(dir, "", &mut lines);
    lines.push("Analysis complete. Install the agent CLI for real modifications.".to_string());
    lines
}

fn list_tree(dir: &Path, prefix: &str, lines: &mut Vec<String>) {
    let Ok(entries) = fs::read_dir(dir) else { return };
    let mut entries: Vec<_> = entries.filter_map(|e| e.ok()).collect();
    entries.sort_by_key(|e| e.file_name());

    for entry in entries.into_iter().take(20) {
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with('.') || name == "node_modules" {
            continue;
        }
        let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
        let marker = if is_dir { "[dir] " } else { "" };
        lines.push(format!("{}{}{}", prefix, marker, name));
        if is_dir && prefix.len() < 4 {
            list_tree(&entry.path(), &format!("{}  ", prefix), lines);
        }
    }
}

/// Server-sent events over a relay receiver.
pub fn sse_stream(
    rx: mpsc::Receiver<StreamFrame>,
) -> impl futures_util::Stream<Item = std::result::Result<axum::response::sse::Event, Infallible>> {
    futures_util::stream::unfold((rx, false), |(mut rx, finished)| async move {
        if finished {
            return None;
        }
        let frame = rx.recv().await?;
        let done = frame.is_done();
        let event = axum::response::sse::Event::default().data(frame.to_string());
        Some((Ok(event), (rx, done)))
    })
}
