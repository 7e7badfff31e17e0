//! Interactive terminal sessions: one pseudo-terminal shell per WebSocket.
//!
//! A session moves through `Created -> PtyStarting -> Active -> Closing ->
//! Closed`. Whatever ends it (caller disconnect, shell exit, transport
//! error, session timer) the shell is killed, the timer dropped and the
//! socket closed before the registry slot is released.

use crate::error::{Error, Result};
use crate::registry::{Registration, Registry};
use crate::process;
use crate::state::AppState;
use crate::workspace;
use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures_util::stream::{SplitSink, StreamExt};
use futures_util::SinkExt;
use portable_pty::{native_pty_system, ChildKiller, CommandBuilder, MasterPty, PtySize};
use serde::Deserialize;
use serde_json::Value;
use std::borrow::Cow;
use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

pub const MIN_COLS: u16 = 10;
pub const MAX_COLS: u16 = 500;
pub const MIN_ROWS: u16 = 2;
pub const MAX_ROWS: u16 = 200;

const DEFAULT_COLS: i64 = 80;
const DEFAULT_ROWS: i64 = 24;
const INITIAL_SIZE: PtySize = PtySize {
    rows: 30,
    cols: 120,
    pixel_width: 0,
    pixel_height: 0,
};

/// How long trailing output is awaited once the shell has exited.
const EXIT_DRAIN: Duration = Duration::from_millis(200);

/// WebSocket close code for policy violations (RFC 6455).
const CLOSE_POLICY: u16 = 1008;

pub type Sessions = Arc<Registry<SessionEntry>>;

/// Registry record for a live shell.
pub struct SessionEntry {
    pub workspace_id: String,
    pub started_at: Instant,
    pid: Option<u32>,
    killer: Box<dyn ChildKiller + Send + Sync>,
}

impl SessionEntry {
    pub fn kill(&mut self) {
        force_kill(self.pid, self.killer.as_mut());
    }
}

/// Kill every registered shell. Used on shutdown.
pub fn kill_all(sessions: &Sessions) {
    sessions.drain(|handle, mut entry| {
        info!(
            session = handle,
            workspace_id = %entry.workspace_id,
            age_secs = entry.started_at.elapsed().as_secs(),
            "terminating session"
        );
        entry.kill();
    });
}

/// SIGKILL the shell's whole session. The shell is a session leader on its
/// pty, so this reaches its jobs too. SIGHUP through the killer covers the
/// case where the pid is unknown.
fn force_kill(pid: Option<u32>, killer: &mut dyn ChildKiller) {
    match pid {
        Some(pid) => process::kill_session(pid),
        None => {
            if let Err(e) = killer.kill() {
                debug!(error = %e, "pty kill");
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Created,
    PtyStarting,
    Active,
    Closing,
    Closed,
}

impl SessionState {
    pub fn can_transition(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Created, PtyStarting)
                | (PtyStarting, Active)
                | (PtyStarting, Closing)
                | (PtyStarting, Closed)
                | (Active, Closing)
                | (Closing, Closed)
        )
    }
}

#[derive(Debug)]
struct Session {
    workspace_id: String,
    state: SessionState,
}

impl Session {
    fn new(workspace_id: String) -> Self {
        Self {
            workspace_id,
            state: SessionState::Created,
        }
    }

    fn transition(&mut self, next: SessionState) {
        if self.state.can_transition(next) {
            debug!(workspace_id = %self.workspace_id, from = ?self.state, to = ?next, "session transition");
            self.state = next;
        } else {
            error!(workspace_id = %self.workspace_id, from = ?self.state, to = ?next, "illegal session transition");
        }
    }
}

/// A decoded inbound frame.
#[derive(Debug, PartialEq, Eq)]
pub enum Inbound {
    Input(Vec<u8>),
    Resize { cols: u16, rows: u16 },
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum ControlMessage {
    Input {
        data: String,
    },
    Resize {
        #[serde(default)]
        cols: Value,
        #[serde(default)]
        rows: Value,
    },
}

/// Decode a text frame. Anything that is not a control message is raw
/// input for the shell.
pub fn parse_inbound(payload: &str) -> Inbound {
    match serde_json::from_str::<ControlMessage>(payload) {
        Ok(ControlMessage::Input { data }) => Inbound::Input(data.into_bytes()),
        Ok(ControlMessage::Resize { cols, rows }) => {
            let (cols, rows) = clamp_size(
                dimension(&cols).unwrap_or(DEFAULT_COLS),
                dimension(&rows).unwrap_or(DEFAULT_ROWS),
            );
            Inbound::Resize { cols, rows }
        }
        Err(_) => Inbound::Input(payload.as_bytes().to_vec()),
    }
}

fn dimension(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

pub fn clamp_size(cols: i64, rows: i64) -> (u16, u16) {
    let cols = cols.clamp(MIN_COLS as i64, MAX_COLS as i64) as u16;
    let rows = rows.clamp(MIN_ROWS as i64, MAX_ROWS as i64) as u16;
    (cols, rows)
}

/// Turns pty bytes into text frames without splitting multi-byte
/// characters across reads.
#[derive(Debug, Default)]
pub struct Utf8Stream {
    carry: Vec<u8>,
}

impl Utf8Stream {
    pub fn decode(&mut self, chunk: &[u8]) -> String {
        self.carry.extend_from_slice(chunk);
        let mut text = String::new();
        loop {
            match std::str::from_utf8(&self.carry) {
                Ok(rest) => {
                    text.push_str(rest);
                    self.carry.clear();
                    return text;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    text.push_str(&String::from_utf8_lossy(&self.carry[..valid]));
                    match e.error_len() {
                        // Incomplete sequence at the end: hold it for the next read.
                        None => {
                            self.carry.drain(..valid);
                            return text;
                        }
                        Some(len) => {
                            text.push(char::REPLACEMENT_CHARACTER);
                            self.carry.drain(..valid + len);
                        }
                    }
                }
            }
        }
    }
}

#[derive(Debug)]
enum PtyEvent {
    Output(Vec<u8>),
    Exit(u32),
}

/// A shell running on a pseudo-terminal. Blocking pty I/O runs on
/// dedicated threads; the session talks to them over channels.
struct Pty {
    master: Box<dyn MasterPty + Send>,
    writer_tx: mpsc::UnboundedSender<Vec<u8>>,
    events: mpsc::UnboundedReceiver<PtyEvent>,
    killer: Box<dyn ChildKiller + Send + Sync>,
    pid: Option<u32>,
    killed: bool,
}

impl Pty {
    fn spawn(shell: &ShellCommand, cwd: &Path, env: &HashMap<String, String>) -> Result<Self> {
        let pair = native_pty_system()
            .openpty(INITIAL_SIZE)
            .map_err(|e| Error::Pty(format!("open pty: {}", e)))?;

        let mut cmd = CommandBuilder::new(&shell.program);
        cmd.args(&shell.args);
        cmd.cwd(cwd);
        cmd.env_clear();
        for (key, value) in env {
            cmd.env(key, value);
        }

        let mut child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| Error::Pty(format!("spawn {}: {}", shell.program, e)))?;
        // Only the child keeps the slave open, so the reader sees EOF on exit.
        drop(pair.slave);

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| Error::Pty(format!("clone reader: {}", e)))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| Error::Pty(format!("take writer: {}", e)))?;

        let (writer_tx, writer_rx) = mpsc::unbounded_channel();
        let (events_tx, events) = mpsc::unbounded_channel();
        let killer = child.clone_killer();
        let pid = child.process_id();

        let output_tx = events_tx.clone();
        thread::spawn(move || read_output(reader, output_tx));
        thread::spawn(move || write_input(writer, writer_rx));
        thread::spawn(move || match child.wait() {
            Ok(status) => {
                let _ = events_tx.send(PtyEvent::Exit(status.exit_code()));
            }
            Err(e) => {
                error!(error = %e, "wait on pty child failed");
                let _ = events_tx.send(PtyEvent::Exit(u32::MAX));
            }
        });

        Ok(Self {
            master: pair.master,
            writer_tx,
            events,
            killer,
            pid,
            killed: false,
        })
    }

    fn write(&self, bytes: Vec<u8>) {
        if self.writer_tx.send(bytes).is_err() {
            debug!("pty writer gone");
        }
    }

    fn resize(&self, cols: u16, rows: u16) {
        let size = PtySize {
            rows,
            cols,
            pixel_width: 0,
            pixel_height: 0,
        };
        if let Err(e) = self.master.resize(size) {
            warn!(error = %e, "pty resize failed");
        }
    }

    /// Idempotent. Runs even after the shell itself exited, since jobs it
    /// left behind keep its session alive.
    fn kill(&mut self) {
        if self.killed {
            return;
        }
        self.killed = true;
        force_kill(self.pid, self.killer.as_mut());
    }
}

impl Drop for Pty {
    fn drop(&mut self) {
        self.kill();
    }
}

fn read_output(mut reader: Box<dyn Read + Send>, tx: mpsc::UnboundedSender<PtyEvent>) {
    let mut buf = [0u8; 4096];
    loop {
        match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                if tx.send(PtyEvent::Output(buf[..n].to_vec())).is_err() {
                    break;
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            // EIO once the slave side is gone.
            Err(e) => {
                debug!(error = %e, "pty reader stopped");
                break;
            }
        }
    }
}

fn write_input(mut writer: Box<dyn Write + Send>, mut rx: mpsc::UnboundedReceiver<Vec<u8>>) {
    while let Some(data) = rx.blocking_recv() {
        if let Err(e) = writer.write_all(&data).and_then(|_| writer.flush()) {
            debug!(error = %e, "pty write failed");
            break;
        }
    }
}

struct ShellCommand {
    program: String,
    args: Vec<String>,
}

/// bash with the workspace rc file when available, plain sh otherwise.
fn shell_for(home: &Path) -> ShellCommand {
    if Path::new("/bin/bash").exists() {
        ShellCommand {
            program: "/bin/bash".to_string(),
            args: vec![
                "--rcfile".to_string(),
                home.join(".bashrc").display().to_string(),
            ],
        }
    } else {
        ShellCommand {
            program: "/bin/sh".to_string(),
            args: Vec::new(),
        }
    }
}

fn red(message: &str) -> String {
    format!("\r\n\x1b[31m{}\x1b[0m\r\n", message)
}

fn yellow(message: &str) -> String {
    format!("\r\n\x1b[33m{}\x1b[0m\r\n", message)
}

fn describe(duration: Duration) -> String {
    let secs = duration.as_secs();
    match secs {
        3600 => "1 hour".to_string(),
        s if s > 0 && s % 3600 == 0 => format!("{} hours", s / 3600),
        s if s > 0 && s % 60 == 0 => format!("{} min", s / 60),
        _ => format!("{}s", duration.as_secs_f64()),
    }
}

/// Close reasons are capped at 123 bytes by the protocol.
fn close_reason(message: &str) -> Cow<'static, str> {
    let mut end = message.len().min(120);
    while !message.is_char_boundary(end) {
        end -= 1;
    }
    Cow::Owned(message[..end].to_string())
}

#[derive(Debug)]
enum CloseCause {
    Disconnected,
    Transport(String),
    PtyExited(u32),
    Timeout,
}

/// Resolve the workspace; errors are caller-facing messages.
fn resolve(state: &AppState, workspace_id: Option<&str>) -> std::result::Result<PathBuf, String> {
    let dir = state
        .guard
        .confine(workspace_id.unwrap_or_default())
        .map_err(|e| e.to_string())?;
    if !dir.is_dir() {
        return Err("Project directory not found".to_string());
    }
    Ok(dir)
}

fn start_shell(state: &AppState, workspace_id: &str, dir: &Path) -> Result<Pty> {
    let home = workspace::ensure_home(&state.guard, workspace_id)?;
    let shell = shell_for(&home);
    let env = workspace::project_env(&home, &[("SHELL", shell.program.as_str())]);
    info!(workspace_id, home = %home.display(), shell = %shell.program, "starting terminal");
    Pty::spawn(&shell, dir, &env)
}

/// Drive one terminal session to completion.
pub async fn run_session(socket: WebSocket, state: AppState, workspace_id: Option<String>) {
    let mut session = Session::new(workspace_id.clone().unwrap_or_default());
    session.transition(SessionState::PtyStarting);
    let (mut ws_tx, mut ws_rx) = socket.split();

    let dir = match resolve(&state, workspace_id.as_deref()) {
        Ok(dir) => dir,
        Err(message) => {
            warn!(workspace_id = ?workspace_id, %message, "terminal rejected");
            session.transition(SessionState::Closing);
            let _ = ws_tx.send(Message::Text(red(&format!("Error: {}", message)))).await;
            close(&mut ws_tx, CLOSE_POLICY, &message).await;
            session.transition(SessionState::Closed);
            return;
        }
    };

    let spawned = {
        let state = state.clone();
        let id = session.workspace_id.clone();
        tokio::task::spawn_blocking(move || start_shell(&state, &id, &dir)).await
    };
    let mut pty = match spawned {
        Ok(Ok(pty)) => pty,
        Ok(Err(e)) => return fail_start(&mut session, &mut ws_tx, &e.to_string()).await,
        Err(e) => return fail_start(&mut session, &mut ws_tx, &e.to_string()).await,
    };

    session.transition(SessionState::Active);
    let registration: Registration<SessionEntry> = state.sessions.register(SessionEntry {
        workspace_id: session.workspace_id.clone(),
        started_at: Instant::now(),
        pid: pty.pid,
        killer: pty.killer.clone_killer(),
    });
    info!(session = registration.handle(), workspace_id = %session.workspace_id, pid = ?pty.pid, "terminal active");

    let timeout = state.config.terminal_timeout;
    let mut timer = Box::pin(tokio::time::sleep(timeout));
    let mut decoder = Utf8Stream::default();

    let cause = loop {
        tokio::select! {
            inbound = ws_rx.next() => match inbound {
                Some(Ok(Message::Text(text))) => match parse_inbound(&text) {
                    Inbound::Input(bytes) => pty.write(bytes),
                    Inbound::Resize { cols, rows } => pty.resize(cols, rows),
                },
                Some(Ok(Message::Binary(bytes))) => pty.write(bytes),
                Some(Ok(Message::Close(_))) | None => break CloseCause::Disconnected,
                Some(Ok(_)) => {}
                Some(Err(e)) => break CloseCause::Transport(e.to_string()),
            },
            event = pty.events.recv() => match event {
                Some(PtyEvent::Output(bytes)) => {
                    let text = decoder.decode(&bytes);
                    if !text.is_empty() {
                        if let Err(e) = ws_tx.send(Message::Text(text)).await {
                            break CloseCause::Transport(e.to_string());
                        }
                    }
                }
                Some(PtyEvent::Exit(code)) => {
                    flush_trailing(&mut pty, &mut decoder, &mut ws_tx).await;
                    let _ = ws_tx
                        .send(Message::Text(yellow(&format!("[Process exited with code {}]", code))))
                        .await;
                    break CloseCause::PtyExited(code);
                }
                None => break CloseCause::PtyExited(u32::MAX),
            },
            _ = &mut timer => {
                let _ = ws_tx
                    .send(Message::Text(yellow(&format!("[Session timeout - {}]", describe(timeout)))))
                    .await;
                break CloseCause::Timeout;
            }
        }
    };

    session.transition(SessionState::Closing);
    info!(session = registration.handle(), workspace_id = %session.workspace_id, cause = ?cause, "terminal closing");
    pty.kill();
    drop(timer);
    close(&mut ws_tx, 1000, "").await;
    drop(registration);
    drop(pty);
    session.transition(SessionState::Closed);
}

async fn fail_start(
    session: &mut Session,
    ws_tx: &mut SplitSink<WebSocket, Message>,
    message: &str,
) {
    error!(workspace_id = %session.workspace_id, %message, "failed to start terminal");
    let _ = ws_tx
        .send(Message::Text(red(&format!("Error starting terminal: {}", message))))
        .await;
    close(ws_tx, 1011, "terminal unavailable").await;
    session.transition(SessionState::Closed);
}

async fn flush_trailing(
    pty: &mut Pty,
    decoder: &mut Utf8Stream,
    ws_tx: &mut SplitSink<WebSocket, Message>,
) {
    while let Ok(Some(PtyEvent::Output(bytes))) =
        tokio::time::timeout(EXIT_DRAIN, pty.events.recv()).await
    {
        let text = decoder.decode(&bytes);
        if !text.is_empty() && ws_tx.send(Message::Text(text)).await.is_err() {
            return;
        }
    }
}

async fn close(ws_tx: &mut SplitSink<WebSocket, Message>, code: u16, reason: &str) {
    let frame = CloseFrame {
        code,
        reason: close_reason(reason),
    };
    let _ = ws_tx.send(Message::Close(Some(frame))).await;
    let _ = ws_tx.close().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SandboxConfig;
    use futures_util::SinkExt;
    use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
    use tokio_tungstenite::tungstenite::Message as WsMessage;

    #[test]
    fn test_clamps_pathological_sizes() {
        assert_eq!(clamp_size(0, 9999), (MIN_COLS, MAX_ROWS));
        assert_eq!(clamp_size(100_000, -3), (MAX_COLS, MIN_ROWS));
        assert_eq!(clamp_size(120, 40), (120, 40));
        assert_eq!(
            parse_inbound(r#"{"type":"resize","cols":0,"rows":9999}"#),
            Inbound::Resize { cols: 10, rows: 200 }
        );
    }

    #[test]
    fn test_parse_control_messages() {
        assert_eq!(
            parse_inbound(r#"{"type":"input","data":"ls -la\r"}"#),
            Inbound::Input(b"ls -la\r".to_vec())
        );
        assert_eq!(
            parse_inbound(r#"{"type":"resize","cols":"132","rows":43.7}"#),
            Inbound::Resize { cols: 132, rows: 43 }
        );
        assert_eq!(
            parse_inbound(r#"{"type":"resize"}"#),
            Inbound::Resize { cols: 80, rows: 24 }
        );
    }

    #[test]
    fn test_non_protocol_payloads_are_raw_input() {
        for raw in ["echo hi\n", "{not json", r#"{"type":"ping"}"#, "42", "\x03"] {
            assert_eq!(parse_inbound(raw), Inbound::Input(raw.as_bytes().to_vec()));
        }
    }

    #[test]
    fn test_utf8_stream_holds_split_characters() {
        let bytes = "a€b".as_bytes();
        let mut stream = Utf8Stream::default();
        assert_eq!(stream.decode(&bytes[..2]), "a");
        assert_eq!(stream.decode(&bytes[2..3]), "");
        assert_eq!(stream.decode(&bytes[3..]), "€b");
        assert_eq!(stream.decode(&[0xff, b'x']), "\u{fffd}x");
    }

    #[test]
    fn test_utf8_stream_invalid_byte_before_split_character() {
        let mut stream = Utf8Stream::default();
        assert_eq!(stream.decode(&[0xff, 0xe2, 0x82]), "\u{fffd}");
        assert_eq!(stream.decode(&[0xac]), "€");
        assert_eq!(stream.decode(&[b'a', 0xff, 0xfe, b'b']), "a\u{fffd}\u{fffd}b");
    }

    #[test]
    fn test_transition_table() {
        use SessionState::*;
        assert!(Created.can_transition(PtyStarting));
        assert!(PtyStarting.can_transition(Active));
        assert!(PtyStarting.can_transition(Closed));
        assert!(Active.can_transition(Closing));
        assert!(Closing.can_transition(Closed));
        assert!(!Closed.can_transition(Active));
        assert!(!Active.can_transition(Closed));
        assert!(!Created.can_transition(Active));
    }

    #[test]
    fn test_describe_timeout() {
        assert_eq!(describe(Duration::from_secs(3600)), "1 hour");
        assert_eq!(describe(Duration::from_secs(7200)), "2 hours");
        assert_eq!(describe(Duration::from_secs(300)), "5 min");
    }

    async fn serve(config: SandboxConfig) -> (String, AppState) {
        let state = AppState::new(config).unwrap();
        let app = crate::http_server::router(state.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("ws://{}/terminal", addr), state)
    }

    fn config_for(root: &Path) -> SandboxConfig {
        SandboxConfig {
            workspace_root: root.to_path_buf(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_traversal_id_rejected_with_message() {
        let root = tempfile::tempdir().unwrap();
        let (url, state) = serve(config_for(root.path())).await;

        let (mut ws, _) = tokio_tungstenite::connect_async(format!("{}?projectId=..%2F..%2Fetc", url))
            .await
            .unwrap();
        let first = ws.next().await.unwrap().unwrap();
        assert!(first.to_text().unwrap().contains("Error: Invalid projectId format"));
        match ws.next().await.unwrap().unwrap() {
            WsMessage::Close(Some(frame)) => assert_eq!(frame.code, CloseCode::Policy),
            other => panic!("expected close, got {:?}", other),
        }
        assert!(state.sessions.is_empty());
    }

    #[tokio::test]
    async fn test_missing_workspace_rejected() {
        let root = tempfile::tempdir().unwrap();
        let (url, _state) = serve(config_for(root.path())).await;

        let (mut ws, _) = tokio_tungstenite::connect_async(format!("{}?projectId=ghost", url))
            .await
            .unwrap();
        let first = ws.next().await.unwrap().unwrap();
        assert!(first.to_text().unwrap().contains("Project directory not found"));
        assert!(!root.path().join("ghost").exists());
    }

    async fn read_until(
        ws: &mut tokio_tungstenite::WebSocketStream<
            tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
        >,
        needle: &str,
    ) -> String {
        let mut seen = String::new();
        let deadline = Duration::from_secs(10);
        tokio::time::timeout(deadline, async {
            while let Some(Ok(msg)) = ws.next().await {
                if let WsMessage::Text(text) = msg {
                    seen.push_str(&text);
                    if seen.contains(needle) {
                        return;
                    }
                }
            }
        })
        .await
        .unwrap_or_else(|_| panic!("never saw {:?} in {:?}", needle, seen));
        seen
    }

    fn pid_after(text: &str, marker: &str) -> Option<i32> {
        text.match_indices(marker).find_map(|(at, _)| {
            let digits: String = text[at + marker.len()..]
                .chars()
                .take_while(char::is_ascii_digit)
                .collect();
            digits.parse().ok()
        })
    }

    /// Read until every marker is followed by digits in the output. The
    /// echoed command line itself (`PID=$$`) does not match.
    async fn read_pids(
        ws: &mut tokio_tungstenite::WebSocketStream<
            tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
        >,
        markers: &[&str],
    ) -> Vec<i32> {
        let mut seen = String::new();
        tokio::time::timeout(Duration::from_secs(10), async {
            while let Some(Ok(msg)) = ws.next().await {
                if let WsMessage::Text(text) = msg {
                    seen.push_str(&text);
                }
                let found: Option<Vec<i32>> =
                    markers.iter().map(|marker| pid_after(&seen, marker)).collect();
                if let Some(pids) = found {
                    return pids;
                }
            }
            panic!("connection ended before {:?}", markers)
        })
        .await
        .unwrap_or_else(|_| panic!("never saw {:?} in {:?}", markers, seen))
    }

    /// Gone or a zombie within 5s.
    async fn exits_soon(pid: i32) -> bool {
        for _ in 0..250 {
            match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
                Err(_) => return true,
                Ok(stat) if stat.rsplit_once(") ").is_some_and(|(_, rest)| rest.starts_with('Z')) => {
                    return true
                }
                Ok(_) => tokio::time::sleep(Duration::from_millis(20)).await,
            }
        }
        false
    }

    const STUBBORN_SHELL: &str =
        "trap '' HUP; echo PID=$$; (trap '' HUP; exec sleep 300) & echo JOB=$!\n";

    #[tokio::test]
    async fn test_disconnect_kills_hup_ignoring_shell_and_jobs() {
        let root = tempfile::tempdir().unwrap();
        std::fs::create_dir(root.path().join("proj")).unwrap();
        let (url, state) = serve(config_for(root.path())).await;

        let (mut ws, _) = tokio_tungstenite::connect_async(format!("{}?projectId=proj", url))
            .await
            .unwrap();
        ws.send(WsMessage::Text(STUBBORN_SHELL.into())).await.unwrap();
        let pids = read_pids(&mut ws, &["PID=", "JOB="]).await;
        let (shell, job) = (pids[0], pids[1]);

        ws.close(None).await.unwrap();
        drop(ws);
        assert!(exits_soon(shell).await, "shell {} survived disconnect", shell);
        assert!(exits_soon(job).await, "job {} survived disconnect", job);
        tokio::time::timeout(Duration::from_secs(5), async {
            while !state.sessions.is_empty() {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("session released after disconnect");
    }

    #[tokio::test]
    async fn test_kill_all_terminates_live_shells() {
        let root = tempfile::tempdir().unwrap();
        std::fs::create_dir(root.path().join("proj")).unwrap();
        let (url, state) = serve(config_for(root.path())).await;

        let (mut ws, _) = tokio_tungstenite::connect_async(format!("{}?projectId=proj", url))
            .await
            .unwrap();
        ws.send(WsMessage::Text(STUBBORN_SHELL.into())).await.unwrap();
        let pids = read_pids(&mut ws, &["PID=", "JOB="]).await;
        let (shell, job) = (pids[0], pids[1]);

        kill_all(&state.sessions);
        assert!(state.sessions.is_empty());
        assert!(exits_soon(shell).await, "shell {} survived shutdown", shell);
        assert!(exits_soon(job).await, "job {} survived shutdown", job);
        read_until(&mut ws, "[Process exited with code").await;
    }

    #[tokio::test]
    async fn test_shell_round_trip_and_disconnect_cleanup() {
        let root = tempfile::tempdir().unwrap();
        std::fs::create_dir(root.path().join("proj")).unwrap();
        let (url, state) = serve(config_for(root.path())).await;

        let (mut ws, _) = tokio_tungstenite::connect_async(format!("{}?projectId=proj", url))
            .await
            .unwrap();
        ws.send(WsMessage::Text(r#"{"type":"resize","cols":0,"rows":9999}"#.into()))
            .await
            .unwrap();
        ws.send(WsMessage::Text(
            r#"{"type":"input","data":"echo sb_$((40+2))\n"}"#.into(),
        ))
        .await
        .unwrap();
        read_until(&mut ws, "sb_42").await;
        assert_eq!(state.sessions.len(), 1);
        assert!(root.path().join("proj/.home/.bashrc").exists());
        ws.send(WsMessage::Text("echo PID=$$\n".into())).await.unwrap();
        let shell = read_pids(&mut ws, &["PID="]).await[0];

        ws.close(None).await.unwrap();
        drop(ws);
        tokio::time::timeout(Duration::from_secs(5), async {
            while !state.sessions.is_empty() {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("session released after disconnect");
        assert!(exits_soon(shell).await, "shell {} survived disconnect", shell);
    }

    #[tokio::test]
    async fn test_shell_exit_code_reported() {
        let root = tempfile::tempdir().unwrap();
        std::fs::create_dir(root.path().join("proj")).unwrap();
        let (url, state) = serve(config_for(root.path())).await;

        let (mut ws, _) = tokio_tungstenite::connect_async(format!("{}?projectId=proj", url))
            .await
            .unwrap();
        ws.send(WsMessage::Text("exit 3\n".into())).await.unwrap();
        read_until(&mut ws, "[Process exited with code 3]").await;
        tokio::time::timeout(Duration::from_secs(5), async {
            while !state.sessions.is_empty() {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("session released after shell exit");
    }

    #[tokio::test]
    async fn test_session_timer_closes_session() {
        let root = tempfile::tempdir().unwrap();
        std::fs::create_dir(root.path().join("proj")).unwrap();
        let config = SandboxConfig {
            terminal_timeout: Duration::from_millis(500),
            ..config_for(root.path())
        };
        let (url, state) = serve(config).await;

        let (mut ws, _) = tokio_tungstenite::connect_async(format!("{}?projectId=proj", url))
            .await
            .unwrap();
        read_until(&mut ws, "[Session timeout").await;
        tokio::time::timeout(Duration::from_secs(5), async {
            while !state.sessions.is_empty() {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("session released after timeout");
    }
}
