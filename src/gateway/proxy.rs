//! Terminal proxy: one caller WebSocket bridged to one sandbox WebSocket.
//!
//! The sandbox leg is dialled after the caller's upgrade completes. Frames
//! the caller sends in the meantime are held in a bounded queue and
//! flushed, in order, before anything else is forwarded.

use super::store::assert_owner;
use super::GatewayState;
use crate::error::{Error, Result};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::collections::VecDeque;
use std::time::Duration;
use tokio_tungstenite::tungstenite::Message as SandboxMessage;
use tracing::{info, warn};

pub const SANDBOX_UNREACHABLE: &str = "\r\n\x1b[31m[Error: Cannot connect to sandbox]\x1b[0m\r\n";
const SANDBOX_TIMEOUT: &str = "\r\n\x1b[31m[Error: Sandbox connection timed out]\x1b[0m\r\n";
const QUEUE_OVERFLOW: &str = "\r\n\x1b[31m[Error: Too much input before sandbox connected]\x1b[0m\r\n";

#[derive(Deserialize)]
pub struct TerminalQuery {
    token: Option<String>,
    #[serde(rename = "projectId")]
    project_id: Option<String>,
}

pub async fn terminal(
    State(state): State<GatewayState>,
    Query(query): Query<TerminalQuery>,
    ws: Option<WebSocketUpgrade>,
) -> Result<Response> {
    let (token, project_id) = match (query.token, query.project_id) {
        (Some(token), Some(project_id)) if !token.is_empty() && !project_id.is_empty() => {
            (token, project_id)
        }
        _ => return Err(Error::InvalidInput("Missing token or projectId".into())),
    };

    let identity = state.verifier.verify(&token).await.map_err(|e| {
        warn!(error = %e, "terminal token rejected");
        Error::Unauthorized("Invalid or expired token".into())
    })?;
    assert_owner(state.projects.as_ref(), &identity, &project_id).await?;
    state.guard.confine(&project_id)?;
    let ws = ws.ok_or(Error::UpgradeRequired)?;

    let url = state.config.terminal_url(&project_id);
    let limits = BridgeLimits {
        connect_timeout: state.config.connect_timeout,
        queue_limit: state.config.pending_queue_limit,
    };
    info!(%project_id, user = %identity.sub, "terminal proxy");
    Ok(ws.on_upgrade(move |socket| bridge(socket, url, limits, project_id)))
}

#[derive(Debug, Clone, Copy)]
pub struct BridgeLimits {
    /// Deadline for the sandbox leg's TCP connect and WebSocket handshake.
    pub connect_timeout: Duration,
    /// Caller frames held while the sandbox leg is still opening.
    pub queue_limit: usize,
}

/// FIFO of caller frames that arrived before the sandbox leg opened.
#[derive(Debug)]
pub struct PendingQueue<T> {
    items: VecDeque<T>,
    limit: usize,
}

impl<T> PendingQueue<T> {
    pub fn new(limit: usize) -> Self {
        Self {
            items: VecDeque::new(),
            limit,
        }
    }

    /// Hands the item back when the queue is full.
    pub fn push(&mut self, item: T) -> std::result::Result<(), T> {
        if self.items.len() >= self.limit {
            return Err(item);
        }
        self.items.push_back(item);
        Ok(())
    }

    pub fn drain(&mut self) -> impl Iterator<Item = T> + '_ {
        self.items.drain(..)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

enum Relay<T> {
    Forward(T),
    Skip,
    Close,
}

fn to_sandbox(message: Message) -> Relay<SandboxMessage> {
    match message {
        Message::Text(text) => Relay::Forward(SandboxMessage::Text(text)),
        Message::Binary(data) => Relay::Forward(SandboxMessage::Binary(data)),
        Message::Ping(_) | Message::Pong(_) => Relay::Skip,
        Message::Close(_) => Relay::Close,
    }
}

fn to_caller(message: SandboxMessage) -> Relay<Message> {
    match message {
        SandboxMessage::Text(text) => Relay::Forward(Message::Text(text)),
        SandboxMessage::Binary(data) => Relay::Forward(Message::Binary(data)),
        SandboxMessage::Ping(_) | SandboxMessage::Pong(_) | SandboxMessage::Frame(_) => {
            Relay::Skip
        }
        SandboxMessage::Close(_) => Relay::Close,
    }
}

/// Relay frames between `caller` and the sandbox terminal at `sandbox_url`
/// until either side goes away, then close the other.
pub async fn bridge(caller: WebSocket, sandbox_url: String, limits: BridgeLimits, project_id: String) {
    let (mut caller_tx, mut caller_rx) = caller.split();
    let mut pending = PendingQueue::new(limits.queue_limit);

    let connect = tokio::time::timeout(
        limits.connect_timeout,
        tokio_tungstenite::connect_async(sandbox_url),
    );
    tokio::pin!(connect);

    let sandbox = loop {
        tokio::select! {
            connected = &mut connect => {
                let notice = match connected {
                    Ok(Ok((stream, _))) => break stream,
                    Ok(Err(e)) => {
                        warn!(%project_id, error = %e, "sandbox terminal unreachable");
                        SANDBOX_UNREACHABLE
                    }
                    Err(_) => {
                        warn!(%project_id, timeout_ms = limits.connect_timeout.as_millis() as u64, "sandbox terminal handshake timed out");
                        SANDBOX_TIMEOUT
                    }
                };
                let _ = caller_tx.send(Message::Text(notice.into())).await;
                let _ = caller_tx.close().await;
                return;
            }
            inbound = caller_rx.next() => match inbound {
                Some(Ok(message)) => match to_sandbox(message) {
                    Relay::Forward(message) => {
                        if pending.push(message).is_err() {
                            warn!(%project_id, limit = limits.queue_limit, "pending terminal queue overflow");
                            let _ = caller_tx.send(Message::Text(QUEUE_OVERFLOW.into())).await;
                            let _ = caller_tx.close().await;
                            return;
                        }
                    }
                    Relay::Skip => {}
                    Relay::Close => {
                        info!(%project_id, "caller left before sandbox connected");
                        return;
                    }
                },
                _ => {
                    info!(%project_id, "caller left before sandbox connected");
                    return;
                }
            },
        }
    };

    info!(%project_id, queued = pending.len(), "sandbox terminal connected");
    let (mut sandbox_tx, mut sandbox_rx) = sandbox.split();
    for message in pending.drain() {
        if let Err(e) = sandbox_tx.send(message).await {
            warn!(%project_id, error = %e, "flushing queued input failed");
            let _ = caller_tx.close().await;
            return;
        }
    }

    loop {
        tokio::select! {
            inbound = caller_rx.next() => match inbound {
                Some(Ok(message)) => match to_sandbox(message) {
                    Relay::Forward(message) => {
                        if sandbox_tx.send(message).await.is_err() {
                            break;
                        }
                    }
                    Relay::Skip => {}
                    Relay::Close => break,
                },
                _ => break,
            },
            outbound = sandbox_rx.next() => match outbound {
                Some(Ok(message)) => match to_caller(message) {
                    Relay::Forward(message) => {
                        if caller_tx.send(message).await.is_err() {
                            break;
                        }
                    }
                    Relay::Skip => {}
                    Relay::Close => break,
                },
                Some(Err(e)) => {
                    warn!(%project_id, error = %e, "sandbox terminal error");
                    break;
                }
                None => break,
            },
        }
    }

    let _ = sandbox_tx.send(SandboxMessage::Close(None)).await;
    let _ = sandbox_tx.close().await;
    let _ = caller_tx.send(Message::Close(None)).await;
    let _ = caller_tx.close().await;
    info!(%project_id, "terminal proxy closed");
}
