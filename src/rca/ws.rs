use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    extract::{
        Path, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, Stream, StreamExt, stream::SplitSink};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, mpsc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::api::SharedState;
use super::capability::CapabilityEvent;
use super::lifecycle::{SessionLifecycle, SessionOutcome};
use super::models::Stage;
use crate::errors::RcaError;

/// How often to send WebSocket Ping frames.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// How long to wait for a Pong response before considering the connection dead.
const PONG_TIMEOUT: Duration = Duration::from_secs(60);

// ── Wire protocol ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Status,
    Error,
    AgentStarted,
    AgentUpdated,
    ToolCall,
    ToolOutput,
    MessageOutput,
}

/// One JSON object on the stream: `{"type", "agent", "data"}`.
/// `status` and `error` always carry `agent: null`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WireMessage {
    #[serde(rename = "type")]
    pub kind: MessageType,
    pub agent: Option<Stage>,
    pub data: serde_json::Value,
}

impl WireMessage {
    pub fn status(text: impl Into<String>) -> Self {
        Self {
            kind: MessageType::Status,
            agent: None,
            data: serde_json::Value::String(text.into()),
        }
    }

    pub fn error(text: impl Into<String>) -> Self {
        Self {
            kind: MessageType::Error,
            agent: None,
            data: serde_json::Value::String(text.into()),
        }
    }

    pub fn from_event(stage: Stage, event: &CapabilityEvent) -> Self {
        let (kind, data) = match event {
            CapabilityEvent::AgentStarted { name } => {
                (MessageType::AgentStarted, serde_json::Value::String(name.clone()))
            }
            CapabilityEvent::AgentUpdated { data } => (MessageType::AgentUpdated, data.clone()),
            CapabilityEvent::ToolCall { description } => (
                MessageType::ToolCall,
                serde_json::Value::String(description.clone()),
            ),
            CapabilityEvent::ToolOutput { output } => (MessageType::ToolOutput, output.clone()),
            CapabilityEvent::MessageOutput { output } => {
                (MessageType::MessageOutput, output.to_json())
            }
        };
        Self {
            kind,
            agent: Some(stage),
            data,
        }
    }
}

// ── Channels ─────────────────────────────────────────────────────────

/// Transport for one client. A failed send means the client is gone.
#[async_trait]
pub trait MessageChannel: Send {
    async fn send(&mut self, msg: &WireMessage) -> Result<(), RcaError>;

    /// Keepalive ping. Transports without one succeed trivially.
    async fn ping(&mut self) -> Result<(), RcaError> {
        Ok(())
    }

    async fn close(&mut self);
}

/// Bound on one write or close towards the client.
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Shared, order-preserving writer over a client's channel.
///
/// The first failed or timed-out write marks the channel broken; later sends
/// fail fast without touching the transport. `close` reaches the transport
/// once.
pub struct SessionChannel {
    inner: Mutex<Box<dyn MessageChannel>>,
    broken: AtomicBool,
    closed: AtomicBool,
    write_timeout: Duration,
}

impl SessionChannel {
    pub fn new(channel: Box<dyn MessageChannel>) -> Arc<Self> {
        Self::with_write_timeout(channel, WRITE_TIMEOUT)
    }

    pub fn with_write_timeout(channel: Box<dyn MessageChannel>, write_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(channel),
            broken: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            write_timeout,
        })
    }

    pub async fn send(&self, msg: &WireMessage) -> Result<(), RcaError> {
        if self.is_broken() {
            return Err(RcaError::ChannelClosed);
        }
        let write = async {
            let mut inner = self.inner.lock().await;
            inner.send(msg).await
        };
        match tokio::time::timeout(self.write_timeout, write).await {
            Ok(Ok(())) => {
                tracing::debug!(kind = ?msg.kind, agent = ?msg.agent, "relayed");
                Ok(())
            }
            Ok(Err(e)) => {
                self.mark_broken();
                Err(e)
            }
            Err(_) => {
                tracing::warn!(
                    timeout_ms = self.write_timeout.as_millis() as u64,
                    "client stopped reading; write timed out"
                );
                self.mark_broken();
                Err(RcaError::ChannelClosed)
            }
        }
    }

    /// Keepalive ping. Skipped while a write holds the transport, since
    /// that write is itself bounded by the write timeout.
    pub async fn ping(&self) -> Result<(), RcaError> {
        if self.is_broken() {
            return Err(RcaError::ChannelClosed);
        }
        let Ok(mut inner) = self.inner.try_lock() else {
            return Ok(());
        };
        match tokio::time::timeout(self.write_timeout, inner.ping()).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) | Err(_) => {
                self.mark_broken();
                Err(RcaError::ChannelClosed)
            }
        }
    }

    /// Mark the client as gone without writing (disconnect seen on the read side).
    pub fn mark_broken(&self) {
        self.broken.store(true, Ordering::SeqCst);
    }

    pub fn is_broken(&self) -> bool {
        self.broken.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let close = async {
            self.inner.lock().await.close().await;
        };
        if tokio::time::timeout(self.write_timeout, close).await.is_err() {
            tracing::warn!("client close timed out");
            self.mark_broken();
        }
    }
}

/// WebSocket write half.
pub struct WsChannel {
    sender: SplitSink<WebSocket, Message>,
}

#[async_trait]
impl MessageChannel for WsChannel {
    async fn send(&mut self, msg: &WireMessage) -> Result<(), RcaError> {
        let json = serde_json::to_string(msg).map_err(anyhow::Error::from)?;
        self.sender
            .send(Message::Text(json.into()))
            .await
            .map_err(|_| RcaError::ChannelClosed)
    }

    async fn ping(&mut self) -> Result<(), RcaError> {
        self.sender
            .send(Message::Ping(Default::default()))
            .await
            .map_err(|_| RcaError::ChannelClosed)
    }

    async fn close(&mut self) {
        // Best-effort close frame
        let _ = self.sender.send(Message::Close(None)).await;
        let _ = self.sender.close().await;
    }
}

/// In-process channel delivering messages to an mpsc receiver.
///
/// Used by `rootcause analyze` to print a local run, and by tests. With
/// `fail_after(n)` the n+1th send fails as if the client disconnected.
pub struct MemoryChannel {
    tx: Option<mpsc::UnboundedSender<WireMessage>>,
    fail_after: Option<usize>,
    sent: usize,
}

impl MemoryChannel {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<WireMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx: Some(tx),
                fail_after: None,
                sent: 0,
            },
            rx,
        )
    }

    pub fn fail_after(mut self, n: usize) -> Self {
        self.fail_after = Some(n);
        self
    }
}

#[async_trait]
impl MessageChannel for MemoryChannel {
    async fn send(&mut self, msg: &WireMessage) -> Result<(), RcaError> {
        if self.fail_after.is_some_and(|n| self.sent >= n) {
            return Err(RcaError::ChannelClosed);
        }
        let tx = self.tx.as_ref().ok_or(RcaError::ChannelClosed)?;
        tx.send(msg.clone()).map_err(|_| RcaError::ChannelClosed)?;
        self.sent += 1;
        Ok(())
    }

    async fn close(&mut self) {
        self.tx = None;
    }
}

// ── WebSocket handler ────────────────────────────────────────────────

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(session_id): Path<String>,
    State(state): State<SharedState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, session_id, state))
}

async fn handle_socket(socket: WebSocket, session_id: String, state: SharedState) {
    let (sender, receiver) = socket.split();
    let channel = SessionChannel::new(Box::new(WsChannel { sender }));
    serve_session(&state.lifecycle, &session_id, channel, receiver).await;
}

/// Run one session while watching the client's read side.
async fn serve_session<S, E>(
    lifecycle: &SessionLifecycle,
    session_id: &str,
    channel: Arc<SessionChannel>,
    receiver: S,
) -> SessionOutcome
where
    S: Stream<Item = Result<Message, E>> + Unpin + Send + 'static,
    E: Send + 'static,
{
    let cancel = CancellationToken::new();
    let watcher = tokio::spawn(watch_client(receiver, channel.clone(), cancel.clone()));
    let outcome = lifecycle.run(session_id, channel, cancel).await;
    watcher.abort();
    outcome
}

/// Read side of the socket with ping/pong keepalive.
///
/// Client frames carry no commands; a Close, a read error, or a missed Pong
/// marks the channel broken and cancels the session's pipeline.
async fn watch_client<S, E>(mut receiver: S, channel: Arc<SessionChannel>, cancel: CancellationToken)
where
    S: Stream<Item = Result<Message, E>> + Unpin,
{
    let mut ping_interval = tokio::time::interval(PING_INTERVAL);
    // The first tick completes immediately; consume it so the first real
    // ping fires after PING_INTERVAL has elapsed.
    ping_interval.tick().await;

    let mut last_pong = Instant::now();
    let mut awaiting_pong = false;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,

            _ = ping_interval.tick() => {
                if awaiting_pong && last_pong.elapsed() > PONG_TIMEOUT {
                    tracing::warn!("client missed pong deadline");
                    break;
                }
                if channel.ping().await.is_err() {
                    break;
                }
                awaiting_pong = true;
            }

            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Pong(_))) => {
                        last_pong = Instant::now();
                        awaiting_pong = false;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
        }
    }

    tracing::info!("client disconnected");
    channel.mark_broken();
    cancel.cancel();
}

// ── Tests ────────────────────────────────────────────────────────────

/// A client that stays connected but never reads: every write hangs.
#[cfg(test)]
pub(crate) struct StalledChannel;

#[cfg(test)]
#[async_trait]
impl MessageChannel for StalledChannel {
    async fn send(&mut self, _msg: &WireMessage) -> Result<(), RcaError> {
        std::future::pending().await
    }

    async fn ping(&mut self) -> Result<(), RcaError> {
        std::future::pending().await
    }

    async fn close(&mut self) {
        std::future::pending::<()>().await
    }
}
