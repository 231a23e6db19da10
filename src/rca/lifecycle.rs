//! One streamed session from claim to cleanup.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::FutureExt;
use tokio_util::sync::CancellationToken;

use super::models::{AlertGroup, PipelineRun};
use super::pipeline::Orchestrator;
use super::session::SharedSessionStore;
use super::ws::{SessionChannel, WireMessage};

pub const STATUS_STARTING: &str = "Starting";
pub const STATUS_COMPLETE: &str = "Analysis complete";

/// How a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    Completed,
    /// Pipeline failed; the message was sent to the client as `error`.
    Failed(String),
    /// Client went away; nothing further was sent.
    Disconnected,
    /// Unknown or already-claimed session id.
    NotFound,
}

pub struct SessionLifecycle {
    store: SharedSessionStore,
    orchestrator: Arc<Orchestrator>,
}

impl SessionLifecycle {
    pub fn new(store: SharedSessionStore, orchestrator: Orchestrator) -> Self {
        Self {
            store,
            orchestrator: Arc::new(orchestrator),
        }
    }

    pub fn store(&self) -> &SharedSessionStore {
        &self.store
    }

    /// Claim `session_id` and stream its analysis onto `channel`.
    ///
    /// Whatever happens after a successful claim, including a panic inside
    /// the pipeline, the session is discarded once and the channel closed
    /// once. An unknown id gets a single `error` message and a close.
    pub async fn run(
        &self,
        session_id: &str,
        channel: Arc<SessionChannel>,
        cancel: CancellationToken,
    ) -> SessionOutcome {
        let alert = match self.store.take(session_id) {
            Ok(alert) => alert,
            Err(e) => {
                tracing::warn!(session_id, "stream requested for unknown session");
                // The id may belong to another client's live run; leave it be.
                let _ = channel.send(&WireMessage::error(e.to_string())).await;
                channel.close().await;
                return SessionOutcome::NotFound;
            }
        };
        tracing::info!(session_id, services = ?alert.affected_services(), "session claimed");

        let outcome = match AssertUnwindSafe(self.execute(session_id, alert, &channel, &cancel))
            .catch_unwind()
            .await
        {
            Ok(outcome) => outcome,
            Err(_) => {
                tracing::error!(session_id, "session run panicked");
                let message = "internal error during analysis".to_string();
                let _ = channel.send(&WireMessage::error(&message)).await;
                SessionOutcome::Failed(message)
            }
        };

        self.store.discard(session_id);
        channel.close().await;
        cancel.cancel();
        tracing::info!(session_id, outcome = ?outcome, "session finished");
        outcome
    }

    async fn execute(
        &self,
        session_id: &str,
        alert: AlertGroup,
        channel: &SessionChannel,
        cancel: &CancellationToken,
    ) -> SessionOutcome {
        if channel.send(&WireMessage::status(STATUS_STARTING)).await.is_err() {
            return SessionOutcome::Disconnected;
        }

        let mut run = PipelineRun::new(session_id, alert);
        match self.orchestrator.run(&mut run, channel, cancel).await {
            Ok(()) => match channel.send(&WireMessage::status(STATUS_COMPLETE)).await {
                Ok(()) => SessionOutcome::Completed,
                Err(_) => SessionOutcome::Disconnected,
            },
            Err(e) if e.is_channel_failure() => {
                tracing::info!(session_id, "client disconnected; abandoning run");
                SessionOutcome::Disconnected
            }
            Err(e) => {
                let message = e.to_string();
                tracing::warn!(
                    session_id,
                    error = %message,
                    failed = ?e.failed_stages(),
                    completed = ?run.completed_stages(),
                    "analysis failed"
                );
                // Best effort: the client may already be gone.
                let _ = channel.send(&WireMessage::error(&message)).await;
                SessionOutcome::Failed(message)
            }
        }
    }
}
