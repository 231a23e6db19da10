//! Typed error hierarchy for the root cause analysis service.
//!
//! `RcaError` is the boundary type between the orchestration core and its
//! callers. Collaborators (backends, capabilities) return `anyhow::Result`
//! and are converted into `RcaError::StageFailed` by the orchestrator.

use thiserror::Error;

use crate::rca::models::Stage;

/// Errors surfaced by a session run.
#[derive(Debug, Error)]
pub enum RcaError {
    #[error("Session {id} not found")]
    SessionNotFound { id: String },

    #[error("{stage} analysis failed: {message}")]
    StageFailed { stage: Stage, message: String },

    #[error("{stage} analysis timed out after {secs}s")]
    StageTimedOut { stage: Stage, secs: u64 },

    #[error("partial analysis: {}", describe_partial(.failed, .succeeded))]
    PartialFanOut {
        failed: Vec<Stage>,
        succeeded: Vec<Stage>,
    },

    #[error("Client channel closed")]
    ChannelClosed,

    #[error("Session cancelled")]
    Cancelled,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl RcaError {
    /// Channel failures abort silently: nothing more is sent to the client.
    pub fn is_channel_failure(&self) -> bool {
        matches!(self, RcaError::ChannelClosed | RcaError::Cancelled)
    }

    /// Stages this error is attributed to, if any.
    pub fn failed_stages(&self) -> Vec<Stage> {
        match self {
            RcaError::StageFailed { stage, .. } | RcaError::StageTimedOut { stage, .. } => {
                vec![*stage]
            }
            RcaError::PartialFanOut { failed, .. } => failed.clone(),
            _ => Vec::new(),
        }
    }
}

fn describe_partial(failed: &[Stage], succeeded: &[Stage]) -> String {
    let mut parts: Vec<String> = failed.iter().map(|s| format!("{} failed", s)).collect();
    parts.extend(succeeded.iter().map(|s| format!("{} succeeded", s)));
    parts.join("; ")
}
