//! One-shot local analysis for `rootcause analyze`.
//!
//! Runs the same lifecycle the WebSocket endpoint uses, but over an
//! in-process channel whose messages are printed as JSON lines.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use tokio_util::sync::CancellationToken;

use rootcause::config::RcaConfig;
use rootcause::rca::capability::CapabilitySet;
use rootcause::rca::lifecycle::{SessionLifecycle, SessionOutcome};
use rootcause::rca::models::AlertGroup;
use rootcause::rca::pipeline::{Orchestrator, PipelineOptions};
use rootcause::rca::session::SessionStore;
use rootcause::rca::ws::{MemoryChannel, SessionChannel};

pub async fn cmd_analyze(config_path: Option<&Path>, alert_path: &Path, dry_run: bool) -> Result<()> {
    let config = RcaConfig::resolve(config_path)?;

    let raw = std::fs::read_to_string(alert_path)
        .with_context(|| format!("Failed to read alert file: {}", alert_path.display()))?;
    let alert: AlertGroup = serde_json::from_str(&raw)
        .with_context(|| format!("Failed to parse alert group: {}", alert_path.display()))?;
    alert.validate().map_err(anyhow::Error::msg)?;

    let capabilities = if dry_run {
        CapabilitySet::scripted()
    } else {
        CapabilitySet::from_config(&config)
    };
    let store = Arc::new(SessionStore::new());
    let lifecycle = SessionLifecycle::new(
        store.clone(),
        Orchestrator::new(capabilities, PipelineOptions::from_config(&config)),
    );
    let session_id = store.create(alert);

    let (chan, mut rx) = MemoryChannel::channel();
    let channel = SessionChannel::new(Box::new(chan));
    let printer = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            match serde_json::to_string(&msg) {
                Ok(line) => println!("{}", line),
                Err(e) => tracing::error!(error = %e, "failed to encode message"),
            }
        }
    });

    let outcome = lifecycle
        .run(&session_id, channel, CancellationToken::new())
        .await;
    printer.await.context("Output task failed")?;

    match outcome {
        SessionOutcome::Completed => Ok(()),
        SessionOutcome::Failed(message) => bail!("Analysis failed: {}", message),
        SessionOutcome::Disconnected => bail!("Output closed before the analysis finished"),
        SessionOutcome::NotFound => bail!("Session {} was not available", session_id),
    }
}
