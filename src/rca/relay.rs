//! Stream adapter: capability events → wire messages.

use tokio::sync::mpsc;

use super::capability::CapabilityEvent;
use super::models::Stage;
use super::ws::{SessionChannel, WireMessage};
use crate::errors::RcaError;

/// Counts for one stage's relayed sub-stream.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RelayStats {
    pub relayed: usize,
    pub suppressed: usize,
}

/// The graph stage's terminal output is structured data consumed by later
/// stages, not something to display.
fn is_suppressed(stage: Stage, event: &CapabilityEvent) -> bool {
    stage == Stage::Graph && matches!(event, CapabilityEvent::MessageOutput { .. })
}

/// Drain `events` in emission order, writing one message per event.
///
/// Returns once the capability closes its stream. A failed write aborts
/// immediately with `ChannelClosed`; remaining events are left unread.
pub async fn relay(
    stage: Stage,
    events: &mut mpsc::Receiver<CapabilityEvent>,
    channel: &SessionChannel,
) -> Result<RelayStats, RcaError> {
    let mut stats = RelayStats::default();
    while let Some(event) = events.recv().await {
        if is_suppressed(stage, &event) {
            stats.suppressed += 1;
            continue;
        }
        channel.send(&WireMessage::from_event(stage, &event)).await?;
        stats.relayed += 1;
    }
    Ok(stats)
}
