//! Pipeline orchestrator.
//!
//! Drives one session's run through
//! `INIT → GRAPH → FANOUT(cluster, logs) → JOIN → CODE → SYNTHESIS → DONE`,
//! falling into `ERROR` on the first unrecoverable failure. Each stage is
//! launched as a capability, its event stream relayed to the client before
//! its final output is awaited.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use super::capability::{CapabilitySet, RunningCapability, launch};
use super::models::{ContextBlock, PipelineRun, PipelineState, Stage, StageOutput, StageResult};
use super::relay::relay;
use super::ws::SessionChannel;
use crate::config::{JoinPolicy, RcaConfig};
use crate::errors::RcaError;

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    /// Bound on a single capability invocation, relay included.
    pub stage_timeout: Duration,
    pub join_policy: JoinPolicy,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            stage_timeout: Duration::from_secs(300),
            join_policy: JoinPolicy::Settle,
        }
    }
}

impl PipelineOptions {
    pub fn from_config(config: &RcaConfig) -> Self {
        Self {
            stage_timeout: config.stage_timeout(),
            join_policy: config.pipeline.join_policy,
        }
    }
}

pub struct Orchestrator {
    capabilities: CapabilitySet,
    options: PipelineOptions,
}

impl Orchestrator {
    pub fn new(capabilities: CapabilitySet, options: PipelineOptions) -> Self {
        Self {
            capabilities,
            options,
        }
    }

    /// Run every stage for `run`, relaying progress onto `channel`.
    ///
    /// On error the run is left in `PipelineState::Error` with whatever
    /// results were produced. A channel failure cancels `cancel` so that no
    /// further capability is invoked for this session.
    pub async fn run(
        &self,
        run: &mut PipelineRun,
        channel: &SessionChannel,
        cancel: &CancellationToken,
    ) -> Result<(), RcaError> {
        let result = self.drive(run, channel, cancel).await;
        if let Err(e) = &result {
            if e.is_channel_failure() {
                cancel.cancel();
            }
            run.transition(PipelineState::Error);
        }
        result
    }

    async fn drive(
        &self,
        run: &mut PipelineRun,
        channel: &SessionChannel,
        cancel: &CancellationToken,
    ) -> Result<(), RcaError> {
        run.transition(PipelineState::Graph);
        let graph = self
            .run_stage(Stage::Graph, run.context_for(&[]), channel, cancel)
            .await?;
        run.record(graph);

        run.transition(PipelineState::FanOut);
        self.fan_out(run, channel, cancel).await?;

        run.transition(PipelineState::Code);
        let code = self
            .run_stage(
                Stage::Code,
                run.context_for(&[Stage::Graph, Stage::Cluster, Stage::Logs]),
                channel,
                cancel,
            )
            .await?;
        run.record(code);

        run.transition(PipelineState::Synthesis);
        let synthesis = self
            .run_stage(
                Stage::Synthesis,
                run.context_for(&[Stage::Graph, Stage::Cluster, Stage::Logs, Stage::Code]),
                channel,
                cancel,
            )
            .await?;
        run.record(synthesis);

        run.transition(PipelineState::Done);
        Ok(())
    }

    /// Run cluster and logs concurrently and join them.
    ///
    /// Successful branches are recorded even when the join fails. A branch
    /// stopped by `FailFast` is reported as neither failed nor succeeded.
    async fn fan_out(
        &self,
        run: &mut PipelineRun,
        channel: &SessionChannel,
        cancel: &CancellationToken,
    ) -> Result<(), RcaError> {
        let context = run.context_for(&[Stage::Graph]);
        let branches = cancel.child_token();

        let (cluster, logs) = tokio::join!(
            self.branch(Stage::Cluster, context.clone(), channel, &branches),
            self.branch(Stage::Logs, context, channel, &branches),
        );
        run.transition(PipelineState::Join);

        let outcomes = [(Stage::Cluster, cluster), (Stage::Logs, logs)];
        if outcomes
            .iter()
            .any(|(_, o)| matches!(o, Err(RcaError::ChannelClosed)))
        {
            return Err(RcaError::ChannelClosed);
        }
        if cancel.is_cancelled() {
            return Err(RcaError::Cancelled);
        }

        let mut failed = Vec::new();
        let mut succeeded = Vec::new();
        for (stage, outcome) in outcomes {
            match outcome {
                Ok(result) => {
                    succeeded.push(stage);
                    run.record(result);
                }
                Err(RcaError::Cancelled) => {
                    tracing::debug!(session_id = %run.session_id, %stage, "branch stopped after sibling failure");
                }
                Err(e) => {
                    tracing::warn!(session_id = %run.session_id, %stage, error = %e, "fan-out branch failed");
                    failed.push(stage);
                }
            }
        }

        if failed.is_empty() {
            Ok(())
        } else {
            Err(RcaError::PartialFanOut { failed, succeeded })
        }
    }

    async fn branch(
        &self,
        stage: Stage,
        context: Vec<ContextBlock>,
        channel: &SessionChannel,
        branches: &CancellationToken,
    ) -> Result<StageResult, RcaError> {
        let result = self.run_stage(stage, context, channel, branches).await;
        let stop_sibling = match &result {
            Err(RcaError::ChannelClosed) => true,
            Err(RcaError::Cancelled) | Ok(_) => false,
            Err(_) => self.options.join_policy == JoinPolicy::FailFast,
        };
        if stop_sibling {
            branches.cancel();
        }
        result
    }

    /// Launch one capability, relay its events, then collect its output.
    async fn run_stage(
        &self,
        stage: Stage,
        context: Vec<ContextBlock>,
        channel: &SessionChannel,
        cancel: &CancellationToken,
    ) -> Result<StageResult, RcaError> {
        if cancel.is_cancelled() {
            return Err(RcaError::Cancelled);
        }
        tracing::info!(%stage, context_blocks = context.len(), "stage started");

        let running = launch(self.capabilities.get(stage), context);
        let abort = running.handle.abort_handle();

        let outcome = tokio::select! {
            _ = cancel.cancelled() => Err(RcaError::Cancelled),
            res = tokio::time::timeout(self.options.stage_timeout, collect(running, channel)) => match res {
                Ok(outcome) => outcome,
                Err(_) => Err(RcaError::StageTimedOut {
                    stage,
                    secs: self.options.stage_timeout.as_secs(),
                }),
            },
        };

        match outcome {
            Ok(output) => {
                tracing::info!(%stage, "stage completed");
                Ok(StageResult { stage, output })
            }
            Err(e) => {
                // Results of an abandoned invocation are discarded.
                abort.abort();
                tracing::warn!(%stage, error = %e, "stage did not complete");
                Err(e)
            }
        }
    }
}

/// Relay a running capability's events, then await its output.
///
/// The output is only awaited once the event stream has been fully drained.
async fn collect(running: RunningCapability, channel: &SessionChannel) -> Result<StageOutput, RcaError> {
    let RunningCapability {
        stage,
        mut events,
        handle,
    } = running;
    let stats = relay(stage, &mut events, channel).await?;
    tracing::debug!(%stage, relayed = stats.relayed, suppressed = stats.suppressed, "stage stream drained");
    match handle.await {
        Ok(Ok(output)) => Ok(output),
        Ok(Err(e)) => Err(RcaError::StageFailed {
            stage,
            message: format!("{:#}", e),
        }),
        Err(e) => Err(RcaError::StageFailed {
            stage,
            message: e.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use anyhow::Result;
    use async_trait::async_trait;
    use tokio::sync::mpsc;

    use crate::rca::capability::{Capability, EventSink, ScriptStep, ScriptedCapability, ToolBudget};
    use crate::rca::models::StageOutput;
    use crate::rca::models::fixtures::checkout_alert;
    use crate::rca::models::{AlertGroup, find_context};
    use crate::rca::ws::{MemoryChannel, MessageType, WireMessage};

    fn tool(call: &str) -> ScriptStep {
        ScriptStep::Tool {
            call: call.to_string(),
            output: serde_json::json!("ok"),
        }
    }

    fn options(stage_timeout: Duration, join_policy: JoinPolicy) -> PipelineOptions {
        PipelineOptions {
            stage_timeout,
            join_policy,
        }
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<WireMessage>) -> Vec<WireMessage> {
        std::iter::from_fn(|| rx.try_recv().ok()).collect()
    }

    fn positions(msgs: &[WireMessage], stage: Stage) -> Vec<usize> {
        msgs.iter()
            .enumerate()
            .filter(|(_, m)| m.agent == Some(stage))
            .map(|(i, _)| i)
            .collect()
    }

    /// agent_started first, message_output last, tool events in between.
    fn assert_stage_ordering(msgs: &[WireMessage], stage: Stage) {
        let own: Vec<&WireMessage> = msgs.iter().filter(|m| m.agent == Some(stage)).collect();
        assert!(!own.is_empty(), "no messages for {}", stage);
        assert_eq!(own[0].kind, MessageType::AgentStarted, "{} must open with agent_started", stage);
        let outputs: Vec<usize> = own
            .iter()
            .enumerate()
            .filter(|(_, m)| m.kind == MessageType::MessageOutput)
            .map(|(i, _)| i)
            .collect();
        assert!(outputs.len() <= 1, "{} emitted more than one message_output", stage);
        if let Some(&last) = outputs.first() {
            assert_eq!(last, own.len() - 1, "{} message_output must be last", stage);
        }
    }

    /// Records how many times it was invoked.
    struct CountingCapability {
        stage: Stage,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Capability for CountingCapability {
        fn stage(&self) -> Stage {
            self.stage
        }

        async fn run(&self, _context: &[ContextBlock], _events: EventSink) -> Result<StageOutput> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(StageOutput::Text("counted".into()))
        }
    }

    /// Echoes the roles of its context blocks as its output.
    struct ContextRoles {
        stage: Stage,
    }

    #[async_trait]
    impl Capability for ContextRoles {
        fn stage(&self) -> Stage {
            self.stage
        }

        async fn run(&self, context: &[ContextBlock], _events: EventSink) -> Result<StageOutput> {
            let roles: Vec<&str> = context.iter().map(|b| b.role.as_str()).collect();
            Ok(StageOutput::Text(roles.join(",")))
        }
    }

    /// Reports the alert it was handed, plus every earlier output it saw.
    struct AlertEcho {
        stage: Stage,
    }

    #[async_trait]
    impl Capability for AlertEcho {
        fn stage(&self) -> Stage {
            self.stage
        }

        fn tools(&self) -> Vec<&'static str> {
            vec!["echo_alert"]
        }

        async fn run(&self, context: &[ContextBlock], events: EventSink) -> Result<StageOutput> {
            let block = find_context(context, "alert").ok_or_else(|| anyhow::anyhow!("no alert"))?;
            let alert: AlertGroup = serde_json::from_str(&block.content)?;
            let key = alert.group_key.clone();
            let mut budget = ToolBudget::unlimited();
            let seen = events
                .tool(&mut budget, format!("echo_alert({})", key), async move {
                    // Let the other session's stages interleave with this one.
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    Ok(serde_json::json!({ "group_key": key }))
                })
                .await?;
            let earlier: Vec<String> = context
                .iter()
                .filter(|b| b.role != "alert")
                .map(|b| b.content.clone())
                .collect();
            Ok(StageOutput::Text(format!(
                "{} saw {} for {} after [{}]",
                self.stage,
                seen["group_key"].as_str().unwrap_or_default(),
                alert.affected_services().join(","),
                earlier.join(" | ")
            )))
        }
    }

    fn echo_set() -> CapabilitySet {
        let echo = |stage| Arc::new(AlertEcho { stage }) as Arc<dyn Capability>;
        CapabilitySet {
            graph: echo(Stage::Graph),
            cluster: echo(Stage::Cluster),
            logs: echo(Stage::Logs),
            code: echo(Stage::Code),
            synthesis: echo(Stage::Synthesis),
        }
    }

    fn payments_alert() -> AlertGroup {
        let mut alert = checkout_alert();
        alert.group_key = "payments-latency".to_string();
        alert
            .common_labels
            .insert("service".to_string(), "payments".to_string());
        for a in &mut alert.alerts {
            a.labels.insert("service".to_string(), "payments".to_string());
        }
        alert
    }

    #[tokio::test]
    async fn test_concurrent_sessions_are_isolated() {
        let orchestrator = Arc::new(Orchestrator::new(echo_set(), PipelineOptions::default()));
        let mut checkout = checkout_alert();
        checkout.group_key = "checkout-errors".to_string();
        let payments = payments_alert();

        let spawn_run = |id: &'static str, alert: AlertGroup| {
            let orchestrator = orchestrator.clone();
            let (chan, rx) = MemoryChannel::channel();
            let channel = SessionChannel::new(Box::new(chan));
            let handle = tokio::spawn(async move {
                let mut run = PipelineRun::new(id, alert);
                let outcome = orchestrator
                    .run(&mut run, &channel, &CancellationToken::new())
                    .await;
                (outcome, run)
            });
            (handle, rx)
        };
        let (a, mut a_rx) = spawn_run("a", checkout);
        let (b, mut b_rx) = spawn_run("b", payments);
        let (a_outcome, a_run) = a.await.unwrap();
        let (b_outcome, b_run) = b.await.unwrap();
        assert!(a_outcome.is_ok());
        assert!(b_outcome.is_ok());

        let sessions = [
            (&a_run, drain(&mut a_rx), "checkout-errors", "payments-latency"),
            (&b_run, drain(&mut b_rx), "payments-latency", "checkout-errors"),
        ];
        for (run, msgs, own, other) in sessions {
            assert_eq!(run.results().len(), 5);
            for result in run.results() {
                let text = result.output.to_context_string();
                assert!(text.contains(own), "{} missing own alert: {}", result.stage, text);
                assert!(!text.contains(other), "{} saw another session: {}", result.stage, text);
            }

            for msg in msgs.iter().filter(|m| m.agent.is_some()) {
                assert!(!msg.data.to_string().contains(other), "leaked onto the wire: {:?}", msg);
            }
            let calls = msgs.iter().filter(|m| m.kind == MessageType::ToolCall).count();
            assert_eq!(calls, 5);
        }
        assert!(a_run.result(Stage::Graph).unwrap().output.to_context_string().contains("checkout"));
        assert!(b_run.result(Stage::Graph).unwrap().output.to_context_string().contains("payments"));
    }

    #[tokio::test]
    async fn test_complete_run_relays_five_stage_cycles_in_dependency_order() {
        let orchestrator = Orchestrator::new(CapabilitySet::scripted(), PipelineOptions::default());
        let (chan, mut rx) = MemoryChannel::channel();
        let channel = SessionChannel::new(Box::new(chan));
        let mut run = PipelineRun::new("s1", checkout_alert());

        orchestrator
            .run(&mut run, &channel, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(
            run.history(),
            &[
                PipelineState::Init,
                PipelineState::Graph,
                PipelineState::FanOut,
                PipelineState::Join,
                PipelineState::Code,
                PipelineState::Synthesis,
                PipelineState::Done,
            ]
        );
        assert_eq!(run.results().len(), 5);

        let msgs = drain(&mut rx);
        for stage in Stage::ALL {
            assert_stage_ordering(&msgs, stage);
        }
        // Orchestrator itself never announces status.
        assert!(msgs.iter().all(|m| m.agent.is_some()));

        let last = |s| *positions(&msgs, s).last().unwrap();
        let first = |s| *positions(&msgs, s).first().unwrap();
        assert!(last(Stage::Graph) < first(Stage::Cluster));
        assert!(last(Stage::Graph) < first(Stage::Logs));
        assert!(last(Stage::Cluster) < first(Stage::Code));
        assert!(last(Stage::Logs) < first(Stage::Code));
        assert!(last(Stage::Code) < first(Stage::Synthesis));
    }

    #[tokio::test]
    async fn test_graph_message_output_is_not_relayed() {
        let orchestrator = Orchestrator::new(CapabilitySet::scripted(), PipelineOptions::default());
        let (chan, mut rx) = MemoryChannel::channel();
        let channel = SessionChannel::new(Box::new(chan));
        let mut run = PipelineRun::new("s1", checkout_alert());
        orchestrator
            .run(&mut run, &channel, &CancellationToken::new())
            .await
            .unwrap();

        let msgs = drain(&mut rx);
        let graph_kinds: Vec<MessageType> = msgs
            .iter()
            .filter(|m| m.agent == Some(Stage::Graph))
            .map(|m| m.kind)
            .collect();
        assert!(graph_kinds.contains(&MessageType::ToolCall));
        assert!(!graph_kinds.contains(&MessageType::MessageOutput));
        // But it is still available to later stages.
        assert!(run.result(Stage::Graph).is_some());
    }

    #[tokio::test]
    async fn test_stages_receive_prior_outputs_as_context() {
        let mut set = CapabilitySet::scripted();
        set.cluster = Arc::new(ContextRoles { stage: Stage::Cluster });
        set.code = Arc::new(ContextRoles { stage: Stage::Code });
        set.synthesis = Arc::new(ContextRoles { stage: Stage::Synthesis });
        let orchestrator = Orchestrator::new(set, PipelineOptions::default());
        let (chan, _rx) = MemoryChannel::channel();
        let channel = SessionChannel::new(Box::new(chan));
        let mut run = PipelineRun::new("s1", checkout_alert());
        orchestrator
            .run(&mut run, &channel, &CancellationToken::new())
            .await
            .unwrap();

        let output = |s| run.result(s).unwrap().output.to_context_string();
        assert_eq!(output(Stage::Cluster), "alert,neo4j");
        assert_eq!(output(Stage::Code), "alert,neo4j,k8s,observe");
        assert_eq!(output(Stage::Synthesis), "alert,neo4j,k8s,observe,github");
    }

    #[tokio::test]
    async fn test_fan_out_failure_lets_sibling_settle_then_errors() {
        let code_calls = Arc::new(AtomicUsize::new(0));
        let mut set = CapabilitySet::scripted();
        set.cluster = Arc::new(ScriptedCapability::failing(
            Stage::Cluster,
            vec![tool("kubectl get pods")],
            "kubectl: forbidden",
        ));
        set.logs = Arc::new(ScriptedCapability::new(
            Stage::Logs,
            vec![
                ScriptStep::Sleep(Duration::from_millis(50)),
                tool("opl_get_errors(checkout)"),
            ],
            StageOutput::Text("3 errors".into()),
        ));
        set.code = Arc::new(CountingCapability {
            stage: Stage::Code,
            calls: code_calls.clone(),
        });
        let orchestrator = Orchestrator::new(set, options(Duration::from_secs(5), JoinPolicy::Settle));
        let (chan, mut rx) = MemoryChannel::channel();
        let channel = SessionChannel::new(Box::new(chan));
        let mut run = PipelineRun::new("s1", checkout_alert());

        let err = orchestrator
            .run(&mut run, &channel, &CancellationToken::new())
            .await
            .unwrap_err();

        match &err {
            RcaError::PartialFanOut { failed, succeeded } => {
                assert_eq!(failed, &vec![Stage::Cluster]);
                assert_eq!(succeeded, &vec![Stage::Logs]);
            }
            other => panic!("Expected PartialFanOut, got {:?}", other),
        }
        assert_eq!(err.to_string(), "partial analysis: k8s failed; observe succeeded");
        assert_eq!(run.state(), PipelineState::Error);
        assert!(run.history().contains(&PipelineState::Join));
        assert!(run.result(Stage::Logs).is_some());
        assert_eq!(code_calls.load(Ordering::SeqCst), 0);

        let msgs = drain(&mut rx);
        // The surviving branch's progress stays on the wire.
        assert!(
            msgs.iter()
                .any(|m| m.agent == Some(Stage::Logs) && m.kind == MessageType::MessageOutput)
        );
        assert!(
            !msgs
                .iter()
                .any(|m| m.agent == Some(Stage::Cluster) && m.kind == MessageType::MessageOutput)
        );
        assert!(positions(&msgs, Stage::Code).is_empty());
        assert_stage_ordering(&msgs, Stage::Cluster);
        assert_stage_ordering(&msgs, Stage::Logs);
    }

    #[tokio::test]
    async fn test_fail_fast_cancels_sibling() {
        let mut set = CapabilitySet::scripted();
        set.cluster = Arc::new(ScriptedCapability::failing(Stage::Cluster, Vec::new(), "boom"));
        set.logs = Arc::new(ScriptedCapability::new(
            Stage::Logs,
            vec![ScriptStep::Sleep(Duration::from_secs(10)), tool("late")],
            StageOutput::Text("never".into()),
        ));
        let orchestrator =
            Orchestrator::new(set, options(Duration::from_secs(30), JoinPolicy::FailFast));
        let (chan, mut rx) = MemoryChannel::channel();
        let channel = SessionChannel::new(Box::new(chan));
        let mut run = PipelineRun::new("s1", checkout_alert());
        let cancel = CancellationToken::new();

        let err = tokio::time::timeout(Duration::from_secs(2), orchestrator.run(&mut run, &channel, &cancel))
            .await
            .expect("fail-fast join should not wait for the slow branch")
            .unwrap_err();

        match err {
            RcaError::PartialFanOut { failed, succeeded } => {
                assert_eq!(failed, vec![Stage::Cluster]);
                assert!(succeeded.is_empty());
            }
            other => panic!("Expected PartialFanOut, got {:?}", other),
        }
        // Session itself was not cancelled.
        assert!(!cancel.is_cancelled());
        let msgs = drain(&mut rx);
        assert!(
            !msgs
                .iter()
                .any(|m| m.agent == Some(Stage::Logs) && m.kind == MessageType::ToolCall)
        );
    }

    #[tokio::test]
    async fn test_sequential_stage_failure_is_terminal() {
        let synthesis_calls = Arc::new(AtomicUsize::new(0));
        let mut set = CapabilitySet::scripted();
        set.code = Arc::new(ScriptedCapability::failing(
            Stage::Code,
            vec![tool("query_codebase(checkout)")],
            "repository unavailable",
        ));
        set.synthesis = Arc::new(CountingCapability {
            stage: Stage::Synthesis,
            calls: synthesis_calls.clone(),
        });
        let orchestrator = Orchestrator::new(set, PipelineOptions::default());
        let (chan, _rx) = MemoryChannel::channel();
        let channel = SessionChannel::new(Box::new(chan));
        let mut run = PipelineRun::new("s1", checkout_alert());

        let err = orchestrator
            .run(&mut run, &channel, &CancellationToken::new())
            .await
            .unwrap_err();
        match &err {
            RcaError::StageFailed { stage, message } => {
                assert_eq!(*stage, Stage::Code);
                assert!(message.contains("repository unavailable"));
            }
            other => panic!("Expected StageFailed, got {:?}", other),
        }
        assert_eq!(run.state(), PipelineState::Error);
        assert_eq!(synthesis_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_stage_timeout() {
        let mut set = CapabilitySet::scripted();
        set.graph = Arc::new(ScriptedCapability::new(
            Stage::Graph,
            vec![ScriptStep::Sleep(Duration::from_secs(5))],
            StageOutput::Text("late".into()),
        ));
        let orchestrator =
            Orchestrator::new(set, options(Duration::from_millis(50), JoinPolicy::Settle));
        let (chan, mut rx) = MemoryChannel::channel();
        let channel = SessionChannel::new(Box::new(chan));
        let mut run = PipelineRun::new("s1", checkout_alert());

        let err = orchestrator
            .run(&mut run, &channel, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, RcaError::StageTimedOut { stage: Stage::Graph, .. }));
        assert_eq!(run.history(), &[PipelineState::Init, PipelineState::Graph, PipelineState::Error]);
        let msgs = drain(&mut rx);
        assert!(msgs.iter().all(|m| m.agent == Some(Stage::Graph)));
    }

    #[tokio::test]
    async fn test_disconnect_cancels_remaining_stages() {
        let code_calls = Arc::new(AtomicUsize::new(0));
        let mut set = CapabilitySet::scripted();
        set.code = Arc::new(CountingCapability {
            stage: Stage::Code,
            calls: code_calls.clone(),
        });
        let orchestrator = Orchestrator::new(set, PipelineOptions::default());
        let (chan, mut rx) = MemoryChannel::channel();
        // Client goes away partway through the graph stage.
        let channel = SessionChannel::new(Box::new(chan.fail_after(3)));
        let mut run = PipelineRun::new("s1", checkout_alert());
        let cancel = CancellationToken::new();

        let err = orchestrator.run(&mut run, &channel, &cancel).await.unwrap_err();
        assert!(err.is_channel_failure());
        assert!(cancel.is_cancelled());
        assert!(channel.is_broken());
        assert_eq!(run.state(), PipelineState::Error);
        assert_eq!(code_calls.load(Ordering::SeqCst), 0);
        assert_eq!(drain(&mut rx).len(), 3);
    }

    #[tokio::test]
    async fn test_cancelled_session_invokes_nothing() {
        let graph_calls = Arc::new(AtomicUsize::new(0));
        let mut set = CapabilitySet::scripted();
        set.graph = Arc::new(CountingCapability {
            stage: Stage::Graph,
            calls: graph_calls.clone(),
        });
        let orchestrator = Orchestrator::new(set, PipelineOptions::default());
        let (chan, mut rx) = MemoryChannel::channel();
        let channel = SessionChannel::new(Box::new(chan));
        let mut run = PipelineRun::new("s1", checkout_alert());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = orchestrator.run(&mut run, &channel, &cancel).await.unwrap_err();
        assert!(matches!(err, RcaError::Cancelled));
        assert_eq!(graph_calls.load(Ordering::SeqCst), 0);
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_broken_channel_does_not_disturb_other_session() {
        let orchestrator = Arc::new(Orchestrator::new(
            CapabilitySet::scripted(),
            PipelineOptions::default(),
        ));

        let (healthy_chan, mut healthy_rx) = MemoryChannel::channel();
        let (broken_chan, _broken_rx) = MemoryChannel::channel();
        let healthy = SessionChannel::new(Box::new(healthy_chan));
        let broken = SessionChannel::new(Box::new(broken_chan.fail_after(1)));

        let a = {
            let orchestrator = orchestrator.clone();
            let channel = healthy.clone();
            tokio::spawn(async move {
                let mut run = PipelineRun::new("a", checkout_alert());
                orchestrator
                    .run(&mut run, &channel, &CancellationToken::new())
                    .await
            })
        };
        let b = {
            let orchestrator = orchestrator.clone();
            let channel = broken.clone();
            tokio::spawn(async move {
                let mut run = PipelineRun::new("b", checkout_alert());
                orchestrator
                    .run(&mut run, &channel, &CancellationToken::new())
                    .await
            })
        };

        assert!(a.await.unwrap().is_ok());
        assert!(b.await.unwrap().unwrap_err().is_channel_failure());
        assert!(!healthy.is_broken());

        let msgs = drain(&mut healthy_rx);
        for stage in Stage::ALL {
            assert_stage_ordering(&msgs, stage);
        }
    }
}
