//! Capability abstraction: one unit of analysis per stage.
//!
//! A capability receives ordered context blocks, pushes tool lifecycle
//! events into an [`EventSink`] while it works, and returns a terminal
//! [`StageOutput`]. [`launch`] wraps a run so that the event stream always
//! opens with `AgentStarted` and closes with exactly one `MessageOutput`.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, bail};
use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::models::{ContextBlock, Stage, StageOutput};

/// Buffered events per stage before the capability is made to wait on the relay.
const EVENT_BUFFER: usize = 64;

/// Lifecycle events emitted by a running capability, in emission order.
#[derive(Debug, Clone, PartialEq)]
pub enum CapabilityEvent {
    AgentStarted { name: String },
    AgentUpdated { data: serde_json::Value },
    ToolCall { description: String },
    ToolOutput { output: serde_json::Value },
    MessageOutput { output: StageOutput },
}

/// Push side of a capability's event stream.
///
/// Sends fail once the relay has stopped reading (client gone), which lets a
/// capability stop issuing further tool calls.
#[derive(Clone)]
pub struct EventSink {
    tx: mpsc::Sender<CapabilityEvent>,
}

impl EventSink {
    pub fn channel() -> (Self, mpsc::Receiver<CapabilityEvent>) {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        (Self { tx }, rx)
    }

    pub async fn emit(&self, event: CapabilityEvent) -> Result<()> {
        if self.tx.send(event).await.is_err() {
            bail!("event stream closed");
        }
        Ok(())
    }

    /// Run one tool invocation, bracketing it with `ToolCall`/`ToolOutput`.
    ///
    /// A failed invocation still produces a `ToolOutput` carrying the error
    /// before the error is returned to the capability.
    pub async fn tool<T, F>(&self, budget: &mut ToolBudget, call: impl Into<String>, fut: F) -> Result<T>
    where
        T: Serialize,
        F: Future<Output = Result<T>>,
    {
        budget.consume()?;
        self.emit(CapabilityEvent::ToolCall {
            description: call.into(),
        })
        .await?;
        match fut.await {
            Ok(value) => {
                let output = serde_json::to_value(&value)
                    .unwrap_or_else(|e| serde_json::json!({ "error": e.to_string() }));
                self.emit(CapabilityEvent::ToolOutput { output }).await?;
                Ok(value)
            }
            Err(e) => {
                self.emit(CapabilityEvent::ToolOutput {
                    output: serde_json::json!({ "error": format!("{:#}", e) }),
                })
                .await?;
                Err(e)
            }
        }
    }
}

/// Per-run cap on tool invocations.
#[derive(Debug, Clone)]
pub struct ToolBudget {
    max: Option<usize>,
    used: usize,
}

impl ToolBudget {
    pub fn unlimited() -> Self {
        Self { max: None, used: 0 }
    }

    pub fn limited(max: usize) -> Self {
        Self {
            max: Some(max),
            used: 0,
        }
    }

    fn remaining(&self) -> Option<usize> {
        self.max.map(|m| m.saturating_sub(self.used))
    }

    pub fn is_exhausted(&self) -> bool {
        self.remaining() == Some(0)
    }

    pub fn used(&self) -> usize {
        self.used
    }

    fn consume(&mut self) -> Result<()> {
        if self.is_exhausted() {
            bail!(
                "tool budget exhausted after {} invocations",
                self.used
            );
        }
        self.used += 1;
        Ok(())
    }
}

/// One analysis capability. Implementations hold their backend handles.
#[async_trait]
pub trait Capability: Send + Sync {
    fn stage(&self) -> Stage;

    /// Tool names announced in `AgentUpdated`. Empty for tool-less capabilities.
    fn tools(&self) -> Vec<&'static str> {
        Vec::new()
    }

    /// Perform the analysis. Tool events go through `events`; the terminal
    /// message is emitted by [`launch`] from the returned output.
    async fn run(&self, context: &[ContextBlock], events: EventSink) -> Result<StageOutput>;
}

/// A capability invocation in flight: its event stream plus the task
/// producing the final output.
pub struct RunningCapability {
    pub stage: Stage,
    pub events: mpsc::Receiver<CapabilityEvent>,
    pub handle: JoinHandle<Result<StageOutput>>,
}

/// Spawn a capability run on its own task.
pub fn launch(capability: Arc<dyn Capability>, context: Vec<ContextBlock>) -> RunningCapability {
    let stage = capability.stage();
    let (sink, events) = EventSink::channel();
    let handle = tokio::spawn(drive(capability, context, sink));
    RunningCapability {
        stage,
        events,
        handle,
    }
}

async fn drive(
    capability: Arc<dyn Capability>,
    context: Vec<ContextBlock>,
    sink: EventSink,
) -> Result<StageOutput> {
    let stage = capability.stage();
    sink.emit(CapabilityEvent::AgentStarted {
        name: stage.agent_name().to_string(),
    })
    .await?;
    let tools = capability.tools();
    if !tools.is_empty() {
        sink.emit(CapabilityEvent::AgentUpdated {
            data: serde_json::json!({ "name": stage.agent_name(), "tools": tools }),
        })
        .await?;
    }
    let output = capability.run(&context, sink.clone()).await?;
    sink.emit(CapabilityEvent::MessageOutput {
        output: output.clone(),
    })
    .await?;
    Ok(output)
}

/// The capability bound to each of the five stages.
#[derive(Clone)]
pub struct CapabilitySet {
    pub graph: Arc<dyn Capability>,
    pub cluster: Arc<dyn Capability>,
    pub logs: Arc<dyn Capability>,
    pub code: Arc<dyn Capability>,
    pub synthesis: Arc<dyn Capability>,
}

impl CapabilitySet {
    pub fn get(&self, stage: Stage) -> Arc<dyn Capability> {
        match stage {
            Stage::Graph => self.graph.clone(),
            Stage::Cluster => self.cluster.clone(),
            Stage::Logs => self.logs.clone(),
            Stage::Code => self.code.clone(),
            Stage::Synthesis => self.synthesis.clone(),
        }
    }

    /// Canned capabilities that replay a fixed investigation without
    /// touching any backend (`serve --dry-run`).
    pub fn scripted() -> Self {
        let tool = |call: &str, output: serde_json::Value| ScriptStep::Tool {
            call: call.to_string(),
            output,
        };
        Self {
            graph: Arc::new(ScriptedCapability::new(
                Stage::Graph,
                vec![tool(
                    "get_service_graph(checkout)",
                    serde_json::json!({"upstream": ["frontend"], "downstream": ["payments"]}),
                )],
                StageOutput::Structured(serde_json::json!({"services": []})),
            )),
            cluster: Arc::new(ScriptedCapability::new(
                Stage::Cluster,
                vec![tool("kubectl get pods -n default", serde_json::json!("all pods Running"))],
                StageOutput::Text("No unhealthy workloads found.".into()),
            )),
            logs: Arc::new(ScriptedCapability::new(
                Stage::Logs,
                vec![tool("opl_get_errors(checkout)", serde_json::json!([]))],
                StageOutput::Text("No error lines in the window.".into()),
            )),
            code: Arc::new(ScriptedCapability::new(
                Stage::Code,
                vec![tool("query_codebase(checkout)", serde_json::json!("no recent changes"))],
                StageOutput::Text("No suspicious commits.".into()),
            )),
            synthesis: Arc::new(ScriptedCapability::new(
                Stage::Synthesis,
                Vec::new(),
                StageOutput::Text(
                    "## RCA Summary\nDry run.\n\n## Recommendation\nNone.".into(),
                ),
            )),
        }
    }
}

// ── Scripted capability ───────────────────────────────────────────────

#[derive(Debug, Clone)]
pub enum ScriptStep {
    Tool {
        call: String,
        output: serde_json::Value,
    },
    Sleep(Duration),
}

/// Replays a fixed sequence of tool steps, then returns a fixed outcome.
pub struct ScriptedCapability {
    stage: Stage,
    steps: Vec<ScriptStep>,
    outcome: std::result::Result<StageOutput, String>,
}

impl ScriptedCapability {
    pub fn new(stage: Stage, steps: Vec<ScriptStep>, output: StageOutput) -> Self {
        Self {
            stage,
            steps,
            outcome: Ok(output),
        }
    }

    pub fn failing(stage: Stage, steps: Vec<ScriptStep>, message: impl Into<String>) -> Self {
        Self {
            stage,
            steps,
            outcome: Err(message.into()),
        }
    }
}

#[async_trait]
impl Capability for ScriptedCapability {
    fn stage(&self) -> Stage {
        self.stage
    }

    fn tools(&self) -> Vec<&'static str> {
        if self.steps.iter().any(|s| matches!(s, ScriptStep::Tool { .. })) {
            vec!["scripted"]
        } else {
            Vec::new()
        }
    }

    async fn run(&self, _context: &[ContextBlock], events: EventSink) -> Result<StageOutput> {
        let mut budget = ToolBudget::unlimited();
        for step in &self.steps {
            match step {
                ScriptStep::Tool { call, output } => {
                    let output = output.clone();
                    events
                        .tool(&mut budget, call.clone(), async move { Ok(output) })
                        .await?;
                }
                ScriptStep::Sleep(d) => tokio::time::sleep(*d).await,
            }
        }
        match &self.outcome {
            Ok(output) => Ok(output.clone()),
            Err(message) => bail!("{}", message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn drain(mut running: RunningCapability) -> (Vec<CapabilityEvent>, Result<StageOutput>) {
        let mut events = Vec::new();
        while let Some(event) = running.events.recv().await {
            events.push(event);
        }
        let result = running.handle.await.unwrap();
        (events, result)
    }

    #[tokio::test]
    async fn test_launch_brackets_tool_events() {
        let cap = ScriptedCapability::new(
            Stage::Cluster,
            vec![ScriptStep::Tool {
                call: "kubectl get pods".into(),
                output: serde_json::json!("ok"),
            }],
            StageOutput::Text("healthy".into()),
        );
        let (events, result) = drain(launch(Arc::new(cap), Vec::new())).await;

        assert_eq!(result.unwrap(), StageOutput::Text("healthy".into()));
        assert_eq!(events.len(), 5);
        assert!(matches!(&events[0], CapabilityEvent::AgentStarted { name } if name == "K8sAgent"));
        assert!(matches!(events[1], CapabilityEvent::AgentUpdated { .. }));
        assert!(matches!(events[2], CapabilityEvent::ToolCall { .. }));
        assert!(matches!(events[3], CapabilityEvent::ToolOutput { .. }));
        assert!(matches!(events[4], CapabilityEvent::MessageOutput { .. }));
    }

    #[tokio::test]
    async fn test_toolless_capability_emits_only_start_and_message() {
        let cap = ScriptedCapability::new(Stage::Synthesis, Vec::new(), StageOutput::Text("r".into()));
        let (events, _) = drain(launch(Arc::new(cap), Vec::new())).await;
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], CapabilityEvent::AgentStarted { .. }));
        assert!(matches!(events[1], CapabilityEvent::MessageOutput { .. }));
    }

    #[tokio::test]
    async fn test_failed_run_has_no_message_output() {
        let cap = ScriptedCapability::failing(Stage::Logs, Vec::new(), "observe unreachable");
        let (events, result) = drain(launch(Arc::new(cap), Vec::new())).await;
        assert!(result.unwrap_err().to_string().contains("observe unreachable"));
        assert!(
            !events
                .iter()
                .any(|e| matches!(e, CapabilityEvent::MessageOutput { .. }))
        );
    }

    #[tokio::test]
    async fn test_tool_budget_caps_invocations() {
        let (sink, mut rx) = EventSink::channel();
        let mut budget = ToolBudget::limited(1);
        sink.tool(&mut budget, "first", async { Ok(1) }).await.unwrap();
        let err = sink
            .tool(&mut budget, "second", async { Ok(2) })
            .await
            .unwrap_err();
        assert!(err.to_string().contains("budget exhausted"));
        assert_eq!(budget.used(), 1);
        assert!(budget.is_exhausted());

        drop(sink);
        let mut count = 0;
        while rx.recv().await.is_some() {
            count += 1;
        }
        // Only the first call's pair was emitted.
        assert_eq!(count, 2);
    }

    #[tokio::test]
    async fn test_tool_error_still_emits_output() {
        let (sink, mut rx) = EventSink::channel();
        let mut budget = ToolBudget::unlimited();
        let result: Result<String> = sink
            .tool(&mut budget, "describe", async { Err(anyhow::anyhow!("forbidden")) })
            .await;
        assert!(result.is_err());
        assert!(matches!(rx.recv().await, Some(CapabilityEvent::ToolCall { .. })));
        match rx.recv().await {
            Some(CapabilityEvent::ToolOutput { output }) => {
                assert!(output["error"].as_str().unwrap().contains("forbidden"))
            }
            other => panic!("Expected ToolOutput, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_emit_fails_once_receiver_dropped() {
        let (sink, rx) = EventSink::channel();
        drop(rx);
        let err = sink
            .emit(CapabilityEvent::ToolCall {
                description: "x".into(),
            })
            .await
            .unwrap_err();
        assert!(err.to_string().contains("closed"));
    }

    #[test]
    fn test_scripted_set_covers_every_stage() {
        let set = CapabilitySet::scripted();
        for stage in Stage::ALL {
            assert_eq!(set.get(stage).stage(), stage);
        }
    }
}
