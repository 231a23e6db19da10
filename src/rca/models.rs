use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ── Alert payload ─────────────────────────────────────────────────────

/// One firing (or resolved) alert inside an Alertmanager webhook group.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Alert {
    pub status: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    #[serde(default)]
    pub starts_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub ends_at: Option<DateTime<Utc>>,
    #[serde(default, rename = "generatorURL")]
    pub generator_url: String,
}

/// Alertmanager webhook document. Immutable once submitted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AlertGroup {
    pub version: String,
    pub group_key: String,
    pub status: String,
    #[serde(default)]
    pub receiver: String,
    #[serde(default)]
    pub group_labels: BTreeMap<String, String>,
    #[serde(default)]
    pub common_labels: BTreeMap<String, String>,
    #[serde(default)]
    pub common_annotations: BTreeMap<String, String>,
    #[serde(default, rename = "externalURL")]
    pub external_url: String,
    #[serde(default)]
    pub alerts: Vec<Alert>,
}

impl AlertGroup {
    /// Reject payloads whose `version` is not a plain decimal number.
    pub fn validate(&self) -> Result<(), String> {
        if self.version.is_empty() || !self.version.chars().all(|c| c.is_ascii_digit()) {
            return Err(format!(
                "Invalid alert group version '{}': expected digits only",
                self.version
            ));
        }
        Ok(())
    }

    /// Distinct `service` labels across firing alerts, falling back to the
    /// group's common labels when no individual alert names one.
    pub fn affected_services(&self) -> Vec<String> {
        let mut services: BTreeSet<String> = self
            .alerts
            .iter()
            .filter(|a| a.status == "firing")
            .filter_map(|a| a.labels.get("service").cloned())
            .collect();
        if services.is_empty()
            && let Some(svc) = self.common_labels.get("service")
        {
            services.insert(svc.clone());
        }
        services.into_iter().collect()
    }

    /// Alert names across the group (used to seed code queries).
    pub fn alert_names(&self) -> Vec<String> {
        let names: BTreeSet<String> = self
            .alerts
            .iter()
            .filter_map(|a| a.labels.get("alertname").cloned())
            .collect();
        names.into_iter().collect()
    }
}

// ── Stages ────────────────────────────────────────────────────────────

/// One of the five fixed analysis stages. Serializes as the wire `agent` tag.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Stage {
    #[serde(rename = "neo4j")]
    Graph,
    #[serde(rename = "k8s")]
    Cluster,
    #[serde(rename = "observe")]
    Logs,
    #[serde(rename = "github")]
    Code,
    #[serde(rename = "report")]
    Synthesis,
}

impl Stage {
    pub const ALL: [Stage; 5] = [
        Stage::Graph,
        Stage::Cluster,
        Stage::Logs,
        Stage::Code,
        Stage::Synthesis,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Graph => "neo4j",
            Self::Cluster => "k8s",
            Self::Logs => "observe",
            Self::Code => "github",
            Self::Synthesis => "report",
        }
    }

    /// Display name announced in `agent_started`.
    pub fn agent_name(&self) -> &'static str {
        match self {
            Self::Graph => "Neo4jAgent",
            Self::Cluster => "K8sAgent",
            Self::Logs => "ObserveLogAgent",
            Self::Code => "GithubAgent",
            Self::Synthesis => "ReportAgent",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "neo4j" => Ok(Self::Graph),
            "k8s" => Ok(Self::Cluster),
            "observe" => Ok(Self::Logs),
            "github" => Ok(Self::Code),
            "report" => Ok(Self::Synthesis),
            _ => Err(format!("Invalid stage: {}", s)),
        }
    }
}

// ── Stage results ─────────────────────────────────────────────────────

/// Terminal output of a capability: free text or a structured document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum StageOutput {
    Text(String),
    Structured(serde_json::Value),
}

impl StageOutput {
    /// Render as a plain-text context block for downstream stages.
    pub fn to_context_string(&self) -> String {
        match self {
            Self::Text(text) => text.clone(),
            Self::Structured(value) => {
                serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
            }
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::Text(text) => serde_json::Value::String(text.clone()),
            Self::Structured(value) => value.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StageResult {
    pub stage: Stage,
    pub output: StageOutput,
}

/// A role-tagged plain-text input handed to a capability.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ContextBlock {
    pub role: String,
    pub content: String,
}

impl ContextBlock {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }

    pub fn alert(alert: &AlertGroup) -> Self {
        let content = serde_json::to_string_pretty(alert).unwrap_or_default();
        Self::new("alert", content)
    }

    pub fn from_result(result: &StageResult) -> Self {
        Self::new(result.stage.as_str(), result.output.to_context_string())
    }
}

/// Find the context block for a role, if present.
pub fn find_context<'a>(context: &'a [ContextBlock], role: &str) -> Option<&'a ContextBlock> {
    context.iter().find(|b| b.role == role)
}

// ── Pipeline state machine ────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    Init,
    Graph,
    FanOut,
    Join,
    Code,
    Synthesis,
    Done,
    Error,
}

impl PipelineState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Graph => "graph",
            Self::FanOut => "fan_out",
            Self::Join => "join",
            Self::Code => "code",
            Self::Synthesis => "synthesis",
            Self::Done => "done",
            Self::Error => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Error)
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Forward edges of the pipeline; `Error` is reachable from any live state.
pub fn is_valid_transition(from: PipelineState, to: PipelineState) -> bool {
    use PipelineState::*;
    matches!(
        (from, to),
        (Init, Graph) | (Graph, FanOut) | (FanOut, Join) | (Join, Code) | (Code, Synthesis) | (Synthesis, Done)
    ) || (to == Error && !from.is_terminal())
}

// ── Pipeline run ──────────────────────────────────────────────────────

/// Per-session aggregate of the stage results produced so far.
#[derive(Debug, Clone)]
pub struct PipelineRun {
    pub session_id: String,
    pub alert: AlertGroup,
    results: Vec<StageResult>,
    history: Vec<PipelineState>,
}

impl PipelineRun {
    pub fn new(session_id: impl Into<String>, alert: AlertGroup) -> Self {
        Self {
            session_id: session_id.into(),
            alert,
            results: Vec::new(),
            history: vec![PipelineState::Init],
        }
    }

    pub fn state(&self) -> PipelineState {
        self.history.last().copied().unwrap_or(PipelineState::Init)
    }

    /// States visited so far, starting with `Init`.
    pub fn history(&self) -> &[PipelineState] {
        &self.history
    }

    /// Advance the state machine. Invalid edges are refused and logged.
    pub fn transition(&mut self, to: PipelineState) -> bool {
        let from = self.state();
        if !is_valid_transition(from, to) {
            tracing::error!(session_id = %self.session_id, %from, %to, "invalid pipeline transition");
            return false;
        }
        tracing::info!(session_id = %self.session_id, %from, %to, "pipeline transition");
        self.history.push(to);
        true
    }

    pub fn record(&mut self, result: StageResult) {
        self.results.push(result);
    }

    pub fn results(&self) -> &[StageResult] {
        &self.results
    }

    pub fn result(&self, stage: Stage) -> Option<&StageResult> {
        self.results.iter().find(|r| r.stage == stage)
    }

    pub fn completed_stages(&self) -> Vec<Stage> {
        self.results.iter().map(|r| r.stage).collect()
    }

    /// Alert block followed by the outputs of `stages`, in the given order.
    pub fn context_for(&self, stages: &[Stage]) -> Vec<ContextBlock> {
        let mut blocks = vec![ContextBlock::alert(&self.alert)];
        for stage in stages {
            if let Some(result) = self.result(*stage) {
                blocks.push(ContextBlock::from_result(result));
            }
        }
        blocks
    }
}
