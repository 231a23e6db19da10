//! Concrete capabilities for the five stages.
//!
//! Each one reads what it needs from its ordered context blocks (the alert
//! plus earlier stage outputs), queries its backend through the event sink,
//! and condenses the results into a stage output.

use std::sync::Arc;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::backends::{
    ClusterInspector, CodeFindings, CodeSearch, GitCodeSearch, K8sMetadata, KubectlInspector,
    LogQuery, MAX_TOOL_OUTPUT, Neo4jHttpGraph, ObserveClient, ServiceGraph, ServiceGraphEntry,
    ServiceNode, container_logs_pipeline, kubectl_describe, kubectl_get, truncate_output,
};
use super::capability::{Capability, CapabilitySet, EventSink, ToolBudget};
use super::models::{AlertGroup, ContextBlock, Stage, StageOutput, find_context};
use crate::config::RcaConfig;

/// Pod states worth calling out in the cluster findings.
const UNHEALTHY_MARKERS: &[&str] = &[
    "CrashLoopBackOff",
    "Error",
    "OOMKilled",
    "ImagePullBackOff",
    "ErrImagePull",
    "Pending",
    "Evicted",
];

const ERROR_MARKERS: &[&str] = &["error", "exception", "panic", "fatal", "warn"];

/// Sample lines kept per service in summaries.
const SAMPLE_LINES: usize = 5;

impl CapabilitySet {
    /// Capabilities backed by the configured services.
    pub fn from_config(config: &RcaConfig) -> Self {
        Self {
            graph: Arc::new(GraphCapability::new(Arc::new(Neo4jHttpGraph::new(
                &config.graph,
            )))),
            cluster: Arc::new(ClusterCapability::new(Arc::new(KubectlInspector::new(
                &config.cluster,
            )))),
            logs: Arc::new(LogsCapability::new(
                Arc::new(ObserveClient::new(&config.logs)),
                config.logs.window_minutes,
                config.logs.limit,
            )),
            code: Arc::new(CodeCapability::new(
                Arc::new(GitCodeSearch::new(&config.code)),
                config.code.max_queries,
            )),
            synthesis: Arc::new(SynthesisCapability),
        }
    }
}

/// Structured output of the graph stage.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct GraphReport {
    pub services: Vec<ServiceGraphEntry>,
}

fn alert_from_context(context: &[ContextBlock]) -> Result<AlertGroup> {
    let block = find_context(context, "alert").context("no alert in context")?;
    serde_json::from_str(&block.content).context("alert context is not an alert group")
}

fn unplaced_node(name: &str) -> ServiceNode {
    ServiceNode {
        name: name.to_string(),
        k8s: K8sMetadata {
            namespace: "default".to_string(),
            owner_kind: "Deployment".to_string(),
            owner_name: name.to_string(),
            owner_uid: "unknown".to_string(),
        },
        operation: None,
        attributes: Default::default(),
    }
}

/// The services under investigation: the graph stage's focal nodes when
/// present, otherwise the alert's service labels in the default namespace.
fn focal_services(context: &[ContextBlock]) -> Result<Vec<ServiceNode>> {
    if let Some(block) = find_context(context, Stage::Graph.as_str()) {
        let report: GraphReport =
            serde_json::from_str(&block.content).context("graph context is not a service graph")?;
        return Ok(report.services.into_iter().map(|e| e.current).collect());
    }
    let alert = alert_from_context(context)?;
    Ok(alert
        .affected_services()
        .iter()
        .map(|name| unplaced_node(name))
        .collect())
}

/// Finding recorded when a tool call errors.
fn failure_line(call: &str, e: &anyhow::Error) -> String {
    format!("- `{}` failed: {:#}", call, e)
}

/// Finding lines of a cluster summary, leaving out tool failures.
fn cluster_findings(content: &str) -> impl Iterator<Item = &str> {
    content
        .lines()
        .filter(|l| l.starts_with("- ") && !(l.starts_with("- `") && l.contains("` failed: ")))
}

fn context_content(context: &[ContextBlock], stage: Stage) -> &str {
    find_context(context, stage.as_str())
        .map(|b| b.content.as_str())
        .unwrap_or_default()
}

fn has_marker(line: &str, markers: &[&str], ignore_case: bool) -> bool {
    if ignore_case {
        let lower = line.to_lowercase();
        markers.iter().any(|m| lower.contains(m))
    } else {
        markers.iter().any(|m| line.contains(m))
    }
}

// ── Graph ────────────────────────────────────────────────────────────

pub struct GraphCapability {
    graph: Arc<dyn ServiceGraph>,
}

impl GraphCapability {
    pub fn new(graph: Arc<dyn ServiceGraph>) -> Self {
        Self { graph }
    }

    async fn entry(&self, service: &str) -> Result<ServiceGraphEntry> {
        let current = self.graph.node(service).await?;
        let deps = self.graph.dependencies(service).await?;
        // Neighbours share the focal node's placement until looked up.
        let neighbour = |name: String| ServiceNode {
            name,
            k8s: current.k8s.clone(),
            operation: None,
            attributes: Default::default(),
        };
        Ok(ServiceGraphEntry {
            upstream: deps.upstream.into_iter().map(neighbour).collect(),
            downstream: deps.downstream.into_iter().map(neighbour).collect(),
            current,
        })
    }
}

#[async_trait]
impl Capability for GraphCapability {
    fn stage(&self) -> Stage {
        Stage::Graph
    }

    fn tools(&self) -> Vec<&'static str> {
        vec!["get_service_graph"]
    }

    async fn run(&self, context: &[ContextBlock], events: EventSink) -> Result<StageOutput> {
        let alert = alert_from_context(context)?;
        let services = alert.affected_services();
        if services.is_empty() {
            bail!("alert carries no service label");
        }

        let mut budget = ToolBudget::unlimited();
        let mut report = GraphReport::default();
        for service in &services {
            let entry = events
                .tool(
                    &mut budget,
                    format!("get_service_graph({})", service),
                    self.entry(service),
                )
                .await?;
            report.services.push(entry);
        }
        Ok(StageOutput::Structured(serde_json::to_value(&report)?))
    }
}

// ── Cluster ──────────────────────────────────────────────────────────

pub struct ClusterCapability {
    inspector: Arc<dyn ClusterInspector>,
}

impl ClusterCapability {
    pub fn new(inspector: Arc<dyn ClusterInspector>) -> Self {
        Self { inspector }
    }
}

#[async_trait]
impl Capability for ClusterCapability {
    fn stage(&self) -> Stage {
        Stage::Cluster
    }

    fn tools(&self) -> Vec<&'static str> {
        vec!["kubectl_get", "kubectl_describe"]
    }

    async fn run(&self, context: &[ContextBlock], events: EventSink) -> Result<StageOutput> {
        let services = focal_services(context)?;
        let mut budget = ToolBudget::unlimited();
        let mut sections = Vec::new();
        let mut succeeded = 0;
        let mut last_error = None;

        for node in &services {
            let ns = node.k8s.namespace.as_str();
            let selector = format!("app={}", node.name);
            let owner_kind = match node.k8s.owner_kind.as_str() {
                "Unknown" | "" => "deployment".to_string(),
                kind => kind.to_lowercase(),
            };
            let commands = [
                kubectl_get("pods", Some(ns), Some(&selector)),
                kubectl_describe(&owner_kind, &node.k8s.owner_name, Some(ns)),
            ];

            let mut findings = Vec::new();
            for args in commands {
                let call = format!("kubectl {}", args.join(" "));
                match events
                    .tool(&mut budget, call.clone(), self.inspector.run(&args))
                    .await
                {
                    Ok(output) => {
                        succeeded += 1;
                        findings.extend(
                            output
                                .lines()
                                .filter(|l| {
                                    has_marker(l, UNHEALTHY_MARKERS, false) || l.contains("Warning")
                                })
                                .take(SAMPLE_LINES)
                                .map(|l| format!("- {}", l.trim())),
                        );
                    }
                    Err(e) => {
                        findings.push(failure_line(&call, &e));
                        last_error = Some(e);
                    }
                }
            }

            if findings.is_empty() {
                findings.push("- no unhealthy pods or warning events".to_string());
            }
            sections.push(format!(
                "### {} ({} {}/{})\n{}",
                node.name,
                node.k8s.owner_kind,
                ns,
                node.k8s.owner_name,
                findings.join("\n")
            ));
        }

        // Only give up when the cluster could not be queried at all.
        if succeeded == 0
            && let Some(e) = last_error
        {
            return Err(e.context("no kubectl command succeeded"));
        }
        Ok(StageOutput::Text(sections.join("\n\n")))
    }
}

// ── Logs ─────────────────────────────────────────────────────────────

/// Condensed result of one log query, as relayed in `tool_output`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LogDigest {
    pub service: String,
    pub rows: usize,
    pub error_lines: Vec<String>,
    pub excerpt: String,
}

fn digest_rows(service: &str, rows: &[serde_json::Value]) -> LogDigest {
    let line_of = |row: &serde_json::Value| match row.get("log").and_then(|v| v.as_str()) {
        Some(text) => text.to_string(),
        None => row.to_string(),
    };
    let error_lines: Vec<String> = rows
        .iter()
        .map(line_of)
        .filter(|line| has_marker(line, ERROR_MARKERS, true))
        .collect();
    let excerpt = serde_json::to_string_pretty(rows).unwrap_or_default();
    LogDigest {
        service: service.to_string(),
        rows: rows.len(),
        error_lines,
        excerpt: truncate_output(&excerpt, MAX_TOOL_OUTPUT),
    }
}

pub struct LogsCapability {
    logs: Arc<dyn LogQuery>,
    window_minutes: u32,
    limit: u32,
}

impl LogsCapability {
    pub fn new(logs: Arc<dyn LogQuery>, window_minutes: u32, limit: u32) -> Self {
        Self {
            logs,
            window_minutes,
            limit,
        }
    }

    async fn sample(&self, node: &ServiceNode) -> Result<LogDigest> {
        let pipeline = container_logs_pipeline(&node.name, &node.k8s.namespace, self.limit);
        let rows = self.logs.query(&pipeline, self.window_minutes).await?;
        Ok(digest_rows(&node.name, &rows))
    }
}

#[async_trait]
impl Capability for LogsCapability {
    fn stage(&self) -> Stage {
        Stage::Logs
    }

    fn tools(&self) -> Vec<&'static str> {
        vec!["opl_get_logs"]
    }

    async fn run(&self, context: &[ContextBlock], events: EventSink) -> Result<StageOutput> {
        let services = focal_services(context)?;
        let mut budget = ToolBudget::unlimited();
        let mut lines = Vec::new();
        let mut succeeded = 0;
        let mut last_error = None;

        for node in &services {
            let call = format!(
                "opl_get_logs({}, namespace={}, minutes={})",
                node.name, node.k8s.namespace, self.window_minutes
            );
            match events.tool(&mut budget, call, self.sample(node)).await {
                Ok(digest) => {
                    succeeded += 1;
                    lines.push(format!(
                        "- {}: {} error lines out of {} rows in the last {}m",
                        digest.service,
                        digest.error_lines.len(),
                        digest.rows,
                        self.window_minutes
                    ));
                    lines.extend(
                        digest
                            .error_lines
                            .iter()
                            .take(SAMPLE_LINES)
                            .map(|l| format!("  - `{}`", truncate_output(l.trim(), 200))),
                    );
                }
                Err(e) => {
                    lines.push(format!("- {}: log query failed: {:#}", node.name, e));
                    last_error = Some(e);
                }
            }
        }

        if succeeded == 0
            && let Some(e) = last_error
        {
            return Err(e.context("no log query succeeded"));
        }
        Ok(StageOutput::Text(lines.join("\n")))
    }
}

// ── Code ─────────────────────────────────────────────────────────────

pub struct CodeCapability {
    search: Arc<dyn CodeSearch>,
    max_queries: usize,
}

impl CodeCapability {
    pub fn new(search: Arc<dyn CodeSearch>, max_queries: usize) -> Self {
        Self {
            search,
            max_queries,
        }
    }
}

/// Exception and error type names (`PaymentTimeoutException`,
/// `KafkaError`) quoted in the logs samples and cluster findings.
fn error_hints(context: &[ContextBlock]) -> Vec<String> {
    let samples = context_content(context, Stage::Logs)
        .lines()
        .filter(|l| l.starts_with("  - "));
    let findings = cluster_findings(context_content(context, Stage::Cluster));

    let mut hints: Vec<String> = Vec::new();
    for line in samples.chain(findings) {
        for token in line.split(|c: char| !(c.is_ascii_alphanumeric() || c == '_')) {
            if is_error_type(token) && !hints.iter().any(|h| h == token) {
                hints.push(token.to_string());
            }
        }
    }
    hints
}

fn is_error_type(token: &str) -> bool {
    token.starts_with(|c: char| c.is_ascii_alphabetic())
        && ["Exception", "Error"]
            .iter()
            .any(|suffix| token.len() > suffix.len() && token.ends_with(suffix))
}

/// Search terms in priority order: alert names, error hints from the
/// earlier stages, then affected services.
fn query_terms(alert: &AlertGroup, hints: Vec<String>) -> Vec<String> {
    let mut terms: Vec<String> = Vec::new();
    for term in alert
        .alert_names()
        .into_iter()
        .chain(hints)
        .chain(alert.affected_services())
    {
        if !term.is_empty() && !terms.contains(&term) {
            terms.push(term);
        }
    }
    terms
}

fn describe_findings(findings: &CodeFindings) -> String {
    let mut out = format!(
        "- `{}`: {} matches, {} related commits",
        findings.query,
        findings.matches.len(),
        findings.commits.len()
    );
    for commit in findings.commits.iter().take(SAMPLE_LINES) {
        out.push_str(&format!("\n  - commit {}", commit));
    }
    for hit in findings.matches.iter().take(SAMPLE_LINES) {
        out.push_str(&format!("\n  - {}", truncate_output(hit, 200)));
    }
    out
}

#[async_trait]
impl Capability for CodeCapability {
    fn stage(&self) -> Stage {
        Stage::Code
    }

    fn tools(&self) -> Vec<&'static str> {
        vec!["query_codebase"]
    }

    async fn run(&self, context: &[ContextBlock], events: EventSink) -> Result<StageOutput> {
        let alert = alert_from_context(context)?;
        let mut budget = ToolBudget::limited(self.max_queries);
        let mut lines = Vec::new();
        let mut last_error = None;
        let mut succeeded = 0;

        for term in query_terms(&alert, error_hints(context)) {
            if budget.is_exhausted() {
                tracing::debug!(skipped = %term, "codebase query budget spent");
                break;
            }
            let call = format!("query_codebase({})", term);
            match events.tool(&mut budget, call, self.search.search(&term)).await {
                Ok(findings) => {
                    succeeded += 1;
                    lines.push(describe_findings(&findings));
                }
                Err(e) => {
                    lines.push(format!("- `{}`: search failed: {:#}", term, e));
                    last_error = Some(e);
                }
            }
        }

        if succeeded == 0
            && let Some(e) = last_error
        {
            return Err(e.context("no codebase query succeeded"));
        }
        if lines.is_empty() {
            lines.push("- nothing to search for".to_string());
        }
        Ok(StageOutput::Text(lines.join("\n")))
    }
}

// ── Synthesis ────────────────────────────────────────────────────────

/// Assembles the final markdown report from every prior output. No tools.
pub struct SynthesisCapability;

fn recommendation(context: &[ContextBlock]) -> &'static str {
    let cluster = context_content(context, Stage::Cluster);
    let logs = context_content(context, Stage::Logs);
    let code = context_content(context, Stage::Code);

    if cluster_findings(cluster).any(|l| has_marker(l, UNHEALTHY_MARKERS, false)) {
        "Inspect the unhealthy workloads above first: check recent restarts and events, and roll back or restart the affected deployment if a bad rollout is confirmed."
    } else if logs.lines().any(|l| l.contains(" error lines") && !l.contains(": 0 error lines")) {
        "Start from the error lines above: trace the failing requests and confirm whether the errors originate in this service or a downstream dependency."
    } else if code.lines().any(|l| l.contains("  - commit ")) {
        "Review the recent commits listed above for a change that lines up with the alert start time."
    } else {
        "No conclusive evidence was found; escalate to the owning team and widen the log window or check upstream dependencies."
    }
}

#[async_trait]
impl Capability for SynthesisCapability {
    fn stage(&self) -> Stage {
        Stage::Synthesis
    }

    async fn run(&self, context: &[ContextBlock], _events: EventSink) -> Result<StageOutput> {
        let alert = alert_from_context(context)?;
        let mut report = String::from("## RCA Summary\n");
        report.push_str(&format!(
            "Alert `{}` is {} for {}.\n",
            alert.alert_names().join("`, `"),
            alert.status,
            alert
                .affected_services()
                .iter()
                .map(|s| format!("`{}`", s))
                .collect::<Vec<_>>()
                .join(", ")
        ));

        if let Some(block) = find_context(context, Stage::Graph.as_str())
            && let Ok(graph) = serde_json::from_str::<GraphReport>(&block.content)
        {
            report.push_str("\n### Service graph\n");
            for entry in &graph.services {
                let names = |nodes: &[ServiceNode]| {
                    nodes.iter().map(|n| n.name.as_str()).collect::<Vec<_>>().join(", ")
                };
                report.push_str(&format!(
                    "- {} ({}): upstream [{}], downstream [{}]\n",
                    entry.current.name,
                    entry.current.k8s.namespace,
                    names(&entry.upstream),
                    names(&entry.downstream)
                ));
            }
        }

        for (stage, title) in [
            (Stage::Cluster, "Cluster"),
            (Stage::Logs, "Logs"),
            (Stage::Code, "Code"),
        ] {
            if let Some(block) = find_context(context, stage.as_str()) {
                report.push_str(&format!("\n### {}\n{}\n", title, block.content.trim()));
            }
        }

        report.push_str("\n## Recommendation\n");
        report.push_str(recommendation(context));
        report.push('\n');
        Ok(StageOutput::Text(report))
    }
}
