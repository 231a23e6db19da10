//! Collaborator handles used by the concrete capabilities.
//!
//! Each backend is a trait so capabilities can be exercised with fakes; the
//! concrete clients talk to Neo4j over its HTTP transaction API, to the
//! cluster through a read-only `kubectl`, to Observe's export API, and to a
//! local git checkout.

use std::path::PathBuf;
use std::process::Output;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;

use crate::config::{ClusterSection, CodeSection, GraphSection, LogsSection};

/// Tool output above this many characters is cut before being relayed.
pub const MAX_TOOL_OUTPUT: usize = 15_000;

const HTTP_TIMEOUT: Duration = Duration::from_secs(60);

/// Cut `text` to at most `max` characters, marking the cut.
pub fn truncate_output(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => format!("{}\n... [truncated]", &text[..idx]),
        None => text.to_string(),
    }
}

// ── Service graph ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct K8sMetadata {
    pub namespace: String,
    pub owner_kind: String,
    pub owner_name: String,
    pub owner_uid: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServiceNode {
    pub name: String,
    pub k8s: K8sMetadata,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation: Option<String>,
    #[serde(default)]
    pub attributes: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ServiceDependencies {
    /// Services that call this one.
    pub upstream: Vec<String>,
    /// Services this one calls.
    pub downstream: Vec<String>,
}

/// One focal service with its neighbours, as handed to later stages.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServiceGraphEntry {
    pub current: ServiceNode,
    pub upstream: Vec<ServiceNode>,
    pub downstream: Vec<ServiceNode>,
}

#[async_trait]
pub trait ServiceGraph: Send + Sync {
    async fn node(&self, service: &str) -> Result<ServiceNode>;
    async fn dependencies(&self, service: &str) -> Result<ServiceDependencies>;
}

const NODE_QUERY: &str = "MATCH (s:Service {name: $service_name}) \
RETURN s.name, s.k8s_namespace, s.k8s_owner_kind, s.k8s_owner_name, s.k8s_owner_uid, s.operation, s.attributesJson";

const UPSTREAM_QUERY: &str =
    "MATCH (caller:Service)-[:CALLS]->(callee:Service {name: $service_name}) RETURN caller.name";

const DOWNSTREAM_QUERY: &str =
    "MATCH (caller:Service {name: $service_name})-[:CALLS]->(callee:Service) RETURN callee.name";

#[derive(Debug, Deserialize)]
struct TxResponse {
    #[serde(default)]
    results: Vec<TxResult>,
    #[serde(default)]
    errors: Vec<TxError>,
}

#[derive(Debug, Deserialize)]
struct TxResult {
    #[serde(default)]
    data: Vec<TxRow>,
}

#[derive(Debug, Deserialize)]
struct TxRow {
    row: Vec<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct TxError {
    code: String,
    message: String,
}

/// Rows of the first statement result, or the first reported error.
fn rows_from_response(response: TxResponse) -> Result<Vec<Vec<serde_json::Value>>> {
    if let Some(err) = response.errors.first() {
        bail!("neo4j error {}: {}", err.code, err.message);
    }
    Ok(response
        .results
        .into_iter()
        .next()
        .map(|r| r.data.into_iter().map(|d| d.row).collect())
        .unwrap_or_default())
}

/// Build a node from a `NODE_QUERY` row, filling gaps the way the graph
/// builder leaves them.
fn node_from_row(service: &str, row: &[serde_json::Value]) -> ServiceNode {
    let text = |i: usize| row.get(i).and_then(|v| v.as_str()).map(str::to_string);
    let attributes = text(6)
        .and_then(|raw| match serde_json::from_str(&raw) {
            Ok(serde_json::Value::Object(map)) => Some(map),
            _ => {
                tracing::debug!(service, "ignoring unparseable attributesJson");
                None
            }
        })
        .unwrap_or_default();
    ServiceNode {
        name: text(0).unwrap_or_else(|| service.to_string()),
        k8s: K8sMetadata {
            namespace: text(1).unwrap_or_else(|| "unknown".to_string()),
            owner_kind: text(2).unwrap_or_else(|| "Unknown".to_string()),
            owner_name: text(3).unwrap_or_else(|| service.to_string()),
            owner_uid: text(4).unwrap_or_else(|| "unknown".to_string()),
        },
        operation: text(5),
        attributes,
    }
}

fn names_from_rows(rows: Vec<Vec<serde_json::Value>>) -> Vec<String> {
    rows.into_iter()
        .filter_map(|row| row.into_iter().next())
        .filter_map(|v| v.as_str().map(str::to_string))
        .collect()
}

/// Neo4j over the HTTP transactional endpoint.
pub struct Neo4jHttpGraph {
    client: reqwest::Client,
    endpoint: String,
    user: String,
    password: String,
}

impl Neo4jHttpGraph {
    pub fn new(config: &GraphSection) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: format!(
                "{}/db/{}/tx/commit",
                config.uri.trim_end_matches('/'),
                config.database
            ),
            user: config.user.clone(),
            password: config.password.clone(),
        }
    }

    async fn query(&self, statement: &str, service: &str) -> Result<Vec<Vec<serde_json::Value>>> {
        let body = serde_json::json!({
            "statements": [{
                "statement": statement,
                "parameters": { "service_name": service },
            }]
        });
        let resp = self
            .client
            .post(&self.endpoint)
            .basic_auth(&self.user, Some(&self.password))
            .json(&body)
            .timeout(HTTP_TIMEOUT)
            .send()
            .await
            .with_context(|| format!("Failed to reach neo4j at {}", self.endpoint))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            bail!("neo4j returned {}: {}", status, text);
        }

        let response: TxResponse = resp
            .json()
            .await
            .context("Failed to parse neo4j transaction response")?;
        rows_from_response(response)
    }
}

#[async_trait]
impl ServiceGraph for Neo4jHttpGraph {
    async fn node(&self, service: &str) -> Result<ServiceNode> {
        let rows = self.query(NODE_QUERY, service).await?;
        match rows.first() {
            Some(row) => Ok(node_from_row(service, row)),
            None => bail!("Service {} not found", service),
        }
    }

    async fn dependencies(&self, service: &str) -> Result<ServiceDependencies> {
        let upstream = names_from_rows(self.query(UPSTREAM_QUERY, service).await?);
        let downstream = names_from_rows(self.query(DOWNSTREAM_QUERY, service).await?);
        Ok(ServiceDependencies {
            upstream,
            downstream,
        })
    }
}

// ── Cluster ──────────────────────────────────────────────────────────

/// kubectl verbs the inspector will run.
const READ_ONLY_VERBS: &[&str] = &["get", "describe"];

/// Options the inspector passes itself; each takes one value.
const VALUE_FLAGS: &[&str] = &["-n", "-l", "-o"];

/// Reject anything but `kubectl get` / `kubectl describe` with plain
/// resource names. Names come from alert labels and graph data, so a value
/// that looks like an option (`--kubeconfig=…`, `--as=…`) is refused.
pub fn validate_read_only(args: &[String]) -> Result<()> {
    let Some((verb, rest)) = args.split_first() else {
        bail!("empty kubectl command");
    };
    if !READ_ONLY_VERBS.contains(&verb.as_str()) {
        bail!(
            "kubectl {} is not permitted; allowed: {}",
            verb,
            READ_ONLY_VERBS.join(", ")
        );
    }

    let mut rest = rest.iter();
    while let Some(arg) = rest.next() {
        if VALUE_FLAGS.contains(&arg.as_str()) {
            match rest.next() {
                Some(value) if !value.is_empty() && !value.starts_with('-') => {}
                _ => bail!("kubectl {} needs a plain value", arg),
            }
        } else if arg.is_empty() || arg.starts_with('-') {
            bail!("kubectl argument '{}' is not permitted", arg);
        }
    }
    Ok(())
}

pub fn kubectl_get(resource: &str, namespace: Option<&str>, selector: Option<&str>) -> Vec<String> {
    let mut args = vec!["get".to_string(), resource.to_string()];
    if let Some(ns) = namespace {
        args.extend(["-n".to_string(), ns.to_string()]);
    }
    if let Some(sel) = selector {
        args.extend(["-l".to_string(), sel.to_string()]);
    }
    args.extend(["-o".to_string(), "wide".to_string()]);
    args
}

pub fn kubectl_describe(resource: &str, name: &str, namespace: Option<&str>) -> Vec<String> {
    let mut args = vec!["describe".to_string(), resource.to_string(), name.to_string()];
    if let Some(ns) = namespace {
        args.extend(["-n".to_string(), ns.to_string()]);
    }
    args
}

#[async_trait]
pub trait ClusterInspector: Send + Sync {
    /// Run a read-only kubectl command and return its stdout.
    async fn run(&self, args: &[String]) -> Result<String>;
}

pub struct KubectlInspector {
    program: String,
    context: String,
}

impl KubectlInspector {
    pub fn new(config: &ClusterSection) -> Self {
        Self {
            program: config.kubectl.clone(),
            context: config.context.clone(),
        }
    }
}

fn stdout_or_error(what: &str, output: Output) -> Result<String> {
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!("{} failed: {}", what, stderr.trim());
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

#[async_trait]
impl ClusterInspector for KubectlInspector {
    async fn run(&self, args: &[String]) -> Result<String> {
        validate_read_only(args)?;
        let mut cmd = Command::new(&self.program);
        if !self.context.is_empty() {
            cmd.args(["--context", &self.context]);
        }
        let output = cmd
            .args(args)
            .output()
            .await
            .with_context(|| format!("Failed to run {}", self.program))?;
        let stdout = stdout_or_error(&format!("kubectl {}", args.join(" ")), output)?;
        Ok(truncate_output(&stdout, MAX_TOOL_OUTPUT))
    }
}

// ── Logs ─────────────────────────────────────────────────────────────

#[async_trait]
pub trait LogQuery: Send + Sync {
    /// Run an OPAL pipeline over the last `minutes` and return its rows.
    async fn query(&self, pipeline: &str, minutes: u32) -> Result<Vec<serde_json::Value>>;
}

/// OPAL pipeline selecting one container's logs.
pub fn container_logs_pipeline(service: &str, namespace: &str, limit: u32) -> String {
    format!(
        "filter namespace = \"{}\"\nfilter container = \"{}\"\nlimit {}",
        namespace, service, limit
    )
}

/// Parse a newline-delimited JSON export body.
pub fn parse_ndjson(body: &str) -> Result<Vec<serde_json::Value>> {
    body.lines()
        .filter(|line| !line.trim().is_empty())
        .enumerate()
        .map(|(i, line)| {
            serde_json::from_str(line).with_context(|| format!("Invalid export row {}", i + 1))
        })
        .collect()
}

/// Observe export query API, authenticated with a bearer token.
pub struct ObserveClient {
    client: reqwest::Client,
    base_url: String,
    dataset: String,
    token: String,
}

impl ObserveClient {
    pub fn new(config: &LogsSection) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            dataset: config.dataset.clone(),
            token: config.token.clone(),
        }
    }
}

#[async_trait]
impl LogQuery for ObserveClient {
    async fn query(&self, pipeline: &str, minutes: u32) -> Result<Vec<serde_json::Value>> {
        if self.token.is_empty() {
            bail!("OBSERVE_API_TOKEN is not set");
        }
        let url = format!("{}/v1/meta/export/query?interval={}m", self.base_url, minutes);
        let body = serde_json::json!({
            "query": {
                "stages": [{
                    "input": [{ "inputName": "Logs", "datasetId": self.dataset }],
                    "stageID": "main",
                    "pipeline": pipeline,
                }]
            }
        });
        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.token)
            .json(&body)
            .timeout(HTTP_TIMEOUT)
            .send()
            .await
            .with_context(|| format!("Failed to reach Observe at {}", self.base_url))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            bail!("Observe returned {}: {}", status, truncate_output(&text, 500));
        }

        let text = resp.text().await.context("Failed to read Observe response")?;
        parse_ndjson(&text)
    }
}

// ── Code ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CodeFindings {
    pub query: String,
    /// `path:line:text` hits.
    pub matches: Vec<String>,
    /// `sha subject` of commits mentioning the query.
    pub commits: Vec<String>,
}

#[async_trait]
pub trait CodeSearch: Send + Sync {
    async fn search(&self, query: &str) -> Result<CodeFindings>;
}

/// Searches a local git checkout with `git grep` and `git log`.
pub struct GitCodeSearch {
    repo: PathBuf,
    max_matches: usize,
}

const MAX_COMMITS: usize = 10;

impl GitCodeSearch {
    pub fn new(config: &CodeSection) -> Self {
        Self {
            repo: config.repo_path.clone(),
            max_matches: 50,
        }
    }
}

#[async_trait]
impl CodeSearch for GitCodeSearch {
    async fn search(&self, query: &str) -> Result<CodeFindings> {
        let grep = Command::new("git")
            .args(["grep", "-n", "-I", "-i", "--fixed-strings", "-e", query])
            .current_dir(&self.repo)
            .output()
            .await
            .context("Failed to run git grep")?;
        // Exit status 1 means no matches.
        let matches = match grep.status.code() {
            Some(0) | Some(1) => String::from_utf8_lossy(&grep.stdout)
                .lines()
                .take(self.max_matches)
                .map(str::to_string)
                .collect(),
            _ => {
                let stderr = String::from_utf8_lossy(&grep.stderr);
                bail!("git grep failed in {}: {}", self.repo.display(), stderr.trim());
            }
        };

        let log = Command::new("git")
            .args(["log", "--oneline", "-i", "--fixed-strings"])
            .arg(format!("-n{}", MAX_COMMITS))
            .arg(format!("--grep={}", query))
            .current_dir(&self.repo)
            .output()
            .await
            .context("Failed to run git log")?;
        let commits = stdout_or_error("git log", log)?
            .lines()
            .map(str::to_string)
            .collect();

        Ok(CodeFindings {
            query: query.to_string(),
            matches,
            commits,
        })
    }
}
