//! Configuration for the rootcause service.
//!
//! Settings are layered: `rootcause.toml` → environment → CLI flags. Every
//! field has a default, so a missing file is a valid configuration.
//!
//! # Configuration File Format
//!
//! ```toml
//! [server]
//! host = "127.0.0.1"
//! port = 8000
//!
//! [sessions]
//! ttl_secs = 600
//! sweep_interval_secs = 60
//!
//! [pipeline]
//! stage_timeout_secs = 300
//! join_policy = "settle"
//!
//! [graph]
//! uri = "http://localhost:7474"
//! database = "neo4j"
//!
//! [cluster]
//! kubectl = "kubectl"
//!
//! [logs]
//! base_url = "https://example.observeinc.com"
//! dataset = "42492215"
//! window_minutes = 15
//!
//! [code]
//! repo_path = "."
//! max_queries = 3
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

pub const DEFAULT_CONFIG_FILE: &str = "rootcause.toml";

/// What the fan-out join does when one branch fails.
///
/// | Policy     | Sibling branch                    | Pipeline outcome           |
/// |------------|-----------------------------------|----------------------------|
/// | `Settle`   | allowed to run to completion      | error once both settle     |
/// | `FailFast` | cancelled as soon as one fails    | error immediately          |
///
/// Either way, progress already relayed by the surviving branch stays on the
/// wire and its result is reported as partial.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinPolicy {
    #[default]
    Settle,
    FailFast,
}

impl std::fmt::Display for JoinPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JoinPolicy::Settle => write!(f, "settle"),
            JoinPolicy::FailFast => write!(f, "fail_fast"),
        }
    }
}

impl std::str::FromStr for JoinPolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "settle" => Ok(JoinPolicy::Settle),
            "fail_fast" => Ok(JoinPolicy::FailFast),
            _ => anyhow::bail!(
                "Invalid join policy '{}'. Valid values: settle, fail_fast",
                s
            ),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Permissive CORS and bind on all interfaces.
    #[serde(default)]
    pub dev: bool,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8000
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            dev: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionsSection {
    /// Unclaimed sessions older than this are evicted.
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

fn default_ttl_secs() -> u64 {
    600
}

fn default_sweep_interval_secs() -> u64 {
    60
}

impl Default for SessionsSection {
    fn default() -> Self {
        Self {
            ttl_secs: default_ttl_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

impl SessionsSection {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSection {
    /// Upper bound on a single capability invocation.
    #[serde(default = "default_stage_timeout_secs")]
    pub stage_timeout_secs: u64,
    #[serde(default)]
    pub join_policy: JoinPolicy,
}

fn default_stage_timeout_secs() -> u64 {
    300
}

impl Default for PipelineSection {
    fn default() -> Self {
        Self {
            stage_timeout_secs: default_stage_timeout_secs(),
            join_policy: JoinPolicy::default(),
        }
    }
}

/// Neo4j HTTP endpoint holding the service graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphSection {
    #[serde(default = "default_graph_uri")]
    pub uri: String,
    #[serde(default = "default_graph_database")]
    pub database: String,
    #[serde(default = "default_graph_user")]
    pub user: String,
    #[serde(default = "default_graph_password", skip_serializing)]
    pub password: String,
}

fn default_graph_uri() -> String {
    "http://localhost:7474".to_string()
}

fn default_graph_database() -> String {
    "neo4j".to_string()
}

fn default_graph_user() -> String {
    "neo4j".to_string()
}

fn default_graph_password() -> String {
    "password".to_string()
}

impl Default for GraphSection {
    fn default() -> Self {
        Self {
            uri: default_graph_uri(),
            database: default_graph_database(),
            user: default_graph_user(),
            password: default_graph_password(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterSection {
    #[serde(default = "default_kubectl")]
    pub kubectl: String,
    /// kubeconfig context; empty means the current context.
    #[serde(default)]
    pub context: String,
}

fn default_kubectl() -> String {
    "kubectl".to_string()
}

impl Default for ClusterSection {
    fn default() -> Self {
        Self {
            kubectl: default_kubectl(),
            context: String::new(),
        }
    }
}

/// Observe log export API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogsSection {
    #[serde(default = "default_logs_base_url")]
    pub base_url: String,
    #[serde(default = "default_logs_dataset")]
    pub dataset: String,
    #[serde(default, skip_serializing)]
    pub token: String,
    #[serde(default = "default_window_minutes")]
    pub window_minutes: u32,
    #[serde(default = "default_logs_limit")]
    pub limit: u32,
}

fn default_logs_base_url() -> String {
    "https://example.observeinc.com".to_string()
}

fn default_logs_dataset() -> String {
    "42492215".to_string()
}

fn default_window_minutes() -> u32 {
    15
}

fn default_logs_limit() -> u32 {
    800
}

impl Default for LogsSection {
    fn default() -> Self {
        Self {
            base_url: default_logs_base_url(),
            dataset: default_logs_dataset(),
            token: String::new(),
            window_minutes: default_window_minutes(),
            limit: default_logs_limit(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodeSection {
    #[serde(default = "default_repo_path")]
    pub repo_path: PathBuf,
    /// Codebase queries allowed per run.
    #[serde(default = "default_max_queries")]
    pub max_queries: usize,
}

fn default_repo_path() -> PathBuf {
    PathBuf::from(".")
}

fn default_max_queries() -> usize {
    3
}

impl Default for CodeSection {
    fn default() -> Self {
        Self {
            repo_path: default_repo_path(),
            max_queries: default_max_queries(),
        }
    }
}

/// Root of `rootcause.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RcaConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub sessions: SessionsSection,
    #[serde(default)]
    pub pipeline: PipelineSection,
    #[serde(default)]
    pub graph: GraphSection,
    #[serde(default)]
    pub cluster: ClusterSection,
    #[serde(default)]
    pub logs: LogsSection,
    #[serde(default)]
    pub code: CodeSection,
}

impl RcaConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse rootcause.toml")
    }

    /// Load `path` if given, else `rootcause.toml` in the working directory
    /// if present, else defaults. Environment overrides are applied last.
    pub fn resolve(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::load(path)?,
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => {
                Self::load(Path::new(DEFAULT_CONFIG_FILE))?
            }
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Apply environment overrides through `lookup` (injectable for tests).
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup("RCA_HOST") {
            self.server.host = host;
        }
        if let Some(port) = lookup("RCA_PORT") {
            self.server.port = port
                .parse()
                .with_context(|| format!("Invalid RCA_PORT '{}'", port))?;
        }
        if let Some(uri) = lookup("NEO4J_URI") {
            self.graph.uri = uri;
        }
        if let Some(user) = lookup("NEO4J_USER") {
            self.graph.user = user;
        }
        if let Some(password) = lookup("NEO4J_PASSWORD") {
            self.graph.password = password;
        }
        if let Some(url) = lookup("OBSERVE_BASE_URL") {
            self.logs.base_url = url;
        }
        if let Some(token) = lookup("OBSERVE_API_TOKEN") {
            // Tokens are often pasted with surrounding quotes.
            self.logs.token = token.trim_matches('"').to_string();
        }
        if let Some(dataset) = lookup("OBSERVE_DATASET") {
            self.logs.dataset = dataset;
        }
        if let Some(kubectl) = lookup("KUBECTL_CMD") {
            self.cluster.kubectl = kubectl;
        }
        if let Some(repo) = lookup("RCA_CODE_REPO") {
            self.code.repo_path = PathBuf::from(repo);
        }
        Ok(())
    }

    pub fn stage_timeout(&self) -> Duration {
        Duration::from_secs(self.pipeline.stage_timeout_secs)
    }

    /// Render as TOML (secrets are never serialized).
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration")
    }

    /// Validate the configuration and return any problems found.
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();

        if self.server.port == 0 {
            problems.push("server.port must be non-zero".to_string());
        }
        if self.pipeline.stage_timeout_secs == 0 {
            problems.push("pipeline.stage_timeout_secs must be non-zero".to_string());
        }
        if self.sessions.sweep_interval_secs == 0 {
            problems.push("sessions.sweep_interval_secs must be non-zero".to_string());
        }
        if self.code.max_queries == 0 {
            problems.push("code.max_queries must be at least 1".to_string());
        }
        if !self.graph.uri.starts_with("http://") && !self.graph.uri.starts_with("https://") {
            problems.push(format!(
                "graph.uri '{}' must be an http(s) URL for the Neo4j HTTP API",
                self.graph.uri
            ));
        }

        problems
    }
}
