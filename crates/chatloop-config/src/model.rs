use serde::{Deserialize, Serialize};
use std::path::PathBuf;

pub const DEFAULT_MAX_ROUNDS: usize = 25;
pub const DEFAULT_SUMMARY_THRESHOLD: usize = 1000;
pub const DEFAULT_TOOL_IDLE_TIMEOUT_SECS: u64 = 120;
pub const DEFAULT_PERSISTENCE_POLL_MS: u64 = 25;
pub const DEFAULT_PERSISTENCE_CACHE_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub provider: ProviderConfig,
    #[serde(default)]
    pub tools: Vec<ToolBackendConfig>,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// OpenAI-compatible chat-completions endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub system_prompt: Option<String>,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            model: default_model(),
            api_key: None,
            max_tokens: None,
            temperature: None,
            system_prompt: None,
        }
    }
}

fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

/// One tool backend. Tool names it reports are exposed as `{namespace}__{name}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolBackendConfig {
    pub namespace: String,
    /// JSON-RPC endpoint answering `tools/list` and `tools/call`.
    pub endpoint: String,
    /// Event-stream endpoint; defaults to `{endpoint}/stream`.
    #[serde(default)]
    pub stream_endpoint: Option<String>,
    #[serde(default = "default_tool_timeout_secs")]
    pub timeout_secs: u64,
}

impl ToolBackendConfig {
    pub fn resolved_stream_endpoint(&self) -> String {
        match &self.stream_endpoint {
            Some(endpoint) => endpoint.clone(),
            None => format!("{}/stream", self.endpoint.trim_end_matches('/')),
        }
    }
}

fn default_tool_timeout_secs() -> u64 {
    60
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_max_rounds")]
    pub max_rounds: usize,
    #[serde(default = "default_summary_threshold")]
    pub summary_threshold: usize,
    #[serde(default = "default_tool_idle_timeout_secs")]
    pub tool_idle_timeout_secs: u64,
    #[serde(default = "default_persistence_poll_ms")]
    pub persistence_poll_ms: u64,
    /// How many completed saves the dedupe guard remembers.
    #[serde(default = "default_persistence_cache_capacity")]
    pub persistence_cache_capacity: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_rounds: DEFAULT_MAX_ROUNDS,
            summary_threshold: DEFAULT_SUMMARY_THRESHOLD,
            tool_idle_timeout_secs: DEFAULT_TOOL_IDLE_TIMEOUT_SECS,
            persistence_poll_ms: DEFAULT_PERSISTENCE_POLL_MS,
            persistence_cache_capacity: DEFAULT_PERSISTENCE_CACHE_CAPACITY,
        }
    }
}

fn default_max_rounds() -> usize {
    DEFAULT_MAX_ROUNDS
}

fn default_summary_threshold() -> usize {
    DEFAULT_SUMMARY_THRESHOLD
}

fn default_tool_idle_timeout_secs() -> u64 {
    DEFAULT_TOOL_IDLE_TIMEOUT_SECS
}

fn default_persistence_poll_ms() -> u64 {
    DEFAULT_PERSISTENCE_POLL_MS
}

fn default_persistence_cache_capacity() -> usize {
    DEFAULT_PERSISTENCE_CACHE_CAPACITY
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite file. An in-memory database is used when unset.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub level: Option<String>,
    #[serde(default)]
    pub json: bool,
}
