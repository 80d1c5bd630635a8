//! Configuration resolution for runlane.
//!
//! Implements hierarchical config resolution:
//! 1. Built-in defaults
//! 2. Global config (~/.config/runlane/settings.json)
//! 3. Project config (.runlane/settings.json)
//! 4. Environment variables
//! 5. CLI arguments (highest priority, applied by the binary)
//!
//! Layers are merged as JSON objects before deserializing, so a project file
//! that only sets `queue.mode` keeps every other value from the layers below.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Provider bucket used when a model reference has no provider prefix.
pub const UNKNOWN_PROVIDER: &str = "unknown";

/// Complete runlane configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub subagents: SubagentConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub compaction: CompactionConfig,
    /// Per-agent settings keyed by agent id.
    #[serde(default)]
    pub agents: HashMap<String, AgentConfig>,
}

/// Gateway process configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub database_path: Option<PathBuf>,
    pub log_level: String,
    /// Default timeout for a single turn, in seconds.
    pub run_timeout_secs: u64,
    /// Lane wait after which a queued task logs a warning.
    pub lane_warn_after_ms: u64,
    /// Concurrent turns admitted by the global `main` lane.
    pub main_lane_concurrency: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            database_path: None,
            log_level: "info".to_string(),
            run_timeout_secs: 600,
            lane_warn_after_ms: 2_000,
            main_lane_concurrency: 4,
        }
    }
}

/// Sub-agent spawning limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SubagentConfig {
    pub max_children_per_agent: usize,
    pub max_spawn_depth: u32,
    pub allow_recursive_spawn: bool,
    /// Per-provider concurrent run caps. An `unknown` entry caps runs whose
    /// provider cannot be resolved.
    pub provider_limits: HashMap<String, usize>,
    pub default_provider_limit: usize,
    pub default_cleanup: CleanupPolicy,
    /// Runs older than this are ended by the registry sweeper.
    pub archive_after_minutes: u64,
    /// Concurrent sub-agent turns admitted by the global `subagent` lane.
    pub lane_concurrency: usize,
}

impl Default for SubagentConfig {
    fn default() -> Self {
        Self {
            max_children_per_agent: 5,
            max_spawn_depth: 2,
            allow_recursive_spawn: false,
            provider_limits: HashMap::new(),
            default_provider_limit: 8,
            default_cleanup: CleanupPolicy::Keep,
            archive_after_minutes: 60,
            lane_concurrency: 8,
        }
    }
}

/// Follow-up queue defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub mode: QueueMode,
    pub debounce_ms: u64,
    pub cap: usize,
    pub drop_policy: DropPolicy,
    /// Queue mode overrides keyed by surface (e.g. `discord`, `telegram`).
    pub by_surface: HashMap<String, QueueMode>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            mode: QueueMode::Collect,
            debounce_ms: 1_000,
            cap: 20,
            drop_policy: DropPolicy::Summarize,
            by_surface: HashMap::new(),
        }
    }
}

/// Compaction safeguard budgets.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompactionConfig {
    pub context_window_tokens: u64,
    pub max_history_share: f64,
    pub reserve_tokens: u64,
    pub last_turn_injection: bool,
    pub last_turn_max_tokens: usize,
    pub summarize_timeout_secs: u64,
    pub custom_instructions: Option<String>,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            context_window_tokens: 200_000,
            max_history_share: 0.5,
            reserve_tokens: 16_384,
            last_turn_injection: true,
            last_turn_max_tokens: 4_000,
            summarize_timeout_secs: 120,
            custom_instructions: None,
        }
    }
}

/// Per-agent configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AgentConfig {
    /// Effective model reference, `provider/model`.
    pub model: Option<String>,
    /// One-line summary shown to delegating agents.
    pub description: Option<String>,
    pub thinking: Option<String>,
    /// Tool names available to the agent.
    pub tools: Vec<String>,
    /// Agent ids this agent may spawn sub-agents for (`*` allows any).
    pub allow_agents: Vec<String>,
}

/// How a trigger arriving during a live run is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QueueMode {
    Steer,
    SteerBacklog,
    Followup,
    Collect,
    Interrupt,
}

impl QueueMode {
    /// Parse a user-supplied mode, accepting the common spellings.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "steer" | "queue" | "queued" => Some(Self::Steer),
            "steer-backlog" | "steer_backlog" | "steer+backlog" => Some(Self::SteerBacklog),
            "followup" | "follow-up" | "follow-ups" | "followups" => Some(Self::Followup),
            "collect" | "coalesce" => Some(Self::Collect),
            "interrupt" | "interrupts" | "abort" => Some(Self::Interrupt),
            _ => None,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Steer => "steer",
            Self::SteerBacklog => "steer-backlog",
            Self::Followup => "followup",
            Self::Collect => "collect",
            Self::Interrupt => "interrupt",
        }
    }
}

impl fmt::Display for QueueMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What to do when the follow-up queue is at its cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DropPolicy {
    /// Drop the oldest queued item.
    Old,
    /// Refuse the incoming item.
    New,
    /// Drop the oldest item but keep a one-line summary of it.
    Summarize,
}

impl DropPolicy {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "old" | "oldest" => Some(Self::Old),
            "new" | "newest" => Some(Self::New),
            "summarize" | "summary" => Some(Self::Summarize),
            _ => None,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Old => "old",
            Self::New => "new",
            Self::Summarize => "summarize",
        }
    }
}

/// What happens to a sub-agent session after its run completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CleanupPolicy {
    Delete,
    #[default]
    Keep,
}

impl CleanupPolicy {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Delete => "delete",
            Self::Keep => "keep",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "delete" => Some(Self::Delete),
            "keep" => Some(Self::Keep),
            _ => None,
        }
    }
}

impl Config {
    /// Concurrent-run cap for a provider.
    ///
    /// Falls back to the configured default when the provider has no entry.
    pub fn provider_limit(&self, provider: &str) -> usize {
        self.subagents
            .provider_limits
            .get(provider)
            .copied()
            .unwrap_or(self.subagents.default_provider_limit)
    }

    /// Maximum spawn depth, never below 1.
    pub fn max_spawn_depth(&self) -> u32 {
        self.subagents.max_spawn_depth.max(1)
    }

    /// Queue mode for a surface, falling back to the global default.
    pub fn queue_mode_for(&self, surface: Option<&str>) -> QueueMode {
        surface
            .and_then(|s| self.queue.by_surface.get(&s.to_ascii_lowercase()))
            .copied()
            .unwrap_or(self.queue.mode)
    }

    pub fn agent(&self, agent_id: &str) -> Option<&AgentConfig> {
        self.agents.get(agent_id)
    }

    /// Configured model reference for an agent, if any.
    pub fn agent_model(&self, agent_id: &str) -> Option<&str> {
        self.agent(agent_id).and_then(|a| a.model.as_deref())
    }

    /// Spawn allow-list of an agent.
    pub fn allowed_agents(&self, agent_id: &str) -> &[String] {
        self.agent(agent_id)
            .map(|a| a.allow_agents.as_slice())
            .unwrap_or_default()
    }
}

/// Load configuration with hierarchical resolution.
pub fn load_config(project_dir: Option<&Path>) -> Result<Config> {
    load_config_from(global_config_path().as_deref(), project_dir, |name| {
        std::env::var(name).ok()
    })
}

/// Load configuration from explicit sources.
///
/// `env` looks up an environment variable by name.
pub fn load_config_from(
    global_path: Option<&Path>,
    project_dir: Option<&Path>,
    env: impl Fn(&str) -> Option<String>,
) -> Result<Config> {
    let mut merged = serde_json::to_value(Config::default())?;

    if let Some(path) = global_path {
        if path.exists() {
            merge_json(&mut merged, load_config_file(path)?);
        }
    }

    if let Some(dir) = project_dir {
        let project_path = dir.join(".runlane").join("settings.json");
        if project_path.exists() {
            merge_json(&mut merged, load_config_file(&project_path)?);
        }
    }

    let mut config: Config = serde_json::from_value(merged)
        .map_err(|e| Error::Config(format!("Invalid configuration: {e}")))?;

    apply_env_overrides(&mut config, env);

    Ok(config)
}

/// Get the global config file path.
pub fn global_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("runlane").join("settings.json"))
}

/// Default path of the run-record database.
pub fn database_path() -> Option<PathBuf> {
    dirs::data_dir().map(|p| p.join("runlane").join("runs.db"))
}

fn load_config_file(path: &Path) -> Result<serde_json::Value> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    serde_json::from_str(&content).map_err(|e| {
        Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })
}

/// Recursively overlay `overlay` onto `base`. Objects merge key by key,
/// everything else is replaced.
fn merge_json(base: &mut serde_json::Value, overlay: serde_json::Value) {
    match (base, overlay) {
        (serde_json::Value::Object(base), serde_json::Value::Object(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(existing) => merge_json(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

fn apply_env_overrides(config: &mut Config, env: impl Fn(&str) -> Option<String>) {
    if let Some(n) = env("RUNLANE_MAX_CHILDREN").and_then(|v| v.parse().ok()) {
        config.subagents.max_children_per_agent = n;
    }
    if let Some(n) = env("RUNLANE_MAX_SPAWN_DEPTH").and_then(|v| v.parse().ok()) {
        config.subagents.max_spawn_depth = n;
    }
    if let Some(mode) = env("RUNLANE_QUEUE_MODE").and_then(|v| QueueMode::parse(&v)) {
        config.queue.mode = mode;
    }
    if let Some(n) = env("RUNLANE_CONTEXT_WINDOW").and_then(|v| v.parse().ok()) {
        config.compaction.context_window_tokens = n;
    }
    if let Some(level) = env("RUNLANE_LOG_LEVEL") {
        config.gateway.log_level = level;
    }
}
