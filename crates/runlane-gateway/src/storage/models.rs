//! Database models for the run registry.

use serde::{Deserialize, Serialize};

/// Sub-agent run record as stored. Timestamps are unix milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct SubagentRunRow {
    pub run_id: String,
    pub child_session_key: String,
    pub requester_session_key: String,
    pub requester_agent_id: String,
    pub target_agent_id: String,
    pub label: Option<String>,
    pub task: String,
    pub depth: i64,
    pub provider: String,
    pub model: Option<String>,
    pub cleanup: String,
    pub run_timeout_secs: Option<i64>,
    pub created_at: i64,
    pub started_at: Option<i64>,
    pub ended_at: Option<i64>,
    pub outcome_status: Option<String>,
    pub outcome_error: Option<String>,
    /// JSON-encoded verification contract.
    pub verification: Option<String>,
    /// JSON-encoded verification result.
    pub verification_result: Option<String>,
}
