//! Session-key lineage helpers.
//!
//! Agent session keys look like `agent:{agent_id}:{rest}`. Sub-agent keys
//! put `subagent:{id}` in `rest`, and each further nesting level appends
//! `:sub:{id}`, so the lineage of a run can be read back from its key.

/// Agent id assumed when a key carries none.
pub const DEFAULT_AGENT_ID: &str = "main";

/// An `agent:{agent_id}:{rest}` key split into its parts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AgentSessionKey<'a> {
    pub agent_id: &'a str,
    pub rest: &'a str,
}

/// Parse an `agent:{id}:{rest}` session key.
pub fn parse_agent_session_key(key: &str) -> Option<AgentSessionKey<'_>> {
    let key = key.trim();
    let tail = key.strip_prefix("agent:")?;
    let (agent_id, rest) = tail.split_once(':')?;
    if agent_id.is_empty() || rest.is_empty() {
        return None;
    }
    Some(AgentSessionKey { agent_id, rest })
}

/// Whether the key names a sub-agent session.
pub fn is_subagent_session_key(key: &str) -> bool {
    let key = key.trim();
    if key.to_ascii_lowercase().starts_with("subagent:") {
        return true;
    }
    parse_agent_session_key(key)
        .is_some_and(|parsed| parsed.rest.to_ascii_lowercase().starts_with("subagent:"))
}

/// Nesting depth encoded in a session key (0 for non sub-agent keys).
pub fn subagent_depth(key: &str) -> u32 {
    if !is_subagent_session_key(key) {
        return 0;
    }
    let nested = key.matches(":sub:").count();
    u32::try_from(nested).map_or(u32::MAX, |n| n.saturating_add(1))
}

/// Agent id owning a session key, `main` when the key has none.
pub fn resolve_agent_id(key: &str) -> &str {
    parse_agent_session_key(key).map_or(DEFAULT_AGENT_ID, |parsed| parsed.agent_id)
}

/// Lane name serializing turns of one session.
pub fn session_lane(key: &str) -> String {
    format!("session:{}", key.trim())
}
