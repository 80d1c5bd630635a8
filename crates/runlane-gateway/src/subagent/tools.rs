//! Tool names, groups and allow-list matching.

use std::sync::Arc;

use runlane_core::Config;

/// Named tool groups usable in allow-lists.
const TOOL_GROUPS: &[(&str, &[&str])] = &[
    ("group:fs", &["read", "write", "edit", "apply_patch"]),
    ("group:runtime", &["exec", "process"]),
    (
        "group:sessions",
        &[
            "sessions_list",
            "sessions_history",
            "sessions_send",
            "sessions_spawn",
            "session_status",
        ],
    ),
    ("group:memory", &["memory_search", "memory_get"]),
    ("group:web", &["web_search", "web_fetch"]),
    ("group:ui", &["browser", "canvas"]),
    ("group:automation", &["cron", "gateway"]),
    ("group:messaging", &["message"]),
    ("group:nodes", &["nodes"]),
];

/// Canonical form of a tool name.
pub fn normalize_tool_name(name: &str) -> String {
    let name = name.trim().to_ascii_lowercase();
    match name.as_str() {
        "bash" => "exec".to_string(),
        "apply-patch" => "apply_patch".to_string(),
        _ => name,
    }
}

/// Members of a `group:*` name, if it is one.
pub fn group_members(name: &str) -> Option<&'static [&'static str]> {
    TOOL_GROUPS
        .iter()
        .find(|(group, _)| *group == name)
        .map(|(_, members)| *members)
}

/// Normalize entries and expand groups into their members.
pub fn expand_tool_groups<S: AsRef<str>>(entries: &[S]) -> Vec<String> {
    let mut expanded = Vec::new();
    for entry in entries {
        let name = normalize_tool_name(entry.as_ref());
        if name.is_empty() {
            continue;
        }
        match group_members(&name) {
            Some(members) => expanded.extend(members.iter().map(|m| (*m).to_string())),
            None => expanded.push(name),
        }
    }
    expanded.dedup();
    expanded
}

/// Match a tool name against a pattern with `*` wildcards anywhere.
pub fn matches_tool(pattern: &str, name: &str) -> bool {
    if !pattern.contains('*') {
        return pattern == name;
    }
    let parts: Vec<&str> = pattern.split('*').collect();
    let Some((first, tail)) = parts.split_first() else {
        return false;
    };
    let Some((last, middle)) = tail.split_last() else {
        return false;
    };
    let Some(mut rest) = name.strip_prefix(first) else {
        return false;
    };
    for part in middle {
        match rest.find(part) {
            Some(i) => rest = &rest[i + part.len()..],
            None => return false,
        }
    }
    rest.ends_with(last)
}

/// Allow-list entries that match none of the `available` tools.
///
/// Entries are returned as given (trimmed), in order.
pub fn find_invalid_allow_overrides<S: AsRef<str>, T: AsRef<str>>(
    allow: &[S],
    available: &[T],
) -> Vec<String> {
    let available: Vec<String> = available
        .iter()
        .map(|t| normalize_tool_name(t.as_ref()))
        .collect();
    allow
        .iter()
        .map(|entry| entry.as_ref().trim())
        .filter(|entry| !entry.is_empty())
        .filter(|entry| {
            let patterns = expand_tool_groups(&[*entry]);
            !patterns
                .iter()
                .any(|p| available.iter().any(|tool| matches_tool(p, tool)))
        })
        .map(str::to_string)
        .collect()
}

/// Source of the tool set each agent actually has.
pub trait ToolCatalog: Send + Sync {
    fn tools_for(&self, agent_id: &str) -> Vec<String>;
}

/// Tool catalog backed by `agents.{id}.tools`.
pub struct ConfigToolCatalog {
    config: Arc<Config>,
}

impl ConfigToolCatalog {
    pub const fn new(config: Arc<Config>) -> Self {
        Self { config }
    }
}

impl ToolCatalog for ConfigToolCatalog {
    fn tools_for(&self, agent_id: &str) -> Vec<String> {
        self.config
            .agent(agent_id)
            .map(|a| expand_tool_groups(&a.tools))
            .unwrap_or_default()
    }
}
