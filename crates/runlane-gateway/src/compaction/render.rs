//! Text sections appended to a compaction summary.

use std::collections::HashSet;
use std::fmt::Write;

use super::types::{AgentMessage, ContentBlock};

const MAX_TOOL_FAILURES: usize = 8;
const MAX_TOOL_FAILURE_CHARS: usize = 240;
const TRUNCATED_MARKER: &str = "\n\n> [truncated]";

/// Messages from the last user message onward, or from the last assistant
/// message when the tail holds no user message.
pub fn extract_last_turn(messages: &[AgentMessage]) -> &[AgentMessage] {
    let start = messages
        .iter()
        .rposition(AgentMessage::is_user)
        .or_else(|| {
            messages
                .iter()
                .rposition(|m| matches!(m, AgentMessage::Assistant { .. }))
        });
    start.map_or(&messages[..0], |i| &messages[i..])
}

fn message_text(message: &AgentMessage) -> String {
    let parts: Vec<&str> = message
        .content()
        .iter()
        .filter_map(|block| match block {
            ContentBlock::Text { text } => Some(text.as_str()),
            ContentBlock::Image { .. } => Some("[image]"),
            ContentBlock::ToolCall { .. } | ContentBlock::Thinking { .. } => None,
        })
        .collect();
    parts.join("\n").trim().to_string()
}

fn quote(label: &str, text: &str) -> String {
    let mut out = format!("> {label}:");
    for (i, line) in text.lines().enumerate() {
        if i == 0 {
            let _ = write!(out, " {line}");
        } else {
            let _ = write!(out, "\n> {line}");
        }
    }
    out
}

/// Quote the last turn as markdown, capped at `max_tokens × 4` characters.
///
/// Tool calls are listed by name. Thinking blocks are skipped.
pub fn serialize_last_turn(messages: &[AgentMessage], max_tokens: usize) -> String {
    let mut parts = Vec::new();
    for message in messages {
        match message {
            AgentMessage::User { .. } => {
                let text = message_text(message);
                if !text.is_empty() {
                    parts.push(quote("User", &text));
                }
            }
            AgentMessage::Assistant { .. } => {
                let text = message_text(message);
                if !text.is_empty() {
                    parts.push(quote("Assistant", &text));
                }
                let names: Vec<&str> = message.tool_calls().into_iter().map(|(_, name)| name).collect();
                if !names.is_empty() {
                    parts.push(quote("Assistant tool calls", &names.join("; ")));
                }
            }
            AgentMessage::ToolResult { .. } => {
                let text = message_text(message);
                if !text.is_empty() {
                    parts.push(quote("Tool result", &text));
                }
            }
        }
    }

    let text = parts.join("\n\n");
    let max_chars = max_tokens.saturating_mul(4);
    if text.chars().count() <= max_chars {
        return text;
    }
    let keep = max_chars.saturating_sub(20);
    let mut cut: String = text.chars().take(keep).collect();
    cut.push_str(TRUNCATED_MARKER);
    cut
}

pub fn format_last_exchange_section(serialized: &str) -> String {
    if serialized.is_empty() {
        return String::new();
    }
    format!("\n\n## Last Exchange (Verbatim)\n\n{serialized}")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolFailure {
    pub tool_call_id: String,
    pub tool_name: String,
    pub summary: String,
    pub meta: Option<String>,
}

fn normalize_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn truncate_failure_text(text: &str) -> String {
    if text.chars().count() <= MAX_TOOL_FAILURE_CHARS {
        return text.to_string();
    }
    let mut cut: String = text.chars().take(MAX_TOOL_FAILURE_CHARS - 3).collect();
    cut.push_str("...");
    cut
}

fn failure_meta(details: Option<&serde_json::Value>) -> Option<String> {
    let details = details?.as_object()?;
    let mut parts = Vec::new();
    if let Some(status) = details.get("status").and_then(serde_json::Value::as_str) {
        parts.push(format!("status={status}"));
    }
    if let Some(code) = details.get("exitCode").and_then(serde_json::Value::as_i64) {
        parts.push(format!("exitCode={code}"));
    }
    (!parts.is_empty()).then(|| parts.join(" "))
}

/// Errored tool results, one per call id, in transcript order.
pub fn collect_tool_failures(messages: &[AgentMessage]) -> Vec<ToolFailure> {
    let mut seen = HashSet::new();
    let mut failures = Vec::new();
    for message in messages {
        let AgentMessage::ToolResult {
            tool_call_id,
            tool_name,
            is_error: true,
            details,
            ..
        } = message
        else {
            continue;
        };
        if tool_call_id.is_empty() || !seen.insert(tool_call_id.clone()) {
            continue;
        }
        let name = if tool_name.trim().is_empty() {
            "tool"
        } else {
            tool_name.as_str()
        };
        let meta = failure_meta(details.as_ref());
        let text = normalize_whitespace(&message_text(message));
        let summary = if !text.is_empty() {
            truncate_failure_text(&text)
        } else if meta.is_some() {
            "failed".to_string()
        } else {
            "failed (no output)".to_string()
        };
        failures.push(ToolFailure {
            tool_call_id: tool_call_id.clone(),
            tool_name: name.to_string(),
            summary,
            meta,
        });
    }
    failures
}

pub fn format_tool_failures_section(failures: &[ToolFailure]) -> String {
    if failures.is_empty() {
        return String::new();
    }
    let mut out = String::from("\n\n## Tool Failures\n");
    for failure in failures.iter().take(MAX_TOOL_FAILURES) {
        match &failure.meta {
            Some(meta) => {
                let _ = write!(out, "\n- {} ({meta}): {}", failure.tool_name, failure.summary);
            }
            None => {
                let _ = write!(out, "\n- {}: {}", failure.tool_name, failure.summary);
            }
        }
    }
    if failures.len() > MAX_TOOL_FAILURES {
        let _ = write!(out, "\n- ...and {} more", failures.len() - MAX_TOOL_FAILURES);
    }
    out
}

pub fn format_file_operations(read_files: &[String], modified_files: &[String]) -> String {
    let mut out = String::new();
    if !read_files.is_empty() {
        let _ = write!(out, "\n\n<read-files>\n{}\n</read-files>", read_files.join("\n"));
    }
    if !modified_files.is_empty() {
        let _ = write!(
            out,
            "\n\n<modified-files>\n{}\n</modified-files>",
            modified_files.join("\n")
        );
    }
    out
}
