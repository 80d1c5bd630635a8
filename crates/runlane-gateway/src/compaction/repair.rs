//! Transcript repair after history was cut.

use std::collections::{HashMap, HashSet};

use super::types::{AgentMessage, StopReason};

pub const SYNTHETIC_RESULT_TEXT: &str =
    "missing tool result in session history; inserted synthetic error result for transcript repair.";

/// Drop executor metadata from tool results.
pub fn strip_tool_result_details(messages: &[AgentMessage]) -> Vec<AgentMessage> {
    messages
        .iter()
        .map(|message| match message {
            AgentMessage::ToolResult {
                tool_call_id,
                tool_name,
                content,
                is_error,
                details: Some(_),
            } => AgentMessage::ToolResult {
                tool_call_id: tool_call_id.clone(),
                tool_name: tool_name.clone(),
                content: content.clone(),
                is_error: *is_error,
                details: None,
            },
            other => other.clone(),
        })
        .collect()
}

#[derive(Debug, Default)]
pub struct RepairReport {
    pub messages: Vec<AgentMessage>,
    /// Synthetic results inserted for calls without one.
    pub added: usize,
    pub dropped_duplicates: usize,
    pub dropped_orphans: usize,
}

impl RepairReport {
    pub const fn changed(&self) -> bool {
        self.added > 0 || self.dropped_duplicates > 0 || self.dropped_orphans > 0
    }
}

fn synthetic_result(tool_call_id: &str, tool_name: &str) -> AgentMessage {
    let name = if tool_name.trim().is_empty() {
        "unknown"
    } else {
        tool_name
    };
    AgentMessage::tool_result(tool_call_id, name, SYNTHETIC_RESULT_TEXT, true)
}

const fn is_failed_turn(message: &AgentMessage) -> bool {
    matches!(
        message,
        AgentMessage::Assistant {
            stop_reason: Some(StopReason::Error | StopReason::Aborted),
            ..
        }
    )
}

/// Make every tool call answered by exactly one result, placed right after it.
///
/// Results without a preceding call are dropped, duplicates are dropped, and
/// calls without a result get a synthetic error result. Errored or aborted
/// assistant turns are kept as they are.
pub fn repair_tool_use_result_pairing(messages: Vec<AgentMessage>) -> RepairReport {
    let mut report = RepairReport::default();
    let mut out = Vec::with_capacity(messages.len());
    let mut seen: HashSet<String> = HashSet::new();
    let mut iter = messages.into_iter().peekable();

    while let Some(message) = iter.next() {
        if matches!(message, AgentMessage::ToolResult { .. }) {
            report.dropped_orphans += 1;
            continue;
        }
        if message.is_user() {
            out.push(message);
            continue;
        }

        let calls: Vec<(String, String)> = message
            .tool_calls()
            .into_iter()
            .map(|(id, name)| (id.to_string(), name.to_string()))
            .collect();
        if is_failed_turn(&message) || calls.is_empty() {
            out.push(message);
            continue;
        }

        let call_ids: HashSet<&str> = calls.iter().map(|(id, _)| id.as_str()).collect();
        let mut results: HashMap<String, AgentMessage> = HashMap::new();
        let mut remainder = Vec::new();
        while let Some(next) = iter.next_if(|m| !matches!(m, AgentMessage::Assistant { .. })) {
            let result_id = match &next {
                AgentMessage::ToolResult { tool_call_id, .. } => Some(tool_call_id.clone()),
                _ => None,
            };
            match result_id {
                Some(id) if call_ids.contains(id.as_str()) => {
                    if seen.contains(&id) || results.contains_key(&id) {
                        report.dropped_duplicates += 1;
                    } else {
                        results.insert(id, next);
                    }
                }
                Some(_) => report.dropped_orphans += 1,
                None => remainder.push(next),
            }
        }

        out.push(message);
        for (id, name) in &calls {
            if !seen.insert(id.clone()) {
                continue;
            }
            match results.remove(id) {
                Some(result) => out.push(result),
                None => {
                    report.added += 1;
                    out.push(synthetic_result(id, name));
                }
            }
        }
        out.extend(remainder);
    }

    report.messages = out;
    report
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    use crate::compaction::types::ContentBlock;

    fn call(id: &str, name: &str) -> AgentMessage {
        AgentMessage::Assistant {
            content: vec![ContentBlock::ToolCall {
                id: id.into(),
                name: name.into(),
                arguments: serde_json::json!({}),
            }],
            stop_reason: Some(StopReason::ToolUse),
        }
    }

    #[test]
    fn orphan_results_are_dropped() {
        let report = repair_tool_use_result_pairing(vec![
            AgentMessage::tool_result("gone", "exec", "out", false),
            AgentMessage::user("next"),
        ]);
        assert_eq!(report.dropped_orphans, 1);
        assert_eq!(report.messages, vec![AgentMessage::user("next")]);
    }

    #[test]
    fn missing_results_are_synthesized() {
        let report = repair_tool_use_result_pairing(vec![call("c1", "read"), AgentMessage::user("hi")]);
        assert_eq!(report.added, 1);
        assert_eq!(report.messages.len(), 3);
        let AgentMessage::ToolResult {
            tool_call_id,
            is_error,
            content,
            ..
        } = &report.messages[1]
        else {
            panic!("expected tool result");
        };
        assert_eq!(tool_call_id, "c1");
        assert!(*is_error);
        assert_eq!(content, &vec![ContentBlock::text(SYNTHETIC_RESULT_TEXT)]);
        assert_eq!(report.messages[2], AgentMessage::user("hi"));
    }

    #[test]
    fn results_move_next_to_their_call_and_duplicates_drop() {
        let report = repair_tool_use_result_pairing(vec![
            call("c1", "exec"),
            AgentMessage::user("interleaved"),
            AgentMessage::tool_result("c1", "exec", "first", false),
            AgentMessage::tool_result("c1", "exec", "second", false),
        ]);
        assert_eq!(report.dropped_duplicates, 1);
        assert_eq!(
            report.messages,
            vec![
                call("c1", "exec"),
                AgentMessage::tool_result("c1", "exec", "first", false),
                AgentMessage::user("interleaved"),
            ]
        );
    }

    #[test]
    fn aborted_turns_are_left_alone() {
        let aborted = AgentMessage::Assistant {
            content: vec![ContentBlock::ToolCall {
                id: "c1".into(),
                name: "exec".into(),
                arguments: serde_json::Value::Null,
            }],
            stop_reason: Some(StopReason::Aborted),
        };
        let report = repair_tool_use_result_pairing(vec![aborted.clone()]);
        assert!(!report.changed());
        assert_eq!(report.messages, vec![aborted]);
    }

    #[test]
    fn strips_details() {
        let with_details = AgentMessage::ToolResult {
            tool_call_id: "c1".into(),
            tool_name: "exec".into(),
            content: Vec::new(),
            is_error: true,
            details: Some(serde_json::json!({"exitCode": 2})),
        };
        let stripped = strip_tool_result_details(&[with_details]);
        assert!(matches!(&stripped[0], AgentMessage::ToolResult { details: None, .. }));
    }
}
