//! Transcript model handed to the compaction safeguard.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    Image {
        mime_type: String,
        #[serde(default)]
        data: String,
    },
    ToolCall {
        id: String,
        name: String,
        #[serde(default)]
        arguments: serde_json::Value,
    },
    Thinking {
        thinking: String,
    },
}

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    Stop,
    Length,
    ToolUse,
    Error,
    Aborted,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum AgentMessage {
    User {
        content: Vec<ContentBlock>,
    },
    Assistant {
        content: Vec<ContentBlock>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stop_reason: Option<StopReason>,
    },
    ToolResult {
        tool_call_id: String,
        tool_name: String,
        content: Vec<ContentBlock>,
        #[serde(default)]
        is_error: bool,
        /// Executor metadata (status, exit code). Never sent to the summarizer.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        details: Option<serde_json::Value>,
    },
}

impl AgentMessage {
    pub fn user(text: impl Into<String>) -> Self {
        Self::User {
            content: vec![ContentBlock::text(text)],
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::Assistant {
            content: vec![ContentBlock::text(text)],
            stop_reason: Some(StopReason::Stop),
        }
    }

    pub fn tool_result(
        tool_call_id: impl Into<String>,
        tool_name: impl Into<String>,
        text: impl Into<String>,
        is_error: bool,
    ) -> Self {
        Self::ToolResult {
            tool_call_id: tool_call_id.into(),
            tool_name: tool_name.into(),
            content: vec![ContentBlock::text(text)],
            is_error,
            details: None,
        }
    }

    pub const fn role(&self) -> &'static str {
        match self {
            Self::User { .. } => "user",
            Self::Assistant { .. } => "assistant",
            Self::ToolResult { .. } => "tool_result",
        }
    }

    pub fn content(&self) -> &[ContentBlock] {
        match self {
            Self::User { content }
            | Self::Assistant { content, .. }
            | Self::ToolResult { content, .. } => content,
        }
    }

    pub const fn is_user(&self) -> bool {
        matches!(self, Self::User { .. })
    }

    /// `(id, name)` of every tool call in an assistant message.
    pub fn tool_calls(&self) -> Vec<(&str, &str)> {
        let Self::Assistant { content, .. } = self else {
            return Vec::new();
        };
        content
            .iter()
            .filter_map(|block| match block {
                ContentBlock::ToolCall { id, name, .. } if !id.is_empty() => {
                    Some((id.as_str(), name.as_str()))
                }
                _ => None,
            })
            .collect()
    }
}

/// Files touched by the compacted part of the session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FileOps {
    pub read: BTreeSet<String>,
    pub edited: BTreeSet<String>,
    pub written: BTreeSet<String>,
}

impl FileOps {
    /// `(read-only files, modified files)`, both sorted.
    pub fn file_lists(&self) -> (Vec<String>, Vec<String>) {
        let modified: BTreeSet<&String> = self.edited.iter().chain(&self.written).collect();
        let read = self
            .read
            .iter()
            .filter(|f| !modified.contains(f))
            .cloned()
            .collect();
        (read, modified.into_iter().cloned().collect())
    }
}

/// One compaction event, as prepared by the executor before truncating history.
#[derive(Debug, Clone, Default)]
pub struct CompactionRequest {
    pub messages_to_summarize: Vec<AgentMessage>,
    /// Head of a turn that is being split; its tail stays in context.
    pub turn_prefix_messages: Vec<AgentMessage>,
    pub is_split_turn: bool,
    pub previous_summary: Option<String>,
    /// Context size before compaction, when the executor knows it.
    pub tokens_before: Option<u64>,
    pub first_kept_entry_id: String,
    pub file_ops: FileOps,
    pub model: Option<String>,
    pub api_key: Option<String>,
    /// Overrides the configured reserve.
    pub reserve_tokens: Option<u64>,
    pub custom_instructions: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CompactionResult {
    pub summary: String,
    pub first_kept_entry_id: String,
    pub tokens_before: Option<u64>,
    pub read_files: Vec<String>,
    pub modified_files: Vec<String>,
    /// Verbatim rendering of the last exchange, when one was appended.
    pub last_turn: Option<String>,
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn messages_deserialize_from_tagged_json() {
        let raw = r#"[
            {"role":"user","content":[{"type":"text","text":"hi"}]},
            {"role":"assistant","content":[{"type":"tool_call","id":"c1","name":"exec","arguments":{"cmd":"ls"}}],"stop_reason":"tool_use"},
            {"role":"tool_result","tool_call_id":"c1","tool_name":"exec","content":[],"is_error":true,"details":{"exitCode":1}}
        ]"#;
        let messages: Vec<AgentMessage> = serde_json::from_str(raw).unwrap();
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[1].tool_calls(), vec![("c1", "exec")]);
        assert_eq!(messages[2].role(), "tool_result");
    }

    #[test]
    fn modified_files_are_not_listed_as_read() {
        let ops = FileOps {
            read: ["b.rs", "a.rs", "c.rs"].map(String::from).into(),
            edited: ["c.rs"].map(String::from).into(),
            written: ["d.rs"].map(String::from).into(),
        };
        let (read, modified) = ops.file_lists();
        assert_eq!(read, vec!["a.rs", "b.rs"]);
        assert_eq!(modified, vec!["c.rs", "d.rs"]);
    }
}
