//! Splitting transcripts into summarizer-sized chunks.
//!
//! Chunks are contiguous sub-slices; a message is never split.

use super::estimate::{estimate_messages_tokens, estimate_tokens};
use super::types::AgentMessage;

pub const DEFAULT_PARTS: usize = 2;

/// Clamp `parts` to `1..=message_count`.
pub fn normalize_parts(parts: usize, message_count: usize) -> usize {
    if parts <= 1 {
        return 1;
    }
    parts.min(message_count.max(1))
}

/// Split into at most `parts` chunks of roughly equal token share.
pub fn split_messages_by_token_share(messages: &[AgentMessage], parts: usize) -> Vec<&[AgentMessage]> {
    if messages.is_empty() {
        return Vec::new();
    }
    let parts = normalize_parts(parts, messages.len());
    if parts <= 1 {
        return vec![messages];
    }

    let target = estimate_messages_tokens(messages) / parts as u64;
    let mut chunks = Vec::with_capacity(parts);
    let mut start = 0;
    let mut current_tokens = 0;
    for (i, message) in messages.iter().enumerate() {
        let tokens = estimate_tokens(message);
        if chunks.len() < parts - 1 && i > start && current_tokens + tokens > target {
            chunks.push(&messages[start..i]);
            start = i;
            current_tokens = 0;
        }
        current_tokens += tokens;
    }
    chunks.push(&messages[start..]);
    chunks
}

/// Split into chunks of at most `max_tokens`. A message above the limit
/// becomes a chunk of its own.
pub fn chunk_messages_by_max_tokens(messages: &[AgentMessage], max_tokens: u64) -> Vec<&[AgentMessage]> {
    let mut chunks = Vec::new();
    let mut start = 0;
    let mut current_tokens = 0;
    for (i, message) in messages.iter().enumerate() {
        let tokens = estimate_tokens(message);
        if i > start && current_tokens + tokens > max_tokens {
            chunks.push(&messages[start..i]);
            start = i;
            current_tokens = 0;
        }
        current_tokens += tokens;
        if tokens > max_tokens {
            chunks.push(&messages[start..=i]);
            start = i + 1;
            current_tokens = 0;
        }
    }
    if start < messages.len() {
        chunks.push(&messages[start..]);
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sized(tokens: usize) -> AgentMessage {
        AgentMessage::user("x".repeat(tokens * 4))
    }

    #[test]
    fn parts_are_clamped() {
        assert_eq!(normalize_parts(0, 5), 1);
        assert_eq!(normalize_parts(2, 5), 2);
        assert_eq!(normalize_parts(8, 3), 3);
    }

    #[test]
    fn splits_by_token_share() {
        let messages = vec![sized(10), sized(10), sized(10), sized(10)];
        let chunks = split_messages_by_token_share(&messages, 2);
        assert_eq!(chunks.iter().map(|c| c.len()).collect::<Vec<_>>(), vec![2, 2]);

        let skewed = vec![sized(100), sized(1), sized(1)];
        let chunks = split_messages_by_token_share(&skewed, 2);
        assert_eq!(chunks.iter().map(|c| c.len()).collect::<Vec<_>>(), vec![1, 2]);
    }

    #[test]
    fn oversized_message_gets_its_own_chunk() {
        let messages = vec![sized(5), sized(50), sized(5), sized(5)];
        let chunks = chunk_messages_by_max_tokens(&messages, 10);
        assert_eq!(chunks.iter().map(|c| c.len()).collect::<Vec<_>>(), vec![1, 1, 2]);
        assert!(chunk_messages_by_max_tokens(&[], 10).is_empty());
    }
}
