//! Dropping the oldest history until it fits a share of the context window.

use super::chunking::{DEFAULT_PARTS, normalize_parts, split_messages_by_token_share};
use super::estimate::{estimate_messages_tokens, tokens_for_ratio};
use super::repair::repair_tool_use_result_pairing;
use super::types::AgentMessage;

#[derive(Debug, Clone, Default)]
pub struct PrunedHistory {
    pub messages: Vec<AgentMessage>,
    /// Dropped messages in their original order.
    pub dropped: Vec<AgentMessage>,
    pub dropped_chunks: usize,
    /// Dropped messages plus the orphaned results removed by repair.
    pub dropped_messages: usize,
    pub dropped_tokens: u64,
    pub kept_tokens: u64,
    pub budget_tokens: u64,
}

/// Drop the oldest of `parts` token-balanced chunks, repairing tool pairing
/// after each drop, until the history fits `floor(window × share)`.
pub fn prune_history_for_context_share(
    messages: Vec<AgentMessage>,
    context_window: u64,
    max_history_share: f64,
    parts: usize,
) -> PrunedHistory {
    let budget_tokens = tokens_for_ratio(context_window, max_history_share);
    let parts = normalize_parts(if parts == 0 { DEFAULT_PARTS } else { parts }, messages.len());
    let mut kept = messages;
    let mut pruned = PrunedHistory {
        budget_tokens,
        ..PrunedHistory::default()
    };

    while !kept.is_empty() && estimate_messages_tokens(&kept) > budget_tokens {
        let chunks = split_messages_by_token_share(&kept, parts);
        if chunks.len() <= 1 {
            break;
        }
        let cut = chunks[0].len();
        let mut rest = kept.split_off(cut);
        std::mem::swap(&mut kept, &mut rest);
        let dropped = rest;

        let report = repair_tool_use_result_pairing(kept);
        pruned.dropped_chunks += 1;
        pruned.dropped_messages += dropped.len() + report.dropped_orphans;
        pruned.dropped_tokens += estimate_messages_tokens(&dropped);
        pruned.dropped.extend(dropped);
        kept = report.messages;
    }

    pruned.kept_tokens = estimate_messages_tokens(&kept);
    pruned.messages = kept;
    pruned
}
