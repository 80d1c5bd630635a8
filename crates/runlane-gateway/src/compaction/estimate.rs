//! Token estimates and the adaptive chunk budget.

use super::types::{AgentMessage, ContentBlock};

/// Headroom applied to estimates, which run low on code and non-latin text.
pub const SAFETY_MARGIN: f64 = 1.2;
pub const BASE_CHUNK_RATIO: f64 = 0.4;
pub const MIN_CHUNK_RATIO: f64 = 0.15;
/// Characters an image block is counted as.
pub const IMAGE_CHARS: usize = 4_800;

fn block_chars(block: &ContentBlock) -> usize {
    match block {
        ContentBlock::Text { text } => text.chars().count(),
        ContentBlock::Thinking { thinking } => thinking.chars().count(),
        ContentBlock::Image { .. } => IMAGE_CHARS,
        ContentBlock::ToolCall {
            name, arguments, ..
        } => name.chars().count() + arguments.to_string().chars().count(),
    }
}

/// Estimated tokens of one message: a quarter of its content characters.
pub fn estimate_tokens(message: &AgentMessage) -> u64 {
    let chars: usize = message.content().iter().map(block_chars).sum();
    u64::try_from(chars.div_ceil(4)).unwrap_or(u64::MAX)
}

pub fn estimate_messages_tokens(messages: &[AgentMessage]) -> u64 {
    messages.iter().map(estimate_tokens).sum()
}

/// Share of the context window a single summarizer call may use.
///
/// Starts at [`BASE_CHUNK_RATIO`] and shrinks toward [`MIN_CHUNK_RATIO`] as
/// the average message grows relative to the window.
#[allow(clippy::cast_precision_loss)]
pub fn compute_adaptive_chunk_ratio(messages: &[AgentMessage], context_window: u64) -> f64 {
    if messages.is_empty() || context_window == 0 {
        return BASE_CHUNK_RATIO;
    }
    let average = estimate_messages_tokens(messages) as f64 / messages.len() as f64;
    let avg_ratio = average * SAFETY_MARGIN / context_window as f64;
    if avg_ratio > 0.1 {
        let reduction = (avg_ratio * 2.0).min(BASE_CHUNK_RATIO - MIN_CHUNK_RATIO);
        (BASE_CHUNK_RATIO - reduction).max(MIN_CHUNK_RATIO)
    } else {
        BASE_CHUNK_RATIO
    }
}

/// A message larger than half the window cannot be summarized safely.
#[allow(clippy::cast_precision_loss)]
pub fn is_oversized_for_summary(message: &AgentMessage, context_window: u64) -> bool {
    estimate_tokens(message) as f64 * SAFETY_MARGIN > context_window as f64 * 0.5
}

/// `floor(window × ratio)`, never below 1.
#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss
)]
pub fn tokens_for_ratio(context_window: u64, ratio: f64) -> u64 {
    ((context_window as f64 * ratio).floor() as u64).max(1)
}
