//! Compaction safeguard.
//!
//! - [`CompactionSafeguard`]: builds the summary that replaces old history.
//! - [`Summarizer`]: the external model call.
//! - [`prune_history_for_context_share`]: drops old chunks when new content
//!   crowds the window, then repairs tool pairing.
//! - [`render`]: last exchange, tool failure and file sections.

pub mod chunking;
pub mod estimate;
pub mod prune;
pub mod render;
pub mod repair;
pub mod safeguard;
pub mod summarize;
pub mod types;

pub use estimate::{compute_adaptive_chunk_ratio, estimate_messages_tokens, estimate_tokens};
pub use prune::{PrunedHistory, prune_history_for_context_share};
pub use repair::{RepairReport, repair_tool_use_result_pairing};
pub use safeguard::{CompactionSafeguard, FALLBACK_SUMMARY};
pub use summarize::{SummarizeError, SummarizeRequest, Summarizer};
pub use types::{AgentMessage, CompactionRequest, CompactionResult, ContentBlock, FileOps, StopReason};
