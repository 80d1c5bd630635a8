//! Compaction safeguard.
//!
//! Produces the summary that replaces compacted history. It always yields a
//! usable summary: when the summarizer cannot be reached, or fails, the
//! result falls back to a fixed note plus the tool failures and file lists.

use std::sync::Arc;
use std::time::Duration;

use runlane_core::config::CompactionConfig;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::chunking::DEFAULT_PARTS;
use super::estimate::{SAFETY_MARGIN, compute_adaptive_chunk_ratio, estimate_messages_tokens, tokens_for_ratio};
use super::prune::prune_history_for_context_share;
use super::render::{
    collect_tool_failures, extract_last_turn, format_file_operations, format_last_exchange_section,
    format_tool_failures_section, serialize_last_turn,
};
use super::summarize::{SummaryParams, Summarizer, summarize_in_stages};
use super::types::{AgentMessage, CompactionRequest, CompactionResult};
use crate::lanes::{LANE_COMPACTION, LaneScheduler};

pub const FALLBACK_SUMMARY: &str =
    "Summary unavailable due to context limits. Older messages were truncated.";
pub const TURN_PREFIX_INSTRUCTIONS: &str = "This summary covers the prefix of a split turn. Focus on the original request, early progress, and any details needed to understand the retained suffix.";

/// Sections that every result carries, summarized or not.
struct Appendix {
    read_files: Vec<String>,
    modified_files: Vec<String>,
    tool_failures: String,
    file_ops: String,
}

impl Appendix {
    fn new(request: &CompactionRequest) -> Self {
        let (read_files, modified_files) = request.file_ops.file_lists();
        let all: Vec<AgentMessage> = request
            .messages_to_summarize
            .iter()
            .chain(&request.turn_prefix_messages)
            .cloned()
            .collect();
        let tool_failures = format_tool_failures_section(&collect_tool_failures(&all));
        let file_ops = format_file_operations(&read_files, &modified_files);
        Self {
            read_files,
            modified_files,
            tool_failures,
            file_ops,
        }
    }

    fn finish(self, request: &CompactionRequest, mut summary: String, last_turn: Option<String>) -> CompactionResult {
        summary.push_str(&self.tool_failures);
        summary.push_str(&self.file_ops);
        CompactionResult {
            summary,
            first_kept_entry_id: request.first_kept_entry_id.clone(),
            tokens_before: request.tokens_before,
            read_files: self.read_files,
            modified_files: self.modified_files,
            last_turn,
        }
    }
}

#[derive(Clone)]
pub struct CompactionSafeguard {
    config: CompactionConfig,
    summarizer: Arc<dyn Summarizer>,
}

impl CompactionSafeguard {
    pub fn new(config: CompactionConfig, summarizer: Arc<dyn Summarizer>) -> Self {
        Self { config, summarizer }
    }

    pub const fn config(&self) -> &CompactionConfig {
        &self.config
    }

    /// The result used when no summary can be produced.
    pub fn fallback(request: &CompactionRequest) -> CompactionResult {
        Appendix::new(request).finish(request, FALLBACK_SUMMARY.to_string(), None)
    }

    /// Summarize `request` on the compaction lane, so summarizer calls from
    /// many sessions share one bound.
    pub async fn compact_on_lane(
        &self,
        lanes: &LaneScheduler,
        request: CompactionRequest,
        cancel: CancellationToken,
    ) -> CompactionResult {
        let safeguard = self.clone();
        let fallback = Self::fallback(&request);
        match lanes
            .enqueue(LANE_COMPACTION, move || async move {
                safeguard.compact(&request, &cancel).await
            })
            .await
        {
            Ok(result) => result,
            Err(e) => {
                warn!(error = %e, "Compaction summarization failed; truncating history");
                fallback
            }
        }
    }

    #[allow(clippy::cast_precision_loss)]
    pub async fn compact(&self, request: &CompactionRequest, cancel: &CancellationToken) -> CompactionResult {
        let appendix = Appendix::new(request);
        let (Some(model), Some(api_key)) = (
            request.model.as_deref().filter(|m| !m.is_empty()),
            request.api_key.as_deref().filter(|k| !k.is_empty()),
        ) else {
            info!("No summarization model or credentials; using fallback summary");
            return appendix.finish(request, FALLBACK_SUMMARY.to_string(), None);
        };

        let window = self.config.context_window_tokens.max(1);
        let share = self.config.max_history_share;
        let reserve_tokens = request.reserve_tokens.unwrap_or(self.config.reserve_tokens).max(1);
        let custom_instructions = request
            .custom_instructions
            .as_deref()
            .or(self.config.custom_instructions.as_deref());
        let base = SummaryParams {
            summarizer: self.summarizer.as_ref(),
            model,
            api_key,
            cancel,
            reserve_tokens,
            max_chunk_tokens: window,
            context_window: window,
            custom_instructions,
            call_timeout: Duration::from_secs(self.config.summarize_timeout_secs.max(1)),
        };

        let prefix = &request.turn_prefix_messages;
        let mut to_summarize = request.messages_to_summarize.clone();
        let mut dropped_summary = None;

        if let Some(tokens_before) = request.tokens_before {
            let summarizable = estimate_messages_tokens(&to_summarize) + estimate_messages_tokens(prefix);
            let new_content = tokens_before.saturating_sub(summarizable);
            let max_history = tokens_for_ratio(window, share * SAFETY_MARGIN);
            if new_content > max_history {
                let pruned = prune_history_for_context_share(to_summarize, window, share, DEFAULT_PARTS);
                if pruned.dropped_chunks > 0 {
                    warn!(
                        new_content_pct = %format!("{:.1}", new_content as f64 / window as f64 * 100.0),
                        dropped_chunks = pruned.dropped_chunks,
                        dropped_messages = pruned.dropped_messages,
                        "New content crowds the context; dropped {} older chunk(s) to fit history budget",
                        pruned.dropped_chunks
                    );
                }
                if !pruned.dropped.is_empty() {
                    let ratio = compute_adaptive_chunk_ratio(&pruned.dropped, window);
                    let params = SummaryParams {
                        max_chunk_tokens: tokens_for_ratio(window, ratio),
                        ..base
                    };
                    dropped_summary = Some(
                        summarize_in_stages(
                            &params,
                            &pruned.dropped,
                            request.previous_summary.as_deref(),
                            DEFAULT_PARTS,
                        )
                        .await,
                    );
                }
                to_summarize = pruned.messages;
            }
        }

        let all: Vec<AgentMessage> = to_summarize.iter().chain(prefix).cloned().collect();
        let ratio = compute_adaptive_chunk_ratio(&all, window);
        let params = SummaryParams {
            max_chunk_tokens: tokens_for_ratio(window, ratio),
            ..base
        };
        let previous = dropped_summary
            .as_deref()
            .or(request.previous_summary.as_deref());
        let mut summary = summarize_in_stages(&params, &to_summarize, previous, DEFAULT_PARTS).await;

        if request.is_split_turn && !prefix.is_empty() {
            let prefix_params = SummaryParams {
                custom_instructions: Some(TURN_PREFIX_INSTRUCTIONS),
                ..params
            };
            let prefix_summary = summarize_in_stages(&prefix_params, prefix, None, DEFAULT_PARTS).await;
            summary = format!("{summary}\n\n---\n\n**Turn Context (split turn):**\n\n{prefix_summary}");
        }

        let mut last_turn = None;
        if self.config.last_turn_injection {
            let turn = extract_last_turn(&all);
            if turn.iter().any(AgentMessage::is_user) {
                let text = serialize_last_turn(turn, self.config.last_turn_max_tokens.max(1));
                summary.push_str(&format_last_exchange_section(&text));
                if !text.is_empty() {
                    last_turn = Some(text);
                }
            }
        }

        appendix.finish(request, summary, last_turn)
    }
}
