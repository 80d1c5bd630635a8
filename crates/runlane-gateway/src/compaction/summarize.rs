//! Summarizer collaborator and the staged summarization chain built on it.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::chunking::{DEFAULT_PARTS, chunk_messages_by_max_tokens, normalize_parts, split_messages_by_token_share};
use super::estimate::{estimate_messages_tokens, estimate_tokens, is_oversized_for_summary};
use super::repair::strip_tool_result_details;
use super::types::AgentMessage;

pub const DEFAULT_SUMMARY_FALLBACK: &str = "No prior history.";
pub const MERGE_SUMMARIES_INSTRUCTIONS: &str = "Merge these partial summaries into a single cohesive summary. Preserve decisions, TODOs, open questions, and any constraints.";
const MIN_MESSAGES_FOR_SPLIT: usize = 4;

/// One call to the summarization model.
#[derive(Debug, Clone, Copy)]
pub struct SummarizeRequest<'a> {
    pub messages: &'a [AgentMessage],
    pub model: &'a str,
    pub reserve_tokens: u64,
    pub api_key: &'a str,
    pub cancel: &'a CancellationToken,
    pub custom_instructions: Option<&'a str>,
    pub previous_summary: Option<&'a str>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SummarizeError {
    #[error("Summarization failed: {0}")]
    Failed(String),

    #[error("Summarization cancelled")]
    Cancelled,

    #[error("Summarization timed out after {after:?}")]
    TimedOut { after: Duration },
}

/// The model call that turns a transcript chunk into a summary.
#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, request: SummarizeRequest<'_>) -> Result<String, SummarizeError>;
}

/// Settings shared by every call of one compaction.
#[derive(Clone, Copy)]
pub struct SummaryParams<'a> {
    pub summarizer: &'a dyn Summarizer,
    pub model: &'a str,
    pub api_key: &'a str,
    pub cancel: &'a CancellationToken,
    pub reserve_tokens: u64,
    pub max_chunk_tokens: u64,
    pub context_window: u64,
    pub custom_instructions: Option<&'a str>,
    /// Bound on each summarizer call.
    pub call_timeout: Duration,
}

impl SummaryParams<'_> {
    async fn call(
        &self,
        messages: &[AgentMessage],
        previous_summary: Option<&str>,
    ) -> Result<String, SummarizeError> {
        if self.cancel.is_cancelled() {
            return Err(SummarizeError::Cancelled);
        }
        let request = SummarizeRequest {
            messages,
            model: self.model,
            reserve_tokens: self.reserve_tokens,
            api_key: self.api_key,
            cancel: self.cancel,
            custom_instructions: self.custom_instructions,
            previous_summary,
        };
        tokio::time::timeout(self.call_timeout, self.summarizer.summarize(request))
            .await
            .unwrap_or(Err(SummarizeError::TimedOut {
                after: self.call_timeout,
            }))
    }
}

/// Feed `messages` through the summarizer in `max_chunk_tokens` chunks,
/// carrying the running summary forward.
pub async fn summarize_chunks(
    params: &SummaryParams<'_>,
    messages: &[AgentMessage],
    previous_summary: Option<&str>,
) -> Result<String, SummarizeError> {
    if messages.is_empty() {
        return Ok(previous_summary
            .unwrap_or(DEFAULT_SUMMARY_FALLBACK)
            .to_string());
    }
    let stripped = strip_tool_result_details(messages);
    let mut summary = previous_summary.map(str::to_string);
    for chunk in chunk_messages_by_max_tokens(&stripped, params.max_chunk_tokens) {
        summary = Some(params.call(chunk, summary.as_deref()).await?);
    }
    Ok(summary.unwrap_or_else(|| DEFAULT_SUMMARY_FALLBACK.to_string()))
}

/// [`summarize_chunks`] that never fails.
///
/// On failure it retries without oversized messages, noting each one it
/// left out. If that fails too, it returns a placeholder with the counts.
pub async fn summarize_with_fallback(
    params: &SummaryParams<'_>,
    messages: &[AgentMessage],
    previous_summary: Option<&str>,
) -> String {
    if messages.is_empty() {
        return previous_summary
            .unwrap_or(DEFAULT_SUMMARY_FALLBACK)
            .to_string();
    }
    match summarize_chunks(params, messages, previous_summary).await {
        Ok(summary) => return summary,
        Err(e) => warn!(error = %e, "Full summarization failed, trying partial"),
    }

    let mut small = Vec::new();
    let mut notes = Vec::new();
    for message in messages {
        if is_oversized_for_summary(message, params.context_window) {
            let thousands = (estimate_tokens(message) + 500) / 1_000;
            notes.push(format!(
                "[Large {} (~{thousands}K tokens) omitted from summary]",
                message.role()
            ));
        } else {
            small.push(message.clone());
        }
    }

    if !small.is_empty() {
        match summarize_chunks(params, &small, previous_summary).await {
            Ok(summary) if notes.is_empty() => return summary,
            Ok(summary) => return format!("{summary}\n\n{}", notes.join("\n")),
            Err(e) => warn!(error = %e, "Partial summarization also failed"),
        }
    }

    format!(
        "Context contained {} messages ({} oversized). Summary unavailable due to size limits.",
        messages.len(),
        notes.len()
    )
}

/// Summarize large histories in parts and merge the partial summaries.
///
/// Small inputs go straight to [`summarize_with_fallback`]. Otherwise each of
/// `parts` token-balanced chunks is summarized on its own and the partials
/// are merged by another staged pass. The merge input has `parts` messages,
/// below the split minimum, so recursion ends there.
pub fn summarize_in_stages<'a>(
    params: &'a SummaryParams<'a>,
    messages: &'a [AgentMessage],
    previous_summary: Option<&'a str>,
    parts: usize,
) -> Pin<Box<dyn Future<Output = String> + Send + 'a>> {
    Box::pin(async move {
        if messages.is_empty() {
            return previous_summary
                .unwrap_or(DEFAULT_SUMMARY_FALLBACK)
                .to_string();
        }
        let parts = normalize_parts(if parts == 0 { DEFAULT_PARTS } else { parts }, messages.len());
        if parts <= 1
            || messages.len() < MIN_MESSAGES_FOR_SPLIT
            || estimate_messages_tokens(messages) <= params.max_chunk_tokens
        {
            return summarize_with_fallback(params, messages, previous_summary).await;
        }

        let splits: Vec<&[AgentMessage]> = split_messages_by_token_share(messages, parts)
            .into_iter()
            .filter(|chunk| !chunk.is_empty())
            .collect();
        if splits.len() <= 1 {
            return summarize_with_fallback(params, messages, previous_summary).await;
        }
        debug!(parts = splits.len(), "Summarizing in stages");

        let mut partials = Vec::with_capacity(splits.len());
        for chunk in splits {
            partials.push(summarize_with_fallback(params, chunk, None).await);
        }

        let merge_instructions = match params.custom_instructions {
            Some(custom) => format!("{MERGE_SUMMARIES_INSTRUCTIONS}\n\nAdditional focus:\n{custom}"),
            None => MERGE_SUMMARIES_INSTRUCTIONS.to_string(),
        };
        let merge_params = SummaryParams {
            custom_instructions: Some(&merge_instructions),
            ..*params
        };
        let summary_messages: Vec<AgentMessage> =
            partials.into_iter().map(AgentMessage::user).collect();
        summarize_in_stages(&merge_params, &summary_messages, previous_summary, parts).await
    })
}
