#![allow(clippy::unwrap_used, clippy::panic)] // Integration tests use unwrap for brevity

//! Compaction safeguard behavior against fake summarizers.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use runlane_core::config::CompactionConfig;
use runlane_gateway::compaction::estimate::{BASE_CHUNK_RATIO, MIN_CHUNK_RATIO};
use runlane_gateway::compaction::{
    AgentMessage, CompactionRequest, CompactionSafeguard, ContentBlock, FALLBACK_SUMMARY, FileOps,
    StopReason, SummarizeError, SummarizeRequest, Summarizer, compute_adaptive_chunk_ratio,
};
use runlane_gateway::lanes::{LANE_COMPACTION, LaneScheduler};

struct Failing {
    calls: AtomicUsize,
}

#[async_trait]
impl Summarizer for Failing {
    async fn summarize(&self, _request: SummarizeRequest<'_>) -> Result<String, SummarizeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(SummarizeError::Failed("provider returned 500".into()))
    }
}

/// Summarizes as `summary(<n messages>)` and records what it was given.
#[derive(Default)]
struct Counting {
    previous: Mutex<Vec<Option<String>>>,
}

#[async_trait]
impl Summarizer for Counting {
    async fn summarize(&self, request: SummarizeRequest<'_>) -> Result<String, SummarizeError> {
        self.previous
            .lock()
            .unwrap()
            .push(request.previous_summary.map(str::to_string));
        Ok(format!("summary({})", request.messages.len()))
    }
}

/// Never answers.
struct Stalled;

#[async_trait]
impl Summarizer for Stalled {
    async fn summarize(&self, request: SummarizeRequest<'_>) -> Result<String, SummarizeError> {
        request.cancel.cancelled().await;
        Err(SummarizeError::Cancelled)
    }
}

fn transcript() -> Vec<AgentMessage> {
    vec![
        AgentMessage::user("deploy the staging branch"),
        AgentMessage::Assistant {
            content: vec![
                ContentBlock::text("Running the deploy script."),
                ContentBlock::ToolCall {
                    id: "call-1".into(),
                    name: "exec".into(),
                    arguments: serde_json::json!({"cmd": "./deploy.sh staging"}),
                },
            ],
            stop_reason: Some(StopReason::ToolUse),
        },
        AgentMessage::ToolResult {
            tool_call_id: "call-1".into(),
            tool_name: "exec".into(),
            content: vec![ContentBlock::text("permission denied")],
            is_error: true,
            details: Some(serde_json::json!({"status": "error", "exitCode": 126})),
        },
    ]
}

fn request() -> CompactionRequest {
    CompactionRequest {
        messages_to_summarize: transcript(),
        first_kept_entry_id: "entry-42".into(),
        tokens_before: Some(10_000),
        file_ops: FileOps {
            read: ["deploy.sh".to_string()].into(),
            written: ["staging.env".to_string()].into(),
            ..FileOps::default()
        },
        model: Some("anthropic/claude".into()),
        api_key: Some("sk-test".into()),
        ..CompactionRequest::default()
    }
}

#[tokio::test]
async fn failing_summarizer_never_fails_compaction() {
    let summarizer = Arc::new(Failing {
        calls: AtomicUsize::new(0),
    });
    let safeguard = CompactionSafeguard::new(CompactionConfig::default(), Arc::clone(&summarizer) as Arc<dyn Summarizer>);
    let result = safeguard.compact(&request(), &CancellationToken::new()).await;

    assert!(!result.summary.trim().is_empty());
    assert!(result.summary.starts_with("Context contained 3 messages (0 oversized)."));
    assert!(result.summary.contains("- exec (status=error exitCode=126): permission denied"));
    assert!(result.summary.contains("<read-files>\ndeploy.sh\n</read-files>"));
    assert!(result.summary.contains("<modified-files>\nstaging.env\n</modified-files>"));
    assert_eq!(result.first_kept_entry_id, "entry-42");
    assert_eq!(result.tokens_before, Some(10_000));
    assert!(summarizer.calls.load(Ordering::SeqCst) >= 2);
}

#[tokio::test]
async fn last_exchange_is_preserved_verbatim() {
    let safeguard = CompactionSafeguard::new(CompactionConfig::default(), Arc::new(Counting::default()));
    let result = safeguard.compact(&request(), &CancellationToken::new()).await;

    assert!(result.summary.starts_with("summary(3)"));
    let last_turn = result.last_turn.unwrap();
    assert!(last_turn.starts_with("> User: deploy the staging branch"));
    assert!(last_turn.contains("> Assistant tool calls: exec"));
    assert!(last_turn.contains("> Tool result: permission denied"));
    assert!(result.summary.contains(&format!("## Last Exchange (Verbatim)\n\n{last_turn}")));
}

#[tokio::test]
async fn last_exchange_can_be_disabled() {
    let config = CompactionConfig {
        last_turn_injection: false,
        ..CompactionConfig::default()
    };
    let safeguard = CompactionSafeguard::new(config, Arc::new(Counting::default()));
    let result = safeguard.compact(&request(), &CancellationToken::new()).await;
    assert!(result.last_turn.is_none());
    assert!(!result.summary.contains("Last Exchange"));
}

#[tokio::test]
async fn previous_summary_seeds_the_history_summary() {
    let summarizer = Arc::new(Counting::default());
    let safeguard = CompactionSafeguard::new(CompactionConfig::default(), Arc::clone(&summarizer) as Arc<dyn Summarizer>);
    let mut req = request();
    req.previous_summary = Some("earlier work".into());
    safeguard.compact(&req, &CancellationToken::new()).await;
    assert_eq!(
        summarizer.previous.lock().unwrap().as_slice(),
        &[Some("earlier work".to_string())]
    );
}

#[tokio::test]
async fn stalled_summarizer_times_out_into_fallback_text() {
    let config = CompactionConfig {
        summarize_timeout_secs: 1,
        ..CompactionConfig::default()
    };
    let safeguard = CompactionSafeguard::new(config, Arc::new(Stalled));
    let result = tokio::time::timeout(
        Duration::from_secs(10),
        safeguard.compact(&request(), &CancellationToken::new()),
    )
    .await
    .unwrap();
    assert!(result.summary.contains("Summary unavailable due to size limits."));
}

#[tokio::test]
async fn compaction_runs_on_its_lane() {
    let safeguard = CompactionSafeguard::new(CompactionConfig::default(), Arc::new(Counting::default()));
    let lanes = LaneScheduler::default();
    let mut req = request();
    req.api_key = None;
    let result = safeguard
        .compact_on_lane(&lanes, req, CancellationToken::new())
        .await;
    assert!(result.summary.starts_with(FALLBACK_SUMMARY));
    assert!(lanes.queue_size(LANE_COMPACTION) <= 1);
}

#[test]
fn adaptive_ratio_stays_in_bounds() {
    let window = 10_000;
    let cases = [
        vec![AgentMessage::user("short"); 20],
        // ~900 tokens each: just past the shrink threshold.
        vec![AgentMessage::user("x".repeat(3_600)); 4],
        vec![AgentMessage::user("x".repeat(40_000)); 2],
    ];
    let ratios: Vec<f64> = cases
        .iter()
        .map(|messages| compute_adaptive_chunk_ratio(messages, window))
        .collect();
    for ratio in &ratios {
        assert!((MIN_CHUNK_RATIO..=BASE_CHUNK_RATIO).contains(ratio), "{ratio}");
    }
    assert!((ratios[0] - BASE_CHUNK_RATIO).abs() < f64::EPSILON);
    assert!(ratios[1] < BASE_CHUNK_RATIO && ratios[1] > MIN_CHUNK_RATIO);
    assert!((ratios[2] - MIN_CHUNK_RATIO).abs() < f64::EPSILON);
}
