//! Per-session follow-up queue.
//!
//! Triggers that arrive while a turn is running wait here and are drained
//! once the turn ends. The queue deduplicates by exact prompt, enforces a cap
//! with a drop policy, debounces bursts and, in `collect` mode, folds queued
//! prompts bound for the same destination into one turn.

use std::collections::{HashMap, VecDeque};
use std::fmt::Write as _;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use runlane_core::config::QueueConfig;
use runlane_core::{DropPolicy, QueueMode};
use tracing::{debug, info};

/// Header of a collected prompt.
pub const COLLECT_HEADER: &str = "[Queued messages while agent was busy]";
/// Maximum length of a dropped-prompt summary line.
const SUMMARY_LINE_MAX: usize = 160;

/// Effective queue settings for a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueSettings {
    pub mode: QueueMode,
    pub debounce: Duration,
    pub cap: usize,
    pub drop_policy: DropPolicy,
}

impl QueueSettings {
    pub fn from_config(config: &QueueConfig, mode: QueueMode) -> Self {
        Self {
            mode,
            debounce: Duration::from_millis(config.debounce_ms),
            cap: config.cap.max(1),
            drop_policy: config.drop_policy,
        }
    }
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self::from_config(&QueueConfig::default(), QueueMode::Collect)
    }
}

/// One queued trigger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FollowupItem {
    pub prompt: String,
    pub channel: Option<String>,
    pub to: Option<String>,
}

impl FollowupItem {
    pub fn new(prompt: &str) -> Self {
        Self {
            prompt: prompt.to_string(),
            channel: None,
            to: None,
        }
    }

    #[must_use]
    pub fn with_route(mut self, channel: &str, to: &str) -> Self {
        self.channel = Some(channel.to_string());
        self.to = Some(to.to_string());
        self
    }

    fn same_route(&self, other: &Self) -> bool {
        self.channel == other.channel && self.to == other.to
    }
}

/// Result of [`FollowupQueues::enqueue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueResult {
    Queued,
    /// An identical prompt is already queued.
    Duplicate,
    /// The queue is full and the drop policy refuses new items.
    Refused,
}

#[derive(Default)]
struct SessionQueue {
    items: VecDeque<FollowupItem>,
    dropped: usize,
    summaries: Vec<String>,
    last_enqueued: Option<Instant>,
    settings: QueueSettings,
}

/// Follow-up queues for every session. Cloning shares the same queues.
#[derive(Clone, Default)]
pub struct FollowupQueues {
    queues: Arc<Mutex<HashMap<String, SessionQueue>>>,
}

impl FollowupQueues {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, SessionQueue>> {
        self.queues.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue `item` for `session_key` under `settings`.
    pub fn enqueue(
        &self,
        session_key: &str,
        item: FollowupItem,
        settings: QueueSettings,
    ) -> EnqueueResult {
        let mut queues = self.lock();
        let queue = queues.entry(session_key.to_string()).or_default();
        queue.settings = settings;

        if queue.items.iter().any(|queued| queued.prompt == item.prompt) {
            debug!(session_key, "Duplicate follow-up ignored");
            return EnqueueResult::Duplicate;
        }

        let cap = settings.cap.max(1);
        while queue.items.len() >= cap {
            match settings.drop_policy {
                DropPolicy::New => {
                    info!(session_key, cap, "Follow-up queue full, refusing new item");
                    return EnqueueResult::Refused;
                }
                DropPolicy::Old => {
                    queue.items.pop_front();
                    queue.dropped += 1;
                }
                DropPolicy::Summarize => {
                    if let Some(oldest) = queue.items.pop_front() {
                        queue.summaries.push(summary_line(&oldest.prompt));
                    }
                    queue.dropped += 1;
                }
            }
        }

        queue.items.push_back(item);
        queue.last_enqueued = Some(Instant::now());
        EnqueueResult::Queued
    }

    /// Queued items for `session_key`.
    pub fn len(&self, session_key: &str) -> usize {
        self.lock().get(session_key).map_or(0, |q| q.items.len())
    }

    pub fn is_empty(&self, session_key: &str) -> bool {
        self.len(session_key) == 0
    }

    /// Drop everything queued for `session_key`. Returns the item count.
    pub fn clear(&self, session_key: &str) -> usize {
        self.lock()
            .remove(session_key)
            .map_or(0, |q| q.items.len())
    }

    /// Wait out the debounce window, then take the queued batch as the turns
    /// to run, in order.
    pub async fn drain(&self, session_key: &str) -> Vec<FollowupItem> {
        loop {
            let wait = {
                let queues = self.lock();
                let Some(queue) = queues.get(session_key) else {
                    return Vec::new();
                };
                let elapsed = queue.last_enqueued.map_or(Duration::MAX, |t| t.elapsed());
                queue.settings.debounce.saturating_sub(elapsed)
            };
            if wait.is_zero() {
                break;
            }
            tokio::time::sleep(wait).await;
        }
        self.take_batch(session_key)
    }

    /// Take the queued batch without debouncing.
    pub fn take_batch(&self, session_key: &str) -> Vec<FollowupItem> {
        let Some(queue) = self.lock().remove(session_key) else {
            return Vec::new();
        };
        let SessionQueue {
            items,
            dropped,
            summaries,
            settings,
            ..
        } = queue;
        let mut items: Vec<FollowupItem> = items.into_iter().collect();
        if items.is_empty() {
            return items;
        }

        if settings.mode == QueueMode::Collect
            && items.len() > 1
            && items.windows(2).all(|w| w[0].same_route(&w[1]))
        {
            let route = items[0].clone();
            let prompt = collect_prompt(&items);
            items = vec![FollowupItem { prompt, ..route }];
        }

        if !summaries.is_empty() {
            if let Some(first) = items.first_mut() {
                first.prompt = format!("{}\n\n{}", overflow_summary(dropped, &summaries), first.prompt);
            }
        }

        debug!(session_key, turns = items.len(), dropped, "Follow-up batch taken");
        items
    }
}

/// Fold queued prompts into one turn.
pub fn collect_prompt(items: &[FollowupItem]) -> String {
    let mut prompt = String::from(COLLECT_HEADER);
    for (i, item) in items.iter().enumerate() {
        let _ = write!(prompt, "\n\n---\nQueued #{}\n{}", i + 1, item.prompt);
    }
    prompt
}

/// Block announcing prompts dropped by the cap.
pub fn overflow_summary(dropped: usize, lines: &[String]) -> String {
    let plural = if dropped == 1 { "" } else { "s" };
    let mut text = format!("[Queue overflow] Dropped {dropped} message{plural} due to cap.\nSummary:");
    for line in lines {
        let _ = write!(text, "\n- {line}");
    }
    text
}

/// One-line summary of a prompt: whitespace collapsed, elided past 160 chars.
pub fn summary_line(prompt: &str) -> String {
    let collapsed = prompt.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.chars().count() <= SUMMARY_LINE_MAX {
        return collapsed;
    }
    let mut line: String = collapsed.chars().take(SUMMARY_LINE_MAX - 1).collect();
    line.push('…');
    line
}
