//! Registry of live turns, keyed by session id.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::{RwLock, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Handle to one running turn.
#[derive(Clone)]
pub struct RunHandle {
    pub run_id: String,
    pub session_id: String,
    pub lane: String,
    pub started_at: Instant,
    cancel: CancellationToken,
    finished: CancellationToken,
    steer_tx: mpsc::UnboundedSender<String>,
    streaming: Arc<AtomicBool>,
}

impl RunHandle {
    pub(crate) fn new(
        run_id: &str,
        session_id: &str,
        lane: &str,
        cancel: CancellationToken,
        steer_tx: mpsc::UnboundedSender<String>,
        streaming: Arc<AtomicBool>,
    ) -> Self {
        Self {
            run_id: run_id.to_string(),
            session_id: session_id.to_string(),
            lane: lane.to_string(),
            started_at: Instant::now(),
            cancel,
            finished: CancellationToken::new(),
            steer_tx,
            streaming,
        }
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming.load(Ordering::SeqCst)
    }

    pub fn is_aborted(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub(crate) fn finished_token(&self) -> CancellationToken {
        self.finished.clone()
    }
}

/// Live-run state read by the queue policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LiveRun {
    pub active: bool,
    pub streaming: bool,
}

/// Process-wide map of active turns. Cloning shares the same map.
#[derive(Clone, Default)]
pub struct ActiveRuns {
    runs: Arc<RwLock<HashMap<String, RunHandle>>>,
}

impl ActiveRuns {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, handle: RunHandle) {
        debug!(session_id = %handle.session_id, run_id = %handle.run_id, "Run registered");
        self.runs
            .write()
            .await
            .insert(handle.session_id.clone(), handle);
    }

    /// Remove the session's run if it is still `run_id`.
    pub async fn end(&self, session_id: &str, run_id: &str) {
        let mut runs = self.runs.write().await;
        if runs.get(session_id).is_some_and(|h| h.run_id == run_id) {
            if let Some(handle) = runs.remove(session_id) {
                handle.finished.cancel();
            }
            debug!(session_id, run_id, "Run ended");
        }
    }

    pub async fn get(&self, session_id: &str) -> Option<RunHandle> {
        self.runs.read().await.get(session_id).cloned()
    }

    pub async fn is_active(&self, session_id: &str) -> bool {
        self.runs.read().await.contains_key(session_id)
    }

    pub async fn is_streaming(&self, session_id: &str) -> bool {
        self.runs
            .read()
            .await
            .get(session_id)
            .is_some_and(RunHandle::is_streaming)
    }

    pub async fn live(&self, session_id: &str) -> LiveRun {
        self.runs
            .read()
            .await
            .get(session_id)
            .map_or_else(LiveRun::default, |h| LiveRun {
                active: true,
                streaming: h.is_streaming(),
            })
    }

    /// Inject text into the session's streaming run.
    ///
    /// Returns `false` when there is no run, it is not streaming, or it has
    /// already been aborted.
    pub async fn queue_message(&self, session_id: &str, text: &str) -> bool {
        let runs = self.runs.read().await;
        let Some(handle) = runs.get(session_id) else {
            return false;
        };
        if !handle.is_streaming() || handle.is_aborted() {
            return false;
        }
        handle.steer_tx.send(text.to_string()).is_ok()
    }

    /// Fire the abort signal of the session's run.
    pub async fn abort(&self, session_id: &str) -> bool {
        let runs = self.runs.read().await;
        let Some(handle) = runs.get(session_id) else {
            return false;
        };
        debug!(session_id, run_id = %handle.run_id, "Aborting run");
        handle.cancel.cancel();
        true
    }

    /// Wait until the session's current run ends. Returns `true` if no run is
    /// active by the time this returns.
    pub async fn wait_for_end(&self, session_id: &str, timeout: Duration) -> bool {
        let Some(handle) = self.get(session_id).await else {
            return true;
        };
        tokio::time::timeout(timeout, handle.finished.cancelled())
            .await
            .is_ok()
    }

    pub async fn len(&self) -> usize {
        self.runs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.runs.read().await.is_empty()
    }
}
