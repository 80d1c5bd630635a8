//! The run executor seam and the turn wrapper that enforces timeouts.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use runlane_core::ThinkLevel;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::active::{ActiveRuns, RunHandle};

/// How long an aborted turn may take to wind down before it is settled.
const ABORT_GRACE: Duration = Duration::from_secs(5);

/// One turn to execute.
#[derive(Debug, Clone)]
pub struct TurnRequest {
    pub run_id: String,
    pub session_id: String,
    pub session_key: String,
    pub prompt: String,
    pub extra_system_prompt: Option<String>,
    pub model: Option<String>,
    pub thinking: Option<ThinkLevel>,
    /// Global lane the turn was admitted on.
    pub lane: String,
    pub timeout: Duration,
}

/// Outcome of a finished turn.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunResult {
    pub output: Option<String>,
    pub aborted: bool,
}

/// Errors from executing a turn.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RunError {
    #[error("Run aborted")]
    Aborted,

    #[error("Run timed out after {after:?}")]
    TimedOut { after: Duration },

    #[error("Executor error: {0}")]
    Executor(String),

    #[error("Lane error: {0}")]
    Lane(#[from] crate::lanes::LaneError),
}

/// Live-run capabilities handed to the executor.
pub struct TurnContext {
    cancel: CancellationToken,
    steer_rx: mpsc::UnboundedReceiver<String>,
    streaming: Arc<AtomicBool>,
}

impl TurnContext {
    /// Abort signal for the turn.
    pub const fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once the turn is aborted or timed out.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await;
    }

    /// Next steering message, if one is waiting.
    pub fn try_next_steer(&mut self) -> Option<String> {
        self.steer_rx.try_recv().ok()
    }

    /// Wait for the next steering message.
    pub async fn next_steer(&mut self) -> Option<String> {
        self.steer_rx.recv().await
    }

    /// Report whether the turn is currently streaming and can accept steering.
    pub fn set_streaming(&self, streaming: bool) {
        self.streaming.store(streaming, Ordering::SeqCst);
    }
}

/// Opaque, abortable turn execution provided by the embedding gateway.
#[async_trait]
pub trait RunExecutor: Send + Sync {
    async fn start_turn(
        &self,
        request: TurnRequest,
        ctx: TurnContext,
    ) -> Result<RunResult, RunError>;
}

/// Execute one turn, registering it as the session's active run.
///
/// `cancel` becomes the turn's abort signal. A token cancelled before the
/// turn starts settles with [`RunError::Aborted`] without reaching the
/// executor. A timeout cancels the turn and settles with
/// [`RunError::TimedOut`]. An external abort settles with whatever the
/// executor returns within a short grace period, [`RunError::Aborted`]
/// otherwise. The run is unregistered on every path.
pub async fn run_turn(
    executor: &dyn RunExecutor,
    active: &ActiveRuns,
    request: TurnRequest,
    cancel: CancellationToken,
) -> Result<RunResult, RunError> {
    run_turn_with_grace(executor, active, request, cancel, ABORT_GRACE).await
}

pub(crate) async fn run_turn_with_grace(
    executor: &dyn RunExecutor,
    active: &ActiveRuns,
    request: TurnRequest,
    cancel: CancellationToken,
    grace: Duration,
) -> Result<RunResult, RunError> {
    if cancel.is_cancelled() {
        debug!(run_id = %request.run_id, "Turn cancelled before it started");
        return Err(RunError::Aborted);
    }
    let (steer_tx, steer_rx) = mpsc::unbounded_channel();
    let streaming = Arc::new(AtomicBool::new(false));

    let handle = RunHandle::new(
        &request.run_id,
        &request.session_id,
        &request.lane,
        cancel.clone(),
        steer_tx,
        Arc::clone(&streaming),
    );
    let finished = handle.finished_token();
    active.register(handle).await;

    let ctx = TurnContext {
        cancel: cancel.clone(),
        steer_rx,
        streaming,
    };
    let run_id = request.run_id.clone();
    let session_id = request.session_id.clone();
    let timeout = request.timeout;

    info!(run_id = %run_id, session_id = %session_id, lane = %request.lane, "Turn started");

    let turn = executor.start_turn(request, ctx);
    tokio::pin!(turn);

    let result = tokio::select! {
        biased;
        result = &mut turn => result,
        () = tokio::time::sleep(timeout) => {
            warn!(run_id = %run_id, ?timeout, "Turn timed out, aborting");
            cancel.cancel();
            let _ = tokio::time::timeout(grace, &mut turn).await;
            Err(RunError::TimedOut { after: timeout })
        }
        () = cancel.cancelled() => {
            debug!(run_id = %run_id, "Turn abort requested");
            tokio::time::timeout(grace, &mut turn)
                .await
                .unwrap_or(Err(RunError::Aborted))
        }
    };

    active.end(&session_id, &run_id).await;
    finished.cancel();

    match &result {
        Ok(r) => info!(run_id = %run_id, aborted = r.aborted, "Turn finished"),
        Err(e) => warn!(run_id = %run_id, error = %e, "Turn failed"),
    }
    result
}
