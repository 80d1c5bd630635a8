//! Per-key FIFO lanes.
//!
//! A lane admits at most `concurrency` tasks at a time (1 unless configured)
//! and runs queued tasks in enqueue order. Each task executes in its own
//! Tokio task so a panic is reported to its caller without stalling the lane.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tokio::sync::oneshot;
use tracing::{debug, warn};

/// Default wait after which a queued task logs a warning.
const DEFAULT_WARN_AFTER: Duration = Duration::from_secs(2);

type Job = Box<dyn FnOnce() -> Pin<Box<dyn Future<Output = ()> + Send>> + Send>;

/// Errors surfaced to the caller of [`LaneScheduler::enqueue`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LaneError {
    /// The task was removed by [`LaneScheduler::clear`] before it started.
    #[error("Lane {lane} was cleared before the task started")]
    Cleared { lane: String },

    /// The task panicked. The lane continues with the next task.
    #[error("Task on lane {lane} panicked")]
    TaskPanicked { lane: String },

    /// The runtime dropped the task before it finished.
    #[error("Task on lane {lane} was cancelled by runtime shutdown")]
    Shutdown { lane: String },
}

/// Per-task enqueue options.
#[derive(Debug, Clone, Copy, Default)]
pub struct EnqueueOptions {
    /// Override the scheduler's wait-warning threshold.
    pub warn_after: Option<Duration>,
}

struct QueueEntry {
    job: Job,
    enqueued_at: Instant,
    queued_ahead: usize,
    warn_after: Duration,
}

struct LaneState {
    queue: VecDeque<QueueEntry>,
    active: usize,
    concurrency: usize,
}

impl Default for LaneState {
    fn default() -> Self {
        Self {
            queue: VecDeque::new(),
            active: 0,
            concurrency: 1,
        }
    }
}

struct Inner {
    lanes: Mutex<HashMap<String, LaneState>>,
    warn_after: Duration,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, LaneState>> {
        self.lanes.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Lane-based FIFO scheduler. Cloning shares the same lanes.
#[derive(Clone)]
pub struct LaneScheduler {
    inner: Arc<Inner>,
}

impl Default for LaneScheduler {
    fn default() -> Self {
        Self::new(DEFAULT_WARN_AFTER)
    }
}

impl LaneScheduler {
    pub fn new(warn_after: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                lanes: Mutex::new(HashMap::new()),
                warn_after,
            }),
        }
    }

    /// Set how many tasks a lane may run at once (minimum 1).
    pub fn set_concurrency(&self, lane: &str, concurrency: usize) {
        let concurrency = concurrency.max(1);
        {
            let mut lanes = self.inner.lock();
            lanes.entry(lane.to_string()).or_default().concurrency = concurrency;
        }
        debug!(lane, concurrency, "Lane concurrency set");
        drain(&self.inner, lane);
    }

    /// Queue `task` on `lane`.
    ///
    /// The task is queued before this returns. The returned future resolves
    /// with the task's output once it has run.
    pub fn enqueue<T, F, Fut>(
        &self,
        lane: &str,
        task: F,
    ) -> impl Future<Output = Result<T, LaneError>> + Send + 'static
    where
        T: Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
    {
        self.enqueue_with(lane, EnqueueOptions::default(), task)
    }

    /// Like [`enqueue`](Self::enqueue) with per-task options.
    pub fn enqueue_with<T, F, Fut>(
        &self,
        lane: &str,
        options: EnqueueOptions,
        task: F,
    ) -> impl Future<Output = Result<T, LaneError>> + Send + 'static
    where
        T: Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel::<Result<T, LaneError>>();
        let lane_name = lane.to_string();

        let job_lane = lane_name.clone();
        let job: Job = Box::new(move || -> Pin<Box<dyn Future<Output = ()> + Send>> {
            Box::pin(async move {
                // The closure itself may panic.
                let outcome = match tokio::spawn(async move { task().await }).await {
                    Ok(value) => Ok(value),
                    Err(e) if e.is_panic() => {
                        warn!(lane = %job_lane, "Lane task panicked");
                        Err(LaneError::TaskPanicked { lane: job_lane })
                    }
                    Err(_) => Err(LaneError::Shutdown { lane: job_lane }),
                };
                // The caller may have stopped waiting.
                let _ = tx.send(outcome);
            })
        });

        {
            let mut lanes = self.inner.lock();
            let state = lanes.entry(lane_name.clone()).or_default();
            let queued_ahead = state.queue.len() + state.active;
            state.queue.push_back(QueueEntry {
                job,
                enqueued_at: Instant::now(),
                queued_ahead,
                warn_after: options.warn_after.unwrap_or(self.inner.warn_after),
            });
            debug!(lane = %lane_name, queued_ahead, "Task enqueued");
        }
        drain(&self.inner, &lane_name);

        async move {
            rx.await
                .unwrap_or(Err(LaneError::Cleared { lane: lane_name }))
        }
    }

    /// Queue `task` on `session_lane`, and once it reaches the head there,
    /// on `global_lane`. The task holds both lanes while it runs.
    pub fn enqueue_nested<T, F, Fut>(
        &self,
        session_lane: &str,
        global_lane: &str,
        task: F,
    ) -> impl Future<Output = Result<T, LaneError>> + Send + 'static
    where
        T: Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
    {
        let scheduler = self.clone();
        let global_lane = global_lane.to_string();
        let outer = self.enqueue(session_lane, move || async move {
            scheduler.enqueue(&global_lane, task).await
        });
        async move { outer.await? }
    }

    /// Queued plus running tasks on `lane`.
    pub fn queue_size(&self, lane: &str) -> usize {
        self.inner
            .lock()
            .get(lane)
            .map_or(0, |state| state.queue.len() + state.active)
    }

    /// Queued, not-yet-started tasks on `lane`.
    pub fn queued_count(&self, lane: &str) -> usize {
        self.inner.lock().get(lane).map_or(0, |state| state.queue.len())
    }

    /// Running tasks on `lane`.
    pub fn active_count(&self, lane: &str) -> usize {
        self.inner.lock().get(lane).map_or(0, |state| state.active)
    }

    /// Drop every queued, not-yet-started task on `lane`.
    ///
    /// Running tasks are left alone. Callers of dropped tasks receive
    /// [`LaneError::Cleared`]. Returns the number of dropped tasks.
    pub fn clear(&self, lane: &str) -> usize {
        let dropped: Vec<QueueEntry> = {
            let mut lanes = self.inner.lock();
            lanes
                .get_mut(lane)
                .map(|state| state.queue.drain(..).collect())
                .unwrap_or_default()
        };
        let count = dropped.len();
        if count > 0 {
            debug!(lane, dropped = count, "Lane cleared");
        }
        count
    }
}

/// Start queued tasks while the lane has free capacity.
fn drain(inner: &Arc<Inner>, lane: &str) {
    let mut ready = Vec::new();
    {
        let mut lanes = inner.lock();
        let Some(state) = lanes.get_mut(lane) else {
            return;
        };
        while state.active < state.concurrency {
            let Some(entry) = state.queue.pop_front() else {
                break;
            };
            state.active += 1;
            ready.push(entry);
        }
    }

    for entry in ready {
        let waited = entry.enqueued_at.elapsed();
        if waited >= entry.warn_after {
            warn!(
                lane,
                waited_ms = u64::try_from(waited.as_millis()).unwrap_or(u64::MAX),
                queued_ahead = entry.queued_ahead,
                "Lane wait exceeded"
            );
        }
        let inner = Arc::clone(inner);
        let lane = lane.to_string();
        tokio::spawn(async move {
            (entry.job)().await;
            finish(&inner, &lane);
        });
    }
}

fn finish(inner: &Arc<Inner>, lane: &str) {
    {
        let mut lanes = inner.lock();
        if let Some(state) = lanes.get_mut(lane) {
            state.active = state.active.saturating_sub(1);
        }
    }
    drain(inner, lane);
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn tasks_complete_in_enqueue_order() {
        let lanes = LaneScheduler::default();
        let log = Arc::new(Mutex::new(Vec::new()));

        let mut pending = Vec::new();
        for (i, delay) in [30_u64, 1, 15, 0].into_iter().enumerate() {
            let log = Arc::clone(&log);
            pending.push(lanes.enqueue("session:a", move || async move {
                tokio::time::sleep(Duration::from_millis(delay)).await;
                log.lock().unwrap().push(i);
                i
            }));
        }
        for (i, fut) in pending.into_iter().enumerate() {
            assert_eq!(fut.await.unwrap(), i);
        }
        assert_eq!(*log.lock().unwrap(), vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn one_active_task_per_lane() {
        let lanes = LaneScheduler::default();
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut pending = Vec::new();
        for _ in 0..5 {
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            pending.push(lanes.enqueue("session:a", move || async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                running.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for fut in pending {
            fut.await.unwrap();
        }
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn independent_lanes_run_concurrently() {
        let lanes = LaneScheduler::default();
        let (tx, rx) = oneshot::channel::<()>();

        // Lane A blocks until lane B signals.
        let a = lanes.enqueue("session:a", move || async move { rx.await.is_ok() });
        let b = lanes.enqueue("session:b", move || async move { tx.send(()).is_ok() });

        let (a, b) = tokio::time::timeout(Duration::from_secs(1), async { (a.await, b.await) })
            .await
            .expect("lanes should not block each other");
        assert!(a.unwrap());
        assert!(b.unwrap());
    }

    #[tokio::test]
    async fn clear_drops_queued_but_not_running() {
        let lanes = LaneScheduler::default();
        let (release_tx, release_rx) = oneshot::channel::<()>();

        let running = lanes.enqueue("session:a", move || async move {
            let _ = release_rx.await;
            "first"
        });
        let queued_1 = lanes.enqueue("session:a", || async { "second" });
        let queued_2 = lanes.enqueue("session:a", || async { "third" });
        tokio::task::yield_now().await;

        assert_eq!(lanes.queue_size("session:a"), 3);
        assert_eq!(lanes.clear("session:a"), 2);
        assert_eq!(lanes.queue_size("session:a"), 1);

        release_tx.send(()).unwrap();
        assert_eq!(running.await.unwrap(), "first");
        assert!(matches!(queued_1.await, Err(LaneError::Cleared { .. })));
        assert!(matches!(queued_2.await, Err(LaneError::Cleared { .. })));
        assert_eq!(lanes.queue_size("session:a"), 0);
    }

    #[tokio::test]
    async fn panicking_task_does_not_stall_lane() {
        let lanes = LaneScheduler::default();
        fn explode() -> u32 {
            panic!("boom")
        }
        let bad = lanes.enqueue("session:a", || async { explode() });
        let good = lanes.enqueue("session:a", || async { 7 });

        assert!(matches!(bad.await, Err(LaneError::TaskPanicked { .. })));
        assert_eq!(good.await.unwrap(), 7);
    }

    #[tokio::test]
    async fn panicking_closure_does_not_stall_lane() {
        let lanes = LaneScheduler::default();
        let bad = lanes.enqueue("session:a", || -> std::future::Ready<u32> {
            panic!("closure failed before returning a future")
        });
        let good = lanes.enqueue("session:a", || async { 7 });

        assert!(matches!(bad.await, Err(LaneError::TaskPanicked { .. })));
        let good = tokio::time::timeout(Duration::from_secs(1), good)
            .await
            .expect("lane should keep draining");
        assert_eq!(good.unwrap(), 7);
    }

    #[tokio::test]
    async fn concurrency_above_one_admits_in_parallel() {
        let lanes = LaneScheduler::default();
        lanes.set_concurrency("main", 2);
        let (tx, rx) = oneshot::channel::<()>();

        let a = lanes.enqueue("main", move || async move { rx.await.is_ok() });
        let b = lanes.enqueue("main", move || async move { tx.send(()).is_ok() });
        let (a, b) = tokio::time::timeout(Duration::from_secs(1), async { (a.await, b.await) })
            .await
            .expect("two slots should run both tasks");
        assert!(a.unwrap() && b.unwrap());
    }

    #[tokio::test]
    async fn nested_task_holds_both_lanes() {
        let lanes = LaneScheduler::default();
        let observed = lanes.clone();

        let result = lanes
            .enqueue_nested("session:a", "main", move || async move {
                (
                    observed.active_count("session:a"),
                    observed.active_count("main"),
                )
            })
            .await
            .unwrap();
        assert_eq!(result, (1, 1));
    }

    #[tokio::test]
    async fn nested_tasks_serialize_on_global_lane() {
        let lanes = LaneScheduler::default();
        let log = Arc::new(Mutex::new(Vec::new()));

        let mut pending = Vec::new();
        for (session, delay) in [("session:a", 20_u64), ("session:b", 0)] {
            let log = Arc::clone(&log);
            pending.push(lanes.enqueue_nested(session, "main", move || async move {
                log.lock().unwrap().push(format!("start {session}"));
                tokio::time::sleep(Duration::from_millis(delay)).await;
                log.lock().unwrap().push(format!("end {session}"));
            }));
        }
        for fut in pending {
            fut.await.unwrap();
        }
        let log = log.lock().unwrap().clone();
        assert_eq!(
            log,
            vec![
                "start session:a",
                "end session:a",
                "start session:b",
                "end session:b"
            ]
        );
    }

    #[tokio::test]
    async fn unknown_lane_is_empty() {
        let lanes = LaneScheduler::default();
        assert_eq!(lanes.queue_size("nope"), 0);
        assert_eq!(lanes.clear("nope"), 0);
    }
}
