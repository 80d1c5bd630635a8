//! Trigger dispatcher.
//!
//! Resolves directives and the effective queue mode for a trigger, asks the
//! policy what to do with it and applies the answer against the lanes, the
//! active-run registry and the follow-up queue.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use runlane_core::session_key::{resolve_agent_id, session_lane};
use runlane_core::{Config, DropPolicy, QueueMode, ThinkLevel};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::directives::{ParsedDirectives, QueueDirective, ThinkDirective, parse_directives};
use super::followup::{EnqueueResult, FollowupItem, FollowupQueues, QueueSettings};
use super::policy::{Action, RejectReason, RunState, Trigger, decide, resolve_steer_refusal};
use crate::lanes::{LANE_MAIN, LaneScheduler};
use crate::runs::{ActiveRuns, RunError, RunExecutor, RunResult, TurnRequest, run_turn};
use crate::slots::SpawnSlots;

/// A turn scheduled by the dispatcher.
#[derive(Debug)]
pub struct RunTicket {
    pub run_id: String,
    task: JoinHandle<Result<RunResult, RunError>>,
}

impl RunTicket {
    /// Wait for the turn to settle.
    pub async fn wait(self) -> Result<RunResult, RunError> {
        match self.task.await {
            Ok(result) => result,
            Err(e) => Err(RunError::Executor(format!("turn task failed: {e}"))),
        }
    }
}

/// What happened to a trigger.
#[derive(Debug)]
pub enum DispatchOutcome {
    Started(RunTicket),
    Steered,
    Queued,
    Rejected { reason: RejectReason },
    /// The trigger only carried directives.
    Directive { reply: String },
}

#[derive(Debug, Clone, Copy, Default)]
struct QueueOverride {
    mode: Option<QueueMode>,
    debounce: Option<Duration>,
    cap: Option<usize>,
    drop_policy: Option<DropPolicy>,
}

/// A turn handed to the lanes, from scheduling until it settles.
struct PendingTurn {
    run_id: String,
    cancel: CancellationToken,
}

#[derive(Debug, Clone, Copy, Default)]
struct SessionOverrides {
    queue: QueueOverride,
    thinking: Option<ThinkLevel>,
}

/// Routes triggers to turns. Cloning shares all state.
#[derive(Clone)]
pub struct Dispatcher {
    config: Arc<Config>,
    lanes: LaneScheduler,
    active: ActiveRuns,
    slots: SpawnSlots,
    executor: Arc<dyn RunExecutor>,
    followups: FollowupQueues,
    overrides: Arc<Mutex<HashMap<String, SessionOverrides>>>,
    /// Turns scheduled but not yet settled, per session key.
    pending: Arc<Mutex<HashMap<String, Vec<PendingTurn>>>>,
}

impl Dispatcher {
    pub fn new(
        config: Arc<Config>,
        lanes: LaneScheduler,
        active: ActiveRuns,
        slots: SpawnSlots,
        executor: Arc<dyn RunExecutor>,
    ) -> Self {
        Self {
            config,
            lanes,
            active,
            slots,
            executor,
            followups: FollowupQueues::new(),
            overrides: Arc::new(Mutex::new(HashMap::new())),
            pending: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub const fn followups(&self) -> &FollowupQueues {
        &self.followups
    }

    fn overrides(&self) -> MutexGuard<'_, HashMap<String, SessionOverrides>> {
        self.overrides.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn pending(&self) -> MutexGuard<'_, HashMap<String, Vec<PendingTurn>>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Handle one inbound trigger.
    pub async fn handle(&self, mut trigger: Trigger) -> DispatchOutcome {
        let directives = parse_directives(&trigger.body);
        if directives.has_directive() {
            let reply = self.apply_directives(&trigger, &directives).await;
            if directives.is_directive_only() {
                return DispatchOutcome::Directive { reply };
            }
            trigger.body = directives.cleaned;
        }

        let settings = self.queue_settings(&trigger);
        let state = self.run_state(&trigger).await;
        let action = decide(&trigger, state, settings.mode);
        debug!(
            session_key = %trigger.session_key,
            mode = %settings.mode,
            active = state.active,
            streaming = state.streaming,
            queued = state.queued,
            ?action,
            "Trigger decided"
        );
        self.apply(trigger, action, settings).await
    }

    async fn apply(
        &self,
        trigger: Trigger,
        action: Action,
        settings: QueueSettings,
    ) -> DispatchOutcome {
        match action {
            Action::RunNow => self.run_now(trigger, settings),
            Action::Interrupt => {
                let lane = session_lane(&trigger.session_key);
                let cancelled = self.cancel_pending(&trigger.session_key);
                let cleared = self.lanes.clear(&lane);
                let dropped = self.followups.clear(&trigger.session_key);
                let aborted = self.active.abort(&trigger.session_id).await;
                info!(
                    session_key = %trigger.session_key,
                    cancelled,
                    cleared,
                    dropped,
                    aborted,
                    "Interrupting session"
                );
                DispatchOutcome::Started(self.start_run(trigger))
            }
            Action::Steer { fallback } => {
                if self
                    .active
                    .queue_message(&trigger.session_id, &trigger.body)
                    .await
                {
                    return DispatchOutcome::Steered;
                }
                let still_active = self.active.is_active(&trigger.session_id).await;
                info!(
                    session_key = %trigger.session_key,
                    still_active,
                    "Steer refused by live run"
                );
                match resolve_steer_refusal(fallback, still_active) {
                    Action::EnqueueFollowup => self.enqueue_followup(&trigger, settings),
                    Action::Reject { reason } => DispatchOutcome::Rejected { reason },
                    _ => self.run_now(trigger, settings),
                }
            }
            Action::EnqueueFollowup => self.enqueue_followup(&trigger, settings),
            Action::Reject { reason } => DispatchOutcome::Rejected { reason },
        }
    }

    fn run_now(&self, trigger: Trigger, settings: QueueSettings) -> DispatchOutcome {
        // A drain is about to run queued follow-ups; keep their order.
        if !self.followups.is_empty(&trigger.session_key) {
            return self.enqueue_followup(&trigger, settings);
        }
        DispatchOutcome::Started(self.start_run(trigger))
    }

    fn enqueue_followup(&self, trigger: &Trigger, settings: QueueSettings) -> DispatchOutcome {
        let item = FollowupItem {
            prompt: trigger.body.clone(),
            channel: trigger.channel.clone(),
            to: trigger.to.clone(),
        };
        match self.followups.enqueue(&trigger.session_key, item, settings) {
            EnqueueResult::Refused => DispatchOutcome::Rejected {
                reason: RejectReason::QueueFull,
            },
            EnqueueResult::Queued | EnqueueResult::Duplicate => {
                let idle = self
                    .pending()
                    .get(&trigger.session_key)
                    .is_none_or(Vec::is_empty);
                if idle {
                    self.schedule_drain(&trigger.session_key, &trigger.session_id);
                }
                DispatchOutcome::Queued
            }
        }
    }

    /// Queue a turn on the session lane nested in `main`.
    fn start_run(&self, trigger: Trigger) -> RunTicket {
        let run_id = Uuid::new_v4().to_string();
        let request = self.turn_request(&run_id, &trigger);
        let lane = session_lane(&trigger.session_key);

        let cancel = CancellationToken::new();
        self.pending()
            .entry(trigger.session_key.clone())
            .or_default()
            .push(PendingTurn {
                run_id: run_id.clone(),
                cancel: cancel.clone(),
            });

        let executor = Arc::clone(&self.executor);
        let active = self.active.clone();
        let turn = self.lanes.enqueue_nested(&lane, LANE_MAIN, move || async move {
            run_turn(executor.as_ref(), &active, request, cancel).await
        });

        let this = self.clone();
        let turn_id = run_id.clone();
        let task = tokio::spawn(async move {
            let result = turn.await.unwrap_or_else(|e| Err(RunError::from(e)));
            this.finish_turn(&trigger, &turn_id);
            result
        });
        RunTicket { run_id, task }
    }

    /// Cancel every scheduled turn of the session, running or still waiting
    /// for a lane. Returns how many were cancelled.
    fn cancel_pending(&self, session_key: &str) -> usize {
        let pending = self.pending();
        let Some(turns) = pending.get(session_key) else {
            return 0;
        };
        for turn in turns {
            debug!(session_key, run_id = %turn.run_id, "Cancelling scheduled turn");
            turn.cancel.cancel();
        }
        turns.len()
    }

    fn finish_turn(&self, trigger: &Trigger, run_id: &str) {
        let idle = {
            let mut pending = self.pending();
            let turns = pending.entry(trigger.session_key.clone()).or_default();
            turns.retain(|t| t.run_id != run_id);
            let idle = turns.is_empty();
            if idle {
                pending.remove(&trigger.session_key);
            }
            idle
        };
        if idle && !self.followups.is_empty(&trigger.session_key) {
            self.schedule_drain(&trigger.session_key, &trigger.session_id);
        }
    }

    fn schedule_drain(&self, session_key: &str, session_id: &str) {
        let this = self.clone();
        let session_key = session_key.to_string();
        let session_id = session_id.to_string();
        tokio::spawn(async move {
            let batch = this.followups.drain(&session_key).await;
            if !batch.is_empty() {
                debug!(session_key = %session_key, turns = batch.len(), "Draining follow-ups");
            }
            for item in batch {
                let trigger = Trigger {
                    session_key: session_key.clone(),
                    session_id: session_id.clone(),
                    body: item.prompt,
                    channel: item.channel,
                    to: item.to,
                };
                drop(this.start_run(trigger));
            }
        });
    }

    fn turn_request(&self, run_id: &str, trigger: &Trigger) -> TurnRequest {
        let agent_id = resolve_agent_id(&trigger.session_key);
        TurnRequest {
            run_id: run_id.to_string(),
            session_id: trigger.session_id.clone(),
            session_key: trigger.session_key.clone(),
            prompt: trigger.body.clone(),
            extra_system_prompt: None,
            model: self.config.agent_model(agent_id).map(str::to_string),
            thinking: self.thinking_for(&trigger.session_key),
            lane: LANE_MAIN.to_string(),
            timeout: Duration::from_secs(self.config.gateway.run_timeout_secs),
        }
    }

    fn thinking_for(&self, session_key: &str) -> Option<ThinkLevel> {
        let session = self.overrides().get(session_key).and_then(|o| o.thinking);
        session.or_else(|| {
            self.config
                .agent(resolve_agent_id(session_key))
                .and_then(|a| a.thinking.as_deref())
                .and_then(ThinkLevel::normalize)
        })
    }

    /// Settings in effect for the trigger: session override, then the
    /// per-surface mode, then the configured default.
    fn queue_settings(&self, trigger: &Trigger) -> QueueSettings {
        let base = QueueSettings::from_config(
            &self.config.queue,
            self.config.queue_mode_for(trigger.channel.as_deref()),
        );
        let Some(o) = self.overrides().get(&trigger.session_key).map(|o| o.queue) else {
            return base;
        };
        QueueSettings {
            mode: o.mode.unwrap_or(base.mode),
            debounce: o.debounce.unwrap_or(base.debounce),
            cap: o.cap.unwrap_or(base.cap),
            drop_policy: o.drop_policy.unwrap_or(base.drop_policy),
        }
    }

    /// Scheduled turns count as queued until they show up as the live run,
    /// including a turn that holds the session lane while it waits for `main`.
    async fn run_state(&self, trigger: &Trigger) -> RunState {
        let live = self.active.live(&trigger.session_id).await;
        let lane = session_lane(&trigger.session_key);
        let scheduled = self
            .pending()
            .get(&trigger.session_key)
            .map_or(0, Vec::len);
        let waiting = scheduled.saturating_sub(usize::from(live.active));
        RunState {
            active: live.active || self.lanes.queue_size(&lane) > 0,
            streaming: live.streaming,
            queued: waiting + self.followups.len(&trigger.session_key),
        }
    }

    async fn apply_directives(&self, trigger: &Trigger, directives: &ParsedDirectives) -> String {
        let mut lines = Vec::new();
        if let Some(think) = &directives.think {
            lines.push(self.apply_think(&trigger.session_key, think));
        }
        if let Some(queue) = &directives.queue {
            lines.push(self.apply_queue(trigger, queue));
        }
        if directives.status {
            lines.push(self.status(trigger).await);
        }
        lines.join("\n")
    }

    fn apply_think(&self, session_key: &str, think: &ThinkDirective) -> String {
        if let Some(raw) = &think.raw {
            return format!(
                "Unrecognized thinking level \"{raw}\". Valid levels: {}.",
                ThinkLevel::format_levels()
            );
        }
        let Some(level) = think.level else {
            let current = self.thinking_for(session_key).unwrap_or(ThinkLevel::Off);
            return format!("Current thinking level: {current}.");
        };
        self.overrides()
            .entry(session_key.to_string())
            .or_default()
            .thinking = Some(level);
        info!(session_key, %level, "Thinking level set");
        format!("Thinking level set to {level}.")
    }

    fn apply_queue(&self, trigger: &Trigger, queue: &QueueDirective) -> String {
        if queue.has_changes() {
            let mut overrides = self.overrides();
            let entry = overrides.entry(trigger.session_key.clone()).or_default();
            if queue.reset {
                entry.queue = QueueOverride::default();
            }
            entry.queue.mode = queue.mode.or(entry.queue.mode);
            entry.queue.debounce = queue.debounce.or(entry.queue.debounce);
            entry.queue.cap = queue.cap.or(entry.queue.cap);
            entry.queue.drop_policy = queue.drop_policy.or(entry.queue.drop_policy);
        }

        let settings = self.queue_settings(trigger);
        let mut reply = if queue.reset && !queue.sets_values() {
            format!("Queue settings reset: {}.", describe(settings))
        } else if queue.has_changes() {
            info!(session_key = %trigger.session_key, mode = %settings.mode, "Queue settings changed");
            format!("Queue settings updated: {}.", describe(settings))
        } else {
            format!("Queue settings: {}.", describe(settings))
        };
        if !queue.errors.is_empty() {
            warn!(session_key = %trigger.session_key, errors = ?queue.errors, "Invalid queue options ignored");
            let _ = write!(reply, " Ignored invalid options: {}.", queue.errors.join(", "));
        }
        reply
    }

    async fn status(&self, trigger: &Trigger) -> String {
        let lane = session_lane(&trigger.session_key);
        let live = self.active.live(&trigger.session_id).await;
        let children = self.slots.children.usage(&trigger.session_key);
        let thinking = self
            .thinking_for(&trigger.session_key)
            .unwrap_or(ThinkLevel::Off);
        let run = match (live.active, live.streaming) {
            (false, _) => "idle",
            (true, false) => "active",
            (true, true) => "streaming",
        };
        format!(
            "Session {key}\nrun: {run}\nlane: {size} ({queued} queued)\nfollow-ups: {followups}\nchildren: {active}/{max} ({pending} pending)\nqueue: {queue}\nthinking: {thinking}",
            key = trigger.session_key,
            size = self.lanes.queue_size(&lane),
            queued = self.lanes.queued_count(&lane),
            followups = self.followups.len(&trigger.session_key),
            active = children.active,
            max = self.config.subagents.max_children_per_agent,
            pending = children.pending,
            queue = describe(self.queue_settings(trigger)),
        )
    }
}

fn describe(settings: QueueSettings) -> String {
    format!(
        "mode={} debounce={}ms cap={} drop={}",
        settings.mode,
        settings.debounce.as_millis(),
        settings.cap,
        settings.drop_policy.as_str()
    )
}
