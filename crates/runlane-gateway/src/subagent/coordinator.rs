//! Sub-agent spawn coordinator.
//!
//! [`SpawnCoordinator::spawn`] runs the whole admission path for a child run:
//! - permission checks (recursion, depth, cross-agent allow-list)
//! - tool override and thinking-level validation
//! - child slot, then provider slot
//! - session patch, registration, dispatch on the `subagent` lane
//!
//! Validation failures never touch a slot. Once slots are held, every exit
//! path hands them back exactly once, either directly or through the
//! registry when the run ends.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use runlane_core::db::unix_timestamp_ms;
use runlane_core::model_ref::resolve_provider;
use runlane_core::session_key::{
    is_subagent_session_key, resolve_agent_id, session_lane, subagent_depth,
};
use runlane_core::{CleanupPolicy, Config, ThinkLevel};
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::patch::{SessionPatch, SessionPatcher, ThinkingPatch};
use super::prompt::{DelegationContext, FleetEntry, build_delegation_prompt};
use super::registry::{RunOutcome, RunRegistry, RunStatus, SubagentRunRecord};
use super::tools::{ToolCatalog, find_invalid_allow_overrides};
use super::verification::{
    OnFailure, VerificationContract, VerificationResult, VerificationStatus, verify_artifacts,
};
use crate::lanes::{LANE_SUBAGENT, LaneScheduler};
use crate::runs::{ActiveRuns, RunError, RunExecutor, TurnRequest, run_turn};
use crate::slots::{SlotDenied, SpawnReservations};

/// A request to spawn a child run.
#[derive(Debug, Clone, Default)]
pub struct SpawnParams {
    pub requester_session_key: String,
    /// Defaults to the agent id in the requester key.
    pub requester_agent_id: Option<String>,
    /// Defaults to the requester's agent.
    pub target_agent_id: Option<String>,
    pub task: String,
    pub label: Option<String>,
    pub model_override: Option<String>,
    pub thinking_override: Option<String>,
    /// Tools the caller wants force-allowed on the child.
    pub tool_allow_overrides: Vec<String>,
    pub cleanup: Option<CleanupPolicy>,
    pub run_timeout_secs: Option<u64>,
    pub verification: Option<VerificationContract>,
    /// Base for relative artifact paths. Defaults to the process directory.
    pub workspace_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockReason {
    ParentLimit,
    ProviderLimit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SpawnErrorReason {
    InvalidToolOverridesAllow,
    InvalidThinkingLevel,
    PatchFailed,
    StoreFailed,
}

/// Result of a spawn attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SpawnOutcome {
    Accepted {
        child_session_key: String,
        run_id: String,
        depth: u32,
        provider: String,
        /// `None` when no model was patched, `Some(false)` when the patch
        /// refused the model and the session kept its default.
        model_applied: Option<bool>,
        warning: Option<String>,
    },
    Blocked {
        reason: BlockReason,
        error: String,
        provider: Option<String>,
        active: usize,
        pending: usize,
        used: usize,
        max_concurrent: usize,
    },
    Forbidden {
        error: String,
    },
    Error {
        reason: SpawnErrorReason,
        error: String,
        child_session_key: Option<String>,
        run_id: Option<String>,
        invalid_allow: Vec<String>,
        available_tools: Vec<String>,
    },
}

impl SpawnOutcome {
    fn forbidden(error: impl Into<String>) -> Self {
        Self::Forbidden {
            error: error.into(),
        }
    }

    fn error(reason: SpawnErrorReason, error: impl Into<String>) -> Self {
        Self::Error {
            reason,
            error: error.into(),
            child_session_key: None,
            run_id: None,
            invalid_allow: Vec::new(),
            available_tools: Vec::new(),
        }
    }

    fn blocked(denied: &SlotDenied) -> Self {
        match denied {
            SlotDenied::ParentLimit { usage, max } => Self::Blocked {
                reason: BlockReason::ParentLimit,
                error: format!(
                    "Cannot spawn: {}/{max} children active. Wait for a child to complete.",
                    usage.total
                ),
                provider: None,
                active: usage.active,
                pending: usage.pending,
                used: usage.total,
                max_concurrent: *max,
            },
            SlotDenied::ProviderLimit {
                provider,
                usage,
                max,
            } => Self::Blocked {
                reason: BlockReason::ProviderLimit,
                error: format!(
                    "Cannot spawn: provider {provider} is at capacity ({}/{max}).",
                    usage.total
                ),
                provider: Some(provider.clone()),
                active: usage.active,
                pending: usage.pending,
                used: usage.total,
                max_concurrent: *max,
            },
        }
    }

    pub const fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted { .. })
    }
}

/// Admission and dispatch of sub-agent runs.
#[derive(Clone)]
pub struct SpawnCoordinator {
    config: Arc<Config>,
    registry: RunRegistry,
    lanes: LaneScheduler,
    active: ActiveRuns,
    executor: Arc<dyn RunExecutor>,
    patcher: Arc<dyn SessionPatcher>,
    tools: Arc<dyn ToolCatalog>,
}

impl SpawnCoordinator {
    pub fn new(
        config: Arc<Config>,
        registry: RunRegistry,
        lanes: LaneScheduler,
        active: ActiveRuns,
        executor: Arc<dyn RunExecutor>,
        patcher: Arc<dyn SessionPatcher>,
        tools: Arc<dyn ToolCatalog>,
    ) -> Self {
        Self {
            config,
            registry,
            lanes,
            active,
            executor,
            patcher,
            tools,
        }
    }

    pub const fn registry(&self) -> &RunRegistry {
        &self.registry
    }

    /// Spawn a child run for `params`.
    #[allow(clippy::too_many_lines)]
    pub async fn spawn(&self, params: SpawnParams) -> SpawnOutcome {
        let requester = params.requester_session_key.trim().to_string();
        let requester_agent = params
            .requester_agent_id
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| resolve_agent_id(&requester))
            .to_string();
        let target_agent = params
            .target_agent_id
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map_or_else(|| requester_agent.clone(), str::to_string);

        let max_depth = self.config.max_spawn_depth();
        let parent_depth = self
            .registry
            .depth_of(&requester)
            .unwrap_or_else(|| subagent_depth(&requester));

        if is_subagent_session_key(&requester) {
            if !self.config.subagents.allow_recursive_spawn {
                return SpawnOutcome::forbidden(
                    "Recursive spawning is not enabled. Set subagents.allow_recursive_spawn: true in config.",
                );
            }
            if parent_depth >= max_depth {
                return SpawnOutcome::forbidden(format!(
                    "Maximum subagent depth ({max_depth}) reached. Cannot spawn deeper."
                ));
            }
        }

        if !target_agent.eq_ignore_ascii_case(&requester_agent) {
            if let Some(denied) = self.cross_agent_denial(&requester_agent, &target_agent) {
                return SpawnOutcome::forbidden(denied);
            }
        }

        if !params.tool_allow_overrides.is_empty() {
            let available = self.tools.tools_for(&target_agent);
            let invalid = find_invalid_allow_overrides(&params.tool_allow_overrides, &available);
            if !invalid.is_empty() {
                let mut available_tools = available;
                available_tools.sort();
                available_tools.dedup();
                return SpawnOutcome::Error {
                    reason: SpawnErrorReason::InvalidToolOverridesAllow,
                    error: format!(
                        "toolOverrides.allow has entries unavailable to target agent \"{target_agent}\": {}",
                        invalid.join(", ")
                    ),
                    child_session_key: None,
                    run_id: None,
                    invalid_allow: invalid,
                    available_tools,
                };
            }
        }

        // The caller's override, else the target agent's configured level.
        let thinking_raw = non_blank(params.thinking_override.as_deref()).or_else(|| {
            non_blank(
                self.config
                    .agent(&target_agent)
                    .and_then(|a| a.thinking.as_deref()),
            )
        });
        let thinking = match thinking_raw {
            Some(raw) => match ThinkLevel::normalize(raw) {
                Some(level) => Some(level),
                None => {
                    warn!(target_agent = %target_agent, level = raw, "Invalid thinking level for spawn");
                    return SpawnOutcome::error(
                        SpawnErrorReason::InvalidThinkingLevel,
                        format!(
                            "Invalid thinking level \"{raw}\". Use one of: {}.",
                            ThinkLevel::format_levels()
                        ),
                    );
                }
            },
            None => None,
        };

        let model = params
            .model_override
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .or_else(|| self.config.agent_model(&target_agent))
            .map(str::to_string);
        let provider = resolve_provider(model.as_deref());
        let max_children = self.config.subagents.max_children_per_agent;

        let mut reservations = match self.registry.slots().reserve(
            &requester,
            max_children,
            &provider,
            self.config.provider_limit(&provider),
        ) {
            Ok(reservations) => reservations,
            Err(denied) => {
                debug!(requester = %requester, ?denied, "Spawn denied a slot");
                return SpawnOutcome::blocked(&denied);
            }
        };

        let run_id = Uuid::new_v4().to_string();
        let child_key = if is_subagent_session_key(&requester) {
            format!("{requester}:sub:{}", Uuid::new_v4())
        } else {
            format!("agent:{target_agent}:subagent:{}", Uuid::new_v4())
        };
        let depth = if parent_depth > 0 {
            parent_depth.saturating_add(1)
        } else {
            1
        };

        let mut warning = None;
        let mut model_applied = None;
        if let Some(model) = model.as_deref() {
            let patch = SessionPatch {
                model: Some(model.to_string()),
                thinking: None,
            };
            match self.patcher.patch(&child_key, patch).await {
                Ok(()) => model_applied = Some(true),
                Err(e) if e.is_recoverable_model_error() => {
                    warn!(child = %child_key, model, error = %e, "Model override refused");
                    warning = Some(e.to_string());
                    model_applied = Some(false);
                }
                Err(e) => {
                    return patch_failed(&mut reservations, &child_key, &run_id, &e.to_string());
                }
            }
        }
        if let Some(level) = thinking {
            let patch = SessionPatch {
                model: None,
                thinking: Some(ThinkingPatch::from_level(level)),
            };
            if let Err(e) = self.patcher.patch(&child_key, patch).await {
                return patch_failed(&mut reservations, &child_key, &run_id, &e.to_string());
            }
        }

        let label = params
            .label
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string);
        let run_timeout_secs = params.run_timeout_secs.filter(|s| *s > 0);
        let record = SubagentRunRecord {
            run_id: run_id.clone(),
            child_session_key: child_key.clone(),
            requester_session_key: requester.clone(),
            requester_agent_id: requester_agent,
            target_agent_id: target_agent.clone(),
            label: label.clone(),
            task: params.task.clone(),
            depth,
            provider: provider.clone(),
            model: model.clone(),
            cleanup: params
                .cleanup
                .unwrap_or(self.config.subagents.default_cleanup),
            run_timeout_secs,
            created_at: unix_timestamp_ms(),
            started_at: None,
            ended_at: None,
            outcome: None,
            verification: params.verification.clone(),
            verification_result: None,
        };

        if let Err(e) = self.registry.register(record, reservations).await {
            return SpawnOutcome::Error {
                reason: SpawnErrorReason::StoreFailed,
                error: format!("Failed to record subagent run: {e}"),
                child_session_key: Some(child_key),
                run_id: Some(run_id),
                invalid_allow: Vec::new(),
                available_tools: Vec::new(),
            };
        }

        let system_prompt = build_delegation_prompt(&self.delegation_context(
            &requester,
            &child_key,
            label,
            &params.task,
            depth,
        ));
        let request = TurnRequest {
            run_id: run_id.clone(),
            session_id: child_key.clone(),
            session_key: child_key.clone(),
            prompt: params.task,
            extra_system_prompt: Some(system_prompt),
            model,
            thinking,
            lane: LANE_SUBAGENT.to_string(),
            timeout: Duration::from_secs(
                run_timeout_secs.unwrap_or(self.config.gateway.run_timeout_secs),
            ),
        };
        self.dispatch(request, params.verification, params.workspace_dir);

        info!(
            run_id = %run_id,
            child = %child_key,
            requester = %requester,
            depth,
            provider = %provider,
            "Subagent spawn accepted"
        );
        SpawnOutcome::Accepted {
            child_session_key: child_key,
            run_id,
            depth,
            provider,
            model_applied,
            warning,
        }
    }

    fn cross_agent_denial(&self, requester_agent: &str, target_agent: &str) -> Option<String> {
        let allowed = self.config.allowed_agents(requester_agent);
        let any = allowed.iter().any(|a| a.trim() == "*");
        if any || allowed.iter().any(|a| a.trim().eq_ignore_ascii_case(target_agent)) {
            return None;
        }
        let listed = if allowed.is_empty() {
            "none".to_string()
        } else {
            allowed
                .iter()
                .map(|a| a.trim())
                .collect::<Vec<_>>()
                .join(", ")
        };
        Some(format!(
            "agentId is not allowed for sessions_spawn (allowed: {listed})"
        ))
    }

    fn delegation_context(
        &self,
        requester: &str,
        child_key: &str,
        label: Option<String>,
        task: &str,
        depth: u32,
    ) -> DelegationContext {
        let max_children = self.config.subagents.max_children_per_agent;
        let max_concurrent = self.config.subagents.lane_concurrency;
        let child_used = self.registry.slots().children.usage(requester).total;
        let global_used = self.lanes.active_count(LANE_SUBAGENT);

        let mut fleet: Vec<FleetEntry> = self
            .config
            .agents
            .iter()
            .map(|(id, agent)| FleetEntry {
                id: id.clone(),
                model: agent.model.clone(),
                description: agent.description.clone(),
            })
            .collect();
        fleet.sort_by(|a, b| a.id.cmp(&b.id));

        DelegationContext {
            requester_session_key: requester.to_string(),
            child_session_key: child_key.to_string(),
            label,
            task: task.to_string(),
            depth,
            max_depth: self.config.max_spawn_depth(),
            recursion_enabled: self.config.subagents.allow_recursive_spawn,
            child_slots_available: max_children.saturating_sub(child_used),
            max_children,
            global_slots_available: max_concurrent.saturating_sub(global_used),
            max_concurrent,
            fleet,
        }
    }

    /// Run the child turn in the background and complete its record.
    fn dispatch(
        &self,
        request: TurnRequest,
        verification: Option<VerificationContract>,
        workspace_dir: Option<PathBuf>,
    ) {
        let run_id = request.run_id.clone();
        let lane = session_lane(&request.session_key);
        let executor = Arc::clone(&self.executor);
        let active = self.active.clone();
        let cancel = self.registry.turn_token(&run_id);
        let turn_cancel = cancel.clone();
        let turn = self
            .lanes
            .enqueue_nested(&lane, LANE_SUBAGENT, move || async move {
                run_turn(executor.as_ref(), &active, request, turn_cancel).await
            });

        let registry = self.registry.clone();
        tokio::spawn(async move {
            let result = turn.await.unwrap_or_else(|e| Err(RunError::from(e)));
            let mut outcome = RunOutcome::from_result(&result);

            // An aborted child has nothing worth verifying.
            let verification_result = match verification.filter(|_| !cancel.is_cancelled()) {
                Some(contract) => {
                    let base = workspace_dir.unwrap_or_else(|| PathBuf::from("."));
                    let checked = verify_artifacts(&contract, &base).await;
                    apply_verification(&mut outcome, &contract, &checked);
                    Some(checked)
                }
                None => None,
            };

            if registry
                .complete(&run_id, outcome, verification_result)
                .await
                .is_none()
            {
                debug!(run_id = %run_id, "Run already completed elsewhere");
            }
        });
    }
}

fn non_blank(raw: Option<&str>) -> Option<&str> {
    raw.map(str::trim).filter(|s| !s.is_empty())
}

fn patch_failed(
    reservations: &mut SpawnReservations,
    child_key: &str,
    run_id: &str,
    error: &str,
) -> SpawnOutcome {
    reservations.release();
    warn!(child = %child_key, run_id, error, "Session patch failed, slots released");
    SpawnOutcome::Error {
        reason: SpawnErrorReason::PatchFailed,
        error: format!("Failed to patch child session: {error}"),
        child_session_key: Some(child_key.to_string()),
        run_id: Some(run_id.to_string()),
        invalid_allow: Vec::new(),
        available_tools: Vec::new(),
    }
}

/// A failed verification turns a successful run into an error when the
/// contract says so. `retry_once` and `escalate` are recorded only.
fn apply_verification(
    outcome: &mut RunOutcome,
    contract: &VerificationContract,
    result: &VerificationResult,
) {
    if result.status != VerificationStatus::Failed || outcome.status != RunStatus::Ok {
        return;
    }
    if contract.on_failure != OnFailure::Fail {
        info!(on_failure = ?contract.on_failure, "Verification failed, recorded for follow-up");
        return;
    }
    let reasons: Vec<String> = result
        .checks
        .iter()
        .filter(|c| !c.passed)
        .map(|c| format!("{}: {}", c.target, c.reason.as_deref().unwrap_or("failed")))
        .collect();
    *outcome = RunOutcome::error(format!("verification failed: {}", reasons.join("; ")));
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    use std::sync::Mutex;

    use async_trait::async_trait;
    use runlane_core::config::AgentConfig;

    use super::super::patch::{NoopPatcher, PatchError};
    use super::super::tools::ConfigToolCatalog;
    use super::super::verification::VerificationArtifact;
    use crate::runs::{RunResult, TurnContext};
    use crate::slots::SpawnSlots;
    use crate::storage::{MemoryRunStore, RunStore};

    struct Echo {
        seen: Mutex<Vec<TurnRequest>>,
    }

    #[async_trait]
    impl RunExecutor for Echo {
        async fn start_turn(
            &self,
            request: TurnRequest,
            _ctx: TurnContext,
        ) -> Result<RunResult, RunError> {
            let output = request.prompt.clone();
            self.seen.lock().unwrap().push(request);
            Ok(RunResult {
                output: Some(output),
                aborted: false,
            })
        }
    }

    struct Recording {
        patches: Mutex<Vec<(String, SessionPatch)>>,
        fail_with: Option<&'static str>,
    }

    #[async_trait]
    impl SessionPatcher for Recording {
        async fn patch(&self, session_key: &str, patch: SessionPatch) -> Result<(), PatchError> {
            self.patches
                .lock()
                .unwrap()
                .push((session_key.to_string(), patch));
            match self.fail_with {
                Some(msg) => Err(PatchError(msg.to_string())),
                None => Ok(()),
            }
        }
    }

    fn config() -> Config {
        let mut config = Config::default();
        config.agents.insert(
            "main".into(),
            AgentConfig {
                model: Some("anthropic/claude".into()),
                tools: vec!["group:fs".into(), "exec".into()],
                allow_agents: vec!["ops".into()],
                ..AgentConfig::default()
            },
        );
        config.agents.insert(
            "ops".into(),
            AgentConfig {
                model: Some("openai/gpt-5".into()),
                description: Some("Runs deployments".into()),
                ..AgentConfig::default()
            },
        );
        config
    }

    fn coordinator_with(
        config: Config,
        patcher: Arc<dyn SessionPatcher>,
    ) -> (SpawnCoordinator, Arc<Echo>) {
        let config = Arc::new(config);
        let executor = Arc::new(Echo {
            seen: Mutex::new(Vec::new()),
        });
        let store = Arc::new(MemoryRunStore::new()) as Arc<dyn RunStore>;
        let registry = RunRegistry::new(SpawnSlots::new(), store);
        let coordinator = SpawnCoordinator::new(
            Arc::clone(&config),
            registry,
            LaneScheduler::new(Duration::from_secs(2)),
            ActiveRuns::new(),
            Arc::clone(&executor) as Arc<dyn RunExecutor>,
            patcher,
            Arc::new(ConfigToolCatalog::new(config)),
        );
        (coordinator, executor)
    }

    fn coordinator() -> (SpawnCoordinator, Arc<Echo>) {
        coordinator_with(config(), Arc::new(NoopPatcher))
    }

    fn params(task: &str) -> SpawnParams {
        SpawnParams {
            requester_session_key: "agent:main:main".into(),
            task: task.into(),
            ..SpawnParams::default()
        }
    }

    async fn wait_finished(coordinator: &SpawnCoordinator, run_id: &str) -> SubagentRunRecord {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Some(record) = coordinator.registry().get(run_id) {
                    if record.is_finished() {
                        return record;
                    }
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn accepted_spawn_runs_with_delegation_prompt() {
        let (coordinator, executor) = coordinator();
        let outcome = coordinator
            .spawn(SpawnParams {
                label: Some("docs".into()),
                ..params("Find the docs")
            })
            .await;
        let SpawnOutcome::Accepted {
            child_session_key,
            run_id,
            depth,
            provider,
            ..
        } = outcome
        else {
            panic!("expected accepted, got {outcome:?}");
        };
        assert!(child_session_key.starts_with("agent:main:subagent:"));
        assert_eq!(depth, 1);
        assert_eq!(provider, "anthropic");

        let record = wait_finished(&coordinator, &run_id).await;
        assert_eq!(record.outcome.map(|o| o.status), Some(RunStatus::Ok));

        let seen = executor.seen.lock().unwrap();
        let prompt = seen[0].extra_system_prompt.as_deref().unwrap();
        assert!(prompt.contains("You are a subagent spawned by agent:main:main"));
        assert!(prompt.contains("- Label: docs"));
        assert!(prompt.contains("| ops | openai/gpt-5 | Runs deployments |"));
        assert_eq!(seen[0].lane, LANE_SUBAGENT);
        drop(seen);

        let usage = coordinator.registry().slots().children.usage("agent:main:main");
        assert_eq!(usage.total, 0);
    }

    #[tokio::test]
    async fn subagent_requester_needs_recursion_enabled() {
        let (coordinator, _) = coordinator();
        let outcome = coordinator
            .spawn(SpawnParams {
                requester_session_key: "agent:main:subagent:abc".into(),
                ..params("nested")
            })
            .await;
        assert_eq!(
            outcome,
            SpawnOutcome::forbidden(
                "Recursive spawning is not enabled. Set subagents.allow_recursive_spawn: true in config."
            )
        );
    }

    #[tokio::test]
    async fn cross_agent_spawn_respects_allow_list() {
        let (coordinator, _) = coordinator();
        let ok = coordinator
            .spawn(SpawnParams {
                target_agent_id: Some("ops".into()),
                ..params("deploy")
            })
            .await;
        assert!(ok.is_accepted());

        let denied = coordinator
            .spawn(SpawnParams {
                target_agent_id: Some("billing".into()),
                ..params("refund")
            })
            .await;
        assert_eq!(
            denied,
            SpawnOutcome::forbidden("agentId is not allowed for sessions_spawn (allowed: ops)")
        );

        let from_ops = coordinator
            .spawn(SpawnParams {
                requester_session_key: "agent:ops:main".into(),
                target_agent_id: Some("main".into()),
                ..params("back")
            })
            .await;
        assert_eq!(
            from_ops,
            SpawnOutcome::forbidden("agentId is not allowed for sessions_spawn (allowed: none)")
        );
    }

    #[tokio::test]
    async fn invalid_tool_overrides_list_available_tools() {
        let (coordinator, _) = coordinator();
        let outcome = coordinator
            .spawn(SpawnParams {
                tool_allow_overrides: vec!["read".into(), "browser".into()],
                ..params("x")
            })
            .await;
        let SpawnOutcome::Error {
            reason,
            error,
            invalid_allow,
            available_tools,
            ..
        } = outcome
        else {
            panic!("expected error");
        };
        assert_eq!(reason, SpawnErrorReason::InvalidToolOverridesAllow);
        assert_eq!(invalid_allow, vec!["browser"]);
        assert_eq!(
            available_tools,
            vec!["apply_patch", "edit", "exec", "read", "write"]
        );
        assert!(error.contains("target agent \"main\": browser"));
        assert_eq!(coordinator.registry().slots().children.usage("agent:main:main").total, 0);
    }

    #[tokio::test]
    async fn invalid_thinking_touches_no_slots() {
        let (coordinator, _) = coordinator();
        let outcome = coordinator
            .spawn(SpawnParams {
                thinking_override: Some("galaxy-brain".into()),
                ..params("x")
            })
            .await;
        assert_eq!(
            outcome,
            SpawnOutcome::error(
                SpawnErrorReason::InvalidThinkingLevel,
                "Invalid thinking level \"galaxy-brain\". Use one of: off, minimal, low, medium, high, xhigh."
            )
        );
        assert!(coordinator.registry().slots().children.keys().is_empty());
    }

    #[tokio::test]
    async fn invalid_configured_thinking_is_an_error() {
        let mut cfg = config();
        if let Some(ops) = cfg.agents.get_mut("ops") {
            ops.thinking = Some("turbo".into());
        }
        let (coordinator, executor) = coordinator_with(cfg, Arc::new(NoopPatcher));
        let outcome = coordinator
            .spawn(SpawnParams {
                target_agent_id: Some("ops".into()),
                ..params("x")
            })
            .await;
        let SpawnOutcome::Error { reason, error, .. } = &outcome else {
            panic!("expected error, got {outcome:?}");
        };
        assert_eq!(*reason, SpawnErrorReason::InvalidThinkingLevel);
        assert!(error.starts_with("Invalid thinking level \"turbo\"."), "{error}");
        assert!(coordinator.registry().slots().children.keys().is_empty());
        assert!(executor.seen.lock().unwrap().is_empty());

        // A valid override wins over the broken default.
        let outcome = coordinator
            .spawn(SpawnParams {
                target_agent_id: Some("ops".into()),
                thinking_override: Some("low".into()),
                ..params("y")
            })
            .await;
        assert!(outcome.is_accepted(), "{outcome:?}");
    }

    #[tokio::test]
    async fn patches_model_then_thinking() {
        let patcher = Arc::new(Recording {
            patches: Mutex::new(Vec::new()),
            fail_with: None,
        });
        let (coordinator, _) =
            coordinator_with(config(), Arc::clone(&patcher) as Arc<dyn SessionPatcher>);
        let outcome = coordinator
            .spawn(SpawnParams {
                model_override: Some("openai/gpt-5".into()),
                thinking_override: Some("off".into()),
                ..params("x")
            })
            .await;
        let SpawnOutcome::Accepted {
            child_session_key,
            model_applied,
            provider,
            ..
        } = outcome
        else {
            panic!("expected accepted");
        };
        assert_eq!(model_applied, Some(true));
        assert_eq!(provider, "openai");

        let patches = patcher.patches.lock().unwrap();
        assert_eq!(patches.len(), 2);
        assert_eq!(patches[0].0, child_session_key);
        assert_eq!(patches[0].1.model.as_deref(), Some("openai/gpt-5"));
        assert_eq!(patches[1].1.thinking, Some(ThinkingPatch::Clear));
    }

    #[tokio::test]
    async fn refused_model_degrades_to_warning() {
        let patcher = Arc::new(Recording {
            patches: Mutex::new(Vec::new()),
            fail_with: Some("model not allowed: openai/gpt-5"),
        });
        let (coordinator, _) = coordinator_with(config(), patcher);
        let outcome = coordinator.spawn(params("x")).await;
        let SpawnOutcome::Accepted {
            model_applied,
            warning,
            ..
        } = outcome
        else {
            panic!("expected accepted");
        };
        assert_eq!(model_applied, Some(false));
        assert_eq!(warning.as_deref(), Some("model not allowed: openai/gpt-5"));
    }

    #[tokio::test]
    async fn patch_failure_releases_slots() {
        let patcher = Arc::new(Recording {
            patches: Mutex::new(Vec::new()),
            fail_with: Some("gateway unreachable"),
        });
        let (coordinator, executor) = coordinator_with(config(), patcher);
        let outcome = coordinator.spawn(params("x")).await;
        let SpawnOutcome::Error {
            reason,
            child_session_key,
            run_id,
            ..
        } = outcome
        else {
            panic!("expected error");
        };
        assert_eq!(reason, SpawnErrorReason::PatchFailed);
        assert!(child_session_key.is_some());
        assert!(run_id.is_some());

        let slots = coordinator.registry().slots();
        assert_eq!(slots.children.usage("agent:main:main").total, 0);
        assert_eq!(slots.providers.usage("anthropic").total, 0);
        assert!(coordinator.registry().is_empty());
        assert!(executor.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn failed_verification_fails_the_run() {
        let dir = tempfile::tempdir().unwrap();
        let (coordinator, _) = coordinator();
        let outcome = coordinator
            .spawn(SpawnParams {
                verification: Some(VerificationContract {
                    artifacts: vec![VerificationArtifact {
                        path: "report.json".into(),
                        ..VerificationArtifact::default()
                    }],
                    ..VerificationContract::default()
                }),
                workspace_dir: Some(dir.path().to_path_buf()),
                ..params("write the report")
            })
            .await;
        let SpawnOutcome::Accepted { run_id, .. } = outcome else {
            panic!("expected accepted");
        };

        let record = wait_finished(&coordinator, &run_id).await;
        let outcome = record.outcome.unwrap();
        assert_eq!(outcome.status, RunStatus::Error);
        assert!(outcome.error.unwrap().contains("artifact_not_found"));
        assert_eq!(
            record.verification_result.map(|v| v.status),
            Some(VerificationStatus::Failed)
        );
    }

    #[test]
    fn escalate_keeps_outcome() {
        let mut outcome = RunOutcome::ok();
        let contract = VerificationContract {
            on_failure: OnFailure::Escalate,
            ..VerificationContract::default()
        };
        let result = VerificationResult {
            status: VerificationStatus::Failed,
            checks: Vec::new(),
            verified_at: 0,
        };
        apply_verification(&mut outcome, &contract, &result);
        assert_eq!(outcome, RunOutcome::ok());
    }
}
