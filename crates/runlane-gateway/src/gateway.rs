//! Wiring of the scheduling core around one configuration.

use std::sync::Arc;
use std::time::Duration;

use runlane_core::Config;
use tracing::info;

use crate::compaction::{CompactionSafeguard, Summarizer};
use crate::lanes::{LANE_MAIN, LANE_SUBAGENT, LaneScheduler};
use crate::queue::Dispatcher;
use crate::runs::{ActiveRuns, RunExecutor};
use crate::slots::SpawnSlots;
use crate::storage::{RunStore, StoreError};
use crate::subagent::{ConfigToolCatalog, NoopPatcher, RunRegistry, SessionPatcher, SpawnCoordinator, ToolCatalog};

/// External capabilities the core depends on.
pub struct GatewayCollaborators {
    pub executor: Arc<dyn RunExecutor>,
    pub summarizer: Arc<dyn Summarizer>,
    pub store: Arc<dyn RunStore>,
    /// Defaults to a patcher that accepts every patch.
    pub patcher: Option<Arc<dyn SessionPatcher>>,
    /// Defaults to the `agents.{id}.tools` lists of the config.
    pub tools: Option<Arc<dyn ToolCatalog>>,
}

/// All scheduling components, sharing one set of lanes, live runs and slots.
#[derive(Clone)]
pub struct Gateway {
    pub config: Arc<Config>,
    pub lanes: LaneScheduler,
    pub active: ActiveRuns,
    pub slots: SpawnSlots,
    pub registry: RunRegistry,
    pub dispatcher: Dispatcher,
    pub coordinator: SpawnCoordinator,
    pub safeguard: CompactionSafeguard,
}

impl Gateway {
    pub fn new(config: Config, collaborators: GatewayCollaborators) -> Self {
        let config = Arc::new(config);
        let lanes = LaneScheduler::new(Duration::from_millis(config.gateway.lane_warn_after_ms));
        lanes.set_concurrency(LANE_MAIN, config.gateway.main_lane_concurrency);
        lanes.set_concurrency(LANE_SUBAGENT, config.subagents.lane_concurrency);

        let active = ActiveRuns::new();
        let slots = SpawnSlots::new();
        let registry = RunRegistry::new(slots.clone(), collaborators.store);
        let dispatcher = Dispatcher::new(
            Arc::clone(&config),
            lanes.clone(),
            active.clone(),
            slots.clone(),
            Arc::clone(&collaborators.executor),
        );
        let patcher: Arc<dyn SessionPatcher> = match collaborators.patcher {
            Some(patcher) => patcher,
            None => Arc::new(NoopPatcher),
        };
        let tools: Arc<dyn ToolCatalog> = match collaborators.tools {
            Some(tools) => tools,
            None => Arc::new(ConfigToolCatalog::new(Arc::clone(&config))),
        };
        let coordinator = SpawnCoordinator::new(
            Arc::clone(&config),
            registry.clone(),
            lanes.clone(),
            active.clone(),
            collaborators.executor,
            patcher,
            tools,
        );
        let safeguard = CompactionSafeguard::new(config.compaction.clone(), collaborators.summarizer);

        info!(
            main_lane = config.gateway.main_lane_concurrency,
            subagent_lane = config.subagents.lane_concurrency,
            "Gateway core initialized"
        );

        Self {
            config,
            lanes,
            active,
            slots,
            registry,
            dispatcher,
            coordinator,
            safeguard,
        }
    }

    /// Reload unfinished runs from the store, re-taking their slots.
    pub async fn restore(&self) -> Result<usize, StoreError> {
        self.registry.restore_from_store().await
    }

    /// End runs older than `subagents.archive_after_minutes`.
    pub async fn sweep(&self) -> usize {
        let max_age = Duration::from_secs(self.config.subagents.archive_after_minutes.saturating_mul(60));
        self.registry.sweep(max_age).await
    }
}
