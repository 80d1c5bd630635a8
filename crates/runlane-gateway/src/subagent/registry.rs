//! Registry of sub-agent runs and the slots they hold.
//!
//! The in-memory map is the source of truth for slot accounting; the
//! [`RunStore`] mirrors it so unfinished runs can be restored after a restart.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use runlane_core::CleanupPolicy;
use runlane_core::db::unix_timestamp_ms;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::verification::{VerificationContract, VerificationResult};
use crate::runs::{RunError, RunResult};
use crate::slots::{SpawnReservations, SpawnSlots};
use crate::storage::{RunStore, StoreError, SubagentRunRow};

/// How long a sweep waits for an aborted child turn to settle.
const SWEEP_SETTLE_GRACE: Duration = Duration::from_secs(10);

const SWEPT_ERROR: &str = "run exceeded archive age";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Ok,
    Error,
    Timeout,
    Aborted,
}

impl RunStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Error => "error",
            Self::Timeout => "timeout",
            Self::Aborted => "aborted",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "ok" => Some(Self::Ok),
            "error" => Some(Self::Error),
            "timeout" => Some(Self::Timeout),
            "aborted" => Some(Self::Aborted),
            _ => None,
        }
    }
}

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunOutcome {
    pub status: RunStatus,
    pub error: Option<String>,
}

impl RunOutcome {
    pub const fn ok() -> Self {
        Self {
            status: RunStatus::Ok,
            error: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: RunStatus::Error,
            error: Some(message.into()),
        }
    }

    pub fn from_result(result: &Result<RunResult, RunError>) -> Self {
        match result {
            Ok(r) if r.aborted => Self {
                status: RunStatus::Aborted,
                error: None,
            },
            Ok(_) => Self::ok(),
            Err(RunError::Aborted) => Self {
                status: RunStatus::Aborted,
                error: None,
            },
            Err(e @ RunError::TimedOut { .. }) => Self {
                status: RunStatus::Timeout,
                error: Some(e.to_string()),
            },
            Err(e) => Self::error(e.to_string()),
        }
    }
}

/// One spawned sub-agent run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubagentRunRecord {
    pub run_id: String,
    pub child_session_key: String,
    pub requester_session_key: String,
    pub requester_agent_id: String,
    pub target_agent_id: String,
    pub label: Option<String>,
    pub task: String,
    pub depth: u32,
    pub provider: String,
    pub model: Option<String>,
    pub cleanup: CleanupPolicy,
    pub run_timeout_secs: Option<u64>,
    /// Unix milliseconds.
    pub created_at: i64,
    pub started_at: Option<i64>,
    pub ended_at: Option<i64>,
    pub outcome: Option<RunOutcome>,
    pub verification: Option<VerificationContract>,
    pub verification_result: Option<VerificationResult>,
}

impl SubagentRunRecord {
    pub const fn is_finished(&self) -> bool {
        self.ended_at.is_some()
    }

    pub fn to_row(&self) -> SubagentRunRow {
        SubagentRunRow {
            run_id: self.run_id.clone(),
            child_session_key: self.child_session_key.clone(),
            requester_session_key: self.requester_session_key.clone(),
            requester_agent_id: self.requester_agent_id.clone(),
            target_agent_id: self.target_agent_id.clone(),
            label: self.label.clone(),
            task: self.task.clone(),
            depth: i64::from(self.depth),
            provider: self.provider.clone(),
            model: self.model.clone(),
            cleanup: self.cleanup.as_str().to_string(),
            run_timeout_secs: self
                .run_timeout_secs
                .map(|s| i64::try_from(s).unwrap_or(i64::MAX)),
            created_at: self.created_at,
            started_at: self.started_at,
            ended_at: self.ended_at,
            outcome_status: self.outcome.as_ref().map(|o| o.status.as_str().to_string()),
            outcome_error: self.outcome.as_ref().and_then(|o| o.error.clone()),
            verification: self
                .verification
                .as_ref()
                .and_then(|v| serde_json::to_string(v).ok()),
            verification_result: self
                .verification_result
                .as_ref()
                .and_then(|v| serde_json::to_string(v).ok()),
        }
    }

    pub fn from_row(row: SubagentRunRow) -> Result<Self, StoreError> {
        let invalid = |reason: String| StoreError::Invalid {
            run_id: row.run_id.clone(),
            reason,
        };
        let depth =
            u32::try_from(row.depth).map_err(|_| invalid(format!("depth {}", row.depth)))?;
        let cleanup = CleanupPolicy::parse(&row.cleanup)
            .ok_or_else(|| invalid(format!("cleanup {}", row.cleanup)))?;
        let outcome = match row.outcome_status.as_deref() {
            None => None,
            Some(raw) => Some(RunOutcome {
                status: RunStatus::parse(raw).ok_or_else(|| invalid(format!("status {raw}")))?,
                error: row.outcome_error.clone(),
            }),
        };
        let verification = row
            .verification
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .map_err(|e| invalid(format!("verification: {e}")))?;
        let verification_result = row
            .verification_result
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .map_err(|e| invalid(format!("verification result: {e}")))?;

        Ok(Self {
            depth,
            cleanup,
            outcome,
            verification,
            verification_result,
            run_timeout_secs: row.run_timeout_secs.and_then(|s| u64::try_from(s).ok()),
            run_id: row.run_id,
            child_session_key: row.child_session_key,
            requester_session_key: row.requester_session_key,
            requester_agent_id: row.requester_agent_id,
            target_agent_id: row.target_agent_id,
            label: row.label,
            task: row.task,
            provider: row.provider,
            model: row.model,
            created_at: row.created_at,
            started_at: row.started_at,
            ended_at: row.ended_at,
        })
    }
}

struct Entry {
    record: SubagentRunRecord,
    /// `None` once released.
    reservations: Option<SpawnReservations>,
    /// Abort signal of the dispatched child turn. `None` until dispatch, and
    /// for runs restored without a live turn.
    turn: Option<CancellationToken>,
    /// Fired once the run is completed.
    done: CancellationToken,
    /// Swept while its turn was still settling.
    expired: bool,
}

impl Entry {
    fn new(record: SubagentRunRecord, reservations: SpawnReservations) -> Self {
        Self {
            record,
            reservations: Some(reservations),
            turn: None,
            done: CancellationToken::new(),
            expired: false,
        }
    }
}

/// Run records plus held reservations. Cloning shares the same registry.
#[derive(Clone)]
pub struct RunRegistry {
    slots: SpawnSlots,
    store: Arc<dyn RunStore>,
    entries: Arc<Mutex<HashMap<String, Entry>>>,
}

impl RunRegistry {
    pub fn new(slots: SpawnSlots, store: Arc<dyn RunStore>) -> Self {
        Self {
            slots,
            store,
            entries: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub const fn slots(&self) -> &SpawnSlots {
        &self.slots
    }

    /// Register a new run holding `reservations`.
    ///
    /// The reservations are committed and the record persisted. If the store
    /// refuses the record, it is forgotten and both slots are released.
    pub async fn register(
        &self,
        mut record: SubagentRunRecord,
        mut reservations: SpawnReservations,
    ) -> Result<(), StoreError> {
        record.started_at.get_or_insert_with(unix_timestamp_ms);
        reservations.commit();
        let row = record.to_row();
        let run_id = record.run_id.clone();
        self.entries()
            .insert(run_id.clone(), Entry::new(record, reservations));

        if let Err(e) = self.store.create(&row).await {
            if let Some(mut entry) = self.entries().remove(&run_id) {
                if let Some(r) = entry.reservations.as_mut() {
                    r.release();
                }
            }
            warn!(run_id = %run_id, error = %e, "Failed to persist run, slots released");
            return Err(e);
        }
        debug!(run_id = %run_id, "Run registered");
        Ok(())
    }

    /// Abort signal for the child turn of `run_id`.
    ///
    /// The token is cancelled already when the run has ended or is unknown,
    /// so a turn dispatched after a sweep never starts.
    pub fn turn_token(&self, run_id: &str) -> CancellationToken {
        let mut entries = self.entries();
        match entries.get_mut(run_id) {
            Some(entry) if !entry.record.is_finished() => {
                entry.turn.get_or_insert_with(CancellationToken::new).clone()
            }
            _ => {
                let token = CancellationToken::new();
                token.cancel();
                token
            }
        }
    }

    /// Record the end of a run and release its slots.
    ///
    /// Returns the final record, or `None` if the run is unknown or already
    /// ended. With `cleanup = delete` the record is dropped as well.
    pub async fn complete(
        &self,
        run_id: &str,
        outcome: RunOutcome,
        verification_result: Option<VerificationResult>,
    ) -> Option<SubagentRunRecord> {
        let record = {
            let mut entries = self.entries();
            let entry = entries.get_mut(run_id)?;
            if entry.record.is_finished() {
                return None;
            }
            let outcome = if entry.expired {
                swept_outcome()
            } else {
                outcome
            };
            entry.record.ended_at = Some(unix_timestamp_ms());
            entry.record.outcome = Some(outcome);
            entry.record.verification_result = verification_result;
            if let Some(mut reservations) = entry.reservations.take() {
                reservations.release();
            }
            entry.done.cancel();
            let record = entry.record.clone();
            if record.cleanup == CleanupPolicy::Delete {
                entries.remove(run_id);
            }
            record
        };

        let persisted = match record.cleanup {
            CleanupPolicy::Delete => self.store.delete(run_id).await,
            CleanupPolicy::Keep => self.store.update(&record.to_row()).await,
        };
        if let Err(e) = persisted {
            warn!(run_id, error = %e, "Failed to persist run completion");
        }
        info!(
            run_id,
            status = record.outcome.as_ref().map_or("", |o| o.status.as_str()),
            "Run completed"
        );
        Some(record)
    }

    pub fn get(&self, run_id: &str) -> Option<SubagentRunRecord> {
        self.entries().get(run_id).map(|e| e.record.clone())
    }

    /// Records spawned by `requester`, oldest first.
    pub fn list_by_requester(&self, requester: &str) -> Vec<SubagentRunRecord> {
        let mut records: Vec<SubagentRunRecord> = self
            .entries()
            .values()
            .filter(|e| e.record.requester_session_key == requester)
            .map(|e| e.record.clone())
            .collect();
        records.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.run_id.cmp(&b.run_id))
        });
        records
    }

    /// Unfinished runs spawned by `requester`.
    pub fn active_children(&self, requester: &str) -> Vec<SubagentRunRecord> {
        let mut children = self.list_by_requester(requester);
        children.retain(|r| !r.is_finished());
        children
    }

    /// Recorded depth of the run owning `child_session_key`.
    pub fn depth_of(&self, child_session_key: &str) -> Option<u32> {
        self.entries()
            .values()
            .find(|e| e.record.child_session_key == child_session_key)
            .map(|e| e.record.depth)
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    /// Rehydrate unfinished runs from the store and re-account their slots.
    ///
    /// Restored slots may exceed the configured caps. Returns how many runs
    /// were restored.
    pub async fn restore_from_store(&self) -> Result<usize, StoreError> {
        let rows = self.store.list_unfinished().await?;
        let mut restored = 0;
        for row in rows {
            let record = match SubagentRunRecord::from_row(row) {
                Ok(record) => record,
                Err(e) => {
                    warn!(error = %e, "Skipping unreadable run record");
                    continue;
                }
            };
            let mut entries = self.entries();
            if entries.contains_key(&record.run_id) {
                continue;
            }
            let reservations = self
                .slots
                .restore(&record.requester_session_key, &record.provider);
            entries.insert(record.run_id.clone(), Entry::new(record, reservations));
            restored += 1;
        }
        if restored > 0 {
            info!(restored, "Restored unfinished runs");
        }
        Ok(restored)
    }

    /// End runs started more than `max_age` ago as timed out.
    ///
    /// A run with a dispatched turn is aborted first. Its slots stay held
    /// until the turn has settled and the run completes; a turn that does not
    /// settle within the grace period keeps them and is completed as timed out
    /// whenever it ends. Returns how many runs were ended.
    pub async fn sweep(&self, max_age: Duration) -> usize {
        self.sweep_with_grace(max_age, SWEEP_SETTLE_GRACE).await
    }

    async fn sweep_with_grace(&self, max_age: Duration, grace: Duration) -> usize {
        let max_age_ms = i64::try_from(max_age.as_millis()).unwrap_or(i64::MAX);
        let cutoff = unix_timestamp_ms().saturating_sub(max_age_ms);
        let stale: Vec<(String, Option<(CancellationToken, CancellationToken)>)> = self
            .entries()
            .values_mut()
            .filter(|e| !e.record.is_finished())
            .filter(|e| e.record.started_at.unwrap_or(e.record.created_at) <= cutoff)
            .map(|e| {
                e.expired = true;
                let live = e.turn.clone().map(|turn| (turn, e.done.clone()));
                (e.record.run_id.clone(), live)
            })
            .collect();

        let mut swept = 0;
        for (run_id, live) in stale {
            match live {
                Some((turn, done)) => {
                    debug!(run_id = %run_id, "Aborting stale run");
                    turn.cancel();
                    if tokio::time::timeout(grace, done.cancelled()).await.is_ok() {
                        swept += 1;
                    } else {
                        warn!(run_id = %run_id, ?grace, "Stale run still settling, slots kept");
                    }
                }
                None => {
                    if self.complete(&run_id, swept_outcome(), None).await.is_some() {
                        swept += 1;
                    }
                }
            }
        }
        if swept > 0 {
            info!(swept, "Swept stale runs");
        }
        swept
    }
}

fn swept_outcome() -> RunOutcome {
    RunOutcome {
        status: RunStatus::Timeout,
        error: Some(SWEPT_ERROR.to_string()),
    }
}
