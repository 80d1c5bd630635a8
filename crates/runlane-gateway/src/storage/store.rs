//! The persistence seam of the run registry.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use super::db::{Database, DatabaseError};
use super::models::SubagentRunRow;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Invalid run record {run_id}: {reason}")]
    Invalid { run_id: String, reason: String },

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// Durable store for sub-agent run records.
#[async_trait]
pub trait RunStore: Send + Sync {
    async fn create(&self, row: &SubagentRunRow) -> Result<(), StoreError>;
    async fn update(&self, row: &SubagentRunRow) -> Result<(), StoreError>;
    async fn list_by_requester(&self, requester: &str) -> Result<Vec<SubagentRunRow>, StoreError>;
    async fn delete(&self, run_id: &str) -> Result<(), StoreError>;
    async fn list_unfinished(&self) -> Result<Vec<SubagentRunRow>, StoreError>;
}

#[async_trait]
impl RunStore for Database {
    async fn create(&self, row: &SubagentRunRow) -> Result<(), StoreError> {
        Ok(self.insert_subagent_run(row).await?)
    }

    async fn update(&self, row: &SubagentRunRow) -> Result<(), StoreError> {
        Ok(self.update_subagent_run(row).await?)
    }

    async fn list_by_requester(&self, requester: &str) -> Result<Vec<SubagentRunRow>, StoreError> {
        Ok(self.list_subagent_runs_by_requester(requester).await?)
    }

    async fn delete(&self, run_id: &str) -> Result<(), StoreError> {
        self.delete_subagent_run(run_id).await?;
        Ok(())
    }

    async fn list_unfinished(&self) -> Result<Vec<SubagentRunRow>, StoreError> {
        Ok(self.list_unfinished_subagent_runs().await?)
    }
}

/// Process-local store. Writes can be made to fail for error-path tests.
#[derive(Default)]
pub struct MemoryRunStore {
    rows: Mutex<HashMap<String, SubagentRunRow>>,
    fail_writes: AtomicBool,
}

impl MemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn rows(&self) -> MutexGuard<'_, HashMap<String, SubagentRunRow>> {
        self.rows.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make every subsequent write fail.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn get(&self, run_id: &str) -> Option<SubagentRunRow> {
        self.rows().get(run_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.rows().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows().is_empty()
    }

    fn check_writable(&self) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("writes disabled".to_string()));
        }
        Ok(())
    }
}

fn sorted(mut rows: Vec<SubagentRunRow>) -> Vec<SubagentRunRow> {
    rows.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.run_id.cmp(&b.run_id)));
    rows
}

#[async_trait]
impl RunStore for MemoryRunStore {
    async fn create(&self, row: &SubagentRunRow) -> Result<(), StoreError> {
        self.check_writable()?;
        self.rows().insert(row.run_id.clone(), row.clone());
        Ok(())
    }

    async fn update(&self, row: &SubagentRunRow) -> Result<(), StoreError> {
        self.check_writable()?;
        let mut rows = self.rows();
        let Some(existing) = rows.get_mut(&row.run_id) else {
            return Err(DatabaseError::NotFound(format!("Run {}", row.run_id)).into());
        };
        *existing = row.clone();
        Ok(())
    }

    async fn list_by_requester(&self, requester: &str) -> Result<Vec<SubagentRunRow>, StoreError> {
        let rows = self
            .rows()
            .values()
            .filter(|r| r.requester_session_key == requester)
            .cloned()
            .collect();
        Ok(sorted(rows))
    }

    async fn delete(&self, run_id: &str) -> Result<(), StoreError> {
        self.check_writable()?;
        self.rows().remove(run_id);
        Ok(())
    }

    async fn list_unfinished(&self) -> Result<Vec<SubagentRunRow>, StoreError> {
        let rows = self
            .rows()
            .values()
            .filter(|r| r.ended_at.is_none())
            .cloned()
            .collect();
        Ok(sorted(rows))
    }
}
