//! Database queries for the `subagent_runs` table.

use super::db::{Database, DatabaseError};
use super::models::SubagentRunRow;

impl Database {
    /// Insert a new run record.
    pub async fn insert_subagent_run(&self, row: &SubagentRunRow) -> Result<(), DatabaseError> {
        sqlx::query(
            r"
            INSERT INTO subagent_runs
                (run_id, child_session_key, requester_session_key, requester_agent_id,
                 target_agent_id, label, task, depth, provider, model, cleanup,
                 run_timeout_secs, created_at, started_at, ended_at, outcome_status,
                 outcome_error, verification, verification_result)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ",
        )
        .bind(&row.run_id)
        .bind(&row.child_session_key)
        .bind(&row.requester_session_key)
        .bind(&row.requester_agent_id)
        .bind(&row.target_agent_id)
        .bind(&row.label)
        .bind(&row.task)
        .bind(row.depth)
        .bind(&row.provider)
        .bind(&row.model)
        .bind(&row.cleanup)
        .bind(row.run_timeout_secs)
        .bind(row.created_at)
        .bind(row.started_at)
        .bind(row.ended_at)
        .bind(&row.outcome_status)
        .bind(&row.outcome_error)
        .bind(&row.verification)
        .bind(&row.verification_result)
        .execute(self.pool())
        .await?;

        Ok(())
    }

    /// Update the mutable lifecycle columns of a run.
    pub async fn update_subagent_run(&self, row: &SubagentRunRow) -> Result<(), DatabaseError> {
        let result = sqlx::query(
            r"
            UPDATE subagent_runs
            SET started_at = ?, ended_at = ?, outcome_status = ?, outcome_error = ?,
                verification_result = ?
            WHERE run_id = ?
            ",
        )
        .bind(row.started_at)
        .bind(row.ended_at)
        .bind(&row.outcome_status)
        .bind(&row.outcome_error)
        .bind(&row.verification_result)
        .bind(&row.run_id)
        .execute(self.pool())
        .await?;

        if result.rows_affected() == 0 {
            return Err(DatabaseError::NotFound(format!("Run {}", row.run_id)));
        }
        Ok(())
    }

    /// Get a run by id.
    pub async fn get_subagent_run(&self, run_id: &str) -> Result<SubagentRunRow, DatabaseError> {
        sqlx::query_as::<_, SubagentRunRow>("SELECT * FROM subagent_runs WHERE run_id = ?")
            .bind(run_id)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("Run {run_id}")))
    }

    /// Runs spawned by a requester session, oldest first.
    pub async fn list_subagent_runs_by_requester(
        &self,
        requester_session_key: &str,
    ) -> Result<Vec<SubagentRunRow>, DatabaseError> {
        let rows = sqlx::query_as::<_, SubagentRunRow>(
            "SELECT * FROM subagent_runs WHERE requester_session_key = ? ORDER BY created_at ASC",
        )
        .bind(requester_session_key)
        .fetch_all(self.pool())
        .await?;

        Ok(rows)
    }

    /// Runs that have not ended, oldest first.
    pub async fn list_unfinished_subagent_runs(
        &self,
    ) -> Result<Vec<SubagentRunRow>, DatabaseError> {
        let rows = sqlx::query_as::<_, SubagentRunRow>(
            "SELECT * FROM subagent_runs WHERE ended_at IS NULL ORDER BY created_at ASC",
        )
        .fetch_all(self.pool())
        .await?;

        Ok(rows)
    }

    /// Delete a run. Returns whether a row was removed.
    pub async fn delete_subagent_run(&self, run_id: &str) -> Result<bool, DatabaseError> {
        let result = sqlx::query("DELETE FROM subagent_runs WHERE run_id = ?")
            .bind(run_id)
            .execute(self.pool())
            .await?;

        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    fn row(run_id: &str, requester: &str, created_at: i64) -> SubagentRunRow {
        SubagentRunRow {
            run_id: run_id.to_string(),
            child_session_key: format!("agent:main:subagent:{run_id}"),
            requester_session_key: requester.to_string(),
            requester_agent_id: "main".to_string(),
            target_agent_id: "main".to_string(),
            label: None,
            task: "do the thing".to_string(),
            depth: 1,
            provider: "openai".to_string(),
            model: Some("openai/gpt-5".to_string()),
            cleanup: "keep".to_string(),
            run_timeout_secs: Some(600),
            created_at,
            started_at: Some(created_at),
            ended_at: None,
            outcome_status: None,
            outcome_error: None,
            verification: None,
            verification_result: None,
        }
    }

    #[tokio::test]
    async fn insert_and_get() {
        let db = Database::open_in_memory().await.unwrap();
        db.insert_subagent_run(&row("r1", "agent:main:main", 10)).await.unwrap();

        let fetched = db.get_subagent_run("r1").await.unwrap();
        assert_eq!(fetched, row("r1", "agent:main:main", 10));
        assert!(matches!(
            db.get_subagent_run("missing").await,
            Err(DatabaseError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn list_by_requester_is_ordered() {
        let db = Database::open_in_memory().await.unwrap();
        db.insert_subagent_run(&row("r2", "agent:main:main", 20)).await.unwrap();
        db.insert_subagent_run(&row("r1", "agent:main:main", 10)).await.unwrap();
        db.insert_subagent_run(&row("r3", "agent:ops:main", 5)).await.unwrap();

        let ids: Vec<String> = db
            .list_subagent_runs_by_requester("agent:main:main")
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.run_id)
            .collect();
        assert_eq!(ids, vec!["r1", "r2"]);
    }

    #[tokio::test]
    async fn update_ends_run() {
        let db = Database::open_in_memory().await.unwrap();
        db.insert_subagent_run(&row("r1", "agent:main:main", 10)).await.unwrap();
        db.insert_subagent_run(&row("r2", "agent:main:main", 11)).await.unwrap();

        let mut ended = row("r1", "agent:main:main", 10);
        ended.ended_at = Some(50);
        ended.outcome_status = Some("ok".into());
        db.update_subagent_run(&ended).await.unwrap();

        let unfinished = db.list_unfinished_subagent_runs().await.unwrap();
        assert_eq!(unfinished.len(), 1);
        assert_eq!(unfinished[0].run_id, "r2");

        let missing = row("nope", "agent:main:main", 1);
        assert!(db.update_subagent_run(&missing).await.is_err());
    }

    #[tokio::test]
    async fn delete_run() {
        let db = Database::open_in_memory().await.unwrap();
        db.insert_subagent_run(&row("r1", "agent:main:main", 10)).await.unwrap();
        assert!(db.delete_subagent_run("r1").await.unwrap());
        assert!(!db.delete_subagent_run("r1").await.unwrap());
    }
}
