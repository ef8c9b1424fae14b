use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqliteRow, Row};
use tokio::sync::watch;

use zenthor_core::domain::conversation::ConversationId;
use zenthor_core::domain::job::{Job, JobId, JobStatus};
use zenthor_core::domain::message::MessageId;

use super::decode::{parse_enum, parse_timestamp};
use super::{new_id, JobQueue, RepositoryError};
use crate::DbPool;

const JOB_COLUMNS: &str =
    "id, conversation_id, message_id, status, claimed_by, created_at, updated_at";

/// SQLite job queue. Enqueue notifications only reach subscribers in this
/// process; jobs inserted elsewhere are picked up by the worker's poll.
pub struct SqlJobQueue {
    pool: DbPool,
    notify: watch::Sender<u64>,
}

impl SqlJobQueue {
    pub fn new(pool: DbPool) -> Self {
        let (notify, _) = watch::channel(0);
        Self { pool, notify }
    }

    async fn set_terminal_status(&self, id: &JobId, status: JobStatus) -> Result<(), RepositoryError> {
        let result = sqlx::query("UPDATE agent_job SET status = ?, updated_at = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(Utc::now().to_rfc3339())
            .bind(&id.0)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound(format!("job `{}`", id.0)));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl JobQueue for SqlJobQueue {
    async fn enqueue(
        &self,
        conversation_id: &ConversationId,
        message_id: Option<&MessageId>,
    ) -> Result<Job, RepositoryError> {
        let now = Utc::now();
        let job = Job {
            id: JobId(new_id("job")),
            conversation_id: conversation_id.clone(),
            message_id: message_id.cloned(),
            status: JobStatus::Pending,
            claimed_by: None,
            created_at: now,
            updated_at: now,
        };

        sqlx::query(
            "INSERT INTO agent_job (id, conversation_id, message_id, status, claimed_by, created_at, updated_at)
             VALUES (?, ?, ?, ?, NULL, ?, ?)",
        )
        .bind(&job.id.0)
        .bind(&job.conversation_id.0)
        .bind(job.message_id.as_ref().map(|id| id.0.as_str()))
        .bind(job.status.as_str())
        .bind(job.created_at.to_rfc3339())
        .bind(job.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        self.notify.send_modify(|version| *version = version.wrapping_add(1));
        Ok(job)
    }

    async fn pending_jobs(&self, limit: u32) -> Result<Vec<Job>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM agent_job
             WHERE status = 'pending'
             ORDER BY created_at ASC, rowid ASC
             LIMIT ?"
        ))
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(job_from_row).collect()
    }

    fn subscribe(&self) -> watch::Receiver<u64> {
        self.notify.subscribe()
    }

    async fn claim(&self, id: &JobId, worker_id: &str) -> Result<bool, RepositoryError> {
        let result = sqlx::query(
            "UPDATE agent_job
             SET status = 'processing', claimed_by = ?, updated_at = ?
             WHERE id = ? AND status = 'pending'",
        )
        .bind(worker_id)
        .bind(Utc::now().to_rfc3339())
        .bind(&id.0)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn complete(&self, id: &JobId) -> Result<(), RepositoryError> {
        self.set_terminal_status(id, JobStatus::Completed).await
    }

    async fn fail(&self, id: &JobId) -> Result<(), RepositoryError> {
        self.set_terminal_status(id, JobStatus::Failed).await
    }

    async fn find(&self, id: &JobId) -> Result<Option<Job>, RepositoryError> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM agent_job WHERE id = ?"))
            .bind(&id.0)
            .fetch_optional(&self.pool)
            .await?;

        row.map(job_from_row).transpose()
    }

    async fn delete_completed_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, RepositoryError> {
        let result =
            sqlx::query("DELETE FROM agent_job WHERE status = 'completed' AND updated_at < ?")
                .bind(cutoff.to_rfc3339())
                .execute(&self.pool)
                .await?;

        Ok(result.rows_affected())
    }
}

fn job_from_row(row: SqliteRow) -> Result<Job, RepositoryError> {
    Ok(Job {
        id: JobId(row.try_get("id")?),
        conversation_id: ConversationId(row.try_get("conversation_id")?),
        message_id: row.try_get::<Option<String>, _>("message_id")?.map(MessageId),
        status: parse_enum("job status", row.try_get("status")?, JobStatus::parse)?,
        claimed_by: row.try_get("claimed_by")?,
        created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
        updated_at: parse_timestamp("updated_at", row.try_get("updated_at")?)?,
    })
}
