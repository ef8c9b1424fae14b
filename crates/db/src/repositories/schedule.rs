use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqliteRow, Row};

use zenthor_core::domain::conversation::ConversationId;
use zenthor_core::domain::schedule::{NewScheduledTask, ScheduledTask, ScheduledTaskId};

use super::decode::{parse_optional_timestamp, parse_timestamp};
use super::{new_id, RepositoryError, ScheduleStore};
use crate::DbPool;

const TASK_COLUMNS: &str = "id, conversation_id, name, description, interval_minutes, payload, enabled, last_run_at, next_run_at, created_at";

pub struct SqlScheduleRepository {
    pool: DbPool,
}

impl SqlScheduleRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl ScheduleStore for SqlScheduleRepository {
    async fn create(&self, request: NewScheduledTask) -> Result<ScheduledTask, RepositoryError> {
        let now = Utc::now();
        let task = ScheduledTask {
            id: ScheduledTaskId(new_id("task")),
            next_run_at: request.first_run_at(now),
            conversation_id: request.conversation_id,
            name: request.name,
            description: request.description,
            interval_minutes: request.interval_minutes,
            payload: request.payload,
            enabled: true,
            last_run_at: None,
            created_at: now,
        };

        sqlx::query(
            "INSERT INTO scheduled_task (
                id, conversation_id, name, description, interval_minutes, payload, enabled,
                last_run_at, next_run_at, created_at
             ) VALUES (?, ?, ?, ?, ?, ?, 1, NULL, ?, ?)",
        )
        .bind(&task.id.0)
        .bind(&task.conversation_id.0)
        .bind(&task.name)
        .bind(task.description.as_deref())
        .bind(i64::from(task.interval_minutes))
        .bind(&task.payload)
        .bind(task.next_run_at.to_rfc3339())
        .bind(task.created_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(task)
    }

    async fn find(&self, id: &ScheduledTaskId) -> Result<Option<ScheduledTask>, RepositoryError> {
        let row = sqlx::query(&format!("SELECT {TASK_COLUMNS} FROM scheduled_task WHERE id = ?"))
            .bind(&id.0)
            .fetch_optional(&self.pool)
            .await?;

        row.map(task_from_row).transpose()
    }

    async fn due(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<ScheduledTask>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {TASK_COLUMNS} FROM scheduled_task
             WHERE enabled = 1 AND next_run_at <= ?
             ORDER BY next_run_at ASC, rowid ASC
             LIMIT ?"
        ))
        .bind(now.to_rfc3339())
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(task_from_row).collect()
    }

    async fn record_run(
        &self,
        id: &ScheduledTaskId,
        ran_at: DateTime<Utc>,
    ) -> Result<(), RepositoryError> {
        let task = self
            .find(id)
            .await?
            .ok_or_else(|| RepositoryError::NotFound(format!("scheduled task `{}`", id.0)))?;

        sqlx::query("UPDATE scheduled_task SET last_run_at = ?, next_run_at = ? WHERE id = ?")
            .bind(ran_at.to_rfc3339())
            .bind((ran_at + task.interval()).to_rfc3339())
            .bind(&id.0)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn list_for_conversation(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Vec<ScheduledTask>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {TASK_COLUMNS} FROM scheduled_task
             WHERE conversation_id = ?
             ORDER BY created_at ASC, rowid ASC"
        ))
        .bind(&conversation_id.0)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(task_from_row).collect()
    }
}

fn task_from_row(row: SqliteRow) -> Result<ScheduledTask, RepositoryError> {
    let interval: i64 = row.try_get("interval_minutes")?;
    let interval_minutes = u32::try_from(interval)
        .map_err(|_| RepositoryError::Decode(format!("invalid interval_minutes `{interval}`")))?;

    Ok(ScheduledTask {
        id: ScheduledTaskId(row.try_get("id")?),
        conversation_id: ConversationId(row.try_get("conversation_id")?),
        name: row.try_get("name")?,
        description: row.try_get("description")?,
        interval_minutes,
        payload: row.try_get("payload")?,
        enabled: row.try_get::<i64, _>("enabled")? != 0,
        last_run_at: parse_optional_timestamp("last_run_at", row.try_get("last_run_at")?)?,
        next_run_at: parse_timestamp("next_run_at", row.try_get("next_run_at")?)?,
        created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
    })
}
