use chrono::Utc;
use sqlx::{sqlite::SqliteRow, Row};
use tokio::sync::broadcast;

use zenthor_core::domain::approval::{ApprovalId, ApprovalStatus, NewToolApproval, ToolApproval};
use zenthor_core::domain::conversation::ConversationId;
use zenthor_core::domain::job::JobId;
use zenthor_core::domain::message::Channel;

use super::decode::{encode_json, parse_enum, parse_json, parse_optional_timestamp, parse_timestamp};
use super::{new_id, ApprovalStore, RepositoryError, APPROVAL_EVENT_CAPACITY};
use crate::DbPool;

const APPROVAL_COLUMNS: &str = "id, job_id, conversation_id, tool_name, tool_input_json, status, channel, created_at, resolved_at";

pub struct SqlApprovalRepository {
    pool: DbPool,
    events: broadcast::Sender<ApprovalId>,
}

impl SqlApprovalRepository {
    pub fn new(pool: DbPool) -> Self {
        let (events, _) = broadcast::channel(APPROVAL_EVENT_CAPACITY);
        Self { pool, events }
    }

    async fn query_many(
        &self,
        filter: &str,
        bind: &str,
    ) -> Result<Vec<ToolApproval>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {APPROVAL_COLUMNS} FROM tool_approval WHERE {filter} ORDER BY created_at ASC, rowid ASC"
        ))
        .bind(bind)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(approval_from_row).collect()
    }
}

#[async_trait::async_trait]
impl ApprovalStore for SqlApprovalRepository {
    async fn create(&self, request: NewToolApproval) -> Result<ToolApproval, RepositoryError> {
        let approval = ToolApproval {
            id: ApprovalId(new_id("approval")),
            job_id: request.job_id,
            conversation_id: request.conversation_id,
            tool_name: request.tool_name,
            tool_input: request.tool_input,
            status: ApprovalStatus::Pending,
            channel: request.channel,
            created_at: Utc::now(),
            resolved_at: None,
        };

        sqlx::query(
            "INSERT INTO tool_approval (
                id, job_id, conversation_id, tool_name, tool_input_json, status, channel, created_at, resolved_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, NULL)",
        )
        .bind(&approval.id.0)
        .bind(&approval.job_id.0)
        .bind(&approval.conversation_id.0)
        .bind(&approval.tool_name)
        .bind(encode_json("tool_input_json", &approval.tool_input)?)
        .bind(approval.status.as_str())
        .bind(approval.channel.as_str())
        .bind(approval.created_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(approval)
    }

    async fn find(&self, id: &ApprovalId) -> Result<Option<ToolApproval>, RepositoryError> {
        let row =
            sqlx::query(&format!("SELECT {APPROVAL_COLUMNS} FROM tool_approval WHERE id = ?"))
                .bind(&id.0)
                .fetch_optional(&self.pool)
                .await?;

        row.map(approval_from_row).transpose()
    }

    async fn get_pending_by_job(
        &self,
        job_id: &JobId,
    ) -> Result<Vec<ToolApproval>, RepositoryError> {
        self.query_many("job_id = ? AND status = 'pending'", &job_id.0).await
    }

    async fn get_by_job(&self, job_id: &JobId) -> Result<Vec<ToolApproval>, RepositoryError> {
        self.query_many("job_id = ?", &job_id.0).await
    }

    async fn get_pending_by_conversation(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Vec<ToolApproval>, RepositoryError> {
        self.query_many("conversation_id = ? AND status = 'pending'", &conversation_id.0).await
    }

    async fn list_pending(&self) -> Result<Vec<ToolApproval>, RepositoryError> {
        self.query_many("status = ?", ApprovalStatus::Pending.as_str()).await
    }

    async fn resolve(
        &self,
        id: &ApprovalId,
        status: ApprovalStatus,
    ) -> Result<Option<ToolApproval>, RepositoryError> {
        if status == ApprovalStatus::Pending {
            return Ok(None);
        }

        let result = sqlx::query(
            "UPDATE tool_approval SET status = ?, resolved_at = ? WHERE id = ? AND status = 'pending'",
        )
        .bind(status.as_str())
        .bind(Utc::now().to_rfc3339())
        .bind(&id.0)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Ok(None);
        }

        let resolved = self.find(id).await?;
        // no subscribers is fine
        let _ = self.events.send(id.clone());
        Ok(resolved)
    }

    fn subscribe(&self) -> broadcast::Receiver<ApprovalId> {
        self.events.subscribe()
    }
}

fn approval_from_row(row: SqliteRow) -> Result<ToolApproval, RepositoryError> {
    let tool_input_json: String = row.try_get("tool_input_json")?;

    Ok(ToolApproval {
        id: ApprovalId(row.try_get("id")?),
        job_id: JobId(row.try_get("job_id")?),
        conversation_id: ConversationId(row.try_get("conversation_id")?),
        tool_name: row.try_get("tool_name")?,
        tool_input: parse_json("tool_input_json", &tool_input_json)?,
        status: parse_enum("approval status", row.try_get("status")?, ApprovalStatus::parse)?,
        channel: parse_enum("channel", row.try_get("channel")?, Channel::parse)?,
        created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
        resolved_at: parse_optional_timestamp("resolved_at", row.try_get("resolved_at")?)?,
    })
}
