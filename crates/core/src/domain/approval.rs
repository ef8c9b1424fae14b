use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::conversation::ConversationId;
use crate::domain::job::JobId;
use crate::domain::message::Channel;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ApprovalId(pub String);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
}

impl ApprovalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "pending" => Some(Self::Pending),
            "approved" => Some(Self::Approved),
            "rejected" => Some(Self::Rejected),
            _ => None,
        }
    }
}

/// Human consent request for one invocation of a high-risk tool.
///
/// Created `Pending`; resolved exactly once to `Approved` or `Rejected` by an
/// external actor. A wait that outlives its deadline is treated as a rejection
/// by the caller and never written back.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolApproval {
    pub id: ApprovalId,
    pub job_id: JobId,
    pub conversation_id: ConversationId,
    pub tool_name: String,
    pub tool_input: Value,
    pub status: ApprovalStatus,
    pub channel: Channel,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl ToolApproval {
    pub fn is_pending(&self) -> bool {
        self.status == ApprovalStatus::Pending
    }
}

/// Fields supplied by the caller when opening an approval request.
#[derive(Clone, Debug, PartialEq)]
pub struct NewToolApproval {
    pub job_id: JobId,
    pub conversation_id: ConversationId,
    pub tool_name: String,
    pub tool_input: Value,
    pub channel: Channel,
}
