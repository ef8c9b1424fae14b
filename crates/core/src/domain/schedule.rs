use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::conversation::ConversationId;

/// Longest supported interval between runs: one year.
pub const MAX_INTERVAL_MINUTES: u32 = 525_600;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ScheduledTaskId(pub String);

/// Recurring instruction that is posted into its conversation as a user turn.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledTask {
    pub id: ScheduledTaskId,
    pub conversation_id: ConversationId,
    pub name: String,
    pub description: Option<String>,
    pub interval_minutes: u32,
    pub payload: String,
    pub enabled: bool,
    pub last_run_at: Option<DateTime<Utc>>,
    pub next_run_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl ScheduledTask {
    pub fn interval(&self) -> Duration {
        Duration::minutes(i64::from(self.interval_minutes))
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.enabled && self.next_run_at <= now
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewScheduledTask {
    pub conversation_id: ConversationId,
    pub name: String,
    pub description: Option<String>,
    pub interval_minutes: u32,
    pub payload: String,
}

impl NewScheduledTask {
    /// First run happens one interval after creation.
    pub fn first_run_at(&self, created_at: DateTime<Utc>) -> DateTime<Utc> {
        created_at + Duration::minutes(i64::from(self.interval_minutes))
    }
}
