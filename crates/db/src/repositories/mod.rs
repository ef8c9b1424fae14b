use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::{broadcast, watch};

use zenthor_core::domain::approval::{ApprovalId, ApprovalStatus, NewToolApproval, ToolApproval};
use zenthor_core::domain::conversation::{
    AgentId, AgentProfile, Contact, ContactId, Conversation, ConversationContext, ConversationId,
    Skill,
};
use zenthor_core::domain::job::{Job, JobId};
use zenthor_core::domain::message::{
    Channel, Message, MessageId, MessageStatus, Role, ToolCallRecord,
};
use zenthor_core::domain::schedule::{NewScheduledTask, ScheduledTask, ScheduledTaskId};

pub mod approval;
pub mod conversation;
mod decode;
pub mod job_queue;
pub mod memory;
pub mod schedule;

pub use approval::SqlApprovalRepository;
pub use conversation::SqlConversationRepository;
pub use job_queue::SqlJobQueue;
pub use memory::{
    InMemoryApprovalRepository, InMemoryConversationRepository, InMemoryJobQueue,
    InMemoryScheduleRepository,
};
pub use schedule::SqlScheduleRepository;

/// Capacity of the in-process approval resolution broadcast.
pub const APPROVAL_EVENT_CAPACITY: usize = 64;

/// Titles derived from the first user message are cut to this many characters.
pub const TITLE_MAX_CHARS: usize = 50;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("not found: {0}")]
    NotFound(String),
}

/// Queue of conversation turns awaiting the agent.
#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn enqueue(
        &self,
        conversation_id: &ConversationId,
        message_id: Option<&MessageId>,
    ) -> Result<Job, RepositoryError>;

    /// Oldest pending jobs first.
    async fn pending_jobs(&self, limit: u32) -> Result<Vec<Job>, RepositoryError>;

    /// Receiver that changes whenever a job is enqueued through this queue.
    fn subscribe(&self) -> watch::Receiver<u64>;

    /// Atomically moves a pending job to processing. Returns `false` when the
    /// job is no longer pending, in which case nothing was written.
    async fn claim(&self, id: &JobId, worker_id: &str) -> Result<bool, RepositoryError>;

    async fn complete(&self, id: &JobId) -> Result<(), RepositoryError>;

    async fn fail(&self, id: &JobId) -> Result<(), RepositoryError>;

    async fn find(&self, id: &JobId) -> Result<Option<Job>, RepositoryError>;

    /// Deletes completed jobs last updated before `cutoff`; returns how many
    /// were removed. Failed jobs are kept for inspection.
    async fn delete_completed_before(&self, cutoff: DateTime<Utc>)
        -> Result<u64, RepositoryError>;
}

#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn get_conversation_context(
        &self,
        id: &ConversationId,
    ) -> Result<Option<ConversationContext>, RepositoryError>;

    async fn find_conversation(
        &self,
        id: &ConversationId,
    ) -> Result<Option<Conversation>, RepositoryError>;

    async fn create_conversation(
        &self,
        channel: Channel,
        contact_id: Option<&ContactId>,
        agent_id: Option<&AgentId>,
    ) -> Result<Conversation, RepositoryError>;

    /// Most recent active conversation of the contact on `channel`, created
    /// when none exists.
    async fn get_or_create_for_contact(
        &self,
        contact_id: &ContactId,
        channel: Channel,
    ) -> Result<Conversation, RepositoryError>;

    async fn find_contact_by_phone(&self, phone: &str) -> Result<Option<Contact>, RepositoryError>;

    async fn create_contact(
        &self,
        phone: &str,
        name: &str,
        is_allowed: bool,
    ) -> Result<Contact, RepositoryError>;

    async fn save_agent(&self, agent: AgentProfile) -> Result<(), RepositoryError>;

    async fn save_skill(&self, skill: Skill) -> Result<(), RepositoryError>;
}

#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Stores an inbound user message and titles the conversation from it when
    /// it has no title yet.
    async fn add_user_message(
        &self,
        conversation_id: &ConversationId,
        content: &str,
        channel: Channel,
    ) -> Result<Message, RepositoryError>;

    async fn add_summary_message(
        &self,
        conversation_id: &ConversationId,
        content: &str,
        channel: Channel,
    ) -> Result<Message, RepositoryError>;

    /// Empty streaming assistant message that is filled in as output arrives.
    async fn create_placeholder(
        &self,
        conversation_id: &ConversationId,
        channel: Channel,
    ) -> Result<MessageId, RepositoryError>;

    async fn update_streaming_content(
        &self,
        id: &MessageId,
        content: &str,
    ) -> Result<(), RepositoryError>;

    async fn finalize_message(
        &self,
        id: &MessageId,
        content: &str,
        tool_calls: Option<Vec<ToolCallRecord>>,
    ) -> Result<(), RepositoryError>;

    async fn add_assistant_message(
        &self,
        conversation_id: &ConversationId,
        content: &str,
        channel: Channel,
        tool_calls: Option<Vec<ToolCallRecord>>,
    ) -> Result<Message, RepositoryError>;

    async fn update_status(
        &self,
        id: &MessageId,
        status: MessageStatus,
    ) -> Result<(), RepositoryError>;

    /// Messages in insertion order.
    async fn list_for_conversation(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Vec<Message>, RepositoryError>;
}

#[async_trait]
pub trait ApprovalStore: Send + Sync {
    async fn create(&self, request: NewToolApproval) -> Result<ToolApproval, RepositoryError>;

    async fn find(&self, id: &ApprovalId) -> Result<Option<ToolApproval>, RepositoryError>;

    /// Pending approvals of a job, oldest first.
    async fn get_pending_by_job(
        &self,
        job_id: &JobId,
    ) -> Result<Vec<ToolApproval>, RepositoryError>;

    async fn get_by_job(&self, job_id: &JobId) -> Result<Vec<ToolApproval>, RepositoryError>;

    /// Pending approvals of a conversation, oldest first.
    async fn get_pending_by_conversation(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Vec<ToolApproval>, RepositoryError>;

    async fn list_pending(&self) -> Result<Vec<ToolApproval>, RepositoryError>;

    /// Resolves a pending approval to `Approved` or `Rejected` and publishes
    /// its id to subscribers. Returns `None` when the record is missing, is no
    /// longer pending, or `status` is `Pending`.
    async fn resolve(
        &self,
        id: &ApprovalId,
        status: ApprovalStatus,
    ) -> Result<Option<ToolApproval>, RepositoryError>;

    fn subscribe(&self) -> broadcast::Receiver<ApprovalId>;
}

/// Recurring tasks created by the `schedule_task` tool.
#[async_trait]
pub trait ScheduleStore: Send + Sync {
    async fn create(&self, request: NewScheduledTask) -> Result<ScheduledTask, RepositoryError>;

    async fn find(&self, id: &ScheduledTaskId) -> Result<Option<ScheduledTask>, RepositoryError>;

    /// Enabled tasks whose next run is at or before `now`, earliest first.
    async fn due(&self, now: DateTime<Utc>, limit: u32)
        -> Result<Vec<ScheduledTask>, RepositoryError>;

    /// Records a run at `ran_at` and moves the next run one interval later.
    async fn record_run(
        &self,
        id: &ScheduledTaskId,
        ran_at: DateTime<Utc>,
    ) -> Result<(), RepositoryError>;

    async fn list_for_conversation(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Vec<ScheduledTask>, RepositoryError>;
}

/// Fields of a message about to be stored; id and timestamp are assigned here.
pub(crate) struct MessageDraft<'a> {
    pub conversation_id: &'a ConversationId,
    pub role: Role,
    pub content: &'a str,
    pub channel: Channel,
    pub tool_calls: Option<Vec<ToolCallRecord>>,
    pub streaming: bool,
    pub status: MessageStatus,
}

impl MessageDraft<'_> {
    pub(crate) fn into_message(self) -> Message {
        Message {
            id: MessageId(new_id("msg")),
            conversation_id: self.conversation_id.clone(),
            role: self.role,
            content: self.content.to_string(),
            channel: self.channel,
            tool_calls: self.tool_calls,
            streaming: self.streaming,
            status: self.status,
            created_at: chrono::Utc::now(),
        }
    }
}

pub(crate) fn new_id(prefix: &str) -> String {
    format!("{prefix}-{}", uuid::Uuid::new_v4().simple())
}

pub(crate) fn derive_title(content: &str) -> Option<String> {
    let title: String = content.trim().chars().take(TITLE_MAX_CHARS).collect();
    (!title.is_empty()).then_some(title)
}
