pub mod config;
pub mod context_guard;
pub mod domain;
pub mod errors;
pub mod prompt;
pub mod tool_policy;

pub use context_guard::{evaluate_context, ContextEvaluation};
pub use domain::approval::{ApprovalId, ApprovalStatus, NewToolApproval, ToolApproval};
pub use domain::conversation::{
    AgentId, AgentProfile, Contact, ContactId, Conversation, ConversationContext, ConversationId,
    ConversationStatus, Skill, SkillConfig, SkillId,
};
pub use domain::job::{Job, JobId, JobStatus};
pub use domain::message::{
    Channel, ChatMessage, Message, MessageId, MessageStatus, Role, ToolCallRecord,
};
pub use errors::{classify_error, is_retryable, FailoverReason, ModelError};
pub use prompt::build_system_prompt;
pub use tool_policy::{default_policy, filter_tools, merge_tool_policies, ToolPolicy};
