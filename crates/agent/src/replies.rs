//! Inbound messages on the store-and-forward channel.
//!
//! A short YES/NO style reply resolves the newest pending approval of the
//! conversation instead of starting a new turn.

use std::sync::Arc;

use tracing::info;

use zenthor_core::domain::approval::{ApprovalStatus, ToolApproval};
use zenthor_core::domain::conversation::ConversationId;
use zenthor_core::domain::job::Job;
use zenthor_core::domain::message::{Channel, Message};
use zenthor_db::repositories::{
    ApprovalStore, ConversationStore, JobQueue, MessageStore, RepositoryError,
};

const APPROVE_WORDS: &[&str] = &["YES", "Y", "APPROVE", "SIM"];
const REJECT_WORDS: &[&str] = &["NO", "N", "REJECT", "NAO", "NÃO"];

/// Interprets a whole message as an approval decision, if it is one.
pub fn parse_approval_reply(text: &str) -> Option<ApprovalStatus> {
    let normalized = text.trim().to_uppercase();
    if APPROVE_WORDS.contains(&normalized.as_str()) {
        Some(ApprovalStatus::Approved)
    } else if REJECT_WORDS.contains(&normalized.as_str()) {
        Some(ApprovalStatus::Rejected)
    } else {
        None
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum InboundOutcome {
    /// Sender is unknown or not allowed; nothing was stored beyond the contact.
    Ignored,
    ApprovalResolved(ToolApproval),
    Queued { message: Message, job: Job },
}

/// Stores a user message and queues a turn for it.
pub async fn submit_user_message(
    messages: &dyn MessageStore,
    jobs: &dyn JobQueue,
    conversation_id: &ConversationId,
    text: &str,
    channel: Channel,
) -> Result<(Message, Job), RepositoryError> {
    let message = messages.add_user_message(conversation_id, text, channel).await?;
    let job = jobs.enqueue(conversation_id, Some(&message.id)).await?;
    Ok((message, job))
}

/// Resolves the most recently requested pending approval of the conversation
/// when `text` is an approval reply. Returns `None` when the text is not a
/// reply or nothing is pending.
pub async fn resolve_approval_reply(
    approvals: &dyn ApprovalStore,
    conversation_id: &ConversationId,
    text: &str,
) -> Result<Option<ToolApproval>, RepositoryError> {
    let Some(status) = parse_approval_reply(text) else {
        return Ok(None);
    };
    let pending = approvals.get_pending_by_conversation(conversation_id).await?;
    let Some(newest) = pending.last() else {
        return Ok(None);
    };
    approvals.resolve(&newest.id, status).await
}

pub struct InboundHandler {
    conversations: Arc<dyn ConversationStore>,
    messages: Arc<dyn MessageStore>,
    approvals: Arc<dyn ApprovalStore>,
    jobs: Arc<dyn JobQueue>,
}

impl InboundHandler {
    pub fn new(
        conversations: Arc<dyn ConversationStore>,
        messages: Arc<dyn MessageStore>,
        approvals: Arc<dyn ApprovalStore>,
        jobs: Arc<dyn JobQueue>,
    ) -> Self {
        Self { conversations, messages, approvals, jobs }
    }

    /// Handles one text message received from `phone` on WhatsApp. Unknown
    /// senders are recorded as contacts that are not allowed yet.
    pub async fn handle_whatsapp(
        &self,
        phone: &str,
        text: &str,
    ) -> Result<InboundOutcome, RepositoryError> {
        let contact = match self.conversations.find_contact_by_phone(phone).await? {
            Some(contact) => contact,
            None => self.conversations.create_contact(phone, phone, false).await?,
        };
        if !contact.is_allowed {
            info!(
                event_name = "inbound.whatsapp.ignored",
                contact_id = %contact.id.0,
                "message from contact that is not allowed"
            );
            return Ok(InboundOutcome::Ignored);
        }

        let conversation =
            self.conversations.get_or_create_for_contact(&contact.id, Channel::WhatsApp).await?;

        if let Some(approval) =
            resolve_approval_reply(self.approvals.as_ref(), &conversation.id, text).await?
        {
            info!(
                event_name = "inbound.whatsapp.approval_resolved",
                conversation_id = %conversation.id.0,
                approval_id = %approval.id.0,
                status = approval.status.as_str(),
                "tool approval resolved by reply"
            );
            return Ok(InboundOutcome::ApprovalResolved(approval));
        }

        let (message, job) = submit_user_message(
            self.messages.as_ref(),
            self.jobs.as_ref(),
            &conversation.id,
            text,
            Channel::WhatsApp,
        )
        .await?;
        info!(
            event_name = "inbound.whatsapp.queued",
            conversation_id = %conversation.id.0,
            correlation_id = %job.id.0,
            "inbound message queued for processing"
        );
        Ok(InboundOutcome::Queued { message, job })
    }
}
