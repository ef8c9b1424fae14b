use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, watch, RwLock};

use zenthor_core::domain::approval::{ApprovalId, ApprovalStatus, NewToolApproval, ToolApproval};
use zenthor_core::domain::conversation::{
    AgentId, AgentProfile, Contact, ContactId, Conversation, ConversationContext, ConversationId,
    ConversationStatus, Skill,
};
use zenthor_core::domain::job::{Job, JobId, JobStatus};
use zenthor_core::domain::message::{
    Channel, Message, MessageId, MessageStatus, Role, ToolCallRecord,
};
use zenthor_core::domain::schedule::{NewScheduledTask, ScheduledTask, ScheduledTaskId};

use super::{
    derive_title, new_id, ApprovalStore, ConversationStore, JobQueue, MessageDraft, MessageStore,
    RepositoryError, ScheduleStore, APPROVAL_EVENT_CAPACITY,
};

pub struct InMemoryJobQueue {
    jobs: RwLock<Vec<Job>>,
    notify: watch::Sender<u64>,
}

impl Default for InMemoryJobQueue {
    fn default() -> Self {
        let (notify, _) = watch::channel(0);
        Self { jobs: RwLock::new(Vec::new()), notify }
    }
}

impl InMemoryJobQueue {
    async fn set_status(&self, id: &JobId, status: JobStatus) -> Result<(), RepositoryError> {
        let mut jobs = self.jobs.write().await;
        let job = jobs
            .iter_mut()
            .find(|job| &job.id == id)
            .ok_or_else(|| RepositoryError::NotFound(format!("job `{}`", id.0)))?;
        job.status = status;
        job.updated_at = Utc::now();
        Ok(())
    }
}

#[async_trait::async_trait]
impl JobQueue for InMemoryJobQueue {
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

        self.jobs.write().await.push(job.clone());
        self.notify.send_modify(|version| *version = version.wrapping_add(1));
        Ok(job)
    }

    async fn pending_jobs(&self, limit: u32) -> Result<Vec<Job>, RepositoryError> {
        let jobs = self.jobs.read().await;
        Ok(jobs
            .iter()
            .filter(|job| job.status == JobStatus::Pending)
            .take(limit as usize)
            .cloned()
            .collect())
    }

    fn subscribe(&self) -> watch::Receiver<u64> {
        self.notify.subscribe()
    }

    async fn claim(&self, id: &JobId, worker_id: &str) -> Result<bool, RepositoryError> {
        let mut jobs = self.jobs.write().await;
        match jobs.iter_mut().find(|job| &job.id == id && job.status == JobStatus::Pending) {
            Some(job) => {
                job.status = JobStatus::Processing;
                job.claimed_by = Some(worker_id.to_string());
                job.updated_at = Utc::now();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn complete(&self, id: &JobId) -> Result<(), RepositoryError> {
        self.set_status(id, JobStatus::Completed).await
    }

    async fn fail(&self, id: &JobId) -> Result<(), RepositoryError> {
        self.set_status(id, JobStatus::Failed).await
    }

    async fn find(&self, id: &JobId) -> Result<Option<Job>, RepositoryError> {
        let jobs = self.jobs.read().await;
        Ok(jobs.iter().find(|job| &job.id == id).cloned())
    }

    async fn delete_completed_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, RepositoryError> {
        let mut jobs = self.jobs.write().await;
        let before = jobs.len();
        jobs.retain(|job| !(job.status == JobStatus::Completed && job.updated_at < cutoff));
        Ok((before - jobs.len()) as u64)
    }
}

#[derive(Default)]
struct ConversationTables {
    conversations: Vec<Conversation>,
    contacts: HashMap<String, Contact>,
    agents: HashMap<String, AgentProfile>,
    skills: Vec<Skill>,
    messages: Vec<Message>,
}

/// Conversations and messages share one lock so a context read is consistent.
#[derive(Default)]
pub struct InMemoryConversationRepository {
    tables: RwLock<ConversationTables>,
}

impl InMemoryConversationRepository {
    async fn insert_message(&self, draft: MessageDraft<'_>) -> Message {
        let message = draft.into_message();
        self.tables.write().await.messages.push(message.clone());
        message
    }

    async fn with_message<F>(&self, id: &MessageId, update: F) -> Result<(), RepositoryError>
    where
        F: FnOnce(&mut Message) + Send,
    {
        let mut tables = self.tables.write().await;
        let message = tables
            .messages
            .iter_mut()
            .find(|message| &message.id == id)
            .ok_or_else(|| RepositoryError::NotFound(format!("message `{}`", id.0)))?;
        update(message);
        Ok(())
    }
}

#[async_trait::async_trait]
impl ConversationStore for InMemoryConversationRepository {
    async fn get_conversation_context(
        &self,
        id: &ConversationId,
    ) -> Result<Option<ConversationContext>, RepositoryError> {
        let tables = self.tables.read().await;
        let Some(conversation) = tables.conversations.iter().find(|c| &c.id == id).cloned() else {
            return Ok(None);
        };

        let messages =
            tables.messages.iter().filter(|message| &message.conversation_id == id).cloned().collect();
        let skills = tables.skills.iter().filter(|skill| skill.enabled).cloned().collect();
        let contact = conversation
            .contact_id
            .as_ref()
            .and_then(|contact_id| tables.contacts.get(&contact_id.0))
            .cloned();
        let agent =
            conversation.agent_id.as_ref().and_then(|agent_id| tables.agents.get(&agent_id.0)).cloned();

        Ok(Some(ConversationContext { conversation, messages, skills, contact, agent }))
    }

    async fn find_conversation(
        &self,
        id: &ConversationId,
    ) -> Result<Option<Conversation>, RepositoryError> {
        let tables = self.tables.read().await;
        Ok(tables.conversations.iter().find(|conversation| &conversation.id == id).cloned())
    }

    async fn create_conversation(
        &self,
        channel: Channel,
        contact_id: Option<&ContactId>,
        agent_id: Option<&AgentId>,
    ) -> Result<Conversation, RepositoryError> {
        let conversation = Conversation {
            id: ConversationId(new_id("conv")),
            channel,
            contact_id: contact_id.cloned(),
            agent_id: agent_id.cloned(),
            title: None,
            status: ConversationStatus::Active,
            created_at: Utc::now(),
        };
        self.tables.write().await.conversations.push(conversation.clone());
        Ok(conversation)
    }

    async fn get_or_create_for_contact(
        &self,
        contact_id: &ContactId,
        channel: Channel,
    ) -> Result<Conversation, RepositoryError> {
        let existing = {
            let tables = self.tables.read().await;
            tables
                .conversations
                .iter()
                .rev()
                .find(|conversation| {
                    conversation.contact_id.as_ref() == Some(contact_id)
                        && conversation.channel == channel
                        && conversation.status == ConversationStatus::Active
                })
                .cloned()
        };

        match existing {
            Some(conversation) => Ok(conversation),
            None => self.create_conversation(channel, Some(contact_id), None).await,
        }
    }

    async fn find_contact_by_phone(&self, phone: &str) -> Result<Option<Contact>, RepositoryError> {
        let tables = self.tables.read().await;
        Ok(tables.contacts.values().find(|contact| contact.phone == phone).cloned())
    }

    async fn create_contact(
        &self,
        phone: &str,
        name: &str,
        is_allowed: bool,
    ) -> Result<Contact, RepositoryError> {
        let contact = Contact {
            id: ContactId(new_id("contact")),
            phone: phone.to_string(),
            name: name.to_string(),
            is_allowed,
        };
        self.tables.write().await.contacts.insert(contact.id.0.clone(), contact.clone());
        Ok(contact)
    }

    async fn save_agent(&self, agent: AgentProfile) -> Result<(), RepositoryError> {
        self.tables.write().await.agents.insert(agent.id.0.clone(), agent);
        Ok(())
    }

    async fn save_skill(&self, skill: Skill) -> Result<(), RepositoryError> {
        let mut tables = self.tables.write().await;
        match tables.skills.iter_mut().find(|existing| existing.id == skill.id) {
            Some(existing) => *existing = skill,
            None => tables.skills.push(skill),
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl MessageStore for InMemoryConversationRepository {
    async fn add_user_message(
        &self,
        conversation_id: &ConversationId,
        content: &str,
        channel: Channel,
    ) -> Result<Message, RepositoryError> {
        let message = self
            .insert_message(MessageDraft {
                conversation_id,
                role: Role::User,
                content,
                channel,
                tool_calls: None,
                streaming: false,
                status: MessageStatus::Sent,
            })
            .await;

        let mut tables = self.tables.write().await;
        if let Some(conversation) =
            tables.conversations.iter_mut().find(|conversation| &conversation.id == conversation_id)
        {
            if conversation.title.is_none() {
                conversation.title = derive_title(content);
            }
        }
        Ok(message)
    }

    async fn add_summary_message(
        &self,
        conversation_id: &ConversationId,
        content: &str,
        channel: Channel,
    ) -> Result<Message, RepositoryError> {
        Ok(self
            .insert_message(MessageDraft {
                conversation_id,
                role: Role::System,
                content,
                channel,
                tool_calls: None,
                streaming: false,
                status: MessageStatus::Sent,
            })
            .await)
    }

    async fn create_placeholder(
        &self,
        conversation_id: &ConversationId,
        channel: Channel,
    ) -> Result<MessageId, RepositoryError> {
        let message = self
            .insert_message(MessageDraft {
                conversation_id,
                role: Role::Assistant,
                content: "",
                channel,
                tool_calls: None,
                streaming: true,
                status: MessageStatus::Pending,
            })
            .await;
        Ok(message.id)
    }

    async fn update_streaming_content(
        &self,
        id: &MessageId,
        content: &str,
    ) -> Result<(), RepositoryError> {
        let content = content.to_string();
        self.with_message(id, move |message| {
            if message.streaming {
                message.content = content;
            }
        })
        .await
    }

    async fn finalize_message(
        &self,
        id: &MessageId,
        content: &str,
        tool_calls: Option<Vec<ToolCallRecord>>,
    ) -> Result<(), RepositoryError> {
        let content = content.to_string();
        self.with_message(id, move |message| {
            message.content = content;
            message.tool_calls = tool_calls;
            message.streaming = false;
            message.status = MessageStatus::Sent;
        })
        .await
    }

    async fn add_assistant_message(
        &self,
        conversation_id: &ConversationId,
        content: &str,
        channel: Channel,
        tool_calls: Option<Vec<ToolCallRecord>>,
    ) -> Result<Message, RepositoryError> {
        Ok(self
            .insert_message(MessageDraft {
                conversation_id,
                role: Role::Assistant,
                content,
                channel,
                tool_calls,
                streaming: false,
                status: MessageStatus::Sent,
            })
            .await)
    }

    async fn update_status(
        &self,
        id: &MessageId,
        status: MessageStatus,
    ) -> Result<(), RepositoryError> {
        self.with_message(id, move |message| message.status = status).await
    }

    async fn list_for_conversation(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Vec<Message>, RepositoryError> {
        let tables = self.tables.read().await;
        Ok(tables
            .messages
            .iter()
            .filter(|message| &message.conversation_id == conversation_id)
            .cloned()
            .collect())
    }
}

pub struct InMemoryApprovalRepository {
    approvals: RwLock<Vec<ToolApproval>>,
    events: broadcast::Sender<ApprovalId>,
}

impl Default for InMemoryApprovalRepository {
    fn default() -> Self {
        let (events, _) = broadcast::channel(APPROVAL_EVENT_CAPACITY);
        Self { approvals: RwLock::new(Vec::new()), events }
    }
}

impl InMemoryApprovalRepository {
    /// Drops a record without publishing anything.
    pub async fn remove(&self, id: &ApprovalId) {
        self.approvals.write().await.retain(|approval| &approval.id != id);
    }

    async fn matching<F>(&self, predicate: F) -> Vec<ToolApproval>
    where
        F: Fn(&ToolApproval) -> bool,
    {
        let approvals = self.approvals.read().await;
        approvals.iter().filter(|approval| predicate(approval)).cloned().collect()
    }
}

#[async_trait::async_trait]
impl ApprovalStore for InMemoryApprovalRepository {
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
        self.approvals.write().await.push(approval.clone());
        Ok(approval)
    }

    async fn find(&self, id: &ApprovalId) -> Result<Option<ToolApproval>, RepositoryError> {
        Ok(self.matching(|approval| &approval.id == id).await.into_iter().next())
    }

    async fn get_pending_by_job(
        &self,
        job_id: &JobId,
    ) -> Result<Vec<ToolApproval>, RepositoryError> {
        Ok(self.matching(|approval| &approval.job_id == job_id && approval.is_pending()).await)
    }

    async fn get_by_job(&self, job_id: &JobId) -> Result<Vec<ToolApproval>, RepositoryError> {
        Ok(self.matching(|approval| &approval.job_id == job_id).await)
    }

    async fn get_pending_by_conversation(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Vec<ToolApproval>, RepositoryError> {
        Ok(self
            .matching(|approval| {
                &approval.conversation_id == conversation_id && approval.is_pending()
            })
            .await)
    }

    async fn list_pending(&self) -> Result<Vec<ToolApproval>, RepositoryError> {
        Ok(self.matching(ToolApproval::is_pending).await)
    }

    async fn resolve(
        &self,
        id: &ApprovalId,
        status: ApprovalStatus,
    ) -> Result<Option<ToolApproval>, RepositoryError> {
        if status == ApprovalStatus::Pending {
            return Ok(None);
        }

        let resolved = {
            let mut approvals = self.approvals.write().await;
            match approvals.iter_mut().find(|approval| &approval.id == id && approval.is_pending()) {
                Some(approval) => {
                    approval.status = status;
                    approval.resolved_at = Some(Utc::now());
                    approval.clone()
                }
                None => return Ok(None),
            }
        };

        let _ = self.events.send(id.clone());
        Ok(Some(resolved))
    }

    fn subscribe(&self) -> broadcast::Receiver<ApprovalId> {
        self.events.subscribe()
    }
}

#[derive(Default)]
pub struct InMemoryScheduleRepository {
    tasks: RwLock<Vec<ScheduledTask>>,
}

#[async_trait::async_trait]
impl ScheduleStore for InMemoryScheduleRepository {
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
        self.tasks.write().await.push(task.clone());
        Ok(task)
    }

    async fn find(&self, id: &ScheduledTaskId) -> Result<Option<ScheduledTask>, RepositoryError> {
        let tasks = self.tasks.read().await;
        Ok(tasks.iter().find(|task| &task.id == id).cloned())
    }

    async fn due(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<ScheduledTask>, RepositoryError> {
        let tasks = self.tasks.read().await;
        let mut due: Vec<ScheduledTask> =
            tasks.iter().filter(|task| task.is_due(now)).cloned().collect();
        due.sort_by_key(|task| task.next_run_at);
        due.truncate(limit as usize);
        Ok(due)
    }

    async fn record_run(
        &self,
        id: &ScheduledTaskId,
        ran_at: DateTime<Utc>,
    ) -> Result<(), RepositoryError> {
        let mut tasks = self.tasks.write().await;
        let task = tasks
            .iter_mut()
            .find(|task| &task.id == id)
            .ok_or_else(|| RepositoryError::NotFound(format!("scheduled task `{}`", id.0)))?;
        task.last_run_at = Some(ran_at);
        task.next_run_at = ran_at + task.interval();
        Ok(())
    }

    async fn list_for_conversation(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Vec<ScheduledTask>, RepositoryError> {
        let tasks = self.tasks.read().await;
        Ok(tasks.iter().filter(|task| &task.conversation_id == conversation_id).cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};
    use serde_json::json;

    use zenthor_core::domain::approval::{ApprovalStatus, NewToolApproval};
    use zenthor_core::domain::job::{JobId, JobStatus};
    use zenthor_core::domain::message::{Channel, MessageStatus};
    use zenthor_core::domain::schedule::NewScheduledTask;

    use crate::repositories::{
        ApprovalStore, ConversationStore, InMemoryApprovalRepository,
        InMemoryConversationRepository, InMemoryJobQueue, InMemoryScheduleRepository, JobQueue,
        MessageStore, ScheduleStore,
    };

    #[tokio::test]
    async fn in_memory_claim_is_exclusive() {
        let queue = InMemoryJobQueue::default();
        let repo = InMemoryConversationRepository::default();
        let conversation = repo.create_conversation(Channel::Web, None, None).await.expect("conv");
        let job = queue.enqueue(&conversation.id, None).await.expect("enqueue");

        assert!(queue.claim(&job.id, "worker-a").await.expect("claim"));
        assert!(!queue.claim(&job.id, "worker-b").await.expect("claim again"));
        assert!(!queue.claim(&JobId("job-missing".to_string()), "worker-a").await.expect("claim"));

        queue.complete(&job.id).await.expect("complete");
        let stored = queue.find(&job.id).await.expect("find").expect("exists");
        assert_eq!(stored.status, JobStatus::Completed);
        assert_eq!(stored.claimed_by.as_deref(), Some("worker-a"));
    }

    #[tokio::test]
    async fn in_memory_messages_follow_placeholder_lifecycle() {
        let repo = InMemoryConversationRepository::default();
        let conversation = repo.create_conversation(Channel::Web, None, None).await.expect("conv");
        repo.add_user_message(&conversation.id, "what time is it?", Channel::Web)
            .await
            .expect("user message");

        let placeholder =
            repo.create_placeholder(&conversation.id, Channel::Web).await.expect("placeholder");
        repo.update_streaming_content(&placeholder, "It is").await.expect("stream");
        repo.finalize_message(&placeholder, "It is noon.", None).await.expect("finalize");
        repo.update_streaming_content(&placeholder, "It is").await.expect("late write");

        let messages = repo.list_for_conversation(&conversation.id).await.expect("list");
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1].content, "It is noon.");
        assert_eq!(messages[1].status, MessageStatus::Sent);
        assert!(!messages[1].streaming);

        let context = repo
            .get_conversation_context(&conversation.id)
            .await
            .expect("context")
            .expect("exists");
        assert_eq!(context.conversation.title.as_deref(), Some("what time is it?"));
    }

    #[tokio::test]
    async fn in_memory_approval_resolves_once_and_publishes() {
        let repo = InMemoryApprovalRepository::default();
        let mut events = repo.subscribe();
        let approval = repo
            .create(NewToolApproval {
                job_id: JobId("job-1".to_string()),
                conversation_id: zenthor_core::domain::conversation::ConversationId(
                    "conv-1".to_string(),
                ),
                tool_name: "browse_url".to_string(),
                tool_input: json!({"url": "https://example.com"}),
                channel: Channel::Web,
            })
            .await
            .expect("create");

        let resolved = repo.resolve(&approval.id, ApprovalStatus::Rejected).await.expect("resolve");
        assert_eq!(resolved.map(|approval| approval.status), Some(ApprovalStatus::Rejected));
        assert_eq!(events.try_recv().expect("event"), approval.id);

        assert!(repo.resolve(&approval.id, ApprovalStatus::Approved).await.expect("again").is_none());
        assert!(repo.list_pending().await.expect("pending").is_empty());
    }

    #[tokio::test]
    async fn in_memory_pending_by_job_lists_every_open_record() {
        let repo = InMemoryApprovalRepository::default();
        let request = NewToolApproval {
            job_id: JobId("job-1".to_string()),
            conversation_id: zenthor_core::domain::conversation::ConversationId(
                "conv-1".to_string(),
            ),
            tool_name: "browse_url".to_string(),
            tool_input: json!({}),
            channel: Channel::WhatsApp,
        };
        let first = repo.create(request.clone()).await.expect("first");
        let second = repo.create(request.clone()).await.expect("second");
        repo.create(NewToolApproval { job_id: JobId("job-2".to_string()), ..request })
            .await
            .expect("other job");

        let pending = repo.get_pending_by_job(&JobId("job-1".to_string())).await.expect("pending");
        assert_eq!(pending, vec![first.clone(), second.clone()]);

        repo.resolve(&first.id, ApprovalStatus::Approved).await.expect("resolve");
        let pending = repo.get_pending_by_job(&JobId("job-1".to_string())).await.expect("pending");
        assert_eq!(pending, vec![second]);
    }

    #[tokio::test]
    async fn in_memory_cleanup_keeps_failed_and_recent_jobs() {
        let queue = InMemoryJobQueue::default();
        let repo = InMemoryConversationRepository::default();
        let conversation = repo.create_conversation(Channel::Web, None, None).await.expect("conv");
        let done = queue.enqueue(&conversation.id, None).await.expect("enqueue");
        let broken = queue.enqueue(&conversation.id, None).await.expect("enqueue");
        queue.complete(&done.id).await.expect("complete");
        queue.fail(&broken.id).await.expect("fail");

        let week_ago = Utc::now() - Duration::days(7);
        assert_eq!(queue.delete_completed_before(week_ago).await.expect("cleanup"), 0);

        let later = Utc::now() + Duration::seconds(1);
        assert_eq!(queue.delete_completed_before(later).await.expect("cleanup"), 1);
        assert!(queue.find(&done.id).await.expect("find").is_none());
        assert!(queue.find(&broken.id).await.expect("find").is_some());
    }

    #[tokio::test]
    async fn in_memory_schedule_advances_after_each_run() {
        let repo = InMemoryScheduleRepository::default();
        let conversation_id =
            zenthor_core::domain::conversation::ConversationId("conv-1".to_string());
        let task = repo
            .create(NewScheduledTask {
                conversation_id: conversation_id.clone(),
                name: "standup".to_string(),
                description: None,
                interval_minutes: 30,
                payload: "Post the standup reminder".to_string(),
            })
            .await
            .expect("create");

        assert!(repo.due(task.created_at, 10).await.expect("due").is_empty());
        let due = repo.due(task.next_run_at, 10).await.expect("due");
        assert_eq!(due, vec![task.clone()]);

        repo.record_run(&task.id, task.next_run_at).await.expect("record run");
        let stored = repo.find(&task.id).await.expect("find").expect("exists");
        assert_eq!(stored.last_run_at, Some(task.next_run_at));
        assert_eq!(stored.next_run_at, task.next_run_at + Duration::minutes(30));
        assert!(repo.due(task.next_run_at, 10).await.expect("due").is_empty());
        assert_eq!(repo.list_for_conversation(&conversation_id).await.expect("list").len(), 1);
    }
}
