use chrono::Utc;
use sqlx::{sqlite::SqliteRow, Row};

use zenthor_core::domain::conversation::{
    AgentId, AgentProfile, Contact, ContactId, Conversation, ConversationContext, ConversationId,
    ConversationStatus, Skill, SkillConfig, SkillId,
};
use zenthor_core::domain::message::{
    Channel, Message, MessageId, MessageStatus, Role, ToolCallRecord,
};
use zenthor_core::tool_policy::ToolPolicy;

use super::decode::{encode_optional_json, parse_enum, parse_optional_json, parse_timestamp};
use super::{
    derive_title, new_id, ConversationStore, MessageDraft, MessageStore, RepositoryError,
};
use crate::DbPool;

const CONVERSATION_COLUMNS: &str = "id, channel, contact_id, agent_id, title, status, created_at";
const MESSAGE_COLUMNS: &str =
    "id, conversation_id, role, content, channel, tool_calls_json, streaming, status, created_at";

/// Conversations, their participants and their messages.
pub struct SqlConversationRepository {
    pool: DbPool,
}

impl SqlConversationRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    async fn find_contact(&self, id: &ContactId) -> Result<Option<Contact>, RepositoryError> {
        let row = sqlx::query("SELECT id, phone, name, is_allowed FROM contact WHERE id = ?")
            .bind(&id.0)
            .fetch_optional(&self.pool)
            .await?;

        row.map(contact_from_row).transpose()
    }

    async fn find_agent(&self, id: &AgentId) -> Result<Option<AgentProfile>, RepositoryError> {
        let row = sqlx::query(
            "SELECT id, name, system_prompt, model, fallback_model, enabled, tool_policy_json
             FROM agent_profile
             WHERE id = ?",
        )
        .bind(&id.0)
        .fetch_optional(&self.pool)
        .await?;

        row.map(agent_from_row).transpose()
    }

    async fn enabled_skills(&self) -> Result<Vec<Skill>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT id, name, description, enabled, config_json
             FROM skill
             WHERE enabled = 1
             ORDER BY created_at ASC, rowid ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(skill_from_row).collect()
    }

    async fn insert_message(&self, draft: MessageDraft<'_>) -> Result<Message, RepositoryError> {
        let message = draft.into_message();
        let tool_calls_json = encode_optional_json("tool_calls_json", message.tool_calls.as_ref())?;

        sqlx::query(
            "INSERT INTO message (
                id, conversation_id, role, content, channel, tool_calls_json, streaming, status, created_at, seq
             ) VALUES (
                ?, ?, ?, ?, ?, ?, ?, ?, ?,
                (SELECT COALESCE(MAX(seq), 0) + 1 FROM message WHERE conversation_id = ?)
             )",
        )
        .bind(&message.id.0)
        .bind(&message.conversation_id.0)
        .bind(message.role.as_str())
        .bind(&message.content)
        .bind(message.channel.as_str())
        .bind(tool_calls_json)
        .bind(message.streaming)
        .bind(message.status.as_str())
        .bind(message.created_at.to_rfc3339())
        .bind(&message.conversation_id.0)
        .execute(&self.pool)
        .await?;

        Ok(message)
    }
}

#[async_trait::async_trait]
impl ConversationStore for SqlConversationRepository {
    async fn get_conversation_context(
        &self,
        id: &ConversationId,
    ) -> Result<Option<ConversationContext>, RepositoryError> {
        let Some(conversation) = self.find_conversation(id).await? else {
            return Ok(None);
        };

        let messages = self.list_for_conversation(id).await?;
        let skills = self.enabled_skills().await?;
        let contact = match &conversation.contact_id {
            Some(contact_id) => self.find_contact(contact_id).await?,
            None => None,
        };
        let agent = match &conversation.agent_id {
            Some(agent_id) => self.find_agent(agent_id).await?,
            None => None,
        };

        Ok(Some(ConversationContext { conversation, messages, skills, contact, agent }))
    }

    async fn find_conversation(
        &self,
        id: &ConversationId,
    ) -> Result<Option<Conversation>, RepositoryError> {
        let row =
            sqlx::query(&format!("SELECT {CONVERSATION_COLUMNS} FROM conversation WHERE id = ?"))
                .bind(&id.0)
                .fetch_optional(&self.pool)
                .await?;

        row.map(conversation_from_row).transpose()
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

        sqlx::query(
            "INSERT INTO conversation (id, channel, contact_id, agent_id, title, status, created_at)
             VALUES (?, ?, ?, ?, NULL, ?, ?)",
        )
        .bind(&conversation.id.0)
        .bind(conversation.channel.as_str())
        .bind(conversation.contact_id.as_ref().map(|id| id.0.as_str()))
        .bind(conversation.agent_id.as_ref().map(|id| id.0.as_str()))
        .bind(conversation.status.as_str())
        .bind(conversation.created_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(conversation)
    }

    async fn get_or_create_for_contact(
        &self,
        contact_id: &ContactId,
        channel: Channel,
    ) -> Result<Conversation, RepositoryError> {
        let row = sqlx::query(&format!(
            "SELECT {CONVERSATION_COLUMNS} FROM conversation
             WHERE contact_id = ? AND channel = ? AND status = 'active'
             ORDER BY created_at DESC, rowid DESC
             LIMIT 1"
        ))
        .bind(&contact_id.0)
        .bind(channel.as_str())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => conversation_from_row(row),
            None => self.create_conversation(channel, Some(contact_id), None).await,
        }
    }

    async fn find_contact_by_phone(&self, phone: &str) -> Result<Option<Contact>, RepositoryError> {
        let row = sqlx::query("SELECT id, phone, name, is_allowed FROM contact WHERE phone = ?")
            .bind(phone)
            .fetch_optional(&self.pool)
            .await?;

        row.map(contact_from_row).transpose()
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

        sqlx::query(
            "INSERT INTO contact (id, phone, name, is_allowed, created_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&contact.id.0)
        .bind(&contact.phone)
        .bind(&contact.name)
        .bind(contact.is_allowed)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(contact)
    }

    async fn save_agent(&self, agent: AgentProfile) -> Result<(), RepositoryError> {
        let tool_policy_json = encode_optional_json("tool_policy_json", agent.tool_policy.as_ref())?;

        sqlx::query(
            "INSERT INTO agent_profile (
                id, name, system_prompt, model, fallback_model, enabled, tool_policy_json, created_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                system_prompt = excluded.system_prompt,
                model = excluded.model,
                fallback_model = excluded.fallback_model,
                enabled = excluded.enabled,
                tool_policy_json = excluded.tool_policy_json",
        )
        .bind(&agent.id.0)
        .bind(&agent.name)
        .bind(&agent.system_prompt)
        .bind(agent.model.as_deref())
        .bind(agent.fallback_model.as_deref())
        .bind(agent.enabled)
        .bind(tool_policy_json)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn save_skill(&self, skill: Skill) -> Result<(), RepositoryError> {
        let config_json = encode_optional_json("config_json", skill.config.as_ref())?;

        sqlx::query(
            "INSERT INTO skill (id, name, description, enabled, config_json, created_at)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                description = excluded.description,
                enabled = excluded.enabled,
                config_json = excluded.config_json",
        )
        .bind(&skill.id.0)
        .bind(&skill.name)
        .bind(&skill.description)
        .bind(skill.enabled)
        .bind(config_json)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[async_trait::async_trait]
impl MessageStore for SqlConversationRepository {
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
            .await?;

        if let Some(title) = derive_title(content) {
            sqlx::query("UPDATE conversation SET title = ? WHERE id = ? AND title IS NULL")
                .bind(title)
                .bind(&conversation_id.0)
                .execute(&self.pool)
                .await?;
        }

        Ok(message)
    }

    async fn add_summary_message(
        &self,
        conversation_id: &ConversationId,
        content: &str,
        channel: Channel,
    ) -> Result<Message, RepositoryError> {
        self.insert_message(MessageDraft {
            conversation_id,
            role: Role::System,
            content,
            channel,
            tool_calls: None,
            streaming: false,
            status: MessageStatus::Sent,
        })
        .await
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
            .await?;

        Ok(message.id)
    }

    async fn update_streaming_content(
        &self,
        id: &MessageId,
        content: &str,
    ) -> Result<(), RepositoryError> {
        // finalized messages are left untouched
        sqlx::query("UPDATE message SET content = ? WHERE id = ? AND streaming = 1")
            .bind(content)
            .bind(&id.0)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn finalize_message(
        &self,
        id: &MessageId,
        content: &str,
        tool_calls: Option<Vec<ToolCallRecord>>,
    ) -> Result<(), RepositoryError> {
        let tool_calls_json = encode_optional_json("tool_calls_json", tool_calls.as_ref())?;

        let result = sqlx::query(
            "UPDATE message
             SET content = ?, tool_calls_json = ?, streaming = 0, status = 'sent'
             WHERE id = ?",
        )
        .bind(content)
        .bind(tool_calls_json)
        .bind(&id.0)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound(format!("message `{}`", id.0)));
        }
        Ok(())
    }

    async fn add_assistant_message(
        &self,
        conversation_id: &ConversationId,
        content: &str,
        channel: Channel,
        tool_calls: Option<Vec<ToolCallRecord>>,
    ) -> Result<Message, RepositoryError> {
        self.insert_message(MessageDraft {
            conversation_id,
            role: Role::Assistant,
            content,
            channel,
            tool_calls,
            streaming: false,
            status: MessageStatus::Sent,
        })
        .await
    }

    async fn update_status(
        &self,
        id: &MessageId,
        status: MessageStatus,
    ) -> Result<(), RepositoryError> {
        let result = sqlx::query("UPDATE message SET status = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(&id.0)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound(format!("message `{}`", id.0)));
        }
        Ok(())
    }

    async fn list_for_conversation(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Vec<Message>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM message WHERE conversation_id = ? ORDER BY seq ASC"
        ))
        .bind(&conversation_id.0)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(message_from_row).collect()
    }
}

fn conversation_from_row(row: SqliteRow) -> Result<Conversation, RepositoryError> {
    Ok(Conversation {
        id: ConversationId(row.try_get("id")?),
        channel: parse_enum("channel", row.try_get("channel")?, Channel::parse)?,
        contact_id: row.try_get::<Option<String>, _>("contact_id")?.map(ContactId),
        agent_id: row.try_get::<Option<String>, _>("agent_id")?.map(AgentId),
        title: row.try_get("title")?,
        status: parse_enum(
            "conversation status",
            row.try_get("status")?,
            ConversationStatus::parse,
        )?,
        created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
    })
}

fn message_from_row(row: SqliteRow) -> Result<Message, RepositoryError> {
    Ok(Message {
        id: MessageId(row.try_get("id")?),
        conversation_id: ConversationId(row.try_get("conversation_id")?),
        role: parse_enum("role", row.try_get("role")?, Role::parse)?,
        content: row.try_get("content")?,
        channel: parse_enum("channel", row.try_get("channel")?, Channel::parse)?,
        tool_calls: parse_optional_json::<Vec<ToolCallRecord>>(
            "tool_calls_json",
            row.try_get("tool_calls_json")?,
        )?,
        streaming: row.try_get("streaming")?,
        status: parse_enum("message status", row.try_get("status")?, MessageStatus::parse)?,
        created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
    })
}

fn contact_from_row(row: SqliteRow) -> Result<Contact, RepositoryError> {
    Ok(Contact {
        id: ContactId(row.try_get("id")?),
        phone: row.try_get("phone")?,
        name: row.try_get("name")?,
        is_allowed: row.try_get("is_allowed")?,
    })
}

fn agent_from_row(row: SqliteRow) -> Result<AgentProfile, RepositoryError> {
    Ok(AgentProfile {
        id: AgentId(row.try_get("id")?),
        name: row.try_get("name")?,
        system_prompt: row.try_get("system_prompt")?,
        model: row.try_get("model")?,
        fallback_model: row.try_get("fallback_model")?,
        enabled: row.try_get("enabled")?,
        tool_policy: parse_optional_json::<ToolPolicy>(
            "tool_policy_json",
            row.try_get("tool_policy_json")?,
        )?,
    })
}

fn skill_from_row(row: SqliteRow) -> Result<Skill, RepositoryError> {
    Ok(Skill {
        id: SkillId(row.try_get("id")?),
        name: row.try_get("name")?,
        description: row.try_get("description")?,
        enabled: row.try_get("enabled")?,
        config: parse_optional_json::<SkillConfig>("config_json", row.try_get("config_json")?)?,
    })
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use zenthor_core::domain::conversation::{AgentId, AgentProfile, Skill, SkillConfig, SkillId};
    use zenthor_core::domain::message::{Channel, MessageStatus, Role, ToolCallRecord};
    use zenthor_core::tool_policy::ToolPolicy;

    use super::SqlConversationRepository;
    use crate::migrations;
    use crate::repositories::{ConversationStore, MessageStore};
    use crate::{connect_with_settings, DbPool};

    #[tokio::test]
    async fn context_includes_messages_contact_agent_and_enabled_skills() {
        let pool = setup_pool().await;
        let repo = SqlConversationRepository::new(pool.clone());

        let contact = repo.create_contact("+5511999990000", "Ana", true).await.expect("contact");
        let agent = AgentProfile {
            id: AgentId("agent-support".to_string()),
            name: "Support".to_string(),
            system_prompt: "You help with support requests.".to_string(),
            model: Some("gpt-4o".to_string()),
            fallback_model: Some("gpt-4o-mini".to_string()),
            enabled: true,
            tool_policy: Some(ToolPolicy::deny(["browse_url"])),
        };
        repo.save_agent(agent.clone()).await.expect("save agent");
        let skill = Skill {
            id: SkillId("skill-weather".to_string()),
            name: "weather".to_string(),
            description: "Weather lookups".to_string(),
            enabled: true,
            config: Some(SkillConfig {
                system_prompt: Some("Report in Celsius.".to_string()),
                tool_policy: Some(ToolPolicy::allow(["current_time"])),
            }),
        };
        repo.save_skill(skill.clone()).await.expect("save skill");
        repo.save_skill(Skill {
            id: SkillId("skill-off".to_string()),
            name: "off".to_string(),
            description: "disabled".to_string(),
            enabled: false,
            config: None,
        })
        .await
        .expect("save disabled skill");

        let conversation = repo
            .create_conversation(Channel::WhatsApp, Some(&contact.id), Some(&agent.id))
            .await
            .expect("conversation");
        repo.add_user_message(&conversation.id, "hello", Channel::WhatsApp).await.expect("user");
        repo.add_assistant_message(&conversation.id, "hi!", Channel::WhatsApp, None)
            .await
            .expect("assistant");

        let context = repo
            .get_conversation_context(&conversation.id)
            .await
            .expect("context")
            .expect("context exists");

        assert_eq!(context.conversation.title.as_deref(), Some("hello"));
        assert_eq!(context.messages.len(), 2);
        assert_eq!(context.messages[0].role, Role::User);
        assert_eq!(context.messages[1].role, Role::Assistant);
        assert_eq!(context.contact, Some(contact));
        assert_eq!(context.agent, Some(agent));
        assert_eq!(context.skills, vec![skill]);
        assert_eq!(context.recipient_phone(), Some("+5511999990000"));

        pool.close().await;
    }

    #[tokio::test]
    async fn missing_conversation_has_no_context() {
        let pool = setup_pool().await;
        let repo = SqlConversationRepository::new(pool.clone());

        let context = repo
            .get_conversation_context(&zenthor_core::domain::conversation::ConversationId(
                "conv-missing".to_string(),
            ))
            .await
            .expect("query");

        assert!(context.is_none());
        pool.close().await;
    }

    #[tokio::test]
    async fn title_is_set_only_from_first_user_message() {
        let pool = setup_pool().await;
        let repo = SqlConversationRepository::new(pool.clone());
        let conversation =
            repo.create_conversation(Channel::Web, None, None).await.expect("conversation");

        let long = "x".repeat(80);
        repo.add_user_message(&conversation.id, &long, Channel::Web).await.expect("first");
        repo.add_user_message(&conversation.id, "second", Channel::Web).await.expect("second");

        let stored = repo
            .find_conversation(&conversation.id)
            .await
            .expect("find")
            .expect("conversation exists");
        assert_eq!(stored.title, Some("x".repeat(50)));

        pool.close().await;
    }

    #[tokio::test]
    async fn placeholder_streams_then_finalizes() {
        let pool = setup_pool().await;
        let repo = SqlConversationRepository::new(pool.clone());
        let conversation =
            repo.create_conversation(Channel::Web, None, None).await.expect("conversation");

        let placeholder =
            repo.create_placeholder(&conversation.id, Channel::Web).await.expect("placeholder");
        repo.update_streaming_content(&placeholder, "Hel").await.expect("stream");

        let messages = repo.list_for_conversation(&conversation.id).await.expect("list");
        assert_eq!(messages[0].content, "Hel");
        assert!(messages[0].streaming);
        assert_eq!(messages[0].status, MessageStatus::Pending);

        let tool_calls = vec![ToolCallRecord {
            name: "current_time".to_string(),
            input: json!({"timezone": "UTC"}),
        }];
        repo.finalize_message(&placeholder, "Hello", Some(tool_calls.clone()))
            .await
            .expect("finalize");
        repo.update_streaming_content(&placeholder, "stale").await.expect("late stream write");

        let messages = repo.list_for_conversation(&conversation.id).await.expect("list");
        assert_eq!(messages[0].content, "Hello");
        assert!(!messages[0].streaming);
        assert_eq!(messages[0].status, MessageStatus::Sent);
        assert_eq!(messages[0].tool_calls, Some(tool_calls));

        pool.close().await;
    }

    #[tokio::test]
    async fn contact_conversation_is_reused() {
        let pool = setup_pool().await;
        let repo = SqlConversationRepository::new(pool.clone());
        let contact = repo.create_contact("+15550001111", "Bo", true).await.expect("contact");

        let first = repo
            .get_or_create_for_contact(&contact.id, Channel::WhatsApp)
            .await
            .expect("first");
        let second = repo
            .get_or_create_for_contact(&contact.id, Channel::WhatsApp)
            .await
            .expect("second");

        assert_eq!(first.id, second.id);
        assert_eq!(
            repo.find_contact_by_phone("+15550001111").await.expect("find"),
            Some(contact)
        );

        pool.close().await;
    }

    async fn setup_pool() -> DbPool {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect test pool");
        migrations::run_pending(&pool).await.expect("run migrations");
        pool
    }
}
