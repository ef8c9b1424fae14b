use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::conversation::ConversationId;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(pub String);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::System => "system",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "user" => Some(Self::User),
            "assistant" => Some(Self::Assistant),
            "system" => Some(Self::System),
            _ => None,
        }
    }
}

/// Delivery medium of a conversation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    /// Interactive session that renders partial output as it is produced.
    Web,
    /// Store-and-forward messaging; only complete replies are delivered.
    #[serde(rename = "whatsapp")]
    WhatsApp,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Web => "web",
            Self::WhatsApp => "whatsapp",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "web" => Some(Self::Web),
            "whatsapp" => Some(Self::WhatsApp),
            _ => None,
        }
    }

    pub fn supports_streaming(&self) -> bool {
        matches!(self, Self::Web)
    }

    pub fn is_store_and_forward(&self) -> bool {
        matches!(self, Self::WhatsApp)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Pending,
    Sent,
    Delivered,
    Failed,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Sent => "sent",
            Self::Delivered => "delivered",
            Self::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "pending" => Some(Self::Pending),
            "sent" => Some(Self::Sent),
            "delivered" => Some(Self::Delivered),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// A tool invocation recorded on an assistant message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRecord {
    pub name: String,
    pub input: Value,
}

/// Persisted conversation message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub role: Role,
    pub content: String,
    pub channel: Channel,
    pub tool_calls: Option<Vec<ToolCallRecord>>,
    pub streaming: bool,
    pub status: MessageStatus,
    pub created_at: DateTime<Utc>,
}

/// The role/content view of a message that is handed to the model.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self { role, content: content.into() }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }
}

impl From<&Message> for ChatMessage {
    fn from(message: &Message) -> Self {
        Self { role: message.role, content: message.content.clone() }
    }
}

#[cfg(test)]
mod tests {
    use super::{Channel, MessageStatus, Role};

    #[test]
    fn enums_round_trip_from_storage_encoding() {
        for role in [Role::User, Role::Assistant, Role::System] {
            assert_eq!(Role::parse(role.as_str()), Some(role));
        }
        for channel in [Channel::Web, Channel::WhatsApp] {
            assert_eq!(Channel::parse(channel.as_str()), Some(channel));
        }
        for status in
            [MessageStatus::Pending, MessageStatus::Sent, MessageStatus::Delivered, MessageStatus::Failed]
        {
            assert_eq!(MessageStatus::parse(status.as_str()), Some(status));
        }
    }

    #[test]
    fn only_web_streams_and_only_whatsapp_forwards() {
        assert!(Channel::Web.supports_streaming());
        assert!(!Channel::Web.is_store_and_forward());
        assert!(!Channel::WhatsApp.supports_streaming());
        assert!(Channel::WhatsApp.is_store_and_forward());
    }

    #[test]
    fn channel_serializes_with_storage_names() {
        assert_eq!(serde_json::to_string(&Channel::WhatsApp).ok().as_deref(), Some("\"whatsapp\""));
        assert_eq!(serde_json::to_string(&Channel::Web).ok().as_deref(), Some("\"web\""));
    }
}
