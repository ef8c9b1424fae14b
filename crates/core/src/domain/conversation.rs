use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::message::{Channel, Message};
use crate::tool_policy::ToolPolicy;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConversationId(pub String);

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContactId(pub String);

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SkillId(pub String);

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AgentId(pub String);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationStatus {
    Active,
    Archived,
}

impl ConversationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Archived => "archived",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "active" => Some(Self::Active),
            "archived" => Some(Self::Archived),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: ConversationId,
    pub channel: Channel,
    pub contact_id: Option<ContactId>,
    pub agent_id: Option<AgentId>,
    pub title: Option<String>,
    pub status: ConversationStatus,
    pub created_at: DateTime<Utc>,
}

/// External party on a store-and-forward channel.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contact {
    pub id: ContactId,
    pub phone: String,
    pub name: String,
    pub is_allowed: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkillConfig {
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub tool_policy: Option<ToolPolicy>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Skill {
    pub id: SkillId,
    pub name: String,
    pub description: String,
    pub enabled: bool,
    pub config: Option<SkillConfig>,
}

/// Persona and model selection for the agent answering a conversation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentProfile {
    pub id: AgentId,
    pub name: String,
    pub system_prompt: String,
    pub model: Option<String>,
    pub fallback_model: Option<String>,
    pub enabled: bool,
    pub tool_policy: Option<ToolPolicy>,
}

/// Everything the job loop needs to answer one turn.
#[derive(Clone, Debug, PartialEq)]
pub struct ConversationContext {
    pub conversation: Conversation,
    pub messages: Vec<Message>,
    pub skills: Vec<Skill>,
    pub contact: Option<Contact>,
    pub agent: Option<AgentProfile>,
}

impl ConversationContext {
    /// Phone number to forward replies to, when the conversation has one.
    pub fn recipient_phone(&self) -> Option<&str> {
        self.contact.as_ref().map(|contact| contact.phone.as_str()).filter(|phone| !phone.is_empty())
    }

    /// Tool policies contributed by the agent profile and the active skills.
    pub fn tool_policy_overrides(&self) -> Vec<ToolPolicy> {
        let agent_policy = self.agent.as_ref().and_then(|agent| agent.tool_policy.clone());
        let skill_policies = self
            .skills
            .iter()
            .filter(|skill| skill.enabled)
            .filter_map(|skill| skill.config.as_ref().and_then(|config| config.tool_policy.clone()));

        agent_policy.into_iter().chain(skill_policies).collect()
    }
}
