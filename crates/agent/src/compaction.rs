//! Collapses older conversation history into a single model-written summary.
//!
//! Triggered by message count alone; the token estimate from
//! `zenthor_core::context_guard` is a separate signal.

use tracing::info;

use zenthor_core::domain::message::ChatMessage;

use crate::failover::{run_with_fallback, ModelRunError, ModelSelection};
use crate::llm::{ModelGateway, ModelRequest, PromptMessage};

/// Histories at or below this many messages are left untouched.
pub const COMPACTION_THRESHOLD: usize = 50;

/// Most recent messages carried over verbatim after compaction.
pub const KEEP_RECENT: usize = 20;

pub const SUMMARIZER_INSTRUCTION: &str = "You are a conversation summarizer. Summarize the following conversation into a concise paragraph that preserves key facts, decisions, and context. Start with '[Conversation Summary]'.";

#[derive(Clone, Debug, PartialEq)]
pub struct CompactionResult {
    pub messages: Vec<ChatMessage>,
    pub summary: Option<String>,
}

pub fn needs_compaction(messages: &[ChatMessage]) -> bool {
    messages.len() > COMPACTION_THRESHOLD
}

/// Renders messages as `role: content` blocks separated by blank lines.
pub fn serialize_history(messages: &[ChatMessage]) -> String {
    messages
        .iter()
        .map(|message| format!("{}: {}", message.role.as_str(), message.content))
        .collect::<Vec<_>>()
        .join("\n\n")
}

pub fn summary_request(older: &[ChatMessage]) -> ModelRequest {
    ModelRequest {
        system: Some(SUMMARIZER_INSTRUCTION.to_string()),
        messages: vec![PromptMessage::User(serialize_history(older))],
        tools: Vec::new(),
    }
}

/// Returns `messages` unchanged when short enough; otherwise a summary
/// system message followed by the last [`KEEP_RECENT`] messages.
pub async fn compact(
    gateway: &dyn ModelGateway,
    models: &ModelSelection,
    messages: Vec<ChatMessage>,
) -> Result<CompactionResult, ModelRunError> {
    if !needs_compaction(&messages) {
        return Ok(CompactionResult { messages, summary: None });
    }

    let split = messages.len() - KEEP_RECENT;
    let mut older = messages;
    let recent = older.split_off(split);
    let request = summary_request(&older);

    let outcome = run_with_fallback(models, |model| {
        let request = &request;
        async move { gateway.complete(&model, request).await }
    })
    .await?;
    let summary = outcome.value.content;

    info!(
        event_name = "agent.compaction.completed",
        model = %outcome.model_used,
        summarized_messages = older.len(),
        kept_messages = recent.len(),
        "conversation history compacted"
    );

    let mut compacted = Vec::with_capacity(recent.len() + 1);
    compacted.push(ChatMessage::system(summary.clone()));
    compacted.extend(recent);

    Ok(CompactionResult { messages: compacted, summary: Some(summary) })
}

#[cfg(test)]
mod tests {
    use zenthor_core::domain::message::{ChatMessage, Role};
    use zenthor_core::errors::ModelError;

    use super::{compact, serialize_history, SUMMARIZER_INSTRUCTION};
    use crate::failover::ModelSelection;
    use crate::llm::testing::ScriptedGateway;
    use crate::llm::{ModelResponse, PromptMessage};

    fn history(count: usize) -> Vec<ChatMessage> {
        (0..count)
            .map(|index| {
                if index % 2 == 0 {
                    ChatMessage::user(format!("question {index}"))
                } else {
                    ChatMessage::assistant(format!("answer {index}"))
                }
            })
            .collect()
    }

    fn models() -> ModelSelection {
        ModelSelection::new("primary", Some("backup".to_string()))
    }

    #[tokio::test]
    async fn short_history_is_returned_unchanged() {
        let gateway = ScriptedGateway::default();
        let messages = history(50);

        let result = compact(&gateway, &models(), messages.clone()).await.expect("compact");

        assert_eq!(result.messages, messages);
        assert_eq!(result.summary, None);
        assert!(gateway.calls().is_empty());
    }

    #[tokio::test]
    async fn long_history_keeps_summary_plus_last_twenty() {
        let gateway =
            ScriptedGateway::new([Ok(ModelResponse::text("[Conversation Summary] all good"))]);
        let messages = history(60);

        let result = compact(&gateway, &models(), messages.clone()).await.expect("compact");

        assert_eq!(result.messages.len(), 21);
        assert_eq!(result.summary.as_deref(), Some("[Conversation Summary] all good"));
        assert_eq!(result.messages[0].role, Role::System);
        assert_eq!(result.messages[0].content, "[Conversation Summary] all good");
        assert_eq!(&result.messages[1..], &messages[40..]);

        let calls = gateway.calls();
        assert_eq!(calls.len(), 1);
        let (model, request) = &calls[0];
        assert_eq!(model, "primary");
        assert_eq!(request.system.as_deref(), Some(SUMMARIZER_INSTRUCTION));
        assert!(request.tools.is_empty());
        assert_eq!(request.messages, vec![PromptMessage::User(serialize_history(&messages[..40]))]);
    }

    #[tokio::test]
    async fn summarization_fails_over_to_the_fallback_model() {
        let gateway = ScriptedGateway::new([
            Err(ModelError::with_status(429, "busy")),
            Ok(ModelResponse::text("[Conversation Summary] via backup")),
        ]);

        let result = compact(&gateway, &models(), history(51)).await.expect("compact");

        assert_eq!(result.messages.len(), 21);
        assert_eq!(gateway.models_called(), vec!["primary", "backup"]);
    }

    #[tokio::test]
    async fn terminal_model_failure_propagates() {
        let gateway = ScriptedGateway::new([Err(ModelError::with_status(401, "bad key"))]);

        let error = compact(&gateway, &models(), history(55)).await.expect_err("auth is terminal");
        assert_eq!(error.model, "primary");
    }

    #[test]
    fn history_serializes_as_role_prefixed_blocks() {
        let rendered = serialize_history(&[ChatMessage::user("hi"), ChatMessage::assistant("hey")]);
        assert_eq!(rendered, "user: hi\n\nassistant: hey");
    }
}
