use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use zenthor_core::domain::message::{ChatMessage, Role, ToolCallRecord};
use zenthor_core::errors::ModelError;

/// Tool description advertised to the model.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

/// A tool invocation requested by the model in one step.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub input: Value,
}

impl ToolCall {
    pub fn record(&self) -> ToolCallRecord {
        ToolCallRecord { name: self.name.clone(), input: self.input.clone() }
    }
}

/// One entry of the transcript sent to the gateway.
#[derive(Clone, Debug, PartialEq)]
pub enum PromptMessage {
    System(String),
    User(String),
    Assistant { content: String, tool_calls: Vec<ToolCall> },
    Tool { call_id: String, name: String, content: String },
}

impl From<&ChatMessage> for PromptMessage {
    fn from(message: &ChatMessage) -> Self {
        match message.role {
            Role::System => Self::System(message.content.clone()),
            Role::User => Self::User(message.content.clone()),
            Role::Assistant => {
                Self::Assistant { content: message.content.clone(), tool_calls: Vec::new() }
            }
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ModelRequest {
    pub system: Option<String>,
    pub messages: Vec<PromptMessage>,
    pub tools: Vec<ToolDefinition>,
}

impl ModelRequest {
    pub fn new(system: impl Into<String>, history: &[ChatMessage]) -> Self {
        Self {
            system: Some(system.into()),
            messages: history.iter().map(PromptMessage::from).collect(),
            tools: Vec::new(),
        }
    }

    pub fn with_tools(mut self, tools: Vec<ToolDefinition>) -> Self {
        self.tools = tools;
        self
    }
}

/// Output of a single model round-trip.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ModelResponse {
    pub content: String,
    pub tool_calls: Vec<ToolCall>,
}

impl ModelResponse {
    pub fn text(content: impl Into<String>) -> Self {
        Self { content: content.into(), tool_calls: Vec::new() }
    }
}

/// Receives each text fragment as the model produces it.
pub type DeltaHandler<'a> = &'a (dyn Fn(&str) + Send + Sync);

/// Boundary to a chat-completions provider. One call is one step; tool
/// execution and failover happen above this trait.
#[async_trait]
pub trait ModelGateway: Send + Sync {
    async fn complete(
        &self,
        model: &str,
        request: &ModelRequest,
    ) -> Result<ModelResponse, ModelError>;

    async fn complete_streaming(
        &self,
        model: &str,
        request: &ModelRequest,
        on_delta: DeltaHandler<'_>,
    ) -> Result<ModelResponse, ModelError>;
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use async_trait::async_trait;

    use zenthor_core::errors::ModelError;

    use super::{DeltaHandler, ModelGateway, ModelRequest, ModelResponse};

    /// Gateway that replays queued outcomes in order and records every call.
    #[derive(Default)]
    pub struct ScriptedGateway {
        outcomes: Mutex<VecDeque<Result<ModelResponse, ModelError>>>,
        calls: Mutex<Vec<(String, ModelRequest)>>,
    }

    impl ScriptedGateway {
        pub fn new<I>(outcomes: I) -> Self
        where
            I: IntoIterator<Item = Result<ModelResponse, ModelError>>,
        {
            Self { outcomes: Mutex::new(outcomes.into_iter().collect()), calls: Mutex::default() }
        }

        pub fn calls(&self) -> Vec<(String, ModelRequest)> {
            self.calls.lock().map(|calls| calls.clone()).unwrap_or_default()
        }

        pub fn models_called(&self) -> Vec<String> {
            self.calls().into_iter().map(|(model, _)| model).collect()
        }

        fn next(&self, model: &str, request: &ModelRequest) -> Result<ModelResponse, ModelError> {
            if let Ok(mut calls) = self.calls.lock() {
                calls.push((model.to_string(), request.clone()));
            }
            self.outcomes
                .lock()
                .ok()
                .and_then(|mut outcomes| outcomes.pop_front())
                .unwrap_or_else(|| Err(ModelError::new("script exhausted")))
        }
    }

    #[async_trait]
    impl ModelGateway for ScriptedGateway {
        async fn complete(
            &self,
            model: &str,
            request: &ModelRequest,
        ) -> Result<ModelResponse, ModelError> {
            self.next(model, request)
        }

        async fn complete_streaming(
            &self,
            model: &str,
            request: &ModelRequest,
            on_delta: DeltaHandler<'_>,
        ) -> Result<ModelResponse, ModelError> {
            let response = self.next(model, request)?;
            // emit in two fragments so callers see accumulation
            let split = response.content.len() / 2;
            let split = (0..=split).rev().find(|index| response.content.is_char_boundary(*index));
            match split {
                Some(index) if index > 0 => {
                    on_delta(&response.content[..index]);
                    on_delta(&response.content[index..]);
                }
                _ if !response.content.is_empty() => on_delta(&response.content),
                _ => {}
            }
            Ok(response)
        }
    }
}
