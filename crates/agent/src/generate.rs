use std::sync::{Arc, Mutex};

use serde_json::Value;
use tracing::{debug, warn};

use zenthor_core::domain::message::{ChatMessage, ToolCallRecord};
use zenthor_core::errors::ModelError;

use crate::failover::{run_with_fallback, ModelRunError, ModelSelection};
use crate::llm::{ModelGateway, ModelRequest, ModelResponse, PromptMessage, ToolCall};
use crate::tools::ToolRegistry;

/// Inputs of one assistant turn.
pub struct Turn<'a> {
    pub system_prompt: &'a str,
    pub history: &'a [ChatMessage],
    pub tools: &'a ToolRegistry,
    pub models: &'a ModelSelection,
}

#[derive(Clone, Debug, PartialEq)]
pub struct GenerationResult {
    pub content: String,
    pub tool_calls: Option<Vec<ToolCallRecord>>,
    pub model_used: String,
}

/// Receives the text accumulated so far, across steps.
pub type ChunkHandler<'a> = &'a (dyn Fn(&str) + Send + Sync);

struct StepsOutput {
    content: String,
    tool_calls: Vec<ToolCallRecord>,
}

/// Runs the bounded step loop against the primary model, failing over to the
/// fallback for eligible errors.
pub struct Generator {
    gateway: Arc<dyn ModelGateway>,
    max_steps: u32,
}

impl Generator {
    pub fn new(gateway: Arc<dyn ModelGateway>, max_steps: u32) -> Self {
        Self { gateway, max_steps: max_steps.max(1) }
    }

    pub fn gateway(&self) -> &dyn ModelGateway {
        self.gateway.as_ref()
    }

    pub async fn generate(&self, turn: &Turn<'_>) -> Result<GenerationResult, ModelRunError> {
        self.run(turn, None).await
    }

    pub async fn generate_streaming(
        &self,
        turn: &Turn<'_>,
        on_chunk: ChunkHandler<'_>,
    ) -> Result<GenerationResult, ModelRunError> {
        self.run(turn, Some(on_chunk)).await
    }

    async fn run(
        &self,
        turn: &Turn<'_>,
        on_chunk: Option<ChunkHandler<'_>>,
    ) -> Result<GenerationResult, ModelRunError> {
        let outcome =
            run_with_fallback(turn.models, |model| self.run_steps(model, turn, on_chunk)).await?;
        let StepsOutput { content, tool_calls } = outcome.value;

        Ok(GenerationResult {
            content,
            tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
            model_used: outcome.model_used,
        })
    }

    async fn run_steps(
        &self,
        model: String,
        turn: &Turn<'_>,
        on_chunk: Option<ChunkHandler<'_>>,
    ) -> Result<StepsOutput, ModelError> {
        let mut request = ModelRequest::new(turn.system_prompt, turn.history)
            .with_tools(turn.tools.definitions());
        let mut recorded = Vec::new();
        let accumulated = Mutex::new(String::new());
        let mut content = String::new();

        for step in 1..=self.max_steps {
            let response = match on_chunk {
                Some(on_chunk) => {
                    let on_delta = |delta: &str| {
                        let snapshot = match accumulated.lock() {
                            Ok(mut text) => {
                                text.push_str(delta);
                                text.clone()
                            }
                            Err(_) => return,
                        };
                        on_chunk(&snapshot);
                    };
                    self.gateway.complete_streaming(&model, &request, &on_delta).await?
                }
                None => self.gateway.complete(&model, &request).await?,
            };
            let ModelResponse { content: step_content, tool_calls } = response;
            content = step_content;

            if tool_calls.is_empty() {
                debug!(event_name = "agent.generate.finished", model = %model, steps = step, "turn finished");
                return Ok(StepsOutput { content, tool_calls: recorded });
            }

            let mut results = Vec::with_capacity(tool_calls.len());
            for call in &tool_calls {
                recorded.push(call.record());
                results.push(PromptMessage::Tool {
                    call_id: call.id.clone(),
                    name: call.name.clone(),
                    content: self.execute_tool(turn.tools, call).await,
                });
            }
            request
                .messages
                .push(PromptMessage::Assistant { content: content.clone(), tool_calls });
            request.messages.extend(results);
        }

        warn!(
            event_name = "agent.generate.step_ceiling",
            model = %model,
            max_steps = self.max_steps,
            "step ceiling reached with tool calls outstanding"
        );
        Ok(StepsOutput { content, tool_calls: recorded })
    }

    async fn execute_tool(&self, tools: &ToolRegistry, call: &ToolCall) -> String {
        let Some(tool) = tools.get(&call.name) else {
            warn!(event_name = "agent.tool.unknown", tool_name = %call.name, "model called an unavailable tool");
            return format!("Error: tool '{}' is not available", call.name);
        };

        debug!(event_name = "agent.tool.invoked", tool_name = %call.name, "executing tool");
        match tool.execute(call.input.clone()).await {
            Ok(Value::String(text)) => text,
            Ok(value) => value.to_string(),
            Err(error) => {
                warn!(event_name = "agent.tool.failed", tool_name = %call.name, error = %error, "tool execution failed");
                format!("Error: {error}")
            }
        }
    }
}
