//! OpenAI-compatible chat-completions client.
//!
//! Speaks the `/chat/completions` protocol with function tools, either as one
//! JSON response or as a server-sent event stream. Retries and failover are
//! the caller's concern; every failure is reported once as a [`ModelError`].

use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::header::CONTENT_TYPE;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::{json, Value};

use zenthor_core::config::LlmConfig;
use zenthor_core::errors::ModelError;

use crate::llm::{
    DeltaHandler, ModelGateway, ModelRequest, ModelResponse, PromptMessage, ToolCall,
    ToolDefinition,
};

pub struct OpenAiCompatibleGateway {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<SecretString>,
}

impl OpenAiCompatibleGateway {
    pub fn new(
        base_url: impl Into<String>,
        api_key: Option<SecretString>,
        timeout: Duration,
    ) -> Result<Self, ModelError> {
        let client = reqwest::Client::builder().timeout(timeout).build().map_err(transport_error)?;
        Ok(Self { client, base_url: base_url.into(), api_key })
    }

    pub fn from_config(config: &LlmConfig) -> Result<Self, ModelError> {
        Self::new(
            config.base_url.clone(),
            config.api_key.clone(),
            Duration::from_secs(config.timeout_secs),
        )
    }

    fn chat_completions_url(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }

    async fn post(&self, body: &Value) -> Result<reqwest::Response, ModelError> {
        let mut request = self.client.post(self.chat_completions_url()).json(body);
        if let Some(api_key) = &self.api_key {
            request = request.bearer_auth(api_key.expose_secret());
        }

        let response = request.send().await.map_err(transport_error)?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        Err(status_error(status.as_u16(), response.text().await))
    }
}

#[async_trait]
impl ModelGateway for OpenAiCompatibleGateway {
    async fn complete(
        &self,
        model: &str,
        request: &ModelRequest,
    ) -> Result<ModelResponse, ModelError> {
        let response = self.post(&build_request_body(model, request, false)).await?;
        let raw = response.text().await.map_err(transport_error)?;
        parse_chat_response(&raw)
    }

    async fn complete_streaming(
        &self,
        model: &str,
        request: &ModelRequest,
        on_delta: DeltaHandler<'_>,
    ) -> Result<ModelResponse, ModelError> {
        let response = self.post(&build_request_body(model, request, true)).await?;
        let is_event_stream = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .is_some_and(|value| value.to_ascii_lowercase().contains("text/event-stream"));

        if !is_event_stream {
            let raw = response.text().await.map_err(transport_error)?;
            let parsed = parse_chat_response(&raw)?;
            if !parsed.content.is_empty() {
                on_delta(&parsed.content);
            }
            return Ok(parsed);
        }

        parse_stream_response(response, on_delta).await
    }
}

fn transport_error(error: reqwest::Error) -> ModelError {
    let message = if error.is_timeout() {
        format!("request timed out: {error}")
    } else {
        error.to_string()
    };
    match error.status() {
        Some(status) => ModelError::with_status(status.as_u16(), message),
        None => ModelError::new(message),
    }
}

fn status_error(status: u16, body: Result<String, impl std::fmt::Display>) -> ModelError {
    match body {
        Ok(raw) => ModelError::with_status(status, provider_error_message(&raw)),
        Err(error) => ModelError::with_status(
            status,
            format!("provider returned status {status}; error body unreadable: {error}"),
        ),
    }
}

/// Prefers the `error.message` field of a JSON error body.
fn provider_error_message(raw: &str) -> String {
    serde_json::from_str::<Value>(raw)
        .ok()
        .and_then(|body| body["error"]["message"].as_str().map(str::to_string))
        .unwrap_or_else(|| raw.to_string())
}

pub(crate) fn build_request_body(model: &str, request: &ModelRequest, stream: bool) -> Value {
    let mut messages = Vec::with_capacity(request.messages.len() + 1);
    if let Some(system) = request.system.as_deref().filter(|system| !system.is_empty()) {
        messages.push(json!({"role": "system", "content": system}));
    }
    messages.extend(request.messages.iter().map(to_openai_message));

    let mut body = json!({
        "model": model,
        "messages": messages,
    });
    if !request.tools.is_empty() {
        body["tools"] = Value::Array(request.tools.iter().map(to_openai_tool).collect());
    }
    if stream {
        body["stream"] = json!(true);
    }
    body
}

fn to_openai_message(message: &PromptMessage) -> Value {
    match message {
        PromptMessage::System(content) => json!({"role": "system", "content": content}),
        PromptMessage::User(content) => json!({"role": "user", "content": content}),
        PromptMessage::Assistant { content, tool_calls } if tool_calls.is_empty() => {
            json!({"role": "assistant", "content": content})
        }
        PromptMessage::Assistant { content, tool_calls } => json!({
            "role": "assistant",
            "content": if content.is_empty() { Value::Null } else { json!(content) },
            "tool_calls": tool_calls.iter().map(|call| json!({
                "id": call.id,
                "type": "function",
                "function": {"name": call.name, "arguments": call.input.to_string()},
            })).collect::<Vec<_>>(),
        }),
        PromptMessage::Tool { call_id, content, .. } => {
            json!({"role": "tool", "tool_call_id": call_id, "content": content})
        }
    }
}

fn to_openai_tool(tool: &ToolDefinition) -> Value {
    json!({
        "type": "function",
        "function": {
            "name": tool.name,
            "description": tool.description,
            "parameters": tool.input_schema,
        },
    })
}

fn parse_tool_arguments(arguments: &str) -> Value {
    if arguments.trim().is_empty() {
        return json!({});
    }
    serde_json::from_str(arguments).unwrap_or_else(|_| Value::String(arguments.to_string()))
}

#[derive(Deserialize)]
struct ChatCompletion {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<WireToolCall>,
}

#[derive(Deserialize)]
struct WireToolCall {
    #[serde(default)]
    id: String,
    function: WireFunction,
}

#[derive(Deserialize)]
struct WireFunction {
    name: String,
    #[serde(default)]
    arguments: String,
}

pub(crate) fn parse_chat_response(raw: &str) -> Result<ModelResponse, ModelError> {
    let completion: ChatCompletion = serde_json::from_str(raw)
        .map_err(|error| ModelError::new(format!("invalid response body: {error}")))?;
    let Some(choice) = completion.choices.into_iter().next() else {
        return Err(ModelError::new("invalid response body: no choices returned"));
    };

    let tool_calls = choice
        .message
        .tool_calls
        .into_iter()
        .enumerate()
        .map(|(index, call)| ToolCall {
            id: if call.id.is_empty() { format!("call_{}", index + 1) } else { call.id },
            name: call.function.name,
            input: parse_tool_arguments(&call.function.arguments),
        })
        .collect();

    Ok(ModelResponse { content: choice.message.content.unwrap_or_default(), tool_calls })
}

#[derive(Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: Option<StreamDelta>,
}

#[derive(Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<StreamToolCallDelta>>,
}

#[derive(Deserialize)]
struct StreamToolCallDelta {
    #[serde(default)]
    index: usize,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<StreamFunctionDelta>,
}

#[derive(Deserialize)]
struct StreamFunctionDelta {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

#[derive(Default)]
struct ToolCallAccumulator {
    id: String,
    name: String,
    arguments: String,
}

#[derive(Default)]
struct StreamState {
    text: String,
    tool_calls: Vec<ToolCallAccumulator>,
}

impl StreamState {
    fn apply(&mut self, data: &str, on_delta: DeltaHandler<'_>) -> Result<(), ModelError> {
        let chunk: StreamChunk = serde_json::from_str(data)
            .map_err(|error| ModelError::new(format!("invalid stream chunk: {error}")))?;

        for choice in chunk.choices {
            let Some(delta) = choice.delta else {
                continue;
            };

            if let Some(text) = delta.content.filter(|text| !text.is_empty()) {
                self.text.push_str(&text);
                on_delta(&text);
            }

            for call in delta.tool_calls.unwrap_or_default() {
                // indices arrive in order; a new call may only extend the list by one
                if call.index > self.tool_calls.len() {
                    return Err(ModelError::new(format!(
                        "invalid stream chunk: tool call index {} after {} calls",
                        call.index,
                        self.tool_calls.len()
                    )));
                }
                if call.index == self.tool_calls.len() {
                    self.tool_calls.push(ToolCallAccumulator::default());
                }
                let current = &mut self.tool_calls[call.index];
                if let Some(id) = call.id.filter(|id| !id.is_empty()) {
                    current.id = id;
                }
                if let Some(function) = call.function {
                    if let Some(name) = function.name.filter(|name| !name.is_empty()) {
                        current.name = name;
                    }
                    if let Some(arguments) = function.arguments {
                        current.arguments.push_str(&arguments);
                    }
                }
            }
        }
        Ok(())
    }

    /// Handles one SSE line. Returns `true` on the `[DONE]` sentinel.
    fn apply_line(&mut self, line: &str, on_delta: DeltaHandler<'_>) -> Result<bool, ModelError> {
        let Some(data) = line.trim().strip_prefix("data:") else {
            return Ok(false);
        };
        let data = data.trim();
        if data == "[DONE]" {
            return Ok(true);
        }
        if data.is_empty() {
            return Ok(false);
        }
        self.apply(data, on_delta).map(|()| false)
    }

    fn finish(self) -> ModelResponse {
        let tool_calls = self
            .tool_calls
            .into_iter()
            .enumerate()
            .filter(|(_, call)| !call.name.trim().is_empty())
            .map(|(index, call)| ToolCall {
                id: if call.id.trim().is_empty() { format!("call_{}", index + 1) } else { call.id },
                input: parse_tool_arguments(&call.arguments),
                name: call.name,
            })
            .collect();
        ModelResponse { content: self.text, tool_calls }
    }
}

async fn parse_stream_response(
    response: reqwest::Response,
    on_delta: DeltaHandler<'_>,
) -> Result<ModelResponse, ModelError> {
    let mut stream = response.bytes_stream();
    let mut buffer: Vec<u8> = Vec::new();
    let mut state = StreamState::default();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(transport_error)?;
        buffer.extend_from_slice(&chunk);

        while let Some(position) = buffer.iter().position(|byte| *byte == b'\n') {
            let line: Vec<u8> = buffer.drain(..=position).collect();
            let line = std::str::from_utf8(&line)
                .map_err(|error| ModelError::new(format!("invalid UTF-8 in stream: {error}")))?;
            if state.apply_line(line, on_delta)? {
                return Ok(state.finish());
            }
        }
    }

    if !buffer.is_empty() {
        let trailing = std::str::from_utf8(&buffer)
            .map_err(|error| ModelError::new(format!("invalid UTF-8 in stream: {error}")))?;
        state.apply_line(trailing, on_delta)?;
    }
    Ok(state.finish())
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use httpmock::prelude::*;
    use secrecy::SecretString;
    use serde_json::json;

    use zenthor_core::errors::FailoverReason;

    use super::{
        build_request_body, parse_chat_response, status_error, OpenAiCompatibleGateway, StreamState,
    };
    use crate::llm::{
        ModelGateway, ModelRequest, PromptMessage, ToolCall, ToolDefinition,
    };

    fn request() -> ModelRequest {
        ModelRequest {
            system: Some("be brief".to_string()),
            messages: vec![PromptMessage::User("hi".to_string())],
            tools: vec![ToolDefinition {
                name: "current_time".to_string(),
                description: "time".to_string(),
                input_schema: json!({"type": "object"}),
            }],
        }
    }

    fn gateway(server: &MockServer) -> OpenAiCompatibleGateway {
        OpenAiCompatibleGateway::new(
            server.url("/v1"),
            Some(SecretString::from("test-key".to_string())),
            Duration::from_secs(5),
        )
        .expect("gateway")
    }

    #[test]
    fn request_body_carries_system_tools_and_tool_results() {
        let mut request = request();
        request.messages.push(PromptMessage::Assistant {
            content: String::new(),
            tool_calls: vec![ToolCall {
                id: "c1".to_string(),
                name: "current_time".to_string(),
                input: json!({}),
            }],
        });
        request.messages.push(PromptMessage::Tool {
            call_id: "c1".to_string(),
            name: "current_time".to_string(),
            content: "noon".to_string(),
        });

        let body = build_request_body("gpt-test", &request, true);

        assert_eq!(body["model"], "gpt-test");
        assert_eq!(body["stream"], true);
        assert_eq!(body["messages"][0], json!({"role": "system", "content": "be brief"}));
        assert_eq!(body["messages"][1], json!({"role": "user", "content": "hi"}));
        assert_eq!(body["messages"][2]["content"], serde_json::Value::Null);
        assert_eq!(body["messages"][2]["tool_calls"][0]["function"]["arguments"], "{}");
        assert_eq!(
            body["messages"][3],
            json!({"role": "tool", "tool_call_id": "c1", "content": "noon"})
        );
        assert_eq!(body["tools"][0]["function"]["name"], "current_time");
    }

    #[test]
    fn tool_call_arguments_are_decoded() {
        let parsed = parse_chat_response(
            &json!({
                "choices": [{
                    "message": {
                        "content": null,
                        "tool_calls": [{
                            "id": "call_9",
                            "type": "function",
                            "function": {"name": "lookup", "arguments": "{\"q\":\"rust\"}"}
                        }]
                    }
                }]
            })
            .to_string(),
        )
        .expect("parse");

        assert_eq!(parsed.content, "");
        assert_eq!(parsed.tool_calls[0].id, "call_9");
        assert_eq!(parsed.tool_calls[0].input, json!({"q": "rust"}));
    }

    #[test]
    fn stream_state_accumulates_text_and_tool_call_fragments() {
        let deltas = Mutex::new(Vec::new());
        let on_delta = |text: &str| {
            if let Ok(mut deltas) = deltas.lock() {
                deltas.push(text.to_string());
            }
        };
        let mut state = StreamState::default();
        let lines = [
            r#"data: {"choices":[{"delta":{"content":"Hel"}}]}"#,
            r#"data: {"choices":[{"delta":{"content":"lo"}}]}"#,
            r#"data: {"choices":[{"delta":{"tool_calls":[{"index":0,"id":"c1","function":{"name":"lookup","arguments":"{\"q\":"}}]}}]}"#,
            r#"data: {"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"\"x\"}"}}]}}]}"#,
            "",
        ];
        for line in lines {
            assert!(!state.apply_line(line, &on_delta).expect("apply"));
        }
        assert!(state.apply_line("data: [DONE]", &on_delta).expect("done"));

        let response = state.finish();
        assert_eq!(response.content, "Hello");
        assert_eq!(response.tool_calls.len(), 1);
        assert_eq!(response.tool_calls[0].input, json!({"q": "x"}));
        assert_eq!(deltas.into_inner().unwrap_or_default(), vec!["Hel", "lo"]);
    }

    #[test]
    fn out_of_sequence_tool_call_index_is_rejected() {
        let on_delta = |_: &str| {};
        let mut state = StreamState::default();

        let huge = r#"data: {"choices":[{"delta":{"tool_calls":[{"index":18446744073709551615,"function":{"name":"lookup"}}]}}]}"#;
        let error = state.apply_line(huge, &on_delta).expect_err("huge index");
        assert!(error.message.starts_with("invalid stream chunk"), "{}", error.message);

        let skipped = r#"data: {"choices":[{"delta":{"tool_calls":[{"index":3,"function":{"name":"lookup"}}]}}]}"#;
        assert!(state.apply_line(skipped, &on_delta).is_err());

        let first = r#"data: {"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"name":"lookup"}}]}}]}"#;
        let second = r#"data: {"choices":[{"delta":{"tool_calls":[{"index":1,"function":{"name":"fetch"}}]}}]}"#;
        state.apply_line(first, &on_delta).expect("first call");
        state.apply_line(second, &on_delta).expect("second call");
        let names: Vec<String> =
            state.finish().tool_calls.into_iter().map(|call| call.name).collect();
        assert_eq!(names, vec!["lookup", "fetch"]);
    }

    #[test]
    fn unreadable_error_body_is_reported() {
        let error = status_error(502, Err::<String, _>("connection reset by peer"));

        assert_eq!(error.status, Some(502));
        assert!(error.message.contains("connection reset by peer"), "{}", error.message);

        let body = r#"{"error":{"message":"Invalid API key"}}"#.to_string();
        let parsed = status_error(401, Ok::<_, String>(body));
        assert_eq!(parsed.message, "Invalid API key");
    }

    #[tokio::test]
    async fn complete_posts_to_chat_completions_with_bearer_auth() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/v1/chat/completions")
                    .header("authorization", "Bearer test-key")
                    .json_body_includes(json!({"model": "gpt-test"}).to_string());
                then.status(200).json_body(json!({
                    "choices": [{"message": {"content": "hello there"}}]
                }));
            })
            .await;

        let response = gateway(&server).complete("gpt-test", &request()).await.expect("complete");

        mock.assert_async().await;
        assert_eq!(response.content, "hello there");
        assert!(response.tool_calls.is_empty());
    }

    #[tokio::test]
    async fn error_status_is_classifiable() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/v1/chat/completions");
                then.status(429)
                    .json_body(json!({"error": {"message": "Rate limit reached for requests"}}));
            })
            .await;

        let error = gateway(&server).complete("gpt-test", &request()).await.expect_err("429");

        assert_eq!(error.status, Some(429));
        assert_eq!(error.message, "Rate limit reached for requests");
        assert_eq!(error.reason(), FailoverReason::RateLimit);
    }

    #[tokio::test]
    async fn streaming_response_is_parsed_from_server_sent_events() {
        let server = MockServer::start_async().await;
        let body = concat!(
            "data: {\"choices\":[{\"delta\":{\"content\":\"Hi \"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"there\"}}]}\n\n",
            "data: [DONE]\n\n",
        );
        server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/v1/chat/completions")
                    .json_body_includes(json!({"stream": true}).to_string());
                then.status(200).header("content-type", "text/event-stream").body(body);
            })
            .await;

        let seen = Mutex::new(Vec::new());
        let on_delta = |text: &str| {
            if let Ok(mut seen) = seen.lock() {
                seen.push(text.to_string());
            }
        };
        let response = gateway(&server)
            .complete_streaming("gpt-test", &request(), &on_delta)
            .await
            .expect("stream");

        assert_eq!(response.content, "Hi there");
        assert_eq!(seen.into_inner().unwrap_or_default(), vec!["Hi ", "there"]);
    }
}
