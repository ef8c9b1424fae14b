use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};

use zenthor_core::tool_policy::{filter_tools, ToolPolicy};

use crate::llm::ToolDefinition;

pub mod browse_url;
pub mod schedule;

pub use browse_url::BrowseUrlTool;
pub use schedule::ScheduleTaskTool;

/// A capability the model may invoke during a turn.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    fn input_schema(&self) -> Value;
    async fn execute(&self, input: Value) -> Result<Value>;

    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name().to_string(),
            description: self.description().to_string(),
            input_schema: self.input_schema(),
        }
    }
}

/// Ordered set of tools, looked up by name.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: Vec<Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn from_tools(tools: Vec<Arc<dyn Tool>>) -> Self {
        let mut registry = Self::default();
        for tool in tools {
            registry.insert(tool);
        }
        registry
    }

    pub fn register<T>(&mut self, tool: T)
    where
        T: Tool + 'static,
    {
        self.insert(Arc::new(tool));
    }

    /// Adds `tool`, replacing any tool already registered under its name.
    pub fn insert(&mut self, tool: Arc<dyn Tool>) {
        match self.tools.iter().position(|existing| existing.name() == tool.name()) {
            Some(index) => self.tools[index] = tool,
            None => self.tools.push(tool),
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.iter().find(|tool| tool.name() == name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.tools.iter().map(|tool| tool.name().to_string()).collect()
    }

    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools.iter().map(|tool| tool.definition()).collect()
    }

    /// Tools admitted by `policy`, in registration order.
    pub fn filtered(&self, policy: &ToolPolicy) -> Self {
        Self { tools: filter_tools(self.tools.clone(), policy, |tool| tool.name()) }
    }

    pub fn into_tools(self) -> Vec<Arc<dyn Tool>> {
        self.tools
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

pub struct CurrentTimeTool;

#[async_trait]
impl Tool for CurrentTimeTool {
    fn name(&self) -> &str {
        "current_time"
    }

    fn description(&self) -> &str {
        "Returns the current date and time in UTC."
    }

    fn input_schema(&self) -> Value {
        json!({"type": "object", "properties": {}, "additionalProperties": false})
    }

    async fn execute(&self, _input: Value) -> Result<Value> {
        let now = Utc::now();
        Ok(json!({
            "utc": now.to_rfc3339(),
            "unix_seconds": now.timestamp(),
        }))
    }
}

/// Tools available to every turn before policy filtering. Conversation-bound
/// tools such as `schedule_task` are added per job.
pub fn builtin_tools() -> Result<ToolRegistry, reqwest::Error> {
    let mut registry = ToolRegistry::default();
    registry.register(CurrentTimeTool);
    registry.register(BrowseUrlTool::new()?);
    Ok(registry)
}
