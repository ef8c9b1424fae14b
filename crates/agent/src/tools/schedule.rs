use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

use zenthor_core::domain::conversation::ConversationId;
use zenthor_core::domain::schedule::{NewScheduledTask, MAX_INTERVAL_MINUTES};
use zenthor_db::repositories::ScheduleStore;

use super::Tool;

#[derive(Debug, Deserialize)]
struct ScheduleTaskInput {
    name: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(alias = "intervalMinutes")]
    interval_minutes: u32,
    payload: String,
}

/// Creates recurring tasks in the conversation the current job belongs to.
pub struct ScheduleTaskTool {
    schedules: Arc<dyn ScheduleStore>,
    conversation_id: ConversationId,
}

impl ScheduleTaskTool {
    pub fn new(schedules: Arc<dyn ScheduleStore>, conversation_id: ConversationId) -> Self {
        Self { schedules, conversation_id }
    }
}

#[async_trait]
impl Tool for ScheduleTaskTool {
    fn name(&self) -> &str {
        "schedule_task"
    }

    fn description(&self) -> &str {
        "Schedule a recurring task or reminder. The task will automatically create messages in the conversation at the specified interval."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "name": {"type": "string", "description": "Name of the scheduled task"},
                "description": {"type": "string", "description": "What this task should do"},
                "interval_minutes": {
                    "type": "integer",
                    "minimum": 1,
                    "maximum": MAX_INTERVAL_MINUTES,
                    "description": "How often to run, in minutes"
                },
                "payload": {"type": "string", "description": "The message or instruction to execute"}
            },
            "required": ["name", "interval_minutes", "payload"],
            "additionalProperties": false
        })
    }

    async fn execute(&self, input: Value) -> Result<Value> {
        let input: ScheduleTaskInput =
            serde_json::from_value(input).context("invalid schedule_task input")?;

        let name = input.name.trim();
        if name.is_empty() {
            bail!("task name must not be empty");
        }
        if input.payload.trim().is_empty() {
            bail!("task payload must not be empty");
        }
        if input.interval_minutes == 0 || input.interval_minutes > MAX_INTERVAL_MINUTES {
            bail!("interval_minutes must be between 1 and {MAX_INTERVAL_MINUTES}");
        }

        let task = self
            .schedules
            .create(NewScheduledTask {
                conversation_id: self.conversation_id.clone(),
                name: name.to_string(),
                description: input.description.filter(|text| !text.trim().is_empty()),
                interval_minutes: input.interval_minutes,
                payload: input.payload,
            })
            .await?;
        info!(
            event_name = "agent.schedule.created",
            conversation_id = %task.conversation_id.0,
            task_id = %task.id.0,
            interval_minutes = task.interval_minutes,
            "scheduled task created"
        );

        Ok(Value::String(format!(
            "Scheduled task \"{}\" created. It will run every {} minutes.",
            task.name, task.interval_minutes
        )))
    }
}
