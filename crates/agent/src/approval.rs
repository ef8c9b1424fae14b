//! Human-in-the-loop gate for high-risk tools.
//!
//! A gated invocation opens a pending [`ToolApproval`], optionally prompts the
//! contact on a store-and-forward channel, and suspends until the record is
//! resolved or the deadline passes. The wait reacts to the store's resolution
//! broadcast and re-reads the record on a heartbeat, so a missed event only
//! delays the outcome by one poll interval. The tool runs only after an
//! observed `approved`; a vanished record is treated as a rejection. A record
//! still pending at the deadline is closed as rejected so later replies in the
//! conversation cannot land on it.
//!
//! [`ToolApproval`]: zenthor_core::domain::approval::ToolApproval

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::time::{sleep, Instant};
use tracing::{info, warn};

use zenthor_core::config::AgentConfig;
use zenthor_core::domain::approval::{ApprovalId, ApprovalStatus, NewToolApproval};
use zenthor_core::domain::conversation::ConversationId;
use zenthor_core::domain::job::JobId;
use zenthor_core::domain::message::Channel;
use zenthor_db::repositories::{ApprovalStore, RepositoryError};

use crate::delivery::OutboundChannel;
use crate::tools::{Tool, ToolRegistry};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ApprovalSettings {
    pub poll_interval: Duration,
    pub timeout: Duration,
    pub high_risk_tools: HashSet<String>,
}

impl Default for ApprovalSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            timeout: Duration::from_secs(300),
            high_risk_tools: HashSet::new(),
        }
    }
}

impl ApprovalSettings {
    pub fn from_config(config: &AgentConfig) -> Self {
        Self {
            poll_interval: Duration::from_millis(config.approval_poll_interval_ms),
            timeout: Duration::from_secs(config.approval_timeout_secs),
            high_risk_tools: config.high_risk_tools.iter().cloned().collect(),
        }
    }

    pub fn requires_approval(&self, tool_name: &str) -> bool {
        self.high_risk_tools.contains(tool_name)
    }
}

/// Where a gated invocation happens.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ApprovalContext {
    pub job_id: JobId,
    pub conversation_id: ConversationId,
    pub channel: Channel,
    pub phone: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ApprovalOutcome {
    Approved,
    Rejected,
    TimedOut,
}

impl ApprovalOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::TimedOut => "timeout",
        }
    }
}

enum RecordState {
    Pending,
    Resolved(ApprovalStatus),
    Vanished,
}

pub fn approval_prompt(tool_name: &str) -> String {
    format!("🔐 I'd like to use the tool '{tool_name}'. Reply YES to approve or NO to reject.")
}

pub fn rejected_message(tool_name: &str) -> String {
    format!("Tool '{tool_name}' was rejected by the user.")
}

pub fn timed_out_message(tool_name: &str) -> String {
    format!("Tool '{tool_name}' approval timed out.")
}

#[derive(Clone)]
pub struct ApprovalGate {
    approvals: Arc<dyn ApprovalStore>,
    outbound: Arc<dyn OutboundChannel>,
    settings: ApprovalSettings,
}

impl ApprovalGate {
    pub fn new(
        approvals: Arc<dyn ApprovalStore>,
        outbound: Arc<dyn OutboundChannel>,
        settings: ApprovalSettings,
    ) -> Self {
        Self { approvals, outbound, settings }
    }

    /// Wraps every high-risk tool in `tools`; the rest pass through as-is.
    pub fn wrap_tools(&self, tools: ToolRegistry, context: &ApprovalContext) -> ToolRegistry {
        let wrapped = tools
            .into_tools()
            .into_iter()
            .map(|tool| {
                if !self.settings.requires_approval(tool.name()) {
                    return tool;
                }
                Arc::new(ApprovalGatedTool {
                    inner: tool,
                    gate: self.clone(),
                    context: context.clone(),
                }) as Arc<dyn Tool>
            })
            .collect();
        ToolRegistry::from_tools(wrapped)
    }

    /// Opens an approval for one invocation and waits for its outcome.
    pub async fn request_approval(
        &self,
        context: &ApprovalContext,
        tool_name: &str,
        input: &Value,
    ) -> Result<ApprovalOutcome, RepositoryError> {
        // subscribe first so a resolution racing the insert is not missed
        let events = self.approvals.subscribe();

        let approval = self
            .approvals
            .create(NewToolApproval {
                job_id: context.job_id.clone(),
                conversation_id: context.conversation_id.clone(),
                tool_name: tool_name.to_string(),
                tool_input: input.clone(),
                channel: context.channel,
            })
            .await?;

        info!(
            event_name = "agent.approval.requested",
            correlation_id = %context.job_id.0,
            conversation_id = %context.conversation_id.0,
            approval_id = %approval.id.0,
            tool_name,
            "waiting for tool approval"
        );

        if context.channel.is_store_and_forward() {
            if let Some(phone) = context.phone.as_deref().filter(|phone| !phone.is_empty()) {
                if let Err(error) = self.outbound.send(phone, &approval_prompt(tool_name)).await {
                    warn!(
                        event_name = "agent.approval.prompt_failed",
                        correlation_id = %context.job_id.0,
                        approval_id = %approval.id.0,
                        tool_name,
                        error = %error,
                        "approval prompt could not be delivered"
                    );
                }
            }
        }

        let outcome = self.wait_for_resolution(&approval.id, events).await?;

        info!(
            event_name = "agent.approval.resolved",
            correlation_id = %context.job_id.0,
            approval_id = %approval.id.0,
            tool_name,
            outcome = outcome.as_str(),
            "tool approval finished"
        );
        Ok(outcome)
    }

    async fn wait_for_resolution(
        &self,
        id: &ApprovalId,
        mut events: broadcast::Receiver<ApprovalId>,
    ) -> Result<ApprovalOutcome, RepositoryError> {
        let deadline = Instant::now() + self.settings.timeout;
        let mut events_open = true;

        loop {
            match self.read_state(id).await? {
                RecordState::Pending => {}
                RecordState::Resolved(ApprovalStatus::Approved) => {
                    return Ok(ApprovalOutcome::Approved)
                }
                RecordState::Resolved(_) | RecordState::Vanished => {
                    return Ok(ApprovalOutcome::Rejected)
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return self.expire(id).await;
            }
            let heartbeat = self.settings.poll_interval.min(deadline - now);

            if events_open {
                tokio::select! {
                    event = events.recv() => {
                        if let Err(RecvError::Closed) = event {
                            events_open = false;
                        }
                    }
                    _ = sleep(heartbeat) => {}
                }
            } else {
                sleep(heartbeat).await;
            }
        }
    }

    /// Rejects a record that outlived its deadline. A decision stored between
    /// the last read and this write still wins.
    async fn expire(&self, id: &ApprovalId) -> Result<ApprovalOutcome, RepositoryError> {
        if self.approvals.resolve(id, ApprovalStatus::Rejected).await?.is_some() {
            return Ok(ApprovalOutcome::TimedOut);
        }
        Ok(match self.read_state(id).await? {
            RecordState::Pending => ApprovalOutcome::TimedOut,
            RecordState::Resolved(ApprovalStatus::Approved) => ApprovalOutcome::Approved,
            RecordState::Resolved(_) | RecordState::Vanished => ApprovalOutcome::Rejected,
        })
    }

    async fn read_state(&self, id: &ApprovalId) -> Result<RecordState, RepositoryError> {
        Ok(match self.approvals.find(id).await? {
            None => RecordState::Vanished,
            Some(approval) if approval.is_pending() => RecordState::Pending,
            Some(approval) => RecordState::Resolved(approval.status),
        })
    }
}

/// Decorator that holds a tool invocation until a human approves it.
pub struct ApprovalGatedTool {
    inner: Arc<dyn Tool>,
    gate: ApprovalGate,
    context: ApprovalContext,
}

#[async_trait]
impl Tool for ApprovalGatedTool {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn description(&self) -> &str {
        self.inner.description()
    }

    fn input_schema(&self) -> Value {
        self.inner.input_schema()
    }

    async fn execute(&self, input: Value) -> Result<Value> {
        let name = self.inner.name();
        match self.gate.request_approval(&self.context, name, &input).await? {
            ApprovalOutcome::Approved => self.inner.execute(input).await,
            ApprovalOutcome::Rejected => Ok(Value::String(rejected_message(name))),
            ApprovalOutcome::TimedOut => Ok(Value::String(timed_out_message(name))),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::time::Duration;

    use serde_json::{json, Value};

    use zenthor_core::domain::approval::ApprovalStatus;
    use zenthor_core::domain::conversation::ConversationId;
    use zenthor_core::domain::job::JobId;
    use zenthor_core::domain::message::Channel;
    use zenthor_db::repositories::{ApprovalStore, InMemoryApprovalRepository};

    use super::{
        approval_prompt, ApprovalContext, ApprovalGate, ApprovalSettings, ApprovalOutcome,
    };
    use crate::delivery::testing::RecordingChannel;
    use crate::replies::resolve_approval_reply;
    use crate::tools::testing::RecordingTool;
    use crate::tools::{Tool, ToolRegistry};

    struct Harness {
        approvals: Arc<InMemoryApprovalRepository>,
        outbound: Arc<RecordingChannel>,
        gate: ApprovalGate,
    }

    fn harness() -> Harness {
        let approvals = Arc::new(InMemoryApprovalRepository::default());
        let outbound = Arc::new(RecordingChannel::default());
        let settings = ApprovalSettings {
            high_risk_tools: HashSet::from(["browse_url".to_string()]),
            ..ApprovalSettings::default()
        };
        let gate = ApprovalGate::new(approvals.clone(), outbound.clone(), settings);
        Harness { approvals, outbound, gate }
    }

    fn context(channel: Channel) -> ApprovalContext {
        context_for("job-1", channel)
    }

    fn context_for(job: &str, channel: Channel) -> ApprovalContext {
        ApprovalContext {
            job_id: JobId(job.to_string()),
            conversation_id: ConversationId("conv-1".to_string()),
            channel,
            phone: Some("5511999990000".to_string()),
        }
    }

    fn gated(harness: &Harness, tool: Arc<RecordingTool>, channel: Channel) -> Arc<dyn Tool> {
        gated_for(harness, tool, "job-1", channel)
    }

    fn gated_for(
        harness: &Harness,
        tool: Arc<RecordingTool>,
        job: &str,
        channel: Channel,
    ) -> Arc<dyn Tool> {
        let registry = ToolRegistry::from_tools(vec![tool as Arc<dyn Tool>]);
        let wrapped = harness.gate.wrap_tools(registry, &context_for(job, channel));
        wrapped.get("browse_url").expect("tool present")
    }

    /// Resolves the first approval that shows up, after `delay`.
    fn resolve_when_created(
        approvals: Arc<InMemoryApprovalRepository>,
        status: ApprovalStatus,
        delay: Duration,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let pending = approvals.list_pending().await.unwrap_or_default();
                if let Some(approval) = pending.first() {
                    tokio::time::sleep(delay).await;
                    let _ = approvals.resolve(&approval.id, status).await;
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
    }

    #[tokio::test(start_paused = true)]
    async fn approved_tool_runs_once_with_original_input() {
        let harness = harness();
        let tool = RecordingTool::new("browse_url");
        let gated = gated(&harness, tool.clone(), Channel::Web);
        let resolver = resolve_when_created(
            harness.approvals.clone(),
            ApprovalStatus::Approved,
            Duration::from_secs(3),
        );

        let output = gated.execute(json!({"url": "https://example.com"})).await.expect("execute");
        resolver.await.expect("resolver task");

        assert_eq!(output, json!({"echo": {"url": "https://example.com"}}));
        assert_eq!(tool.call_count(), 1);
        assert_eq!(tool.inputs(), vec![json!({"url": "https://example.com"})]);
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_tool_never_runs() {
        let harness = harness();
        let tool = RecordingTool::new("browse_url");
        let gated = gated(&harness, tool.clone(), Channel::Web);
        let resolver = resolve_when_created(
            harness.approvals.clone(),
            ApprovalStatus::Rejected,
            Duration::from_millis(500),
        );

        let output = gated.execute(json!({"url": "https://example.com"})).await.expect("execute");
        resolver.await.expect("resolver task");

        assert_eq!(output, Value::String("Tool 'browse_url' was rejected by the user.".into()));
        assert_eq!(tool.call_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_approval_times_out_after_five_minutes() {
        let harness = harness();
        let tool = RecordingTool::new("browse_url");
        let gated = gated(&harness, tool.clone(), Channel::Web);
        let started = tokio::time::Instant::now();

        let output = gated.execute(json!({})).await.expect("execute");

        assert_eq!(output, Value::String("Tool 'browse_url' approval timed out.".into()));
        assert_eq!(tool.call_count(), 0);
        assert!(started.elapsed() >= Duration::from_secs(300));
        assert!(started.elapsed() < Duration::from_secs(302));

        assert!(harness.approvals.list_pending().await.expect("pending").is_empty());
        let stored = harness
            .approvals
            .get_by_job(&JobId("job-1".to_string()))
            .await
            .expect("by job");
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].status, ApprovalStatus::Rejected);
        assert!(stored[0].resolved_at.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn reply_after_an_expired_request_reaches_the_live_one() {
        let harness = harness();
        let tool = RecordingTool::new("browse_url");
        let first = gated_for(&harness, tool.clone(), "job-1", Channel::WhatsApp);
        let expired = first.execute(json!({"url": "https://a.example"})).await.expect("execute");
        assert_eq!(expired, Value::String("Tool 'browse_url' approval timed out.".into()));

        let second = gated_for(&harness, tool.clone(), "job-2", Channel::WhatsApp);
        let waiting =
            tokio::spawn(async move { second.execute(json!({"url": "https://b.example"})).await });
        tokio::time::sleep(Duration::from_secs(5)).await;

        let resolved = resolve_approval_reply(
            harness.approvals.as_ref(),
            &ConversationId("conv-1".to_string()),
            "YES",
        )
        .await
        .expect("reply")
        .expect("a pending approval was resolved");
        assert_eq!(resolved.job_id, JobId("job-2".to_string()));

        let output = waiting.await.expect("task").expect("execute");
        assert_eq!(output, json!({"echo": {"url": "https://b.example"}}));
        assert_eq!(tool.call_count(), 1);
        assert_eq!(tool.inputs(), vec![json!({"url": "https://b.example"})]);
    }

    #[tokio::test(start_paused = true)]
    async fn vanished_record_counts_as_rejection() {
        let harness = harness();
        let tool = RecordingTool::new("browse_url");
        let gated = gated(&harness, tool.clone(), Channel::Web);
        let approvals = harness.approvals.clone();
        let remover = tokio::spawn(async move {
            loop {
                let pending = approvals.list_pending().await.unwrap_or_default();
                if let Some(approval) = pending.first() {
                    approvals.remove(&approval.id).await;
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        });

        let output = gated.execute(json!({})).await.expect("execute");
        remover.await.expect("remover task");

        assert_eq!(output, Value::String("Tool 'browse_url' was rejected by the user.".into()));
        assert_eq!(tool.call_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn whatsapp_invocation_prompts_the_contact() {
        let harness = harness();
        let tool = RecordingTool::new("browse_url");
        let gated = gated(&harness, tool.clone(), Channel::WhatsApp);
        let resolver = resolve_when_created(
            harness.approvals.clone(),
            ApprovalStatus::Approved,
            Duration::ZERO,
        );

        gated.execute(json!({"url": "https://example.com"})).await.expect("execute");
        resolver.await.expect("resolver task");

        assert_eq!(
            harness.outbound.sent(),
            vec![("5511999990000".to_string(), approval_prompt("browse_url"))]
        );
        let stored = harness
            .approvals
            .get_by_job(&JobId("job-1".to_string()))
            .await
            .expect("by job");
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].channel, Channel::WhatsApp);
        assert_eq!(stored[0].tool_input, json!({"url": "https://example.com"}));
    }

    #[tokio::test(start_paused = true)]
    async fn web_invocation_sends_no_prompt() {
        let harness = harness();
        let tool = RecordingTool::new("browse_url");
        let gated = gated(&harness, tool, Channel::Web);
        let resolver = resolve_when_created(
            harness.approvals.clone(),
            ApprovalStatus::Approved,
            Duration::ZERO,
        );

        gated.execute(json!({})).await.expect("execute");
        resolver.await.expect("resolver task");

        assert!(harness.outbound.sent().is_empty());
    }

    #[tokio::test]
    async fn only_high_risk_tools_are_wrapped() {
        let harness = harness();
        let safe = RecordingTool::new("current_time");
        let risky = RecordingTool::new("browse_url");
        let registry =
            ToolRegistry::from_tools(vec![safe.clone() as Arc<dyn Tool>, risky as Arc<dyn Tool>]);

        let wrapped = harness.gate.wrap_tools(registry, &context(Channel::Web));
        assert_eq!(wrapped.names(), vec!["current_time", "browse_url"]);

        let passthrough = wrapped.get("current_time").expect("present");
        passthrough.execute(json!({})).await.expect("execute");
        assert_eq!(safe.call_count(), 1);
        assert!(harness.approvals.list_pending().await.expect("pending").is_empty());
    }

    #[test]
    fn outcome_labels() {
        assert_eq!(ApprovalOutcome::TimedOut.as_str(), "timeout");
        assert_eq!(ApprovalOutcome::Approved.as_str(), "approved");
    }
}
