use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, warn};

use zenthor_core::config::AppConfig;
use zenthor_core::context_guard::evaluate_context;
use zenthor_core::domain::conversation::ConversationContext;
use zenthor_core::domain::job::Job;
use zenthor_core::domain::message::{Channel, ChatMessage, MessageStatus};
use zenthor_core::prompt::build_system_prompt;
use zenthor_core::tool_policy::{default_policy, merge_tool_policies};
use zenthor_db::repositories::{
    ApprovalStore, ConversationStore, JobQueue, MessageStore, RepositoryError, ScheduleStore,
};

use crate::approval::{ApprovalContext, ApprovalGate, ApprovalSettings};
use crate::compaction::compact;
use crate::delivery::{DeliveryError, OutboundChannel};
use crate::failover::{ModelRunError, ModelSelection};
use crate::generate::{GenerationResult, Generator, Turn};
use crate::llm::ModelGateway;
use crate::streaming::{StreamThrottle, StreamWriter};
use crate::tools::{ScheduleTaskTool, ToolRegistry};

#[derive(Debug, Error)]
pub enum JobError {
    #[error("conversation `{0}` has no context")]
    ContextMissing(String),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
    #[error(transparent)]
    Model(#[from] ModelRunError),
    #[error("reply delivery failed: {0}")]
    Delivery(#[from] DeliveryError),
}

impl JobError {
    pub fn error_class(&self) -> &'static str {
        match self {
            Self::ContextMissing(_) => "context_missing",
            Self::Repository(_) => "repository",
            Self::Model(_) => "model",
            Self::Delivery(_) => "delivery",
        }
    }
}

/// Store collaborators shared by the job loop and inbound handling.
#[derive(Clone)]
pub struct AgentStores {
    pub jobs: Arc<dyn JobQueue>,
    pub conversations: Arc<dyn ConversationStore>,
    pub messages: Arc<dyn MessageStore>,
    pub approvals: Arc<dyn ApprovalStore>,
    pub schedules: Arc<dyn ScheduleStore>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct JobLoopSettings {
    pub worker_id: String,
    pub batch_size: u32,
    pub poll_interval: Duration,
    pub stream_throttle: Duration,
    pub max_steps: u32,
    pub context_window: u64,
    pub models: ModelSelection,
    pub approval: ApprovalSettings,
}

impl JobLoopSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            worker_id: config.agent.worker_id.clone(),
            batch_size: config.agent.batch_size,
            poll_interval: Duration::from_millis(config.agent.poll_interval_ms),
            stream_throttle: Duration::from_millis(config.agent.stream_throttle_ms),
            max_steps: config.agent.max_steps,
            context_window: config.llm.context_window,
            models: ModelSelection::new(config.llm.model.clone(), config.llm.fallback_model.clone()),
            approval: ApprovalSettings::from_config(&config.agent),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobOutcome {
    /// Another worker holds the job; nothing was written.
    Skipped,
    Completed,
    Failed,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl BatchReport {
    fn record(&mut self, outcome: JobOutcome) {
        match outcome {
            JobOutcome::Skipped => self.skipped += 1,
            JobOutcome::Completed => self.completed += 1,
            JobOutcome::Failed => self.failed += 1,
        }
    }

    pub fn processed(&self) -> usize {
        self.completed + self.failed
    }
}

/// Claims pending jobs and answers each conversation turn, one job at a time.
pub struct JobLoop {
    stores: AgentStores,
    generator: Generator,
    approval_gate: ApprovalGate,
    outbound: Arc<dyn OutboundChannel>,
    tools: ToolRegistry,
    settings: JobLoopSettings,
}

impl JobLoop {
    pub fn new(
        stores: AgentStores,
        gateway: Arc<dyn ModelGateway>,
        outbound: Arc<dyn OutboundChannel>,
        tools: ToolRegistry,
        settings: JobLoopSettings,
    ) -> Self {
        let approval_gate =
            ApprovalGate::new(stores.approvals.clone(), outbound.clone(), settings.approval.clone());
        Self {
            generator: Generator::new(gateway, settings.max_steps),
            stores,
            approval_gate,
            outbound,
            tools,
            settings,
        }
    }

    /// Processes until `shutdown` turns true or its sender is dropped. A job
    /// that has started is always finished first.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut enqueued = self.stores.jobs.subscribe();
        info!(
            event_name = "agent.loop.started",
            worker_id = %self.settings.worker_id,
            poll_interval_ms = self.settings.poll_interval.as_millis() as u64,
            "job loop started"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }
            if let Err(error) = self.drain_pending(Some(&shutdown)).await {
                error!(
                    event_name = "agent.loop.poll_failed",
                    error = %error,
                    "could not list pending jobs"
                );
            }

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = enqueued.changed() => {}
                _ = sleep(self.settings.poll_interval) => {}
            }
        }

        info!(event_name = "agent.loop.stopped", worker_id = %self.settings.worker_id, "job loop stopped");
    }

    /// Processes one batch of pending jobs.
    pub async fn process_batch(&self) -> Result<BatchReport, RepositoryError> {
        self.drain_pending(None).await
    }

    async fn drain_pending(
        &self,
        shutdown: Option<&watch::Receiver<bool>>,
    ) -> Result<BatchReport, RepositoryError> {
        let jobs = self.stores.jobs.pending_jobs(self.settings.batch_size).await?;
        let mut report = BatchReport::default();

        for job in &jobs {
            if shutdown.is_some_and(|shutdown| *shutdown.borrow()) {
                break;
            }
            report.record(self.process_job(job).await);
        }

        if report != BatchReport::default() {
            debug!(
                event_name = "agent.loop.batch_processed",
                completed = report.completed,
                failed = report.failed,
                skipped = report.skipped,
                "batch processed"
            );
        }
        Ok(report)
    }

    pub async fn process_job(&self, job: &Job) -> JobOutcome {
        match self.stores.jobs.claim(&job.id, &self.settings.worker_id).await {
            Ok(true) => {}
            Ok(false) => {
                debug!(
                    event_name = "agent.job.claim_lost",
                    correlation_id = %job.id.0,
                    "job already claimed elsewhere"
                );
                return JobOutcome::Skipped;
            }
            Err(error) => {
                warn!(
                    event_name = "agent.job.claim_failed",
                    correlation_id = %job.id.0,
                    error = %error,
                    "could not claim job"
                );
                return JobOutcome::Skipped;
            }
        }

        info!(
            event_name = "agent.job.claimed",
            correlation_id = %job.id.0,
            conversation_id = %job.conversation_id.0,
            "processing job"
        );

        match self.run_turn(job).await {
            Ok(()) => {
                info!(event_name = "agent.job.completed", correlation_id = %job.id.0, "job completed");
                JobOutcome::Completed
            }
            Err(failure) => {
                error!(
                    event_name = "agent.job.failed",
                    correlation_id = %job.id.0,
                    conversation_id = %job.conversation_id.0,
                    error_class = failure.error_class(),
                    error = %failure,
                    "job failed"
                );
                if let Err(error) = self.stores.jobs.fail(&job.id).await {
                    error!(
                        event_name = "agent.job.fail_not_recorded",
                        correlation_id = %job.id.0,
                        error = %error,
                        "could not mark job failed"
                    );
                }
                JobOutcome::Failed
            }
        }
    }

    async fn run_turn(&self, job: &Job) -> Result<(), JobError> {
        let mut context = self
            .stores
            .conversations
            .get_conversation_context(&job.conversation_id)
            .await?
            .ok_or_else(|| JobError::ContextMissing(job.conversation_id.0.clone()))?;
        if context.agent.as_ref().is_some_and(|agent| !agent.enabled) {
            context.agent = None;
        }
        let channel = context.conversation.channel;

        let history: Vec<ChatMessage> = context.messages.iter().map(ChatMessage::from).collect();

        let evaluation = evaluate_context(&history, Some(self.settings.context_window));
        info!(
            event_name = "agent.context.evaluated",
            correlation_id = %job.id.0,
            tokens = evaluation.tokens,
            max = evaluation.max,
            should_compact = evaluation.should_compact,
            should_block = evaluation.should_block,
            "context evaluated"
        );
        if evaluation.should_block {
            warn!(
                event_name = "agent.context.over_budget",
                correlation_id = %job.id.0,
                tokens = evaluation.tokens,
                max = evaluation.max,
                "context exceeds the blocking threshold; continuing"
            );
        }

        let models = self.models_for(&context);
        let compaction = compact(self.generator.gateway(), &models, history).await?;
        if let Some(summary) = &compaction.summary {
            self.stores
                .messages
                .add_summary_message(&job.conversation_id, summary, channel)
                .await?;
            info!(
                event_name = "agent.context.compacted",
                correlation_id = %job.id.0,
                conversation_id = %job.conversation_id.0,
                "conversation compacted"
            );
        }

        let system_prompt = build_system_prompt(&context.skills, context.agent.as_ref());
        let tools = self.tools_for(job, &context);
        let turn = Turn {
            system_prompt: &system_prompt,
            history: &compaction.messages,
            tools: &tools,
            models: &models,
        };

        if channel.supports_streaming() {
            self.answer_streaming(job, channel, &turn).await?;
        } else {
            self.answer_and_forward(job, &context, &turn).await?;
        }

        self.stores.jobs.complete(&job.id).await?;
        Ok(())
    }

    fn models_for(&self, context: &ConversationContext) -> ModelSelection {
        let agent = context.agent.as_ref();
        let primary = agent
            .and_then(|agent| agent.model.clone())
            .filter(|model| !model.trim().is_empty())
            .unwrap_or_else(|| self.settings.models.primary.clone());
        let fallback = agent
            .and_then(|agent| agent.fallback_model.clone())
            .filter(|model| !model.trim().is_empty())
            .or_else(|| self.settings.models.fallback.clone());
        ModelSelection::new(primary, fallback)
    }

    fn tools_for(&self, job: &Job, context: &ConversationContext) -> ToolRegistry {
        let channel = context.conversation.channel;
        let mut policies = vec![default_policy(channel)];
        policies.extend(context.tool_policy_overrides());
        let policy = merge_tool_policies(&policies);

        let approval_context = ApprovalContext {
            job_id: job.id.clone(),
            conversation_id: job.conversation_id.clone(),
            channel,
            phone: context.recipient_phone().map(str::to_string),
        };
        let mut tools = self.tools.clone();
        tools.insert(Arc::new(ScheduleTaskTool::new(
            self.stores.schedules.clone(),
            job.conversation_id.clone(),
        )));
        self.approval_gate.wrap_tools(tools.filtered(&policy), &approval_context)
    }

    async fn answer_streaming(
        &self,
        job: &Job,
        channel: Channel,
        turn: &Turn<'_>,
    ) -> Result<(), JobError> {
        let placeholder =
            self.stores.messages.create_placeholder(&job.conversation_id, channel).await?;
        let writer = StreamWriter::spawn(self.stores.messages.clone(), placeholder.clone());
        let throttle = Mutex::new(StreamThrottle::new(self.settings.stream_throttle));

        let on_chunk = |accumulated: &str| {
            let admitted =
                throttle.lock().map(|mut throttle| throttle.admit(Instant::now())).unwrap_or(false);
            if admitted {
                writer.push(accumulated.to_string());
            }
        };
        let generated = self.generator.generate_streaming(turn, &on_chunk).await;
        writer.drain().await;
        let GenerationResult { content, tool_calls, model_used } = generated?;

        self.stores.messages.finalize_message(&placeholder, &content, tool_calls).await?;
        info!(
            event_name = "agent.reply.streamed",
            correlation_id = %job.id.0,
            model = %model_used,
            message_id = %placeholder.0,
            "streamed reply finalized"
        );
        Ok(())
    }

    async fn answer_and_forward(
        &self,
        job: &Job,
        context: &ConversationContext,
        turn: &Turn<'_>,
    ) -> Result<(), JobError> {
        let GenerationResult { content, tool_calls, model_used } =
            self.generator.generate(turn).await?;
        let message = self
            .stores
            .messages
            .add_assistant_message(
                &job.conversation_id,
                &content,
                context.conversation.channel,
                tool_calls,
            )
            .await?;
        info!(
            event_name = "agent.reply.stored",
            correlation_id = %job.id.0,
            model = %model_used,
            message_id = %message.id.0,
            "reply stored"
        );

        let Some(phone) = context.recipient_phone() else {
            return Ok(());
        };
        match self.outbound.send(phone, &content).await {
            Ok(()) => {
                self.stores.messages.update_status(&message.id, MessageStatus::Delivered).await?;
                Ok(())
            }
            Err(error) => {
                self.stores.messages.update_status(&message.id, MessageStatus::Failed).await?;
                Err(error.into())
            }
        }
    }
}
