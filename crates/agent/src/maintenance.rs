//! Periodic housekeeping beside the job loop: due scheduled tasks become user
//! turns with a queued job, and completed jobs past retention are deleted.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info, warn};

use zenthor_core::config::AgentConfig;
use zenthor_db::repositories::RepositoryError;

use crate::runtime::AgentStores;

#[derive(Clone, Debug, PartialEq)]
pub struct MaintenanceSettings {
    pub schedule_poll: Duration,
    pub cleanup_interval: Duration,
    pub job_retention: chrono::Duration,
    pub batch_size: u32,
}

impl MaintenanceSettings {
    pub fn from_config(config: &AgentConfig) -> Self {
        Self {
            schedule_poll: Duration::from_secs(config.schedule_poll_secs),
            cleanup_interval: Duration::from_secs(config.cleanup_interval_secs),
            job_retention: chrono::Duration::days(i64::from(config.job_retention_days)),
            batch_size: config.batch_size,
        }
    }
}

pub struct Maintenance {
    stores: AgentStores,
    settings: MaintenanceSettings,
}

impl Maintenance {
    pub fn new(stores: AgentStores, settings: MaintenanceSettings) -> Self {
        Self { stores, settings }
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut schedule_tick = interval(self.settings.schedule_poll);
        schedule_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut cleanup_tick = interval(self.settings.cleanup_interval);
        cleanup_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            event_name = "agent.maintenance.started",
            schedule_poll_secs = self.settings.schedule_poll.as_secs(),
            cleanup_interval_secs = self.settings.cleanup_interval.as_secs(),
            "maintenance loop started"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = schedule_tick.tick() => {
                    if let Err(error) = self.process_due_tasks(Utc::now()).await {
                        error!(
                            event_name = "agent.schedule.poll_failed",
                            error = %error,
                            "could not process due scheduled tasks"
                        );
                    }
                }
                _ = cleanup_tick.tick() => {
                    if let Err(error) = self.cleanup_old_jobs(Utc::now()).await {
                        error!(
                            event_name = "agent.jobs.cleanup_failed",
                            error = %error,
                            "could not delete old jobs"
                        );
                    }
                }
            }
        }

        info!(event_name = "agent.maintenance.stopped", "maintenance loop stopped");
    }

    /// Posts the payload of every task due at `now` as a user message, queues a
    /// job for it and moves the task to its next run. Returns the number of
    /// tasks that produced a turn.
    pub async fn process_due_tasks(&self, now: DateTime<Utc>) -> Result<usize, RepositoryError> {
        let due = self.stores.schedules.due(now, self.settings.batch_size).await?;
        let mut triggered = 0;

        for task in due {
            let conversation =
                self.stores.conversations.find_conversation(&task.conversation_id).await?;
            match conversation {
                Some(conversation) => {
                    let message = self
                        .stores
                        .messages
                        .add_user_message(&conversation.id, &task.payload, conversation.channel)
                        .await?;
                    let job = self.stores.jobs.enqueue(&conversation.id, Some(&message.id)).await?;
                    info!(
                        event_name = "agent.schedule.triggered",
                        correlation_id = %job.id.0,
                        task_id = %task.id.0,
                        conversation_id = %conversation.id.0,
                        "scheduled task queued a turn"
                    );
                    triggered += 1;
                }
                None => warn!(
                    event_name = "agent.schedule.orphaned",
                    task_id = %task.id.0,
                    conversation_id = %task.conversation_id.0,
                    "scheduled task has no conversation; skipping this run"
                ),
            }
            self.stores.schedules.record_run(&task.id, now).await?;
        }

        Ok(triggered)
    }

    /// Deletes completed jobs last touched more than the retention period
    /// before `now`.
    pub async fn cleanup_old_jobs(&self, now: DateTime<Utc>) -> Result<u64, RepositoryError> {
        let cutoff = now - self.settings.job_retention;
        let deleted = self.stores.jobs.delete_completed_before(cutoff).await?;
        if deleted > 0 {
            info!(event_name = "agent.jobs.cleaned_up", deleted, "deleted old completed jobs");
        }
        Ok(deleted)
    }
}
