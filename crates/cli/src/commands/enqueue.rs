use zenthor_agent::replies::submit_user_message;
use zenthor_core::domain::conversation::ConversationId;
use zenthor_db::repositories::{ConversationStore, SqlConversationRepository, SqlJobQueue};

use crate::commands::{
    load_config, open_database, repository_failure, runtime, CommandFailure, CommandResult,
    EXIT_INVALID_INPUT, EXIT_NOT_FOUND,
};

/// Stores `text` as a user message in an existing conversation and queues a
/// job for the agent.
pub fn run(conversation: &str, text: &str) -> CommandResult {
    if text.trim().is_empty() {
        return CommandResult::failure(
            "enqueue",
            "invalid_input",
            "message text must not be empty",
            EXIT_INVALID_INPUT,
        );
    }

    let config = match load_config("enqueue") {
        Ok(config) => config,
        Err(failure) => return failure,
    };
    let runtime = match runtime("enqueue") {
        Ok(runtime) => runtime,
        Err(failure) => return failure,
    };

    let conversation_id = ConversationId(conversation.to_string());
    let result = runtime.block_on(async {
        let pool = open_database(&config).await?;
        let conversations = SqlConversationRepository::new(pool.clone());
        let jobs = SqlJobQueue::new(pool.clone());

        let outcome: Result<_, CommandFailure> = async {
            let existing = conversations
                .find_conversation(&conversation_id)
                .await
                .map_err(repository_failure)?;
            let Some(existing) = existing else {
                return Err((
                    "not_found",
                    format!("conversation `{}` does not exist", conversation_id.0),
                    EXIT_NOT_FOUND,
                ));
            };
            submit_user_message(&conversations, &jobs, &existing.id, text, existing.channel)
                .await
                .map_err(repository_failure)
        }
        .await;

        pool.close().await;
        outcome
    });

    match result {
        Ok((message, job)) => CommandResult::success_with_data(
            "enqueue",
            format!("queued job {} for conversation {}", job.id.0, job.conversation_id.0),
            Some(serde_json::json!({ "job_id": job.id.0, "message_id": message.id.0 })),
        ),
        Err((error_class, message, exit_code)) => {
            CommandResult::failure("enqueue", error_class, message, exit_code)
        }
    }
}
