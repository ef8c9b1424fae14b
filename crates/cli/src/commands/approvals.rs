use zenthor_core::domain::approval::{ApprovalId, ApprovalStatus};
use zenthor_core::domain::conversation::ConversationId;
use zenthor_db::repositories::{ApprovalStore, SqlApprovalRepository};

use crate::commands::{
    load_config, open_database, repository_failure, runtime, CommandFailure, CommandResult,
    EXIT_NOT_FOUND,
};

/// Lists pending tool approvals, optionally for one conversation.
pub fn list(conversation: Option<&str>) -> CommandResult {
    const COMMAND: &str = "approvals list";
    let config = match load_config(COMMAND) {
        Ok(config) => config,
        Err(failure) => return failure,
    };
    let runtime = match runtime(COMMAND) {
        Ok(runtime) => runtime,
        Err(failure) => return failure,
    };

    let result = runtime.block_on(async {
        let pool = open_database(&config).await?;
        let approvals = SqlApprovalRepository::new(pool.clone());
        let pending = match conversation {
            Some(conversation) => {
                approvals
                    .get_pending_by_conversation(&ConversationId(conversation.to_string()))
                    .await
            }
            None => approvals.list_pending().await,
        };
        pool.close().await;
        pending.map_err(repository_failure)
    });

    match result {
        Ok(pending) => {
            let data = serde_json::to_value(&pending).ok();
            CommandResult::success_with_data(
                COMMAND,
                format!("{} pending approval(s)", pending.len()),
                data,
            )
        }
        Err((error_class, message, exit_code)) => {
            CommandResult::failure(COMMAND, error_class, message, exit_code)
        }
    }
}

/// Approves or rejects a pending tool approval. A waiting job picks the
/// decision up on its next poll.
pub fn resolve(id: &str, approve: bool) -> CommandResult {
    const COMMAND: &str = "approvals resolve";
    let config = match load_config(COMMAND) {
        Ok(config) => config,
        Err(failure) => return failure,
    };
    let runtime = match runtime(COMMAND) {
        Ok(runtime) => runtime,
        Err(failure) => return failure,
    };

    let status = if approve { ApprovalStatus::Approved } else { ApprovalStatus::Rejected };
    let approval_id = ApprovalId(id.to_string());
    let result = runtime.block_on(async {
        let pool = open_database(&config).await?;
        let approvals = SqlApprovalRepository::new(pool.clone());
        let resolved = approvals.resolve(&approval_id, status).await;
        pool.close().await;

        match resolved.map_err(repository_failure)? {
            Some(approval) => Ok(approval),
            None => Err::<_, CommandFailure>((
                "not_pending",
                format!("approval `{}` does not exist or is already resolved", approval_id.0),
                EXIT_NOT_FOUND,
            )),
        }
    });

    match result {
        Ok(approval) => CommandResult::success_with_data(
            COMMAND,
            format!("approval {} {}", approval.id.0, approval.status.as_str()),
            serde_json::to_value(&approval).ok(),
        ),
        Err((error_class, message, exit_code)) => {
            CommandResult::failure(COMMAND, error_class, message, exit_code)
        }
    }
}
