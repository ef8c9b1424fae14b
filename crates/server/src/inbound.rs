use std::sync::Arc;

use axum::{extract::State, http::StatusCode, routing::post, Json, Router};
use serde::{Deserialize, Serialize};
use tracing::error;

use zenthor_agent::replies::{InboundHandler, InboundOutcome};

#[derive(Clone)]
pub struct InboundState {
    handler: Arc<InboundHandler>,
}

/// Text message relayed by the WhatsApp bridge.
#[derive(Debug, Deserialize)]
pub struct WhatsAppInbound {
    pub from: String,
    pub text: String,
}

#[derive(Debug, PartialEq, Eq, Serialize)]
pub struct InboundAck {
    pub outcome: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approval_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct InboundError {
    pub error: String,
}

pub fn router(handler: Arc<InboundHandler>) -> Router {
    Router::new()
        .route("/inbound/whatsapp", post(receive_whatsapp))
        .with_state(InboundState { handler })
}

async fn receive_whatsapp(
    State(state): State<InboundState>,
    Json(body): Json<WhatsAppInbound>,
) -> Result<Json<InboundAck>, (StatusCode, Json<InboundError>)> {
    let from = body.from.trim();
    if from.is_empty() || body.text.trim().is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(InboundError { error: "sender and text are required".to_string() }),
        ));
    }

    let outcome = state.handler.handle_whatsapp(from, &body.text).await.map_err(|error| {
        error!(event_name = "inbound.whatsapp.failed", error = %error, "inbound message not stored");
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(InboundError { error: "message could not be stored".to_string() }),
        )
    })?;

    let ack = match outcome {
        InboundOutcome::Ignored => InboundAck { outcome: "ignored", job_id: None, approval_id: None },
        InboundOutcome::ApprovalResolved(approval) => InboundAck {
            outcome: "approval_resolved",
            job_id: None,
            approval_id: Some(approval.id.0),
        },
        InboundOutcome::Queued { job, .. } => {
            InboundAck { outcome: "queued", job_id: Some(job.id.0), approval_id: None }
        }
    };
    Ok(Json(ack))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::{extract::State, http::StatusCode, Json};
    use zenthor_agent::replies::InboundHandler;
    use zenthor_db::repositories::{
        ConversationStore, InMemoryApprovalRepository, InMemoryConversationRepository,
        InMemoryJobQueue, JobQueue,
    };

    use super::{receive_whatsapp, InboundState, WhatsAppInbound};

    struct Fixture {
        conversations: Arc<InMemoryConversationRepository>,
        jobs: Arc<InMemoryJobQueue>,
        state: InboundState,
    }

    fn fixture() -> Fixture {
        let conversations = Arc::new(InMemoryConversationRepository::default());
        let jobs = Arc::new(InMemoryJobQueue::default());
        let handler = InboundHandler::new(
            conversations.clone(),
            conversations.clone(),
            Arc::new(InMemoryApprovalRepository::default()),
            jobs.clone(),
        );
        Fixture { conversations, jobs, state: InboundState { handler: Arc::new(handler) } }
    }

    fn inbound(from: &str, text: &str) -> Json<WhatsAppInbound> {
        Json(WhatsAppInbound { from: from.to_string(), text: text.to_string() })
    }

    #[tokio::test]
    async fn allowed_contact_message_is_queued() {
        let fixture = fixture();
        fixture
            .conversations
            .create_contact("5511999990000", "Ana", true)
            .await
            .expect("contact");

        let Json(ack) = receive_whatsapp(State(fixture.state), inbound("5511999990000", "hi"))
            .await
            .expect("accepted");

        assert_eq!(ack.outcome, "queued");
        let pending = fixture.jobs.pending_jobs(10).await.expect("pending");
        assert_eq!(pending.len(), 1);
        assert_eq!(ack.job_id.as_deref(), Some(pending[0].id.0.as_str()));
    }

    #[tokio::test]
    async fn unknown_sender_is_acknowledged_as_ignored() {
        let fixture = fixture();

        let Json(ack) = receive_whatsapp(State(fixture.state), inbound("5511000000000", "hi"))
            .await
            .expect("accepted");

        assert_eq!(ack.outcome, "ignored");
        assert!(fixture.jobs.pending_jobs(10).await.expect("pending").is_empty());
    }

    #[tokio::test]
    async fn blank_text_is_a_bad_request() {
        let fixture = fixture();

        let result = receive_whatsapp(State(fixture.state), inbound("5511999990000", "   ")).await;

        let Err((status, _)) = result else {
            panic!("blank text should be rejected");
        };
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }
}
