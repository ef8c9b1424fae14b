use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde_json::json;
use thiserror::Error;
use tracing::{info, warn};

use zenthor_core::config::DeliveryConfig;

const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("no outbound transport is connected")]
    NotConnected,
    #[error("delivery request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("delivery rejected with status {status}: {body}")]
    Rejected { status: u16, body: String },
}

/// Store-and-forward transport used for replies and approval prompts.
#[async_trait]
pub trait OutboundChannel: Send + Sync {
    fn transport_name(&self) -> &'static str;

    async fn send(&self, recipient: &str, text: &str) -> Result<(), DeliveryError>;
}

/// Stand-in when no transport is configured. Every send fails with
/// [`DeliveryError::NotConnected`] so callers record the reply as undelivered.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopChannel;

#[async_trait]
impl OutboundChannel for NoopChannel {
    fn transport_name(&self) -> &'static str {
        "noop"
    }

    async fn send(&self, recipient: &str, text: &str) -> Result<(), DeliveryError> {
        warn!(
            event_name = "delivery.outbound.dropped",
            recipient,
            message_length = text.chars().count(),
            "no outbound transport connected"
        );
        Err(DeliveryError::NotConnected)
    }
}

/// Posts `{"to", "text"}` JSON to a bridge that owns the WhatsApp session.
pub struct WebhookChannel {
    client: reqwest::Client,
    url: String,
    token: Option<SecretString>,
}

impl WebhookChannel {
    pub fn new(url: impl Into<String>, token: Option<SecretString>) -> Result<Self, DeliveryError> {
        let client = reqwest::Client::builder().timeout(WEBHOOK_TIMEOUT).build()?;
        Ok(Self { client, url: url.into(), token })
    }
}

#[async_trait]
impl OutboundChannel for WebhookChannel {
    fn transport_name(&self) -> &'static str {
        "webhook"
    }

    async fn send(&self, recipient: &str, text: &str) -> Result<(), DeliveryError> {
        let mut request = self.client.post(&self.url).json(&json!({"to": recipient, "text": text}));
        if let Some(token) = &self.token {
            request = request.bearer_auth(token.expose_secret());
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(DeliveryError::Rejected { status: status.as_u16(), body });
        }

        info!(
            event_name = "delivery.outbound.sent",
            recipient,
            message_length = text.chars().count(),
            "outbound message delivered"
        );
        Ok(())
    }
}

/// Webhook transport when a URL is configured, otherwise [`NoopChannel`].
pub fn outbound_from_config(
    config: &DeliveryConfig,
) -> Result<Arc<dyn OutboundChannel>, DeliveryError> {
    match config.whatsapp_webhook_url.as_deref().map(str::trim).filter(|url| !url.is_empty()) {
        Some(url) => {
            Ok(Arc::new(WebhookChannel::new(url, config.whatsapp_webhook_token.clone())?))
        }
        None => Ok(Arc::new(NoopChannel)),
    }
}
