use std::future::Future;

use thiserror::Error;
use tracing::warn;

use zenthor_core::errors::{FailoverReason, ModelError};

/// Primary model and optional fallback for one turn.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ModelSelection {
    pub primary: String,
    pub fallback: Option<String>,
}

impl ModelSelection {
    pub fn new(primary: impl Into<String>, fallback: Option<String>) -> Self {
        Self { primary: primary.into(), fallback }
    }

    /// Fallback to try after a failure of the primary, if one is usable.
    pub fn fallback_candidate(&self) -> Option<&str> {
        self.fallback
            .as_deref()
            .map(str::trim)
            .filter(|fallback| !fallback.is_empty() && *fallback != self.primary)
    }
}

/// Terminal failure after every eligible model was attempted.
#[derive(Debug, Error)]
#[error("model `{model}` failed ({reason}): {source}")]
pub struct ModelRunError {
    pub model: String,
    pub reason: FailoverReason,
    #[source]
    pub source: ModelError,
}

impl ModelRunError {
    fn from_failure(model: &str, source: ModelError) -> Self {
        Self { model: model.to_string(), reason: source.reason(), source }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct FailoverOutcome<T> {
    pub value: T,
    pub model_used: String,
}

/// Runs `run` against the primary model and, when the failure warrants it
/// and a distinct fallback is configured, once more against the fallback.
/// Never makes more than two attempts and never sleeps between them.
pub async fn run_with_fallback<T, F, Fut>(
    selection: &ModelSelection,
    mut run: F,
) -> Result<FailoverOutcome<T>, ModelRunError>
where
    F: FnMut(String) -> Fut,
    Fut: Future<Output = Result<T, ModelError>>,
{
    let primary_error = match run(selection.primary.clone()).await {
        Ok(value) => return Ok(FailoverOutcome { value, model_used: selection.primary.clone() }),
        Err(error) => error,
    };

    let reason = primary_error.reason();
    let Some(fallback) = selection.fallback_candidate() else {
        return Err(ModelRunError::from_failure(&selection.primary, primary_error));
    };
    if !reason.warrants_failover() {
        return Err(ModelRunError::from_failure(&selection.primary, primary_error));
    }

    warn!(
        event_name = "agent.model.failover",
        model = %selection.primary,
        fallback_model = %fallback,
        reason = reason.as_str(),
        error = %primary_error,
        "primary model failed, trying fallback"
    );

    match run(fallback.to_string()).await {
        Ok(value) => Ok(FailoverOutcome { value, model_used: fallback.to_string() }),
        Err(error) => Err(ModelRunError::from_failure(fallback, error)),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use zenthor_core::errors::{FailoverReason, ModelError};

    use super::{run_with_fallback, ModelSelection};

    async fn run_script(
        selection: &ModelSelection,
        outcomes: Vec<Result<&'static str, ModelError>>,
    ) -> (Result<super::FailoverOutcome<&'static str>, super::ModelRunError>, Vec<String>) {
        let attempts = Mutex::new(Vec::new());
        let outcomes = Mutex::new(outcomes.into_iter());
        let result = run_with_fallback(selection, |model| {
            if let Ok(mut attempts) = attempts.lock() {
                attempts.push(model);
            }
            let next = outcomes
                .lock()
                .ok()
                .and_then(|mut outcomes| outcomes.next())
                .unwrap_or_else(|| Err(ModelError::new("unexpected attempt")));
            async move { next }
        })
        .await;
        let attempts = attempts.into_inner().unwrap_or_default();
        (result, attempts)
    }

    #[tokio::test]
    async fn primary_success_skips_fallback() {
        let selection = ModelSelection::new("primary", Some("backup".to_string()));
        let (result, attempts) = run_script(&selection, vec![Ok("hi")]).await;

        let outcome = result.expect("success");
        assert_eq!(outcome.value, "hi");
        assert_eq!(outcome.model_used, "primary");
        assert_eq!(attempts, vec!["primary"]);
    }

    #[tokio::test]
    async fn retryable_primary_failure_uses_fallback() {
        let selection = ModelSelection::new("primary", Some("backup".to_string()));
        let (result, attempts) = run_script(
            &selection,
            vec![Err(ModelError::with_status(429, "slow down")), Ok("from backup")],
        )
        .await;

        let outcome = result.expect("fallback success");
        assert_eq!(outcome.value, "from backup");
        assert_eq!(outcome.model_used, "backup");
        assert_eq!(attempts, vec!["primary", "backup"]);
    }

    #[tokio::test]
    async fn context_overflow_is_eligible_for_failover() {
        let selection = ModelSelection::new("small", Some("large".to_string()));
        let (result, attempts) = run_script(
            &selection,
            vec![Err(ModelError::new("maximum context length is 8192 tokens")), Ok("ok")],
        )
        .await;

        assert_eq!(result.expect("fallback success").model_used, "large");
        assert_eq!(attempts.len(), 2);
    }

    #[tokio::test]
    async fn auth_failure_does_not_attempt_fallback() {
        let selection = ModelSelection::new("primary", Some("backup".to_string()));
        let (result, attempts) =
            run_script(&selection, vec![Err(ModelError::with_status(401, "bad key")), Ok("x")])
                .await;

        let error = result.expect_err("auth failure is terminal");
        assert_eq!(error.reason, FailoverReason::Auth);
        assert_eq!(error.model, "primary");
        assert_eq!(attempts, vec!["primary"]);
    }

    #[tokio::test]
    async fn fallback_equal_to_primary_is_ignored() {
        let selection = ModelSelection::new("same", Some("same".to_string()));
        let (result, attempts) =
            run_script(&selection, vec![Err(ModelError::new("request timed out")), Ok("x")]).await;

        assert_eq!(result.expect_err("no distinct fallback").reason, FailoverReason::Timeout);
        assert_eq!(attempts, vec!["same"]);
    }

    #[tokio::test]
    async fn double_failure_reports_fallback_reason_and_model() {
        let selection = ModelSelection::new("primary", Some("backup".to_string()));
        let (result, attempts) = run_script(
            &selection,
            vec![Err(ModelError::new("timed out")), Err(ModelError::with_status(402, "no funds"))],
        )
        .await;

        let error = result.expect_err("both failed");
        assert_eq!(error.reason, FailoverReason::Billing);
        assert_eq!(error.model, "backup");
        assert_eq!(attempts.len(), 2);
    }

    #[test]
    fn blank_fallback_is_not_a_candidate() {
        assert_eq!(ModelSelection::new("a", Some("  ".to_string())).fallback_candidate(), None);
        assert_eq!(ModelSelection::new("a", None).fallback_candidate(), None);
        assert_eq!(ModelSelection::new("a", Some("b".to_string())).fallback_candidate(), Some("b"));
    }
}
