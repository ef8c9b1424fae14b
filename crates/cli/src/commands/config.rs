use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use secrecy::{ExposeSecret, SecretString};
use toml::Value;
use zenthor_core::config::{AppConfig, LoadOptions};

pub fn run() -> String {
    let config = match AppConfig::load(LoadOptions::default()) {
        Ok(config) => config,
        Err(error) => return format!("config validation failed: {error}"),
    };

    let config_file_path = detect_config_path();
    let config_file_doc = load_config_file_doc(config_file_path.as_deref());

    let mut lines =
        vec!["effective config (source precedence: env > file > default):".to_string()];
    for (key_path, value) in effective_values(&config) {
        let env_key = env_key_for(key_path);
        let source = field_source(
            key_path,
            &env_key,
            config_file_doc.as_ref(),
            config_file_path.as_deref(),
        );
        lines.push(render_line(key_path, &value, source));
    }

    lines.join("\n")
}

fn effective_values(config: &AppConfig) -> Vec<(&'static str, String)> {
    vec![
        ("database.url", config.database.url.clone()),
        ("database.max_connections", config.database.max_connections.to_string()),
        ("database.timeout_secs", config.database.timeout_secs.to_string()),
        ("llm.base_url", config.llm.base_url.clone()),
        ("llm.api_key", redact_secret(config.llm.api_key.as_ref())),
        ("llm.model", config.llm.model.clone()),
        ("llm.fallback_model", or_unset(config.llm.fallback_model.as_deref())),
        ("llm.timeout_secs", config.llm.timeout_secs.to_string()),
        ("llm.context_window", config.llm.context_window.to_string()),
        ("agent.worker_id", config.agent.worker_id.clone()),
        ("agent.poll_interval_ms", config.agent.poll_interval_ms.to_string()),
        ("agent.batch_size", config.agent.batch_size.to_string()),
        ("agent.stream_throttle_ms", config.agent.stream_throttle_ms.to_string()),
        ("agent.max_steps", config.agent.max_steps.to_string()),
        ("agent.approval_poll_interval_ms", config.agent.approval_poll_interval_ms.to_string()),
        ("agent.approval_timeout_secs", config.agent.approval_timeout_secs.to_string()),
        ("agent.high_risk_tools", format!("[{}]", config.agent.high_risk_tools.join(", "))),
        ("agent.schedule_poll_secs", config.agent.schedule_poll_secs.to_string()),
        ("agent.cleanup_interval_secs", config.agent.cleanup_interval_secs.to_string()),
        ("agent.job_retention_days", config.agent.job_retention_days.to_string()),
        ("delivery.whatsapp_webhook_url", or_unset(config.delivery.whatsapp_webhook_url.as_deref())),
        ("delivery.whatsapp_webhook_token", redact_secret(config.delivery.whatsapp_webhook_token.as_ref())),
        ("server.bind_address", config.server.bind_address.clone()),
        ("server.health_check_port", config.server.health_check_port.to_string()),
        ("server.graceful_shutdown_secs", config.server.graceful_shutdown_secs.to_string()),
        ("logging.level", config.logging.level.clone()),
        ("logging.format", format!("{:?}", config.logging.format)),
    ]
}

/// `llm.api_key` -> `ZENTHOR_LLM_API_KEY`
fn env_key_for(key_path: &str) -> String {
    format!("ZENTHOR_{}", key_path.replace('.', "_").to_ascii_uppercase())
}

fn detect_config_path() -> Option<PathBuf> {
    [PathBuf::from("zenthor.toml"), PathBuf::from("config/zenthor.toml")]
        .into_iter()
        .find(|path| path.exists())
}

fn load_config_file_doc(path: Option<&Path>) -> Option<Value> {
    let path = path?;
    let raw = fs::read_to_string(path).ok()?;
    raw.parse::<Value>().ok()
}

fn field_source(
    key_path: &str,
    env_key: &str,
    config_file_doc: Option<&Value>,
    config_file_path: Option<&Path>,
) -> String {
    if env::var_os(env_key).is_some() {
        return format!("env ({env_key})");
    }

    if let Some(doc) = config_file_doc {
        if contains_path(doc, key_path) {
            let file_path = config_file_path
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "config file".to_string());
            return format!("file ({file_path})");
        }
    }

    "default".to_string()
}

fn contains_path(root: &Value, key_path: &str) -> bool {
    let mut current = root;
    for key in key_path.split('.') {
        let Some(next) = current.get(key) else {
            return false;
        };
        current = next;
    }
    true
}

fn render_line(key: &str, value: &str, source: String) -> String {
    format!("- {key} = {value} (source: {source})")
}

fn or_unset(value: Option<&str>) -> String {
    value.unwrap_or("<unset>").to_string()
}

fn redact_secret(secret: Option<&SecretString>) -> String {
    let Some(secret) = secret else {
        return "<unset>".to_string();
    };
    let trimmed = secret.expose_secret().trim();
    if trimmed.is_empty() {
        return "<empty>".to_string();
    }

    if let Some((prefix, _)) = trimmed.split_once('-') {
        return format!("{prefix}-***");
    }

    "<redacted>".to_string()
}
