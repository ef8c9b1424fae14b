use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub llm: LlmConfig,
    pub agent: AgentConfig,
    pub delivery: DeliveryConfig,
    pub server: ServerConfig,
    pub logging: LoggingConfig,
}

#[derive(Clone, Debug)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub timeout_secs: u64,
}

#[derive(Clone, Debug)]
pub struct LlmConfig {
    pub base_url: String,
    pub api_key: Option<SecretString>,
    pub model: String,
    pub fallback_model: Option<String>,
    pub timeout_secs: u64,
    pub context_window: u64,
}

#[derive(Clone, Debug)]
pub struct AgentConfig {
    pub worker_id: String,
    pub poll_interval_ms: u64,
    pub batch_size: u32,
    pub stream_throttle_ms: u64,
    pub max_steps: u32,
    pub approval_poll_interval_ms: u64,
    pub approval_timeout_secs: u64,
    pub high_risk_tools: Vec<String>,
    pub schedule_poll_secs: u64,
    pub cleanup_interval_secs: u64,
    pub job_retention_days: u32,
}

#[derive(Clone, Debug, Default)]
pub struct DeliveryConfig {
    pub whatsapp_webhook_url: Option<String>,
    pub whatsapp_webhook_token: Option<SecretString>,
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind_address: String,
    pub health_check_port: u16,
    pub graceful_shutdown_secs: u64,
}

#[derive(Clone, Debug)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Compact,
    Pretty,
    Json,
}

#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    pub database_url: Option<String>,
    pub log_level: Option<String>,
    pub llm_model: Option<String>,
    pub llm_fallback_model: Option<String>,
    pub worker_id: Option<String>,
}

#[derive(Clone, Debug, Default)]
pub struct LoadOptions {
    pub config_path: Option<PathBuf>,
    pub require_file: bool,
    pub overrides: ConfigOverrides,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file `{path}`: {source}")]
    ReadFile { path: PathBuf, source: std::io::Error },
    #[error("could not parse config file `{path}`: {source}")]
    ParseFile { path: PathBuf, source: toml::de::Error },
    #[error("required config file was not found: `{0}`")]
    MissingConfigFile(PathBuf),
    #[error("environment variable interpolation failed for `{var}`")]
    MissingEnvInterpolation { var: String },
    #[error("unterminated environment interpolation expression")]
    UnterminatedInterpolation,
    #[error("invalid environment override for `{key}`: `{value}`")]
    InvalidEnvOverride { key: String, value: String },
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: "sqlite://zenthor.db".to_string(),
                max_connections: 5,
                timeout_secs: 30,
            },
            llm: LlmConfig {
                base_url: "http://localhost:11434/v1".to_string(),
                api_key: None,
                model: "llama3.1".to_string(),
                fallback_model: None,
                timeout_secs: 60,
                context_window: 200_000,
            },
            agent: AgentConfig {
                worker_id: "zenthor-worker".to_string(),
                poll_interval_ms: 1_000,
                batch_size: 10,
                stream_throttle_ms: 200,
                max_steps: 10,
                approval_poll_interval_ms: 1_000,
                approval_timeout_secs: 300,
                high_risk_tools: Vec::new(),
                schedule_poll_secs: 300,
                cleanup_interval_secs: 86_400,
                job_retention_days: 7,
            },
            delivery: DeliveryConfig::default(),
            server: ServerConfig {
                bind_address: "127.0.0.1".to_string(),
                health_check_port: 8080,
                graceful_shutdown_secs: 15,
            },
            logging: LoggingConfig { level: "info".to_string(), format: LogFormat::Compact },
        }
    }
}

fn secret_value(value: String) -> SecretString {
    value.into()
}

impl std::str::FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "compact" => Ok(Self::Compact),
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(ConfigError::Validation(format!(
                "unsupported log format `{other}` (expected compact|pretty|json)"
            ))),
        }
    }
}

impl AppConfig {
    pub fn load(options: LoadOptions) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let maybe_path = resolve_config_path(options.config_path.as_deref());

        if let Some(path) = maybe_path {
            let patch = read_patch(&path)?;
            config.apply_patch(patch);
        } else if options.require_file {
            let expected = options.config_path.unwrap_or_else(|| PathBuf::from("zenthor.toml"));
            return Err(ConfigError::MissingConfigFile(expected));
        }

        config.apply_env_overrides()?;
        config.apply_overrides(options.overrides);
        config.validate()?;

        Ok(config)
    }

    fn apply_patch(&mut self, patch: ConfigPatch) {
        if let Some(database) = patch.database {
            if let Some(url) = database.url {
                self.database.url = url;
            }
            if let Some(max_connections) = database.max_connections {
                self.database.max_connections = max_connections;
            }
            if let Some(timeout_secs) = database.timeout_secs {
                self.database.timeout_secs = timeout_secs;
            }
        }

        if let Some(llm) = patch.llm {
            if let Some(base_url) = llm.base_url {
                self.llm.base_url = base_url;
            }
            if let Some(api_key) = llm.api_key {
                self.llm.api_key = Some(secret_value(api_key));
            }
            if let Some(model) = llm.model {
                self.llm.model = model;
            }
            if let Some(fallback_model) = llm.fallback_model {
                self.llm.fallback_model = Some(fallback_model);
            }
            if let Some(timeout_secs) = llm.timeout_secs {
                self.llm.timeout_secs = timeout_secs;
            }
            if let Some(context_window) = llm.context_window {
                self.llm.context_window = context_window;
            }
        }

        if let Some(agent) = patch.agent {
            if let Some(worker_id) = agent.worker_id {
                self.agent.worker_id = worker_id;
            }
            if let Some(poll_interval_ms) = agent.poll_interval_ms {
                self.agent.poll_interval_ms = poll_interval_ms;
            }
            if let Some(batch_size) = agent.batch_size {
                self.agent.batch_size = batch_size;
            }
            if let Some(stream_throttle_ms) = agent.stream_throttle_ms {
                self.agent.stream_throttle_ms = stream_throttle_ms;
            }
            if let Some(max_steps) = agent.max_steps {
                self.agent.max_steps = max_steps;
            }
            if let Some(approval_poll_interval_ms) = agent.approval_poll_interval_ms {
                self.agent.approval_poll_interval_ms = approval_poll_interval_ms;
            }
            if let Some(approval_timeout_secs) = agent.approval_timeout_secs {
                self.agent.approval_timeout_secs = approval_timeout_secs;
            }
            if let Some(high_risk_tools) = agent.high_risk_tools {
                self.agent.high_risk_tools = high_risk_tools;
            }
            if let Some(schedule_poll_secs) = agent.schedule_poll_secs {
                self.agent.schedule_poll_secs = schedule_poll_secs;
            }
            if let Some(cleanup_interval_secs) = agent.cleanup_interval_secs {
                self.agent.cleanup_interval_secs = cleanup_interval_secs;
            }
            if let Some(job_retention_days) = agent.job_retention_days {
                self.agent.job_retention_days = job_retention_days;
            }
        }

        if let Some(delivery) = patch.delivery {
            if let Some(url) = delivery.whatsapp_webhook_url {
                self.delivery.whatsapp_webhook_url = Some(url);
            }
            if let Some(token) = delivery.whatsapp_webhook_token {
                self.delivery.whatsapp_webhook_token = Some(secret_value(token));
            }
        }

        if let Some(server) = patch.server {
            if let Some(bind_address) = server.bind_address {
                self.server.bind_address = bind_address;
            }
            if let Some(health_check_port) = server.health_check_port {
                self.server.health_check_port = health_check_port;
            }
            if let Some(graceful_shutdown_secs) = server.graceful_shutdown_secs {
                self.server.graceful_shutdown_secs = graceful_shutdown_secs;
            }
        }

        if let Some(logging) = patch.logging {
            if let Some(level) = logging.level {
                self.logging.level = level;
            }
            if let Some(format) = logging.format {
                self.logging.format = format;
            }
        }
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(value) = read_env("ZENTHOR_DATABASE_URL") {
            self.database.url = value;
        }
        if let Some(value) = read_env("ZENTHOR_DATABASE_MAX_CONNECTIONS") {
            self.database.max_connections =
                parse_u32("ZENTHOR_DATABASE_MAX_CONNECTIONS", &value)?;
        }
        if let Some(value) = read_env("ZENTHOR_DATABASE_TIMEOUT_SECS") {
            self.database.timeout_secs = parse_u64("ZENTHOR_DATABASE_TIMEOUT_SECS", &value)?;
        }

        if let Some(value) = read_env("ZENTHOR_LLM_BASE_URL") {
            self.llm.base_url = value;
        }
        if let Some(value) = read_env("ZENTHOR_LLM_API_KEY") {
            self.llm.api_key = Some(secret_value(value));
        }
        if let Some(value) = read_env("ZENTHOR_LLM_MODEL") {
            self.llm.model = value;
        }
        if let Some(value) = read_env("ZENTHOR_LLM_FALLBACK_MODEL") {
            self.llm.fallback_model = Some(value);
        }
        if let Some(value) = read_env("ZENTHOR_LLM_TIMEOUT_SECS") {
            self.llm.timeout_secs = parse_u64("ZENTHOR_LLM_TIMEOUT_SECS", &value)?;
        }
        if let Some(value) = read_env("ZENTHOR_LLM_CONTEXT_WINDOW") {
            self.llm.context_window = parse_u64("ZENTHOR_LLM_CONTEXT_WINDOW", &value)?;
        }

        if let Some(value) = read_env("ZENTHOR_AGENT_WORKER_ID") {
            self.agent.worker_id = value;
        }
        if let Some(value) = read_env("ZENTHOR_AGENT_POLL_INTERVAL_MS") {
            self.agent.poll_interval_ms = parse_u64("ZENTHOR_AGENT_POLL_INTERVAL_MS", &value)?;
        }
        if let Some(value) = read_env("ZENTHOR_AGENT_BATCH_SIZE") {
            self.agent.batch_size = parse_u32("ZENTHOR_AGENT_BATCH_SIZE", &value)?;
        }
        if let Some(value) = read_env("ZENTHOR_AGENT_STREAM_THROTTLE_MS") {
            self.agent.stream_throttle_ms =
                parse_u64("ZENTHOR_AGENT_STREAM_THROTTLE_MS", &value)?;
        }
        if let Some(value) = read_env("ZENTHOR_AGENT_MAX_STEPS") {
            self.agent.max_steps = parse_u32("ZENTHOR_AGENT_MAX_STEPS", &value)?;
        }
        if let Some(value) = read_env("ZENTHOR_AGENT_APPROVAL_POLL_INTERVAL_MS") {
            self.agent.approval_poll_interval_ms =
                parse_u64("ZENTHOR_AGENT_APPROVAL_POLL_INTERVAL_MS", &value)?;
        }
        if let Some(value) = read_env("ZENTHOR_AGENT_APPROVAL_TIMEOUT_SECS") {
            self.agent.approval_timeout_secs =
                parse_u64("ZENTHOR_AGENT_APPROVAL_TIMEOUT_SECS", &value)?;
        }
        if let Some(value) = read_env("ZENTHOR_AGENT_HIGH_RISK_TOOLS") {
            self.agent.high_risk_tools = parse_list(&value);
        }
        if let Some(value) = read_env("ZENTHOR_AGENT_SCHEDULE_POLL_SECS") {
            self.agent.schedule_poll_secs = parse_u64("ZENTHOR_AGENT_SCHEDULE_POLL_SECS", &value)?;
        }
        if let Some(value) = read_env("ZENTHOR_AGENT_CLEANUP_INTERVAL_SECS") {
            self.agent.cleanup_interval_secs =
                parse_u64("ZENTHOR_AGENT_CLEANUP_INTERVAL_SECS", &value)?;
        }
        if let Some(value) = read_env("ZENTHOR_AGENT_JOB_RETENTION_DAYS") {
            self.agent.job_retention_days = parse_u32("ZENTHOR_AGENT_JOB_RETENTION_DAYS", &value)?;
        }

        if let Some(value) = read_env("ZENTHOR_DELIVERY_WHATSAPP_WEBHOOK_URL") {
            self.delivery.whatsapp_webhook_url = Some(value);
        }
        if let Some(value) = read_env("ZENTHOR_DELIVERY_WHATSAPP_WEBHOOK_TOKEN") {
            self.delivery.whatsapp_webhook_token = Some(secret_value(value));
        }

        if let Some(value) = read_env("ZENTHOR_SERVER_BIND_ADDRESS") {
            self.server.bind_address = value;
        }
        if let Some(value) = read_env("ZENTHOR_SERVER_HEALTH_CHECK_PORT") {
            self.server.health_check_port =
                parse_u16("ZENTHOR_SERVER_HEALTH_CHECK_PORT", &value)?;
        }
        if let Some(value) = read_env("ZENTHOR_SERVER_GRACEFUL_SHUTDOWN_SECS") {
            self.server.graceful_shutdown_secs =
                parse_u64("ZENTHOR_SERVER_GRACEFUL_SHUTDOWN_SECS", &value)?;
        }

        let log_level = read_env("ZENTHOR_LOGGING_LEVEL").or_else(|| read_env("ZENTHOR_LOG_LEVEL"));
        if let Some(value) = log_level {
            self.logging.level = value;
        }
        let log_format =
            read_env("ZENTHOR_LOGGING_FORMAT").or_else(|| read_env("ZENTHOR_LOG_FORMAT"));
        if let Some(value) = log_format {
            self.logging.format = value.parse()?;
        }

        Ok(())
    }

    fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        if let Some(database_url) = overrides.database_url {
            self.database.url = database_url;
        }
        if let Some(log_level) = overrides.log_level {
            self.logging.level = log_level;
        }
        if let Some(llm_model) = overrides.llm_model {
            self.llm.model = llm_model;
        }
        if let Some(fallback_model) = overrides.llm_fallback_model {
            self.llm.fallback_model = Some(fallback_model);
        }
        if let Some(worker_id) = overrides.worker_id {
            self.agent.worker_id = worker_id;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_database(&self.database)?;
        validate_llm(&self.llm)?;
        validate_agent(&self.agent)?;
        validate_delivery(&self.delivery)?;
        validate_server(&self.server)?;
        validate_logging(&self.logging)?;
        Ok(())
    }
}

fn resolve_config_path(explicit_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit_path {
        return path.exists().then_some(path.to_path_buf());
    }

    [PathBuf::from("zenthor.toml"), PathBuf::from("config/zenthor.toml")]
        .into_iter()
        .find(|path| path.exists())
}

fn read_patch(path: &Path) -> Result<ConfigPatch, ConfigError> {
    let raw = fs::read_to_string(path)
        .map_err(|source| ConfigError::ReadFile { path: path.to_path_buf(), source })?;

    let interpolated = interpolate_env_vars(&raw)?;
    toml::from_str::<ConfigPatch>(&interpolated)
        .map_err(|source| ConfigError::ParseFile { path: path.to_path_buf(), source })
}

fn interpolate_env_vars(input: &str) -> Result<String, ConfigError> {
    let mut output = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && matches!(chars.peek(), Some('{')) {
            chars.next();
            let mut key = String::new();

            loop {
                match chars.next() {
                    Some('}') => break,
                    Some(next) => key.push(next),
                    None => return Err(ConfigError::UnterminatedInterpolation),
                }
            }

            let value = env::var(&key)
                .map_err(|_| ConfigError::MissingEnvInterpolation { var: key.clone() })?;
            output.push_str(&value);
            continue;
        }

        output.push(ch);
    }

    Ok(output)
}

fn is_http_url(value: &str) -> bool {
    value.starts_with("http://") || value.starts_with("https://")
}

fn validate_database(database: &DatabaseConfig) -> Result<(), ConfigError> {
    let url = database.url.trim();
    let sqlite_url =
        url.starts_with("sqlite://") || url.starts_with("sqlite::") || url == ":memory:";
    if !sqlite_url {
        return Err(ConfigError::Validation(
            "database.url must be a sqlite URL (`sqlite://...`, `sqlite::...`, or `:memory:`)"
                .to_string(),
        ));
    }

    if database.max_connections == 0 {
        return Err(ConfigError::Validation(
            "database.max_connections must be greater than zero".to_string(),
        ));
    }

    if database.timeout_secs == 0 || database.timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "database.timeout_secs must be in range 1..=300".to_string(),
        ));
    }

    Ok(())
}

fn validate_llm(llm: &LlmConfig) -> Result<(), ConfigError> {
    if !is_http_url(llm.base_url.trim()) {
        return Err(ConfigError::Validation(
            "llm.base_url must start with http:// or https://".to_string(),
        ));
    }

    if llm.model.trim().is_empty() {
        return Err(ConfigError::Validation("llm.model must not be empty".to_string()));
    }

    if llm.fallback_model.as_ref().is_some_and(|model| model.trim().is_empty()) {
        return Err(ConfigError::Validation(
            "llm.fallback_model must not be empty when set".to_string(),
        ));
    }

    if llm.timeout_secs == 0 || llm.timeout_secs > 600 {
        return Err(ConfigError::Validation(
            "llm.timeout_secs must be in range 1..=600".to_string(),
        ));
    }

    if llm.context_window < 1_000 {
        return Err(ConfigError::Validation(
            "llm.context_window must be at least 1000 tokens".to_string(),
        ));
    }

    Ok(())
}

fn validate_agent(agent: &AgentConfig) -> Result<(), ConfigError> {
    if agent.worker_id.trim().is_empty() {
        return Err(ConfigError::Validation("agent.worker_id must not be empty".to_string()));
    }

    if agent.poll_interval_ms == 0 {
        return Err(ConfigError::Validation(
            "agent.poll_interval_ms must be greater than zero".to_string(),
        ));
    }

    if agent.batch_size == 0 {
        return Err(ConfigError::Validation(
            "agent.batch_size must be greater than zero".to_string(),
        ));
    }

    if agent.max_steps == 0 || agent.max_steps > 50 {
        return Err(ConfigError::Validation("agent.max_steps must be in range 1..=50".to_string()));
    }

    if agent.approval_poll_interval_ms == 0 {
        return Err(ConfigError::Validation(
            "agent.approval_poll_interval_ms must be greater than zero".to_string(),
        ));
    }

    if agent.approval_timeout_secs == 0 {
        return Err(ConfigError::Validation(
            "agent.approval_timeout_secs must be greater than zero".to_string(),
        ));
    }

    if agent.schedule_poll_secs == 0 || agent.cleanup_interval_secs == 0 {
        return Err(ConfigError::Validation(
            "agent.schedule_poll_secs and agent.cleanup_interval_secs must be greater than zero"
                .to_string(),
        ));
    }

    if agent.job_retention_days == 0 {
        return Err(ConfigError::Validation(
            "agent.job_retention_days must be greater than zero".to_string(),
        ));
    }

    Ok(())
}

fn validate_delivery(delivery: &DeliveryConfig) -> Result<(), ConfigError> {
    if let Some(url) = &delivery.whatsapp_webhook_url {
        if !is_http_url(url.trim()) {
            return Err(ConfigError::Validation(
                "delivery.whatsapp_webhook_url must start with http:// or https://".to_string(),
            ));
        }
    }

    let has_empty_token = delivery
        .whatsapp_webhook_token
        .as_ref()
        .is_some_and(|token| token.expose_secret().trim().is_empty());
    if has_empty_token {
        return Err(ConfigError::Validation(
            "delivery.whatsapp_webhook_token must not be empty when set".to_string(),
        ));
    }

    Ok(())
}

fn validate_server(server: &ServerConfig) -> Result<(), ConfigError> {
    if server.health_check_port == 0 {
        return Err(ConfigError::Validation(
            "server.health_check_port must be greater than zero".to_string(),
        ));
    }

    if server.graceful_shutdown_secs == 0 {
        return Err(ConfigError::Validation(
            "server.graceful_shutdown_secs must be greater than zero".to_string(),
        ));
    }

    Ok(())
}

fn validate_logging(logging: &LoggingConfig) -> Result<(), ConfigError> {
    let level = logging.level.trim().to_ascii_lowercase();
    match level.as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
        _ => Err(ConfigError::Validation(
            "logging.level must be one of trace|debug|info|warn|error".to_string(),
        )),
    }
}

fn read_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn parse_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_u16(key: &str, value: &str) -> Result<u16, ConfigError> {
    value.parse::<u16>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_u32(key: &str, value: &str) -> Result<u32, ConfigError> {
    value.parse::<u32>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_u64(key: &str, value: &str) -> Result<u64, ConfigError> {
    value.parse::<u64>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

#[derive(Debug, Default, Deserialize)]
struct ConfigPatch {
    database: Option<DatabasePatch>,
    llm: Option<LlmPatch>,
    agent: Option<AgentPatch>,
    delivery: Option<DeliveryPatch>,
    server: Option<ServerPatch>,
    logging: Option<LoggingPatch>,
}

#[derive(Debug, Default, Deserialize)]
struct DatabasePatch {
    url: Option<String>,
    max_connections: Option<u32>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct LlmPatch {
    base_url: Option<String>,
    api_key: Option<String>,
    model: Option<String>,
    fallback_model: Option<String>,
    timeout_secs: Option<u64>,
    context_window: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct AgentPatch {
    worker_id: Option<String>,
    poll_interval_ms: Option<u64>,
    batch_size: Option<u32>,
    stream_throttle_ms: Option<u64>,
    max_steps: Option<u32>,
    approval_poll_interval_ms: Option<u64>,
    approval_timeout_secs: Option<u64>,
    high_risk_tools: Option<Vec<String>>,
    schedule_poll_secs: Option<u64>,
    cleanup_interval_secs: Option<u64>,
    job_retention_days: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
struct DeliveryPatch {
    whatsapp_webhook_url: Option<String>,
    whatsapp_webhook_token: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ServerPatch {
    bind_address: Option<String>,
    health_check_port: Option<u16>,
    graceful_shutdown_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct LoggingPatch {
    level: Option<String>,
    format: Option<LogFormat>,
}
