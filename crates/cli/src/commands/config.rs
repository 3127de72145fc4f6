use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use secrecy::ExposeSecret;
use syncso_core::config::{AppConfig, LoadOptions};
use toml::Value;

struct Field {
    key: &'static str,
    env_keys: &'static [&'static str],
    value: String,
}

impl Field {
    fn new(key: &'static str, env_keys: &'static [&'static str], value: impl ToString) -> Self {
        Self { key, env_keys, value: value.to_string() }
    }
}

pub fn run() -> String {
    let config = match AppConfig::load(LoadOptions::default()) {
        Ok(config) => config,
        Err(error) => return format!("config validation failed: {error}"),
    };

    let config_file_path = detect_config_path();
    let config_file_doc = load_config_file_doc(config_file_path.as_deref());

    let api_key = config
        .llm
        .api_key
        .as_ref()
        .map(|key| redact_token(key.expose_secret()))
        .unwrap_or_else(|| "<unset>".to_string());
    let base_url = match &config.llm.base_url {
        Some(url) => url.clone(),
        None => format!("{} (provider default)", config.llm.effective_base_url()),
    };

    let fields = [
        Field::new("llm.provider", &["SYNCSO_LLM_PROVIDER"], config.llm.provider.as_str()),
        Field::new("llm.model", &["SYNCSO_LLM_MODEL"], &config.llm.model),
        Field::new("llm.base_url", &["SYNCSO_LLM_BASE_URL"], base_url),
        Field::new("llm.api_key", &["SYNCSO_LLM_API_KEY"], api_key),
        Field::new("llm.timeout_secs", &["SYNCSO_LLM_TIMEOUT_SECS"], config.llm.timeout_secs),
        Field::new(
            "agent.default_temperature",
            &["SYNCSO_AGENT_DEFAULT_TEMPERATURE"],
            config.agent.default_temperature,
        ),
        Field::new(
            "agent.default_max_tokens",
            &["SYNCSO_AGENT_DEFAULT_MAX_TOKENS"],
            config.agent.default_max_tokens,
        ),
        Field::new(
            "agent.max_tool_iterations",
            &["SYNCSO_AGENT_MAX_TOOL_ITERATIONS"],
            config.agent.max_tool_iterations,
        ),
        Field::new(
            "orchestrator.max_parallel_steps",
            &["SYNCSO_ORCHESTRATOR_MAX_PARALLEL_STEPS"],
            config.orchestrator.max_parallel_steps,
        ),
        Field::new(
            "orchestrator.min_confidence",
            &["SYNCSO_ORCHESTRATOR_MIN_CONFIDENCE"],
            config.orchestrator.min_confidence,
        ),
        Field::new(
            "orchestrator.fallback_agent",
            &["SYNCSO_ORCHESTRATOR_FALLBACK_AGENT"],
            config.orchestrator.fallback_agent.as_deref().unwrap_or("<unset>"),
        ),
        Field::new(
            "orchestrator.router",
            &["SYNCSO_ORCHESTRATOR_ROUTER"],
            format!("{:?}", config.orchestrator.router).to_lowercase(),
        ),
        Field::new(
            "orchestrator.history_window",
            &["SYNCSO_ORCHESTRATOR_HISTORY_WINDOW"],
            config.orchestrator.history_window,
        ),
        Field::new("database.url", &["SYNCSO_DATABASE_URL"], &config.database.url),
        Field::new(
            "database.max_connections",
            &["SYNCSO_DATABASE_MAX_CONNECTIONS"],
            config.database.max_connections,
        ),
        Field::new(
            "database.timeout_secs",
            &["SYNCSO_DATABASE_TIMEOUT_SECS"],
            config.database.timeout_secs,
        ),
        Field::new(
            "server.bind_address",
            &["SYNCSO_SERVER_BIND_ADDRESS"],
            &config.server.bind_address,
        ),
        Field::new("server.port", &["SYNCSO_SERVER_PORT"], config.server.port),
        Field::new(
            "server.graceful_shutdown_secs",
            &["SYNCSO_SERVER_GRACEFUL_SHUTDOWN_SECS"],
            config.server.graceful_shutdown_secs,
        ),
        Field::new(
            "logging.level",
            &["SYNCSO_LOGGING_LEVEL", "SYNCSO_LOG_LEVEL"],
            &config.logging.level,
        ),
        Field::new(
            "logging.format",
            &["SYNCSO_LOGGING_FORMAT", "SYNCSO_LOG_FORMAT"],
            format!("{:?}", config.logging.format).to_lowercase(),
        ),
    ];

    let mut lines = vec!["effective config (source precedence: env > file > default):".to_string()];
    for field in &fields {
        let source = field_source(
            field.key,
            field.env_keys,
            config_file_doc.as_ref(),
            config_file_path.as_deref(),
        );
        lines.push(render_line(field.key, &field.value, source));
    }

    lines.join("\n")
}

fn detect_config_path() -> Option<PathBuf> {
    ["syncso.toml", "config/syncso.toml"].into_iter().map(PathBuf::from).find(|path| path.exists())
}

fn load_config_file_doc(path: Option<&Path>) -> Option<Value> {
    let path = path?;
    let raw = fs::read_to_string(path).ok()?;
    raw.parse::<Value>().ok()
}

fn field_source(
    key_path: &str,
    env_keys: &[&str],
    config_file_doc: Option<&Value>,
    config_file_path: Option<&Path>,
) -> String {
    if let Some(env_key) = env_keys.iter().find(|key| env::var_os(key).is_some()) {
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

fn redact_token(token: &str) -> String {
    let trimmed = token.trim();
    if trimmed.is_empty() {
        return "<empty>".to_string();
    }

    if let Some((prefix, _)) = trimmed.split_once('-') {
        return format!("{prefix}-***");
    }

    "<redacted>".to_string()
}
