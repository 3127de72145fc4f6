use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::memory::MAX_STORED_TURNS;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub llm: LlmConfig,
    pub agent: AgentDefaults,
    pub orchestrator: OrchestratorConfig,
    pub database: DatabaseConfig,
    pub server: ServerConfig,
    pub logging: LoggingConfig,
}

#[derive(Clone, Debug)]
pub struct LlmConfig {
    pub provider: LlmProvider,
    pub api_key: Option<SecretString>,
    pub base_url: Option<String>,
    pub model: String,
    pub timeout_secs: u64,
}

#[derive(Clone, Debug, PartialEq)]
pub struct AgentDefaults {
    pub default_temperature: f32,
    pub default_max_tokens: u32,
    pub max_tool_iterations: usize,
}

#[derive(Clone, Debug, PartialEq)]
pub struct OrchestratorConfig {
    pub max_parallel_steps: usize,
    pub min_confidence: f32,
    pub fallback_agent: Option<String>,
    pub router: RouterKind,
    /// Prior conversation turns replayed into each step's chat.
    pub history_window: usize,
}

#[derive(Clone, Debug)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub timeout_secs: u64,
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind_address: String,
    pub port: u16,
    pub graceful_shutdown_secs: u64,
}

#[derive(Clone, Debug)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LlmProvider {
    #[serde(rename = "openai", alias = "open_ai")]
    OpenAi,
    Together,
    Ollama,
}

impl LlmProvider {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::OpenAi => "openai",
            Self::Together => "together",
            Self::Ollama => "ollama",
        }
    }

    pub fn default_base_url(self) -> &'static str {
        match self {
            Self::OpenAi => "https://api.openai.com/v1",
            Self::Together => "https://api.together.xyz/v1",
            Self::Ollama => "http://localhost:11434/v1",
        }
    }

    pub fn requires_api_key(self) -> bool {
        matches!(self, Self::OpenAi | Self::Together)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouterKind {
    Keyword,
    Model,
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
    pub llm_provider: Option<LlmProvider>,
    pub llm_model: Option<String>,
    pub llm_api_key: Option<String>,
    pub router: Option<RouterKind>,
    pub server_port: Option<u16>,
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
            llm: LlmConfig {
                provider: LlmProvider::Ollama,
                api_key: None,
                base_url: None,
                model: "llama3.1".to_string(),
                timeout_secs: 60,
            },
            agent: AgentDefaults::default(),
            orchestrator: OrchestratorConfig::default(),
            database: DatabaseConfig {
                url: "sqlite://syncso.db".to_string(),
                max_connections: 5,
                timeout_secs: 30,
            },
            server: ServerConfig {
                bind_address: "127.0.0.1".to_string(),
                port: 8080,
                graceful_shutdown_secs: 15,
            },
            logging: LoggingConfig { level: "info".to_string(), format: LogFormat::Compact },
        }
    }
}

impl Default for AgentDefaults {
    fn default() -> Self {
        Self { default_temperature: 0.7, default_max_tokens: 2048, max_tool_iterations: 8 }
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_parallel_steps: 4,
            min_confidence: 0.5,
            fallback_agent: None,
            router: RouterKind::Keyword,
            history_window: 10,
        }
    }
}

impl LlmConfig {
    /// Configured base URL, or the provider's public endpoint.
    pub fn effective_base_url(&self) -> String {
        self.base_url
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .unwrap_or(self.provider.default_base_url())
            .trim_end_matches('/')
            .to_string()
    }
}

fn secret_value(value: String) -> SecretString {
    value.into()
}

impl std::str::FromStr for LlmProvider {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "openai" | "open_ai" => Ok(Self::OpenAi),
            "together" => Ok(Self::Together),
            "ollama" => Ok(Self::Ollama),
            other => Err(ConfigError::Validation(format!(
                "unsupported llm provider `{other}` (expected openai|together|ollama)"
            ))),
        }
    }
}

impl std::str::FromStr for RouterKind {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "keyword" => Ok(Self::Keyword),
            "model" => Ok(Self::Model),
            other => Err(ConfigError::Validation(format!(
                "unsupported router `{other}` (expected keyword|model)"
            ))),
        }
    }
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
            let expected = options.config_path.unwrap_or_else(|| PathBuf::from("syncso.toml"));
            return Err(ConfigError::MissingConfigFile(expected));
        }

        config.apply_env_overrides()?;
        config.apply_overrides(options.overrides);
        config.validate()?;

        Ok(config)
    }

    fn apply_patch(&mut self, patch: ConfigPatch) {
        if let Some(llm) = patch.llm {
            if let Some(provider) = llm.provider {
                self.llm.provider = provider;
            }
            if let Some(llm_api_key_value) = llm.api_key {
                self.llm.api_key = Some(secret_value(llm_api_key_value));
            }
            if let Some(base_url) = llm.base_url {
                self.llm.base_url = Some(base_url);
            }
            if let Some(model) = llm.model {
                self.llm.model = model;
            }
            if let Some(timeout_secs) = llm.timeout_secs {
                self.llm.timeout_secs = timeout_secs;
            }
        }

        if let Some(agent) = patch.agent {
            if let Some(default_temperature) = agent.default_temperature {
                self.agent.default_temperature = default_temperature;
            }
            if let Some(default_max_tokens) = agent.default_max_tokens {
                self.agent.default_max_tokens = default_max_tokens;
            }
            if let Some(max_tool_iterations) = agent.max_tool_iterations {
                self.agent.max_tool_iterations = max_tool_iterations;
            }
        }

        if let Some(orchestrator) = patch.orchestrator {
            if let Some(max_parallel_steps) = orchestrator.max_parallel_steps {
                self.orchestrator.max_parallel_steps = max_parallel_steps;
            }
            if let Some(min_confidence) = orchestrator.min_confidence {
                self.orchestrator.min_confidence = min_confidence;
            }
            if let Some(fallback_agent) = orchestrator.fallback_agent {
                self.orchestrator.fallback_agent = Some(fallback_agent);
            }
            if let Some(router) = orchestrator.router {
                self.orchestrator.router = router;
            }
            if let Some(history_window) = orchestrator.history_window {
                self.orchestrator.history_window = history_window;
            }
        }

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

        if let Some(server) = patch.server {
            if let Some(bind_address) = server.bind_address {
                self.server.bind_address = bind_address;
            }
            if let Some(port) = server.port {
                self.server.port = port;
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
        if let Some(value) = read_env("SYNCSO_LLM_PROVIDER") {
            self.llm.provider = value.parse()?;
        }
        if let Some(value) = read_env("SYNCSO_LLM_API_KEY") {
            self.llm.api_key = Some(secret_value(value));
        }
        if let Some(value) = read_env("SYNCSO_LLM_BASE_URL") {
            self.llm.base_url = Some(value);
        }
        if let Some(value) = read_env("SYNCSO_LLM_MODEL") {
            self.llm.model = value;
        }
        if let Some(value) = read_env("SYNCSO_LLM_TIMEOUT_SECS") {
            self.llm.timeout_secs = parse_env("SYNCSO_LLM_TIMEOUT_SECS", &value)?;
        }

        if let Some(value) = read_env("SYNCSO_AGENT_DEFAULT_TEMPERATURE") {
            self.agent.default_temperature =
                parse_env("SYNCSO_AGENT_DEFAULT_TEMPERATURE", &value)?;
        }
        if let Some(value) = read_env("SYNCSO_AGENT_DEFAULT_MAX_TOKENS") {
            self.agent.default_max_tokens = parse_env("SYNCSO_AGENT_DEFAULT_MAX_TOKENS", &value)?;
        }
        if let Some(value) = read_env("SYNCSO_AGENT_MAX_TOOL_ITERATIONS") {
            self.agent.max_tool_iterations =
                parse_env("SYNCSO_AGENT_MAX_TOOL_ITERATIONS", &value)?;
        }

        if let Some(value) = read_env("SYNCSO_ORCHESTRATOR_MAX_PARALLEL_STEPS") {
            self.orchestrator.max_parallel_steps =
                parse_env("SYNCSO_ORCHESTRATOR_MAX_PARALLEL_STEPS", &value)?;
        }
        if let Some(value) = read_env("SYNCSO_ORCHESTRATOR_MIN_CONFIDENCE") {
            self.orchestrator.min_confidence =
                parse_env("SYNCSO_ORCHESTRATOR_MIN_CONFIDENCE", &value)?;
        }
        if let Some(value) = read_env("SYNCSO_ORCHESTRATOR_FALLBACK_AGENT") {
            self.orchestrator.fallback_agent = Some(value);
        }
        if let Some(value) = read_env("SYNCSO_ORCHESTRATOR_ROUTER") {
            self.orchestrator.router = value.parse()?;
        }
        if let Some(value) = read_env("SYNCSO_ORCHESTRATOR_HISTORY_WINDOW") {
            self.orchestrator.history_window =
                parse_env("SYNCSO_ORCHESTRATOR_HISTORY_WINDOW", &value)?;
        }

        if let Some(value) = read_env("SYNCSO_DATABASE_URL") {
            self.database.url = value;
        }
        if let Some(value) = read_env("SYNCSO_DATABASE_MAX_CONNECTIONS") {
            self.database.max_connections = parse_env("SYNCSO_DATABASE_MAX_CONNECTIONS", &value)?;
        }
        if let Some(value) = read_env("SYNCSO_DATABASE_TIMEOUT_SECS") {
            self.database.timeout_secs = parse_env("SYNCSO_DATABASE_TIMEOUT_SECS", &value)?;
        }

        if let Some(value) = read_env("SYNCSO_SERVER_BIND_ADDRESS") {
            self.server.bind_address = value;
        }
        if let Some(value) = read_env("SYNCSO_SERVER_PORT") {
            self.server.port = parse_env("SYNCSO_SERVER_PORT", &value)?;
        }
        if let Some(value) = read_env("SYNCSO_SERVER_GRACEFUL_SHUTDOWN_SECS") {
            self.server.graceful_shutdown_secs =
                parse_env("SYNCSO_SERVER_GRACEFUL_SHUTDOWN_SECS", &value)?;
        }

        let log_level = read_env("SYNCSO_LOGGING_LEVEL").or_else(|| read_env("SYNCSO_LOG_LEVEL"));
        if let Some(value) = log_level {
            self.logging.level = value;
        }
        let log_format =
            read_env("SYNCSO_LOGGING_FORMAT").or_else(|| read_env("SYNCSO_LOG_FORMAT"));
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
        if let Some(llm_provider) = overrides.llm_provider {
            self.llm.provider = llm_provider;
        }
        if let Some(llm_model) = overrides.llm_model {
            self.llm.model = llm_model;
        }
        if let Some(llm_api_key) = overrides.llm_api_key {
            self.llm.api_key = Some(secret_value(llm_api_key));
        }
        if let Some(router) = overrides.router {
            self.orchestrator.router = router;
        }
        if let Some(port) = overrides.server_port {
            self.server.port = port;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_llm(&self.llm)?;
        validate_agent(&self.agent)?;
        validate_orchestrator(&self.orchestrator)?;
        validate_database(&self.database)?;
        validate_server(&self.server)?;
        validate_logging(&self.logging)?;
        Ok(())
    }
}

fn resolve_config_path(explicit_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit_path {
        return path.exists().then_some(path.to_path_buf());
    }

    [PathBuf::from("syncso.toml"), PathBuf::from("config/syncso.toml")]
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

fn validate_llm(llm: &LlmConfig) -> Result<(), ConfigError> {
    if llm.timeout_secs == 0 || llm.timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "llm.timeout_secs must be in range 1..=300".to_string(),
        ));
    }

    if llm.model.trim().is_empty() {
        return Err(ConfigError::Validation(
            "llm.model is required; agents without a pinned model inherit it".to_string(),
        ));
    }

    if llm.provider.requires_api_key() {
        let missing = llm
            .api_key
            .as_ref()
            .map(|value| value.expose_secret().trim().is_empty())
            .unwrap_or(true);
        if missing {
            return Err(ConfigError::Validation(format!(
                "llm.api_key is required for the {} provider (set SYNCSO_LLM_API_KEY)",
                llm.provider.as_str()
            )));
        }
    }

    if let Some(base_url) = &llm.base_url {
        let trimmed = base_url.trim();
        if !trimmed.is_empty()
            && !trimmed.starts_with("http://")
            && !trimmed.starts_with("https://")
        {
            return Err(ConfigError::Validation(
                "llm.base_url must start with http:// or https://".to_string(),
            ));
        }
    }

    Ok(())
}

fn validate_agent(agent: &AgentDefaults) -> Result<(), ConfigError> {
    if !(0.0..=2.0).contains(&agent.default_temperature) {
        return Err(ConfigError::Validation(
            "agent.default_temperature must be in range 0.0..=2.0".to_string(),
        ));
    }

    if agent.default_max_tokens == 0 {
        return Err(ConfigError::Validation(
            "agent.default_max_tokens must be greater than zero".to_string(),
        ));
    }

    if agent.max_tool_iterations == 0 || agent.max_tool_iterations > 64 {
        return Err(ConfigError::Validation(
            "agent.max_tool_iterations must be in range 1..=64".to_string(),
        ));
    }

    Ok(())
}

fn validate_orchestrator(orchestrator: &OrchestratorConfig) -> Result<(), ConfigError> {
    if orchestrator.max_parallel_steps == 0 {
        return Err(ConfigError::Validation(
            "orchestrator.max_parallel_steps must be greater than zero".to_string(),
        ));
    }

    if !(0.0..=1.0).contains(&orchestrator.min_confidence) {
        return Err(ConfigError::Validation(
            "orchestrator.min_confidence must be in range 0.0..=1.0".to_string(),
        ));
    }

    if orchestrator.history_window > MAX_STORED_TURNS {
        return Err(ConfigError::Validation(format!(
            "orchestrator.history_window must not exceed {MAX_STORED_TURNS} stored turns"
        )));
    }

    if let Some(fallback) = &orchestrator.fallback_agent {
        if fallback.trim().is_empty() {
            return Err(ConfigError::Validation(
                "orchestrator.fallback_agent must not be blank when set".to_string(),
            ));
        }
    }

    Ok(())
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

fn validate_server(server: &ServerConfig) -> Result<(), ConfigError> {
    if server.port == 0 {
        return Err(ConfigError::Validation("server.port must be greater than zero".to_string()));
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

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse::<T>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

#[derive(Debug, Default, Deserialize)]
struct ConfigPatch {
    llm: Option<LlmPatch>,
    agent: Option<AgentPatch>,
    orchestrator: Option<OrchestratorPatch>,
    database: Option<DatabasePatch>,
    server: Option<ServerPatch>,
    logging: Option<LoggingPatch>,
}

#[derive(Debug, Default, Deserialize)]
struct LlmPatch {
    provider: Option<LlmProvider>,
    api_key: Option<String>,
    base_url: Option<String>,
    model: Option<String>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct AgentPatch {
    default_temperature: Option<f32>,
    default_max_tokens: Option<u32>,
    max_tool_iterations: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
struct OrchestratorPatch {
    max_parallel_steps: Option<usize>,
    min_confidence: Option<f32>,
    fallback_agent: Option<String>,
    router: Option<RouterKind>,
    history_window: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
struct DatabasePatch {
    url: Option<String>,
    max_connections: Option<u32>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct ServerPatch {
    bind_address: Option<String>,
    port: Option<u16>,
    graceful_shutdown_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct LoggingPatch {
    level: Option<String>,
    format: Option<LogFormat>,
}
