use std::sync::Arc;

use syncso_agent::{AgentRuntime, SessionContext};
use syncso_core::config::{AppConfig, LoadOptions};
use syncso_db::{connect, migrations, SqlConversationMemoryStore};
use uuid::Uuid;

use crate::commands::{current_thread_runtime, CommandResult};

pub fn run(message: &str, session: Option<&str>) -> CommandResult {
    if message.trim().is_empty() {
        return CommandResult::failure("ask", "invalid_request", "message must not be empty", 1);
    }

    let config = match AppConfig::load(LoadOptions::default()) {
        Ok(config) => config,
        Err(error) => {
            return CommandResult::failure(
                "ask",
                "config_validation",
                format!("configuration issue: {error}"),
                2,
            );
        }
    };

    let runtime = match current_thread_runtime() {
        Ok(runtime) => runtime,
        Err(error) => {
            return CommandResult::failure(
                "ask",
                "runtime_init",
                format!("failed to initialize async runtime: {error}"),
                3,
            );
        }
    };

    let session_id = session
        .map(str::to_string)
        .filter(|session| !session.trim().is_empty())
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let result = runtime.block_on(async {
        let pool = connect(&config.database)
            .await
            .map_err(|error| ("db_connectivity", error.to_string(), 4u8))?;
        migrations::run_pending(&pool)
            .await
            .map_err(|error| ("migration", error.to_string(), 5u8))?;

        let store = Arc::new(SqlConversationMemoryStore::new(pool.clone()));
        let agents = AgentRuntime::from_config(&config, store)
            .map_err(|error| ("agent_configuration", error.to_string(), 2u8))?;
        let outcome = agents
            .orchestrator()
            .handle(message, &SessionContext::new(session_id.clone()))
            .await
            .map_err(|error| ("agent_runtime", error.to_string(), 6u8));

        pool.close().await;
        outcome
    });

    match result {
        Ok(workflow) => {
            let summary = format!(
                "session `{}` run `{}` finished {:?}",
                workflow.session_id, workflow.run_id, workflow.overall_status
            );
            match serde_json::to_value(&workflow) {
                Ok(data) => CommandResult::success_with_data("ask", summary, Some(data)),
                Err(error) => CommandResult::failure("ask", "serialization", error.to_string(), 1),
            }
        }
        Err((error_class, message, exit_code)) => {
            CommandResult::failure("ask", error_class, message, exit_code)
        }
    }
}
