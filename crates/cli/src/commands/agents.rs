use serde::Serialize;
use syncso_agent::catalog;
use syncso_core::domain::agent::AgentId;

use crate::commands::CommandResult;

#[derive(Debug, Serialize)]
struct CatalogEntry {
    id: AgentId,
    name: String,
    description: String,
    capabilities: Vec<String>,
    tools: Vec<String>,
}

pub fn run() -> CommandResult {
    let entries: Vec<CatalogEntry> = catalog::builtin_agents()
        .into_iter()
        .map(|agent| CatalogEntry {
            tools: agent.tools.iter().map(|tool| tool.name.clone()).collect(),
            id: agent.id,
            name: agent.name,
            description: agent.description,
            capabilities: agent.capabilities,
        })
        .collect();

    match serde_json::to_value(&entries) {
        Ok(data) => CommandResult::success_with_data(
            "agents",
            format!("{} built-in agent(s)", entries.len()),
            Some(data),
        ),
        Err(error) => CommandResult::failure("agents", "serialization", error.to_string(), 1),
    }
}
