//! Directory of agent configurations with lazily constructed instances.
//!
//! Every mutation and every instance construction happens under the write
//! lock, so concurrent `get` callers never observe a half-built agent.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use serde::Serialize;
use syncso_core::domain::agent::{AgentConfig, AgentId, AgentStatus};
use syncso_core::errors::AgentError;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::agent::{AgentSettings, BaseAgent};
use crate::llm::CompletionProvider;
use crate::tools::{SharedToolHandler, ToolSet};

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("agent `{0}` is not registered")]
    UnknownAgent(AgentId),
}

#[derive(Clone)]
pub struct AgentRegistryEntry {
    pub config: AgentConfig,
    pub status: AgentStatus,
    instance: Option<Arc<BaseAgent>>,
    bindings: ToolSet,
}

impl AgentRegistryEntry {
    pub fn instance(&self) -> Option<&Arc<BaseAgent>> {
        self.instance.as_ref()
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.bindings.names()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct AgentSummary {
    pub id: AgentId,
    pub name: String,
    pub description: String,
    pub capabilities: Vec<String>,
    pub status: AgentStatus,
    pub tools: Vec<String>,
}

pub struct AgentRegistry {
    entries: RwLock<HashMap<AgentId, AgentRegistryEntry>>,
    provider: Arc<dyn CompletionProvider>,
    settings: AgentSettings,
    default_model: Option<String>,
}

impl AgentRegistry {
    pub fn new(provider: Arc<dyn CompletionProvider>, settings: AgentSettings) -> Self {
        Self { entries: RwLock::new(HashMap::new()), provider, settings, default_model: None }
    }

    /// Model given to agents whose config leaves `model` empty.
    pub fn with_default_model(mut self, model: impl Into<String>) -> Self {
        self.default_model = Some(model.into()).filter(|model| !model.trim().is_empty());
        self
    }

    pub fn provider(&self) -> Arc<dyn CompletionProvider> {
        Arc::clone(&self.provider)
    }

    pub fn settings(&self) -> &AgentSettings {
        &self.settings
    }

    pub fn register(&self, config: AgentConfig) -> Result<(), AgentError> {
        self.register_with_status(config, AgentStatus::Active)
    }

    /// Upserts by id. Re-registering keeps tool bindings and drops the cached instance.
    pub fn register_with_status(
        &self,
        mut config: AgentConfig,
        status: AgentStatus,
    ) -> Result<(), AgentError> {
        if config.model.trim().is_empty() {
            if let Some(model) = &self.default_model {
                config.model = model.clone();
            }
        }
        validate_config(&config)?;

        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let id = config.id.clone();
        match entries.get_mut(&id) {
            Some(entry) => {
                warn!(
                    event_name = "registry.agent.overwritten",
                    agent_id = %id,
                    "agent re-registered; replacing configuration"
                );
                entry.config = config;
                entry.status = status;
                entry.instance = None;
            }
            None => {
                info!(
                    event_name = "registry.agent.registered",
                    agent_id = %id,
                    status = ?status,
                    "agent registered"
                );
                entries.insert(
                    id,
                    AgentRegistryEntry { config, status, instance: None, bindings: ToolSet::new() },
                );
            }
        }
        Ok(())
    }

    /// Instance for an active agent, constructed on first use. `None` means unavailable.
    pub fn get(&self, id: &AgentId) -> Option<Arc<BaseAgent>> {
        {
            let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
            let entry = entries.get(id)?;
            if !entry.status.is_active() {
                return None;
            }
            if let Some(instance) = &entry.instance {
                return Some(Arc::clone(instance));
            }
        }

        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let entry = entries.get_mut(id)?;
        if !entry.status.is_active() {
            return None;
        }
        if let Some(instance) = &entry.instance {
            return Some(Arc::clone(instance));
        }

        let agent = match BaseAgent::new(
            entry.config.clone(),
            Arc::clone(&self.provider),
            self.settings.clone(),
        ) {
            Ok(agent) => agent,
            Err(construction_error) => {
                error!(
                    event_name = "registry.agent.construction_failed",
                    agent_id = %id,
                    error = %construction_error,
                    "could not construct agent"
                );
                return None;
            }
        };
        for (name, handler) in entry.bindings.iter() {
            agent.register_tool(name.clone(), Arc::clone(handler));
        }

        let instance = Arc::new(agent);
        entry.instance = Some(Arc::clone(&instance));
        info!(event_name = "registry.agent.constructed", agent_id = %id, "agent instance constructed");
        Some(instance)
    }

    /// Leaving `active` discards the cached instance.
    pub fn set_status(&self, id: &AgentId, status: AgentStatus) -> Result<(), RegistryError> {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let entry = entries.get_mut(id).ok_or_else(|| RegistryError::UnknownAgent(id.clone()))?;
        let previous = entry.status;
        entry.status = status;
        if !status.is_active() {
            entry.instance = None;
        }
        info!(
            event_name = "registry.agent.status_changed",
            agent_id = %id,
            from = ?previous,
            to = ?status,
            "agent status changed"
        );
        Ok(())
    }

    pub fn status(&self, id: &AgentId) -> Option<AgentStatus> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries.get(id).map(|entry| entry.status)
    }

    pub fn register_tool(
        &self,
        id: &AgentId,
        name: impl Into<String>,
        handler: SharedToolHandler,
    ) -> Result<(), RegistryError> {
        let name = name.into();
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let entry = entries.get_mut(id).ok_or_else(|| RegistryError::UnknownAgent(id.clone()))?;
        bind(entry, name, handler);
        Ok(())
    }

    /// Binds the tool to every agent registered right now and returns how many
    /// were bound. Agents registered later do not receive it.
    pub fn register_global_tool(&self, name: impl Into<String>, handler: SharedToolHandler) -> usize {
        let name = name.into();
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        for entry in entries.values_mut() {
            bind(entry, name.clone(), Arc::clone(&handler));
        }
        info!(
            event_name = "registry.tool.broadcast",
            tool = %name,
            agents = entries.len(),
            "global tool bound to known agents"
        );
        entries.len()
    }

    pub fn entry(&self, id: &AgentId) -> Option<AgentRegistryEntry> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries.get(id).cloned()
    }

    pub fn config(&self, id: &AgentId) -> Option<AgentConfig> {
        self.entry(id).map(|entry| entry.config)
    }

    pub fn has(&self, id: &AgentId) -> bool {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries.contains_key(id)
    }

    pub fn list(&self) -> Vec<AgentConfig> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        let mut configs: Vec<AgentConfig> =
            entries.values().map(|entry| entry.config.clone()).collect();
        configs.sort_by(|left, right| left.id.cmp(&right.id));
        configs
    }

    pub fn list_active(&self) -> Vec<AgentConfig> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        let mut configs: Vec<AgentConfig> = entries
            .values()
            .filter(|entry| entry.status.is_active())
            .map(|entry| entry.config.clone())
            .collect();
        configs.sort_by(|left, right| left.id.cmp(&right.id));
        configs
    }

    pub fn summaries(&self) -> Vec<AgentSummary> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        let mut summaries: Vec<AgentSummary> = entries
            .values()
            .map(|entry| AgentSummary {
                id: entry.config.id.clone(),
                name: entry.config.name.clone(),
                description: entry.config.description.clone(),
                capabilities: entry.config.capabilities.clone(),
                status: entry.status,
                tools: entry.bindings.names(),
            })
            .collect();
        summaries.sort_by(|left, right| left.id.cmp(&right.id));
        summaries
    }

    pub fn unregister(&self, id: &AgentId) -> bool {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let removed = entries.remove(id).is_some();
        if removed {
            info!(event_name = "registry.agent.unregistered", agent_id = %id, "agent unregistered");
        }
        removed
    }

    pub fn clear(&self) {
        self.entries.write().unwrap_or_else(PoisonError::into_inner).clear();
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn bind(entry: &mut AgentRegistryEntry, name: String, handler: SharedToolHandler) {
    if let Some(instance) = &entry.instance {
        instance.register_tool(name.clone(), Arc::clone(&handler));
    }
    entry.bindings.register(name, handler);
}

fn validate_config(config: &AgentConfig) -> Result<(), AgentError> {
    if config.id.as_str().trim().is_empty() {
        return Err(AgentError::Configuration("agent id must not be empty".to_string()));
    }
    if config.model.trim().is_empty() {
        return Err(AgentError::Configuration(format!(
            "agent `{}` has no model and no default model is configured",
            config.id
        )));
    }
    if config.system_prompt.trim().is_empty() {
        return Err(AgentError::Configuration(format!(
            "agent `{}` has no system prompt",
            config.id
        )));
    }
    Ok(())
}
