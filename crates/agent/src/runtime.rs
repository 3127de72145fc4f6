//! Wires provider, registry, router and orchestrator from [`AppConfig`].

use std::sync::Arc;
use std::time::Duration;

use syncso_core::config::{AppConfig, RouterKind};
use syncso_core::errors::AgentError;
use syncso_core::memory_store::ConversationMemoryStore;
use tracing::info;

use crate::agent::AgentSettings;
use crate::catalog;
use crate::llm::CompletionProvider;
use crate::openai::OpenAiCompatibleProvider;
use crate::orchestrator::{Orchestrator, OrchestratorSettings};
use crate::registry::AgentRegistry;
use crate::router::{KeywordRouter, ModelRouter, Router};

#[derive(Clone)]
pub struct AgentRuntime {
    registry: Arc<AgentRegistry>,
    orchestrator: Arc<Orchestrator>,
}

impl AgentRuntime {
    /// Builds the runtime against the configured OpenAI-compatible endpoint.
    pub fn from_config(
        config: &AppConfig,
        memory: Arc<dyn ConversationMemoryStore>,
    ) -> Result<Self, AgentError> {
        let provider: Arc<dyn CompletionProvider> =
            Arc::new(OpenAiCompatibleProvider::from_config(&config.llm)?);
        Self::with_provider(config, provider, memory)
    }

    pub fn with_provider(
        config: &AppConfig,
        provider: Arc<dyn CompletionProvider>,
        memory: Arc<dyn ConversationMemoryStore>,
    ) -> Result<Self, AgentError> {
        let registry = Arc::new(
            AgentRegistry::new(Arc::clone(&provider), AgentSettings::from_config(config))
                .with_default_model(config.llm.model.clone()),
        );
        let registered = catalog::register_builtin(&registry)?;

        let router: Arc<dyn Router> = match config.orchestrator.router {
            RouterKind::Keyword => Arc::new(KeywordRouter::new(catalog::builtin_routes())),
            RouterKind::Model => Arc::new(ModelRouter::new(
                Arc::clone(&provider),
                config.llm.model.clone(),
                Duration::from_secs(config.llm.timeout_secs),
            )),
        };

        info!(
            event_name = "runtime.initialized",
            provider = provider.name(),
            router = router.name(),
            agents = registered,
            "agent runtime initialized"
        );

        let orchestrator = Arc::new(Orchestrator::new(
            Arc::clone(&registry),
            router,
            memory,
            OrchestratorSettings::from_config(&config.orchestrator),
        ));
        Ok(Self { registry, orchestrator })
    }

    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use syncso_core::config::{AppConfig, LlmProvider, RouterKind};
    use syncso_core::memory_store::InMemoryConversationStore;

    use super::AgentRuntime;
    use crate::mock::ScriptedProvider;

    #[test]
    fn runtime_registers_the_catalog_with_the_default_model() {
        let mut config = AppConfig::default();
        config.llm.model = "llama3.1:8b".to_string();
        let provider = Arc::new(ScriptedProvider::new(Vec::new()));
        let runtime = AgentRuntime::with_provider(
            &config,
            provider,
            Arc::new(InMemoryConversationStore::default()),
        )
        .expect("runtime");

        assert_eq!(runtime.registry().len(), 6);
        let finance = runtime.registry().config(&"finance".into()).expect("finance");
        assert_eq!(finance.model, "llama3.1:8b");
        assert_eq!(runtime.orchestrator().router_name(), "keyword");
    }

    #[test]
    fn model_router_is_selected_from_config() {
        let mut config = AppConfig::default();
        config.orchestrator.router = RouterKind::Model;
        let runtime = AgentRuntime::with_provider(
            &config,
            Arc::new(ScriptedProvider::new(Vec::new())),
            Arc::new(InMemoryConversationStore::default()),
        )
        .expect("runtime");
        assert_eq!(runtime.orchestrator().router_name(), "model");
    }

    #[test]
    fn missing_credential_fails_construction() {
        let mut config = AppConfig::default();
        config.llm.provider = LlmProvider::OpenAi;
        config.llm.api_key = None;
        let result =
            AgentRuntime::from_config(&config, Arc::new(InMemoryConversationStore::default()));
        assert!(result.is_err());
    }
}
