use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use syncso_agent::catalog;
use syncso_agent::llm::{
    CompletionChunk, CompletionProvider, CompletionRequest, CompletionResponse, CompletionStream,
};
use syncso_agent::mock::{ScriptedProvider, ScriptedReply};
use syncso_agent::router::{KeywordRouter, ModelRouter, RouteRequest, Router};
use syncso_agent::{AgentRegistry, AgentSettings, Orchestrator, OrchestratorSettings, SessionContext};
use syncso_core::domain::agent::{AgentId, AgentStatus};
use syncso_core::domain::message::Role;
use syncso_core::domain::workflow::{StepStatus, WorkflowStatus, WorkflowStep};
use syncso_core::errors::{ApplicationError, ProviderError};
use syncso_core::memory_store::{ConversationMemoryStore, InMemoryConversationStore};
use tokio_util::sync::CancellationToken;

struct Harness {
    provider: Arc<ScriptedProvider>,
    store: Arc<InMemoryConversationStore>,
    orchestrator: Orchestrator,
}

fn harness(replies: Vec<ScriptedReply>, settings: OrchestratorSettings) -> Harness {
    harness_with(ScriptedProvider::new(replies), settings)
}

fn harness_with(provider: ScriptedProvider, settings: OrchestratorSettings) -> Harness {
    let provider = Arc::new(provider);
    let registry = Arc::new(
        AgentRegistry::new(provider.clone(), AgentSettings::default())
            .with_default_model("m1"),
    );
    catalog::register_builtin(&registry).expect("catalog");
    let store = Arc::new(InMemoryConversationStore::new());
    let orchestrator = Orchestrator::new(
        registry,
        Arc::new(KeywordRouter::new(catalog::builtin_routes())),
        store.clone(),
        settings,
    );
    Harness { provider, store, orchestrator }
}

fn text(content: &str) -> ScriptedReply {
    ScriptedReply::Completion(CompletionResponse::text(content))
}

fn user_input(provider: &ScriptedProvider, call: usize) -> String {
    let requests = provider.requests();
    requests[call]
        .messages
        .iter()
        .rev()
        .find(|message| message.role == "user")
        .and_then(|message| message.content.clone())
        .unwrap_or_default()
}

#[tokio::test]
async fn two_domain_request_becomes_a_dependent_plan() {
    let router = KeywordRouter::new(catalog::builtin_routes());
    let agents = catalog::builtin_agents();
    let decision = router
        .classify(&RouteRequest {
            message: "research this company and draft a proposal",
            memory: None,
            agents: &agents,
        })
        .await
        .expect("classify");

    assert_eq!(decision.steps.len(), 2);
    assert_eq!(decision.steps[0].agent_id, AgentId::from(catalog::GROWTH));
    assert_eq!(decision.steps[1].agent_id, AgentId::from(catalog::FINANCE));
    assert_eq!(decision.steps[1].depends_on, vec![decision.steps[0].id.clone()]);
}

#[tokio::test]
async fn sequential_plan_feeds_outputs_forward_and_records_memory() {
    let h = harness(
        vec![text("Acme builds warehouse robots."), text("Proposal drafted for Acme.")],
        OrchestratorSettings::default(),
    );
    let session = SessionContext::new("s-1");

    let result = h
        .orchestrator
        .handle("research this company and draft a proposal", &session)
        .await
        .expect("run");

    assert_eq!(result.overall_status, WorkflowStatus::Completed);
    assert_eq!(result.final_output, "Proposal drafted for Acme.");
    assert_eq!(result.steps.len(), 2);
    assert!(result.steps.iter().all(|step| step.status == StepStatus::Succeeded));

    let second_input = user_input(&h.provider, 1);
    assert!(second_input.contains("Context from previous steps:"));
    assert!(second_input.contains("Acme builds warehouse robots."));

    let memory = h.store.load("s-1").await.expect("load").expect("memory");
    let order: Vec<_> = memory.delegations.iter().map(|record| record.step_index).collect();
    assert_eq!(order, vec![0, 1]);
    assert_eq!(memory.turns.len(), 2);
    assert_eq!(memory.turns[0].role, Role::User);
    assert_eq!(memory.turns[1].content, "Proposal drafted for Acme.");
    assert_eq!(memory.facts.get("last_agent").map(String::as_str), Some(catalog::FINANCE));
}

#[tokio::test]
async fn failed_dependency_skips_its_dependents() {
    let h = harness(
        vec![ScriptedReply::Failure(ProviderError::Status {
            status: 500,
            body: "boom".to_string(),
        })],
        OrchestratorSettings::default(),
    );
    let steps = vec![
        WorkflowStep::new("a", catalog::GROWTH, "research Acme"),
        WorkflowStep::new("b", catalog::FINANCE, "draft a proposal").after("a"),
    ];

    let result = h
        .orchestrator
        .run_workflow("research and propose", steps, &SessionContext::new("s-2"))
        .await
        .expect("run");

    assert!(matches!(result.steps[0].status, StepStatus::Failed { .. }));
    assert_eq!(
        result.steps[1].status,
        StepStatus::Skipped { reason: "upstream failure".to_string() }
    );
    assert_ne!(result.overall_status, WorkflowStatus::Completed);
    assert_eq!(h.provider.call_count(), 1);
}

#[tokio::test]
async fn sibling_failure_does_not_abort_independent_steps() {
    let h = harness(vec![text("Course plan ready.")], OrchestratorSettings::default());
    let steps = vec![
        WorkflowStep::new("a", "ghost", "haunt"),
        WorkflowStep::new("b", catalog::FINANCE, "invoice").after("a"),
        WorkflowStep::new("c", catalog::LEARN, "plan a course"),
    ];

    let result = h
        .orchestrator
        .run_workflow("mixed", steps, &SessionContext::new("s-3"))
        .await
        .expect("run");

    assert_eq!(result.overall_status, WorkflowStatus::PartiallyFailed);
    assert!(matches!(&result.steps[0].status, StepStatus::Failed { error } if error.contains("unavailable")));
    assert!(matches!(result.steps[1].status, StepStatus::Skipped { .. }));
    assert_eq!(result.steps[2].output.as_deref(), Some("Course plan ready."));
    assert!(result.final_output.contains("**c**: Course plan ready."));
    assert!(result.final_output.contains("- a (ghost) failed"));
}

#[tokio::test]
async fn parallel_steps_are_recorded_in_declared_order() {
    let h = harness(
        vec![text("first"), text("second")],
        OrchestratorSettings { max_parallel_steps: 2, ..OrchestratorSettings::default() },
    );

    let result = h
        .orchestrator
        .handle("research Acme and draft a proposal in parallel", &SessionContext::new("s-4"))
        .await
        .expect("run");

    assert_eq!(result.steps.len(), 2);
    assert!(result.steps.iter().all(|step| step.status == StepStatus::Succeeded));
    assert!(result.final_output.contains("**step_1**"));
    assert!(result.final_output.contains("**step_2**"));

    let memory = h.store.load("s-4").await.expect("load").expect("memory");
    let ids: Vec<_> = memory.delegations.iter().map(|record| record.step_id.as_str()).collect();
    assert_eq!(ids, vec!["step_1", "step_2"]);
}

#[tokio::test]
async fn unmatched_request_asks_for_clarification() {
    let h = harness(Vec::new(), OrchestratorSettings::default());

    let result = h
        .orchestrator
        .handle("hello there", &SessionContext::new("s-5"))
        .await
        .expect("run");

    assert_eq!(result.overall_status, WorkflowStatus::Failed);
    assert!(result.steps.is_empty());
    let delegation = result.delegation.expect("delegation");
    assert_eq!(delegation.target_agent_id, None);
    assert!(result.final_output.contains("Could you tell me"));
    assert!(result.final_output.contains("Learn Agent"));
    assert_eq!(h.provider.call_count(), 0);
}

#[tokio::test]
async fn low_confidence_uses_the_fallback_agent() {
    let h = harness(
        vec![text("Happy to help.")],
        OrchestratorSettings {
            fallback_agent: Some(AgentId::from(catalog::LEARN)),
            ..OrchestratorSettings::default()
        },
    );

    let result = h
        .orchestrator
        .handle("hello there", &SessionContext::new("s-6"))
        .await
        .expect("run");

    assert_eq!(result.overall_status, WorkflowStatus::Completed);
    assert_eq!(result.steps[0].agent_id, AgentId::from(catalog::LEARN));
    assert_eq!(result.final_output, "Happy to help.");
}

#[tokio::test]
async fn follow_up_resolves_referents_from_memory() {
    let h = harness(
        vec![text("Acme is a robotics firm."), text("Sent the summary.")],
        OrchestratorSettings::default(),
    );
    let session = SessionContext::new("s-7");

    h.orchestrator
        .handle("research Acme, contact jane@acme.io", &session)
        .await
        .expect("first run");
    let result = h.orchestrator.handle("send that to them", &session).await.expect("follow-up");

    assert_eq!(result.steps[0].agent_id, AgentId::from(catalog::GROWTH));
    let input = user_input(&h.provider, 1);
    assert!(input.starts_with("Conversation context:"));
    assert!(input.contains("Previous result from growth: Acme is a robotics firm."));
    assert!(input.contains("- last_email: jane@acme.io"));
    assert!(input.ends_with("send that to them"));

    let memory = h.orchestrator.session("s-7").await.expect("session").expect("memory");
    assert_eq!(memory.turns.len(), 4);
    assert_eq!(memory.delegations.len(), 2);
}

#[tokio::test]
async fn inactive_agents_are_not_routed_to() {
    let h = harness(Vec::new(), OrchestratorSettings::default());
    h.orchestrator
        .registry()
        .set_status(&AgentId::from(catalog::FINANCE), AgentStatus::Inactive)
        .expect("deactivate");

    let result = h
        .orchestrator
        .handle("create an invoice", &SessionContext::new("s-8"))
        .await
        .expect("run");

    assert_eq!(result.overall_status, WorkflowStatus::Failed);
    assert!(result.steps.is_empty());
}

#[tokio::test]
async fn cancellation_keeps_committed_steps_only() {
    let h = harness(
        vec![text("Acme builds robots."), ScriptedReply::Hang],
        OrchestratorSettings::default(),
    );
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });

    let outcome = h
        .orchestrator
        .handle_with_cancel(
            "research this company and draft a proposal",
            &SessionContext::new("s-9"),
            &cancel,
        )
        .await;

    match outcome {
        Err(ApplicationError::Agent(error)) => assert!(error.is_cancelled()),
        other => panic!("expected cancellation, got {other:?}"),
    }
    let memory = h.store.load("s-9").await.expect("load").expect("committed memory");
    assert_eq!(memory.delegations.len(), 1);
    assert_eq!(memory.delegations[0].step_id, "step_1");
    assert!(memory.turns.is_empty());
}

#[tokio::test]
async fn model_router_plans_are_executed() {
    let provider = Arc::new(ScriptedProvider::new([
        text(r#"Plan: {"agent_id":"finance","reason":"invoicing","confidence":0.9,"steps":[]}"#),
        text("Invoice INV-7 created."),
    ]));
    let registry = Arc::new(
        AgentRegistry::new(provider.clone(), AgentSettings::default())
            .with_default_model("m1"),
    );
    catalog::register_builtin(&registry).expect("catalog");
    let router = ModelRouter::new(provider.clone(), "m1", Duration::from_secs(5));
    let orchestrator = Orchestrator::new(
        registry,
        Arc::new(router),
        Arc::new(InMemoryConversationStore::new()),
        OrchestratorSettings::default(),
    );

    let result = orchestrator
        .handle("bill Acme for March", &SessionContext::new("s-10"))
        .await
        .expect("run");

    let delegation = result.delegation.expect("delegation");
    assert_eq!(delegation.target_agent_id, Some(AgentId::from(catalog::FINANCE)));
    assert_eq!(result.final_output, "Invoice INV-7 created.");
    assert!(provider.requests()[0].tools.is_empty());
}

#[tokio::test]
async fn sessions_can_be_cleared_and_requests_validated() {
    let h = harness(vec![text("Here is a course.")], OrchestratorSettings::default());
    let session = SessionContext::new("s-11");

    h.orchestrator.handle("find me a course", &session).await.expect("run");
    assert!(h.orchestrator.clear_session("s-11").await.expect("clear"));
    assert!(h.orchestrator.session("s-11").await.expect("session").is_none());

    let empty = h.orchestrator.handle("   ", &session).await;
    assert!(matches!(empty, Err(ApplicationError::InvalidRequest(_))));
    let anonymous = h.orchestrator.handle("find me a course", &SessionContext::new("")).await;
    assert!(matches!(anonymous, Err(ApplicationError::InvalidRequest(_))));
}

#[test]
fn capabilities_describe_every_catalog_agent() {
    let h = harness(Vec::new(), OrchestratorSettings::default());
    let all = h.orchestrator.agent_capabilities(None);
    assert_eq!(all.len(), 6);

    let finance = h.orchestrator.agent_capabilities(Some(&AgentId::from(catalog::FINANCE)));
    assert_eq!(finance.len(), 1);
    assert!(finance[0].capabilities.iter().any(|capability| capability == "Proposal creation"));
}

/// Answers with an address; inputs mentioning "slow" are answered late.
struct PacedProvider;

impl PacedProvider {
    async fn reply(&self, request: &CompletionRequest) -> String {
        let input = request
            .messages
            .iter()
            .rev()
            .find(|message| message.role == "user")
            .and_then(|message| message.content.clone())
            .unwrap_or_default();
        if input.contains("slow") {
            tokio::time::sleep(Duration::from_millis(150)).await;
            "Reach first@a.io".to_string()
        } else {
            "Reach second@b.io".to_string()
        }
    }
}

#[async_trait]
impl CompletionProvider for PacedProvider {
    fn name(&self) -> &str {
        "paced"
    }

    async fn create_completion(
        &self,
        request: CompletionRequest,
    ) -> Result<CompletionResponse, ProviderError> {
        Ok(CompletionResponse::text(self.reply(&request).await))
    }

    async fn stream_completion(
        &self,
        request: CompletionRequest,
    ) -> Result<CompletionStream, ProviderError> {
        let chunk = CompletionChunk::text(self.reply(&request).await);
        Ok(futures::stream::iter([Ok(chunk)]).boxed())
    }
}

#[tokio::test]
async fn facts_follow_declared_order_when_steps_finish_out_of_order() {
    let registry = Arc::new(
        AgentRegistry::new(Arc::new(PacedProvider), AgentSettings::default())
            .with_default_model("m1"),
    );
    catalog::register_builtin(&registry).expect("catalog");
    let store = Arc::new(InMemoryConversationStore::new());
    let orchestrator = Orchestrator::new(
        registry,
        Arc::new(KeywordRouter::new(catalog::builtin_routes())),
        store.clone(),
        OrchestratorSettings { max_parallel_steps: 2, ..OrchestratorSettings::default() },
    );
    let steps = vec![
        WorkflowStep::new("a", catalog::GROWTH, "slow research"),
        WorkflowStep::new("b", catalog::FINANCE, "quick invoice"),
    ];

    let result = orchestrator
        .run_workflow("research and invoice", steps, &SessionContext::new("s-12"))
        .await
        .expect("run");
    assert_eq!(result.overall_status, WorkflowStatus::Completed);

    let memory = store.load("s-12").await.expect("load").expect("memory");
    let order: Vec<_> = memory.delegations.iter().map(|record| record.step_id.as_str()).collect();
    assert_eq!(order, vec!["a", "b"]);
    assert_eq!(memory.facts.get("last_agent").map(String::as_str), Some(catalog::FINANCE));
    assert_eq!(memory.facts.get("last_email").map(String::as_str), Some("second@b.io"));
}

#[tokio::test]
async fn concurrent_turns_on_one_session_are_serialized() {
    let h = harness_with(
        ScriptedProvider::new([text("Invoice INV-1 created."), text("Invoice INV-2 created.")])
            .with_delay(Duration::from_millis(50)),
        OrchestratorSettings::default(),
    );
    let session = SessionContext::new("s-13");

    let (first, second) = tokio::join!(
        h.orchestrator.handle("create an invoice for Acme", &session),
        h.orchestrator.handle("create an invoice for Globex", &session),
    );
    first.expect("first run");
    second.expect("second run");

    let memory = h.store.load("s-13").await.expect("load").expect("memory");
    assert_eq!(memory.turns.len(), 4);
    assert_eq!(memory.delegations.len(), 2);
    assert_eq!(memory.turns[0].content, "create an invoice for Acme");
    assert_eq!(memory.turns[2].content, "create an invoice for Globex");
}

#[tokio::test]
async fn recent_turns_are_replayed_into_step_chats() {
    let h = harness(
        vec![
            text("Invoice INV-1 created."),
            text("Invoice INV-2 created."),
            text("Invoice INV-3 created."),
        ],
        OrchestratorSettings { history_window: 2, ..OrchestratorSettings::default() },
    );
    let session = SessionContext::new("s-14");

    for customer in ["Acme", "Globex", "Initech"] {
        h.orchestrator
            .handle(&format!("create an invoice for {customer}"), &session)
            .await
            .expect("run");
    }

    let requests = h.provider.requests();
    assert_eq!(requests[0].messages.len(), 2);

    let third: Vec<(&str, &str)> = requests[2]
        .messages
        .iter()
        .skip(1)
        .map(|message| (message.role.as_str(), message.content.as_deref().unwrap_or_default()))
        .collect();
    assert_eq!(
        third,
        vec![
            ("user", "create an invoice for Globex"),
            ("assistant", "Invoice INV-2 created."),
            ("user", "create an invoice for Initech"),
        ]
    );
}
