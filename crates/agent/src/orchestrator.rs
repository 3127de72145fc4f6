//! Top-level entry point: routes a request, runs the resulting plan and keeps
//! per-session conversation memory.
//!
//! Runs on the same session are serialized; memory is loaded once per run.
//! Each step's delegation record is committed (and persisted) only after that
//! step reaches a terminal status, so a cancelled run keeps what already
//! finished and nothing of what was in flight. Records stay in declared step
//! order, and the `last_*` facts follow that order rather than completion order.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError};

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use syncso_core::config::OrchestratorConfig;
use syncso_core::domain::agent::{AgentContext, AgentId};
use syncso_core::domain::memory::{ConversationMemory, DelegationRecord};
use syncso_core::domain::message::{Message, Role};
use syncso_core::domain::workflow::{
    DelegationResult, RunState, StepResult, StepStatus, WorkflowResult, WorkflowStatus,
    WorkflowStep,
};
use syncso_core::errors::ApplicationError;
use syncso_core::memory_store::ConversationMemoryStore;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::registry::{AgentRegistry, AgentSummary};
use crate::router::{mentions_referent, RouteRequest, Router, RoutingDecision};
use crate::workflow::{merge_final_output, validate_plan, RunScope, StepObserver, WorkflowExecutor};

pub const FACT_LAST_EMAIL: &str = "last_email";
pub const FACT_LAST_AGENT: &str = "last_agent";
const SINGLE_STEP_ID: &str = "single";

#[derive(Clone, Debug, PartialEq)]
pub struct OrchestratorSettings {
    pub max_parallel_steps: usize,
    pub min_confidence: f32,
    pub fallback_agent: Option<AgentId>,
    pub history_window: usize,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self::from_config(&OrchestratorConfig::default())
    }
}

impl OrchestratorSettings {
    pub fn from_config(config: &OrchestratorConfig) -> Self {
        Self {
            max_parallel_steps: config.max_parallel_steps,
            min_confidence: config.min_confidence,
            fallback_agent: config.fallback_agent.clone().map(AgentId::from),
            history_window: config.history_window,
        }
    }
}

/// Who is asking, and in which conversation.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionContext {
    pub session_id: String,
    #[serde(default)]
    pub context: AgentContext,
}

impl SessionContext {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self { session_id: session_id.into(), context: AgentContext::default() }
    }

    pub fn with_context(mut self, context: AgentContext) -> Self {
        self.context = context;
        self
    }
}

enum Plan {
    Execute { delegation: DelegationResult, steps: Vec<WorkflowStep>, multi_step: bool },
    Clarify { delegation: DelegationResult, message: String },
}

struct RunTracker {
    run_id: String,
    session_id: String,
    state: RunState,
}

impl RunTracker {
    fn new(session_id: &str) -> Self {
        Self {
            run_id: Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            state: RunState::Pending,
        }
    }

    fn advance(&mut self, next: RunState) -> Result<(), ApplicationError> {
        let previous = self.state;
        self.state = previous.transition(next)?;
        info!(
            event_name = "orchestrator.run.transition",
            run_id = %self.run_id,
            session_id = %self.session_id,
            from = ?previous,
            to = ?next,
            "run state changed"
        );
        Ok(())
    }
}

/// One async lock per session id; idle entries are pruned on the next acquire.
#[derive(Default)]
struct SessionLocks {
    locks: std::sync::Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl SessionLocks {
    async fn acquire(&self, session_id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            Arc::clone(locks.entry(session_id.to_string()).or_default())
        };
        lock.lock_owned().await
    }
}

pub struct Orchestrator {
    registry: Arc<AgentRegistry>,
    router: Arc<dyn Router>,
    memory: Arc<dyn ConversationMemoryStore>,
    executor: WorkflowExecutor,
    settings: OrchestratorSettings,
    sessions: SessionLocks,
}

impl Orchestrator {
    pub fn new(
        registry: Arc<AgentRegistry>,
        router: Arc<dyn Router>,
        memory: Arc<dyn ConversationMemoryStore>,
        settings: OrchestratorSettings,
    ) -> Self {
        let executor = WorkflowExecutor::new(Arc::clone(&registry), settings.max_parallel_steps);
        Self { registry, router, memory, executor, settings, sessions: SessionLocks::default() }
    }

    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    pub fn router_name(&self) -> &'static str {
        self.router.name()
    }

    pub async fn handle(
        &self,
        message: &str,
        session: &SessionContext,
    ) -> Result<WorkflowResult, ApplicationError> {
        self.handle_with_cancel(message, session, &CancellationToken::new()).await
    }

    pub async fn handle_with_cancel(
        &self,
        message: &str,
        session: &SessionContext,
        cancel: &CancellationToken,
    ) -> Result<WorkflowResult, ApplicationError> {
        validate_request(message, session)?;
        let _session = self.sessions.acquire(&session.session_id).await;
        let mut run = RunTracker::new(&session.session_id);
        info!(
            event_name = "orchestrator.run.started",
            run_id = %run.run_id,
            session_id = %session.session_id,
            router = self.router.name(),
            "orchestrator run started"
        );
        run.advance(RunState::Routing)?;

        let memory = self.load_memory(session).await?;
        let agents = self.registry.list_active();
        let routed = self
            .router
            .classify(&RouteRequest { message, memory: Some(&memory), agents: &agents })
            .await;

        let decision = match routed {
            Ok(decision) => decision,
            Err(error) if error.is_cancelled() => return Err(error.into()),
            Err(error) => {
                warn!(
                    event_name = "orchestrator.routing.failed",
                    run_id = %run.run_id,
                    error = %error,
                    "routing failed"
                );
                run.advance(RunState::Failed)?;
                let reply = format!("I could not work out how to handle that request ({error}).");
                return self.finish_without_steps(run, memory, message, None, reply).await;
            }
        };

        match self.plan(decision, message) {
            Plan::Execute { delegation, steps, multi_step } => {
                let state = if multi_step { RunState::MultiStep } else { RunState::SingleAgent };
                run.advance(state)?;
                self.execute(run, memory, message, session, Some(delegation), steps, cancel).await
            }
            Plan::Clarify { delegation, message: reply } => {
                info!(
                    event_name = "orchestrator.routing.ambiguous",
                    run_id = %run.run_id,
                    confidence = delegation.confidence,
                    "routing confidence too low; asking for clarification"
                );
                run.advance(RunState::Failed)?;
                self.finish_without_steps(run, memory, message, Some(delegation), reply).await
            }
        }
    }

    /// Sends a task straight to one agent, bypassing classification.
    pub async fn delegate(
        &self,
        agent_id: &AgentId,
        task: &str,
        session: &SessionContext,
    ) -> Result<WorkflowResult, ApplicationError> {
        validate_request(task, session)?;
        let _session = self.sessions.acquire(&session.session_id).await;
        let mut run = RunTracker::new(&session.session_id);
        run.advance(RunState::Routing)?;
        run.advance(RunState::SingleAgent)?;

        let memory = self.load_memory(session).await?;
        let delegation = DelegationResult::to(agent_id.clone(), "explicit delegation", 1.0);
        let steps = vec![WorkflowStep::new(SINGLE_STEP_ID, agent_id.clone(), task)];
        self.execute(run, memory, task, session, Some(delegation), steps, &CancellationToken::new())
            .await
    }

    /// Runs a caller-supplied plan. Steps without dependencies run concurrently.
    pub async fn run_workflow(
        &self,
        request: &str,
        steps: Vec<WorkflowStep>,
        session: &SessionContext,
    ) -> Result<WorkflowResult, ApplicationError> {
        validate_request(request, session)?;
        let _session = self.sessions.acquire(&session.session_id).await;
        let mut run = RunTracker::new(&session.session_id);
        run.advance(RunState::Routing)?;
        run.advance(RunState::MultiStep)?;

        let memory = self.load_memory(session).await?;
        self.execute(run, memory, request, session, None, steps, &CancellationToken::new()).await
    }

    /// Capabilities of one agent, or of every registered agent.
    pub fn agent_capabilities(&self, agent_id: Option<&AgentId>) -> Vec<AgentSummary> {
        self.registry
            .summaries()
            .into_iter()
            .filter(|summary| agent_id.map(|id| &summary.id == id).unwrap_or(true))
            .collect()
    }

    pub async fn session(
        &self,
        session_id: &str,
    ) -> Result<Option<ConversationMemory>, ApplicationError> {
        Ok(self.memory.load(session_id).await?)
    }

    pub async fn clear_session(&self, session_id: &str) -> Result<bool, ApplicationError> {
        let _session = self.sessions.acquire(session_id).await;
        let removed = self.memory.delete(session_id).await?;
        info!(event_name = "orchestrator.session.cleared", session_id, removed, "session cleared");
        Ok(removed)
    }

    async fn load_memory(
        &self,
        session: &SessionContext,
    ) -> Result<ConversationMemory, ApplicationError> {
        let mut memory = self
            .memory
            .load(&session.session_id)
            .await?
            .unwrap_or_else(|| ConversationMemory::new(session.session_id.clone()));
        memory.context.merge(&session.context);
        Ok(memory)
    }

    fn plan(&self, decision: RoutingDecision, message: &str) -> Plan {
        let RoutingDecision { delegation, mut steps } = decision;
        if steps.len() >= 2 {
            return Plan::Execute { delegation, steps, multi_step: true };
        }

        if let Some(target) = delegation.target_agent_id.clone() {
            if delegation.confidence >= self.settings.min_confidence {
                let step = steps
                    .pop()
                    .filter(|step| step.agent_id == target)
                    .map(|step| WorkflowStep { id: SINGLE_STEP_ID.to_string(), depends_on: Vec::new(), ..step })
                    .unwrap_or_else(|| WorkflowStep::new(SINGLE_STEP_ID, target, message));
                return Plan::Execute { delegation, steps: vec![step], multi_step: false };
            }
        }

        if let Some(fallback) = &self.settings.fallback_agent {
            let delegation = DelegationResult::to(
                fallback.clone(),
                format!("fallback agent after low-confidence routing: {}", delegation.reason),
                delegation.confidence,
            );
            let steps = vec![WorkflowStep::new(SINGLE_STEP_ID, fallback.clone(), message)];
            return Plan::Execute { delegation, steps, multi_step: false };
        }

        Plan::Clarify { message: self.clarification(), delegation }
    }

    fn clarification(&self) -> String {
        let agents = self.registry.list_active();
        if agents.is_empty() {
            return "I'm not sure how to help with that yet. Could you rephrase the request?"
                .to_string();
        }
        let options = agents
            .iter()
            .map(|agent| {
                if agent.description.is_empty() {
                    format!("- {}", agent.name)
                } else {
                    format!("- {}: {}", agent.name, agent.description)
                }
            })
            .collect::<Vec<_>>()
            .join("\n");
        format!(
            "I'm not sure which assistant should handle this. Could you tell me a bit more about what you need? I can help with:\n{options}"
        )
    }

    #[allow(clippy::too_many_arguments)]
    async fn execute(
        &self,
        mut run: RunTracker,
        memory: ConversationMemory,
        message: &str,
        session: &SessionContext,
        delegation: Option<DelegationResult>,
        steps: Vec<WorkflowStep>,
        cancel: &CancellationToken,
    ) -> Result<WorkflowResult, ApplicationError> {
        if let Err(reason) = validate_plan(&steps) {
            warn!(
                event_name = "orchestrator.plan.invalid",
                run_id = %run.run_id,
                reason = %reason,
                "workflow plan rejected"
            );
            run.advance(RunState::Failed)?;
            let reply = format!("I could not run that plan: {reason}.");
            return self.finish_without_steps(run, memory, message, delegation, reply).await;
        }

        run.advance(RunState::Executing)?;
        let preamble = referent_context(message, &memory);
        let history = prior_messages(&memory, self.settings.history_window);
        let context = memory.context.clone();
        let committer = MemoryCommitter {
            store: self.memory.as_ref(),
            memory: Mutex::new(memory),
            run_id: &run.run_id,
            steps: &steps,
            request: message,
        };
        let scope = RunScope {
            run_id: &run.run_id,
            context: &context,
            preamble: preamble.as_deref(),
            history: &history,
            observer: &committer,
            cancel,
        };

        let outcome = self.executor.execute(&steps, &scope).await;
        let mut memory = committer.memory.into_inner();
        let results = match outcome {
            Ok(results) => results,
            Err(error) => {
                warn!(
                    event_name = "orchestrator.run.cancelled",
                    run_id = %run.run_id,
                    session_id = %session.session_id,
                    error = %error,
                    "run aborted; in-flight steps were not recorded"
                );
                return Err(error.into());
            }
        };

        let final_output = merge_final_output(&steps, &results);
        let overall_status = WorkflowStatus::from_steps(&results);
        run.advance(RunState::from(overall_status))?;

        memory.push_turn(Role::User, message);
        memory.push_turn(Role::Assistant, final_output.clone());
        self.memory.save(&memory).await?;

        info!(
            event_name = "orchestrator.run.finished",
            run_id = %run.run_id,
            session_id = %session.session_id,
            status = ?overall_status,
            steps = results.len(),
            "orchestrator run finished"
        );

        Ok(WorkflowResult {
            run_id: run.run_id,
            session_id: session.session_id.clone(),
            delegation,
            steps: results,
            final_output,
            overall_status,
        })
    }

    async fn finish_without_steps(
        &self,
        run: RunTracker,
        mut memory: ConversationMemory,
        message: &str,
        delegation: Option<DelegationResult>,
        reply: String,
    ) -> Result<WorkflowResult, ApplicationError> {
        memory.push_turn(Role::User, message);
        memory.push_turn(Role::Assistant, reply.clone());
        self.memory.save(&memory).await?;

        Ok(WorkflowResult {
            run_id: run.run_id,
            session_id: run.session_id,
            delegation,
            steps: Vec::new(),
            final_output: reply,
            overall_status: WorkflowStatus::Failed,
        })
    }
}

fn validate_request(message: &str, session: &SessionContext) -> Result<(), ApplicationError> {
    if message.trim().is_empty() {
        return Err(ApplicationError::InvalidRequest("message must not be empty".to_string()));
    }
    if session.session_id.trim().is_empty() {
        return Err(ApplicationError::InvalidRequest("session id must not be empty".to_string()));
    }
    Ok(())
}

/// Context block for messages that refer back to earlier turns.
fn referent_context(message: &str, memory: &ConversationMemory) -> Option<String> {
    if !mentions_referent(message) || (memory.delegations.is_empty() && memory.facts.is_empty()) {
        return None;
    }

    let mut block = String::from("Conversation context:");
    if let Some(previous) = memory.last_delegation() {
        block.push_str(&format!("\nPrevious result from {}: {}", previous.agent_id, previous.output));
    }
    if !memory.facts.is_empty() {
        block.push_str("\nKnown facts:");
        for (key, value) in &memory.facts {
            block.push_str(&format!("\n- {key}: {value}"));
        }
    }
    Some(block)
}

/// The newest user and assistant turns, replayed as chat messages.
fn prior_messages(memory: &ConversationMemory, window: usize) -> Vec<Message> {
    memory
        .recent_turns(window)
        .iter()
        .filter_map(|turn| match turn.role {
            Role::User => Some(Message::user(turn.content.clone())),
            Role::Assistant => Some(Message::assistant(turn.content.clone())),
            Role::System | Role::Tool => None,
        })
        .collect()
}

fn extract_emails(text: &str) -> Vec<String> {
    text.split_whitespace()
        .map(|token| {
            token.trim_matches(|c: char| {
                !(c.is_ascii_alphanumeric() || matches!(c, '@' | '.' | '_' | '-' | '+'))
            })
        })
        .map(|token| token.trim_end_matches('.'))
        .filter(|token| {
            let mut parts = token.split('@');
            match (parts.next(), parts.next(), parts.next()) {
                (Some(local), Some(domain), None) => {
                    !local.is_empty()
                        && domain.contains('.')
                        && !domain.starts_with('.')
                        && !domain.ends_with('.')
                }
                _ => false,
            }
        })
        .map(str::to_string)
        .collect()
}

struct MemoryCommitter<'a> {
    store: &'a dyn ConversationMemoryStore,
    memory: Mutex<ConversationMemory>,
    run_id: &'a str,
    steps: &'a [WorkflowStep],
    request: &'a str,
}

impl MemoryCommitter<'_> {
    /// Derives the `last_*` facts from this run's successful records in declared order.
    fn refresh_facts(&self, memory: &mut ConversationMemory) {
        let committed: Vec<&DelegationRecord> = memory
            .delegations
            .iter()
            .filter(|record| record.run_id == self.run_id && record.success)
            .collect();
        let Some(latest) = committed.last() else {
            return;
        };
        let agent = latest.agent_id.to_string();
        let email = extract_emails(self.request)
            .into_iter()
            .chain(committed.iter().flat_map(|record| extract_emails(&record.output)))
            .last();

        memory.facts.insert(FACT_LAST_AGENT.to_string(), agent);
        if let Some(email) = email {
            memory.facts.insert(FACT_LAST_EMAIL.to_string(), email);
        }
    }
}

#[async_trait]
impl StepObserver for MemoryCommitter<'_> {
    async fn step_finished(&self, index: usize, result: &StepResult) {
        let success = match &result.status {
            StepStatus::Succeeded => true,
            StepStatus::Failed { .. } => false,
            _ => return,
        };
        let output = match &result.status {
            StepStatus::Failed { error } => error.clone(),
            _ => result.output.clone().unwrap_or_default(),
        };

        let mut memory = self.memory.lock().await;
        memory.record_delegation(DelegationRecord {
            run_id: self.run_id.to_string(),
            step_id: result.step_id.clone(),
            step_index: index,
            agent_id: result.agent_id.clone(),
            input: self.steps.get(index).map(|step| step.input.clone()).unwrap_or_default(),
            output,
            success,
            completed_at: Utc::now(),
        });
        if success {
            self.refresh_facts(&mut memory);
        }

        if let Err(error) = self.store.save(&memory).await {
            warn!(
                event_name = "orchestrator.memory.commit_failed",
                run_id = self.run_id,
                step_id = %result.step_id,
                error = %error,
                "could not persist step record"
            );
        }
    }
}
