//! Dependency-ordered execution of multi-agent plans.
//!
//! Ready steps launch as soon as every dependency has succeeded, bounded by a
//! semaphore. A failed step never aborts its siblings; instead every direct
//! and transitive dependent is marked skipped.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::stream::{FuturesUnordered, StreamExt};
use syncso_core::domain::agent::AgentContext;
use syncso_core::domain::message::Message;
use syncso_core::domain::workflow::{StepResult, StepStatus, WorkflowStep};
use syncso_core::errors::{AgentError, ProviderError};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::registry::AgentRegistry;

pub const UPSTREAM_FAILURE: &str = "upstream failure";

/// Notified once per step that reaches a terminal status. Cancelled steps are not reported.
#[async_trait]
pub trait StepObserver: Send + Sync {
    async fn step_finished(&self, index: usize, result: &StepResult);
}

pub struct NoopObserver;

#[async_trait]
impl StepObserver for NoopObserver {
    async fn step_finished(&self, _index: usize, _result: &StepResult) {}
}

pub struct RunScope<'a> {
    pub run_id: &'a str,
    pub context: &'a AgentContext,
    /// Prepended to every step input, e.g. resolved conversation context.
    pub preamble: Option<&'a str>,
    /// Earlier conversation turns sent ahead of each step input.
    pub history: &'a [Message],
    pub observer: &'a dyn StepObserver,
    pub cancel: &'a CancellationToken,
}

/// Rejects empty plans, duplicate or blank ids, unknown dependencies and cycles.
pub fn validate_plan(steps: &[WorkflowStep]) -> Result<(), String> {
    if steps.is_empty() {
        return Err("workflow has no steps".to_string());
    }

    let mut ids = HashSet::new();
    for step in steps {
        if step.id.trim().is_empty() {
            return Err("workflow step ids must not be blank".to_string());
        }
        if !ids.insert(step.id.as_str()) {
            return Err(format!("duplicate workflow step id `{}`", step.id));
        }
    }

    for step in steps {
        for dependency in &step.depends_on {
            if dependency == &step.id {
                return Err(format!("step `{}` depends on itself", step.id));
            }
            if !ids.contains(dependency.as_str()) {
                return Err(format!("step `{}` depends on unknown step `{dependency}`", step.id));
            }
        }
    }

    let mut indegree: HashMap<&str, usize> = steps
        .iter()
        .map(|step| (step.id.as_str(), step.depends_on.iter().collect::<HashSet<_>>().len()))
        .collect();
    let mut queue: VecDeque<&str> = steps
        .iter()
        .filter(|step| step.depends_on.is_empty())
        .map(|step| step.id.as_str())
        .collect();
    let mut visited = 0;
    while let Some(id) = queue.pop_front() {
        visited += 1;
        for step in steps.iter().filter(|step| step.depends_on.iter().any(|dep| dep == id)) {
            if let Some(remaining) = indegree.get_mut(step.id.as_str()) {
                *remaining -= 1;
                if *remaining == 0 {
                    queue.push_back(step.id.as_str());
                }
            }
        }
    }
    if visited != steps.len() {
        return Err("workflow dependencies contain a cycle".to_string());
    }

    Ok(())
}

/// Replaces `{{step_id}}` placeholders with dependency outputs; outputs not
/// referenced by a placeholder are appended as context.
pub fn render_input(
    step: &WorkflowStep,
    outputs: &HashMap<String, String>,
    preamble: Option<&str>,
) -> String {
    let mut input = step.input.clone();
    let mut unreferenced = Vec::new();

    for dependency in &step.depends_on {
        let output = outputs.get(dependency).map(String::as_str).unwrap_or_default();
        let placeholder = format!("{{{{{dependency}}}}}");
        if input.contains(&placeholder) {
            input = input.replace(&placeholder, output);
        } else {
            unreferenced.push((dependency, output));
        }
    }

    if !unreferenced.is_empty() {
        input.push_str("\n\nContext from previous steps:");
        for (dependency, output) in unreferenced {
            input.push_str(&format!("\n[{dependency}]\n{output}"));
        }
    }

    match preamble {
        Some(preamble) if !preamble.is_empty() => format!("{preamble}\n\n{input}"),
        _ => input,
    }
}

/// Output of the single successful sink, or a labeled summary otherwise.
pub fn merge_final_output(steps: &[WorkflowStep], results: &[StepResult]) -> String {
    let is_sink =
        |id: &str| !steps.iter().any(|step| step.depends_on.iter().any(|dep| dep == id));
    let succeeded: Vec<&StepResult> =
        results.iter().filter(|result| result.status.is_success()).collect();
    let sinks: Vec<&StepResult> =
        succeeded.iter().copied().filter(|result| is_sink(&result.step_id)).collect();
    let shown = if sinks.is_empty() { succeeded } else { sinks };

    let issues: Vec<String> = results
        .iter()
        .filter_map(|result| match &result.status {
            StepStatus::Failed { error } => {
                Some(format!("- {} ({}) failed: {error}", result.step_id, result.agent_id))
            }
            StepStatus::Skipped { reason } => {
                Some(format!("- {} ({}) skipped: {reason}", result.step_id, result.agent_id))
            }
            _ => None,
        })
        .collect();

    if shown.len() == 1 && issues.is_empty() {
        return shown[0].output.clone().unwrap_or_default();
    }

    let mut merged = shown
        .iter()
        .map(|result| {
            format!("**{}**: {}", result.step_id, result.output.as_deref().unwrap_or_default())
        })
        .collect::<Vec<_>>()
        .join("\n\n");
    if !issues.is_empty() {
        if !merged.is_empty() {
            merged.push_str("\n\n");
        }
        merged.push_str("Issues:\n");
        merged.push_str(&issues.join("\n"));
    }
    merged
}

pub struct WorkflowExecutor {
    registry: Arc<AgentRegistry>,
    max_parallel_steps: usize,
}

type StepOutcome = (usize, Result<String, AgentError>, u64);

impl WorkflowExecutor {
    pub fn new(registry: Arc<AgentRegistry>, max_parallel_steps: usize) -> Self {
        Self { registry, max_parallel_steps: max_parallel_steps.max(1) }
    }

    /// Runs a validated plan. Returns `Cancelled` when the scope's token fires;
    /// steps finished before that were already reported to the observer.
    pub async fn execute(
        &self,
        steps: &[WorkflowStep],
        scope: &RunScope<'_>,
    ) -> Result<Vec<StepResult>, AgentError> {
        let mut results: Vec<StepResult> = steps.iter().map(StepResult::pending).collect();
        let mut outputs: HashMap<String, String> = HashMap::new();
        let semaphore = Semaphore::new(self.max_parallel_steps);
        let mut running = FuturesUnordered::new();

        loop {
            for index in self.skip_dependents(steps, &mut results, scope.run_id) {
                scope.observer.step_finished(index, &results[index]).await;
            }

            if !scope.cancel.is_cancelled() {
                for index in ready_steps(steps, &results) {
                    let input = render_input(&steps[index], &outputs, scope.preamble);
                    results[index].input = input.clone();
                    results[index].status = StepStatus::Running;
                    info!(
                        event_name = "orchestrator.step.started",
                        run_id = scope.run_id,
                        step_id = %steps[index].id,
                        agent_id = %steps[index].agent_id,
                        "workflow step started"
                    );
                    running.push(self.run_step(index, &steps[index], input, &semaphore, scope));
                }
            }

            let Some((index, outcome, duration_ms)) = running.next().await else {
                break;
            };

            let result = &mut results[index];
            result.duration_ms = duration_ms;
            match outcome {
                Ok(output) => {
                    outputs.insert(result.step_id.clone(), output.clone());
                    result.output = Some(output);
                    result.status = StepStatus::Succeeded;
                }
                Err(error) if error.is_cancelled() => {
                    result.status = StepStatus::Pending;
                    continue;
                }
                Err(error) => {
                    warn!(
                        event_name = "orchestrator.step.failed",
                        run_id = scope.run_id,
                        step_id = %result.step_id,
                        agent_id = %result.agent_id,
                        error_class = error.error_class(),
                        error = %error,
                        "workflow step failed"
                    );
                    result.status = StepStatus::Failed { error: error.to_string() };
                }
            }
            info!(
                event_name = "orchestrator.step.finished",
                run_id = scope.run_id,
                step_id = %results[index].step_id,
                success = results[index].status.is_success(),
                duration_ms,
                "workflow step finished"
            );
            scope.observer.step_finished(index, &results[index]).await;
        }

        if scope.cancel.is_cancelled() {
            return Err(ProviderError::Cancelled.into());
        }
        Ok(results)
    }

    async fn run_step(
        &self,
        index: usize,
        step: &WorkflowStep,
        input: String,
        semaphore: &Semaphore,
        scope: &RunScope<'_>,
    ) -> StepOutcome {
        let _permit = semaphore.acquire().await;
        let started = Instant::now();
        let outcome = match self.registry.get(&step.agent_id) {
            None => Err(AgentError::Routing(format!("agent `{}` is unavailable", step.agent_id))),
            Some(agent) => {
                let mut messages = scope.history.to_vec();
                messages.push(Message::user(input));
                agent
                    .chat_with_cancel(&messages, scope.context, scope.cancel)
                    .await
                    .map(|response| response.content)
            }
        };
        let elapsed = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        (index, outcome, elapsed)
    }

    /// Marks pending steps whose dependencies failed or were skipped, transitively.
    fn skip_dependents(
        &self,
        steps: &[WorkflowStep],
        results: &mut [StepResult],
        run_id: &str,
    ) -> Vec<usize> {
        let mut skipped = Vec::new();
        loop {
            let position: HashMap<&str, usize> =
                steps.iter().enumerate().map(|(index, step)| (step.id.as_str(), index)).collect();
            let next = (0..steps.len()).find(|&index| {
                matches!(results[index].status, StepStatus::Pending)
                    && steps[index].depends_on.iter().any(|dep| {
                        position.get(dep.as_str()).is_some_and(|&dep_index| {
                            matches!(
                                results[dep_index].status,
                                StepStatus::Failed { .. } | StepStatus::Skipped { .. }
                            )
                        })
                    })
            });
            let Some(index) = next else {
                return skipped;
            };
            results[index].status = StepStatus::Skipped { reason: UPSTREAM_FAILURE.to_string() };
            info!(
                event_name = "orchestrator.step.skipped",
                run_id,
                step_id = %steps[index].id,
                reason = UPSTREAM_FAILURE,
                "workflow step skipped"
            );
            skipped.push(index);
        }
    }
}

fn ready_steps(steps: &[WorkflowStep], results: &[StepResult]) -> Vec<usize> {
    let succeeded: HashSet<&str> = results
        .iter()
        .filter(|result| result.status.is_success())
        .map(|result| result.step_id.as_str())
        .collect();
    (0..steps.len())
        .filter(|&index| {
            matches!(results[index].status, StepStatus::Pending)
                && steps[index].depends_on.iter().all(|dep| succeeded.contains(dep.as_str()))
        })
        .collect()
}
