//! Request classification.
//!
//! A [`Router`] turns a user message into a [`RoutingDecision`]: a single
//! delegation, or a multi-step plan when the request spans several agents.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use syncso_core::domain::agent::{AgentConfig, AgentId};
use syncso_core::domain::memory::ConversationMemory;
use syncso_core::domain::message::Message;
use syncso_core::domain::workflow::{DelegationResult, WorkflowStep};
use syncso_core::errors::{AgentError, ProviderError};
use tracing::debug;

use crate::llm::{to_wire, CompletionProvider, CompletionRequest};

const REFERENTS: &[&str] = &["that", "this", "it", "them", "those", "him", "her"];
const PARALLEL_MARKERS: &[&str] = &["in parallel", "at the same time", "simultaneously"];

pub struct RouteRequest<'a> {
    pub message: &'a str,
    pub memory: Option<&'a ConversationMemory>,
    /// Agents currently available for delegation.
    pub agents: &'a [AgentConfig],
}

#[derive(Clone, Debug, PartialEq)]
pub struct RoutingDecision {
    pub delegation: DelegationResult,
    /// Empty for a single delegation.
    pub steps: Vec<WorkflowStep>,
}

impl RoutingDecision {
    pub fn single(delegation: DelegationResult) -> Self {
        Self { delegation, steps: Vec::new() }
    }

    pub fn is_multi_step(&self) -> bool {
        self.steps.len() >= 2
    }
}

#[async_trait]
pub trait Router: Send + Sync {
    fn name(&self) -> &'static str;

    async fn classify(&self, request: &RouteRequest<'_>) -> Result<RoutingDecision, AgentError>;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AgentRoute {
    pub agent_id: AgentId,
    pub keywords: Vec<String>,
}

impl AgentRoute {
    pub fn new(agent_id: impl Into<AgentId>, keywords: &[&str]) -> Self {
        Self {
            agent_id: agent_id.into(),
            keywords: keywords.iter().map(|keyword| normalize_text(keyword)).collect(),
        }
    }

    fn hits(&self, clause: &Clause) -> Vec<&str> {
        self.keywords
            .iter()
            .filter(|keyword| clause.mentions(keyword))
            .map(String::as_str)
            .collect()
    }
}

/// Rule-based router over per-agent keyword sets.
#[derive(Clone, Debug, Default)]
pub struct KeywordRouter {
    routes: Vec<AgentRoute>,
}

#[derive(Debug)]
struct Assignment {
    agent_id: AgentId,
    text: String,
    hits: Vec<String>,
    confidence: f32,
}

impl KeywordRouter {
    pub fn new(routes: Vec<AgentRoute>) -> Self {
        Self { routes }
    }

    pub fn routes(&self) -> &[AgentRoute] {
        &self.routes
    }

    fn assign(&self, clause: &Clause, available: &[AgentConfig]) -> Option<Assignment> {
        let mut scored: Vec<(&AgentRoute, Vec<&str>)> = self
            .routes
            .iter()
            .filter(|route| {
                available.is_empty() || available.iter().any(|agent| agent.id == route.agent_id)
            })
            .map(|route| (route, route.hits(clause)))
            .filter(|(_, hits)| !hits.is_empty())
            .collect();
        if scored.is_empty() {
            return None;
        }

        // Stable: ties keep route declaration order.
        scored.sort_by(|left, right| right.1.len().cmp(&left.1.len()));
        let best = scored[0].1.len();
        let tied = scored.iter().filter(|(_, hits)| hits.len() == best).count();
        let (route, hits) = &scored[0];

        Some(Assignment {
            agent_id: route.agent_id.clone(),
            text: clause.text.clone(),
            hits: hits.iter().map(|hit| hit.to_string()).collect(),
            confidence: confidence_score(best, tied),
        })
    }
}

#[async_trait]
impl Router for KeywordRouter {
    fn name(&self) -> &'static str {
        "keyword"
    }

    async fn classify(&self, request: &RouteRequest<'_>) -> Result<RoutingDecision, AgentError> {
        let mut groups: Vec<Assignment> = Vec::new();
        let mut leading = String::new();

        for clause in split_clauses(request.message) {
            match self.assign(&clause, request.agents) {
                Some(assignment) => {
                    let merge = groups
                        .last()
                        .map(|last| last.agent_id == assignment.agent_id)
                        .unwrap_or(false);
                    if merge {
                        if let Some(last) = groups.last_mut() {
                            last.text = format!("{} and {}", last.text, assignment.text);
                            last.hits.extend(assignment.hits);
                            last.confidence = last.confidence.max(assignment.confidence);
                        }
                    } else {
                        let mut assignment = assignment;
                        if groups.is_empty() && !leading.is_empty() {
                            assignment.text = format!("{leading} {}", assignment.text);
                            leading.clear();
                        }
                        groups.push(assignment);
                    }
                }
                // Unmatched clauses extend the preceding step.
                None => match groups.last_mut() {
                    Some(last) => last.text = format!("{} and {}", last.text, clause.text),
                    None => {
                        if !leading.is_empty() {
                            leading.push(' ');
                        }
                        leading.push_str(&clause.text);
                    }
                },
            }
        }

        let decision = match groups.len() {
            0 => follow_up(request).unwrap_or_else(|| {
                RoutingDecision::single(DelegationResult::unresolved(
                    "no agent matched the request",
                ))
            }),
            1 => {
                let group = &groups[0];
                RoutingDecision::single(DelegationResult::to(
                    group.agent_id.clone(),
                    format!("matched keywords: {}", group.hits.join(", ")),
                    group.confidence,
                ))
            }
            _ => plan(&groups, is_parallel_request(request.message)),
        };

        debug!(
            event_name = "router.keyword.classified",
            target = ?decision.delegation.target_agent_id,
            confidence = decision.delegation.confidence,
            steps = decision.steps.len(),
            "request classified"
        );
        Ok(decision)
    }
}

fn plan(groups: &[Assignment], parallel: bool) -> RoutingDecision {
    let mut steps: Vec<WorkflowStep> = Vec::with_capacity(groups.len());
    for (index, group) in groups.iter().enumerate() {
        let mut step =
            WorkflowStep::new(format!("step_{}", index + 1), group.agent_id.clone(), &group.text);
        if !parallel {
            if let Some(previous) = steps.last() {
                step = step.after(previous.id.clone());
            }
        }
        steps.push(step);
    }

    let chain = groups.iter().map(|group| group.agent_id.as_str()).collect::<Vec<_>>();
    let separator = if parallel { " + " } else { " -> " };
    let confidence =
        groups.iter().map(|group| group.confidence).sum::<f32>() / groups.len() as f32;

    RoutingDecision {
        delegation: DelegationResult::to(
            groups[0].agent_id.clone(),
            format!("multi-domain request: {}", chain.join(separator)),
            confidence,
        ),
        steps,
    }
}

/// Unmatched follow-ups that refer back ("send that to them") go to the last agent.
fn follow_up(request: &RouteRequest<'_>) -> Option<RoutingDecision> {
    if !mentions_referent(request.message) {
        return None;
    }
    let previous = request.memory?.last_delegation()?;
    let available = request.agents.is_empty()
        || request.agents.iter().any(|agent| agent.id == previous.agent_id);
    available.then(|| {
        RoutingDecision::single(DelegationResult::to(
            previous.agent_id.clone(),
            "follow-up to the previous delegation",
            0.6,
        ))
    })
}

fn confidence_score(hits: usize, tied: usize) -> f32 {
    let mut score = 0.5 + 0.15 * (hits.saturating_sub(1)) as f32;
    score = score.min(0.95);
    if tied > 1 {
        score *= 0.6;
    }
    score
}

#[derive(Debug)]
struct Clause {
    text: String,
    words: Vec<String>,
    normalized: String,
}

impl Clause {
    fn new(words: Vec<&str>) -> Self {
        let normalized_words: Vec<String> = words
            .iter()
            .map(|word| normalize_word(word))
            .filter(|word| !word.is_empty())
            .collect();
        Self {
            text: words.join(" ").trim_matches(|c: char| c == ',' || c == '.').to_string(),
            normalized: normalized_words.join(" "),
            words: normalized_words,
        }
    }

    fn mentions(&self, keyword: &str) -> bool {
        if keyword.contains(' ') {
            format!(" {} ", self.normalized).contains(&format!(" {keyword} "))
        } else {
            self.words.iter().any(|word| word == keyword || stem_matches(word, keyword))
        }
    }
}

fn stem_matches(word: &str, keyword: &str) -> bool {
    word.len() > keyword.len()
        && word.starts_with(keyword)
        && matches!(&word[keyword.len()..], "s" | "es" | "ed" | "ing")
}

/// Splits on sequencing connectors: `;`, "and then", "after that", "then", "and".
fn split_clauses(message: &str) -> Vec<Clause> {
    let mut clauses = Vec::new();
    let mut current: Vec<&str> = Vec::new();
    let mut flush = |current: &mut Vec<&str>| {
        if current.iter().any(|word| !normalize_word(word).is_empty()) {
            clauses.push(Clause::new(std::mem::take(current)));
        } else {
            current.clear();
        }
    };

    for segment in message.split(';') {
        let words: Vec<&str> = segment.split_whitespace().collect();
        let mut index = 0;
        while index < words.len() {
            let word = normalize_word(words[index]);
            let next = words.get(index + 1).map(|next| normalize_word(next)).unwrap_or_default();
            let skip = match (word.as_str(), next.as_str()) {
                ("and", "then") | ("after", "that") => 2,
                ("then", _) | ("and", _) => 1,
                _ => 0,
            };
            if skip > 0 {
                flush(&mut current);
                index += skip;
                continue;
            }
            current.push(words[index]);
            index += 1;
        }
        flush(&mut current);
    }

    clauses
}

pub fn is_parallel_request(message: &str) -> bool {
    let normalized = normalize_text(message);
    PARALLEL_MARKERS.iter().any(|marker| normalized.contains(marker))
}

/// True when the message points back at earlier conversation ("send that to them").
pub fn mentions_referent(message: &str) -> bool {
    let normalized = normalize_text(message);
    if normalized.contains("the above") {
        return true;
    }
    normalized.split_whitespace().any(|word| REFERENTS.contains(&word))
}

fn normalize_word(word: &str) -> String {
    word.trim_matches(|c: char| !c.is_alphanumeric()).to_lowercase()
}

fn normalize_text(text: &str) -> String {
    text.split_whitespace()
        .map(normalize_word)
        .filter(|word| !word.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

const MODEL_ROUTER_PROMPT: &str = "You route requests for a team of specialist agents. \
Answer with a single JSON object and nothing else: \
{\"agent_id\": string or null, \"reason\": string, \"confidence\": number between 0 and 1, \
\"steps\": [{\"id\": string, \"agent_id\": string, \"input\": string, \"depends_on\": [string]}]}. \
Leave steps empty when one agent can handle the whole request. \
When a step needs the output of another, list that step id in depends_on.";

#[derive(Debug, Deserialize)]
struct ModelPlan {
    #[serde(default)]
    agent_id: Option<String>,
    #[serde(default)]
    reason: String,
    #[serde(default)]
    confidence: f32,
    #[serde(default)]
    steps: Vec<WorkflowStep>,
}

/// Asks the completions provider for a routing plan.
pub struct ModelRouter {
    provider: std::sync::Arc<dyn CompletionProvider>,
    model: String,
    timeout: Duration,
}

impl ModelRouter {
    pub fn new(
        provider: std::sync::Arc<dyn CompletionProvider>,
        model: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self { provider, model: model.into(), timeout }
    }

    fn catalog(agents: &[AgentConfig]) -> String {
        agents
            .iter()
            .map(|agent| {
                let capabilities = if agent.capabilities.is_empty() {
                    String::new()
                } else {
                    format!(" (capabilities: {})", agent.capabilities.join(", "))
                };
                format!("- {}: {}{}", agent.id, agent.description, capabilities)
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Session state that lets the model resolve follow-ups such as "send that to them".
    fn conversation(memory: &ConversationMemory) -> Option<String> {
        let previous = memory.last_delegation();
        if previous.is_none() && memory.facts.is_empty() {
            return None;
        }

        let mut block = String::from("Conversation state:");
        if let Some(previous) = previous {
            block.push_str(&format!(
                "\nLast delegation: {} handled \"{}\" and answered \"{}\"",
                previous.agent_id, previous.input, previous.output
            ));
        }
        for (key, value) in &memory.facts {
            block.push_str(&format!("\n- {key}: {value}"));
        }
        Some(block)
    }
}

#[async_trait]
impl Router for ModelRouter {
    fn name(&self) -> &'static str {
        "model"
    }

    async fn classify(&self, request: &RouteRequest<'_>) -> Result<RoutingDecision, AgentError> {
        let mut system = format!(
            "{MODEL_ROUTER_PROMPT}\n\nAvailable agents:\n{}",
            Self::catalog(request.agents)
        );
        if let Some(conversation) = request.memory.and_then(Self::conversation) {
            system.push_str("\n\n");
            system.push_str(&conversation);
        }
        let messages = [Message::system(system), Message::user(request.message)];
        let completion = CompletionRequest {
            model: self.model.clone(),
            messages: to_wire(&messages),
            temperature: 0.0,
            max_tokens: 512,
            tools: Vec::new(),
            stream: false,
        };

        let response =
            tokio::time::timeout(self.timeout, self.provider.create_completion(completion))
                .await
                .unwrap_or_else(|_| Err(ProviderError::Timeout { secs: self.timeout.as_secs() }))?;
        let content = response.content.unwrap_or_default();
        let plan = decode_plan(&content)?;

        let known = |id: &str| request.agents.iter().any(|agent| agent.id.as_str() == id);
        let delegation = match plan.agent_id.as_deref() {
            Some(id) if known(id) => DelegationResult::to(id, plan.reason, plan.confidence),
            Some(id) => {
                DelegationResult::unresolved(format!("router proposed unknown agent `{id}`"))
            }
            None => DelegationResult::unresolved(if plan.reason.is_empty() {
                "router found no suitable agent".to_string()
            } else {
                plan.reason
            }),
        };

        Ok(RoutingDecision { delegation, steps: plan.steps })
    }
}

fn decode_plan(content: &str) -> Result<ModelPlan, AgentError> {
    let start = content.find('{');
    let end = content.rfind('}');
    let json = match (start, end) {
        (Some(start), Some(end)) if start < end => &content[start..=end],
        _ => return Err(AgentError::Routing("router answer carried no JSON object".to_string())),
    };
    serde_json::from_str(json).map_err(|error| {
        AgentError::Routing(format!("router answer could not be decoded: {error}"))
    })
}
