use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::agent::{AgentContext, AgentId};
use crate::domain::message::Role;

/// Turns kept per session; older turns are dropped first.
pub const MAX_STORED_TURNS: usize = 100;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryTurn {
    pub role: Role,
    pub content: String,
    pub at: DateTime<Utc>,
}

/// One completed delegation, recorded once its step reached a terminal status.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelegationRecord {
    pub run_id: String,
    pub step_id: String,
    /// Declared position of the step within its run.
    pub step_index: usize,
    pub agent_id: AgentId,
    pub input: String,
    pub output: String,
    pub success: bool,
    pub completed_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConversationMemory {
    pub session_id: String,
    #[serde(default)]
    pub turns: Vec<MemoryTurn>,
    #[serde(default)]
    pub delegations: Vec<DelegationRecord>,
    #[serde(default)]
    pub facts: BTreeMap<String, String>,
    #[serde(default)]
    pub context: AgentContext,
    pub started_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
}

impl ConversationMemory {
    pub fn new(session_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            session_id: session_id.into(),
            turns: Vec::new(),
            delegations: Vec::new(),
            facts: BTreeMap::new(),
            context: AgentContext::default(),
            started_at: now,
            last_activity_at: now,
        }
    }

    pub fn push_turn(&mut self, role: Role, content: impl Into<String>) {
        let now = Utc::now();
        self.turns.push(MemoryTurn { role, content: content.into(), at: now });
        if self.turns.len() > MAX_STORED_TURNS {
            let excess = self.turns.len() - MAX_STORED_TURNS;
            self.turns.drain(..excess);
        }
        self.last_activity_at = now;
    }

    /// The newest `limit` turns, oldest first.
    pub fn recent_turns(&self, limit: usize) -> &[MemoryTurn] {
        &self.turns[self.turns.len().saturating_sub(limit)..]
    }

    /// Inserts the record keeping records of one run in declared step order,
    /// whatever order the steps finished in.
    pub fn record_delegation(&mut self, record: DelegationRecord) {
        let position = self
            .delegations
            .iter()
            .rposition(|existing| {
                existing.run_id != record.run_id || existing.step_index <= record.step_index
            })
            .map(|index| index + 1)
            .unwrap_or(0);
        self.last_activity_at = record.completed_at;
        self.delegations.insert(position, record);
    }

    pub fn last_delegation(&self) -> Option<&DelegationRecord> {
        self.delegations.iter().rev().find(|record| record.success)
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty() && self.delegations.is_empty() && self.facts.is_empty()
    }
}
