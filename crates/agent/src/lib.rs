//! Agent runtime for the SyncSO platform.
//!
//! - `agent`: [`BaseAgent`], the bounded chat/tool loop and its streaming variant
//! - `registry`: [`AgentRegistry`], an explicit directory with lazily built instances
//! - `router` / `workflow` / `orchestrator`: request classification, dependency-ordered
//!   step execution and per-session conversation memory
//! - `llm` / `openai` / `mock`: the completions-provider seam, its HTTP implementation
//!   and a scripted provider for tests
//! - `tools` / `guardrails`: the named tool table and schema checks run before a handler
//! - `catalog` / `runtime`: built-in specialists and config-driven wiring

pub mod agent;
pub mod catalog;
pub mod guardrails;
pub mod llm;
pub mod mock;
pub mod openai;
pub mod orchestrator;
pub mod registry;
pub mod router;
pub mod runtime;
pub mod tools;
pub mod workflow;

pub use agent::{AgentSettings, BaseAgent, ChatStream};
pub use orchestrator::{Orchestrator, OrchestratorSettings, SessionContext};
pub use registry::{AgentRegistry, AgentSummary, RegistryError};
pub use runtime::AgentRuntime;
