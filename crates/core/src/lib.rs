pub mod config;
pub mod domain;
pub mod errors;
pub mod memory_store;

pub use domain::agent::{AgentConfig, AgentContext, AgentId, AgentStatus, ToolSpec};
pub use domain::memory::{ConversationMemory, DelegationRecord, MemoryTurn};
pub use domain::message::{
    AgentResponse, FinishReason, FunctionCall, Message, Role, StreamingChunk, ToolCall, Usage,
};
pub use domain::workflow::{
    DelegationResult, RunState, RunTransitionError, StepResult, StepStatus, WorkflowResult,
    WorkflowStatus, WorkflowStep,
};
pub use errors::{AgentError, ApplicationError, InterfaceError, ProviderError, ToolError};
pub use memory_store::{ConversationMemoryStore, InMemoryConversationStore, MemoryStoreError};
