use thiserror::Error;

use crate::domain::workflow::RunTransitionError;
use crate::memory_store::MemoryStoreError;

/// Failures of a single tool invocation. Always recovered by the chat loop.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ToolError {
    #[error("tool `{name}` is not registered")]
    NotRegistered { name: String },
    #[error("invalid arguments for tool `{name}`: {reason}")]
    InvalidArguments { name: String, reason: String },
    #[error("tool `{name}` failed: {message}")]
    Execution { name: String, message: String },
}

impl ToolError {
    pub fn tool_name(&self) -> &str {
        match self {
            Self::NotRegistered { name }
            | Self::InvalidArguments { name, .. }
            | Self::Execution { name, .. } => name,
        }
    }

    pub fn error_class(&self) -> &'static str {
        match self {
            Self::NotRegistered { .. } => "tool_not_registered",
            Self::InvalidArguments { .. } => "tool_invalid_arguments",
            Self::Execution { .. } => "tool_execution",
        }
    }
}

/// Failures at the completions-provider boundary. Never retried here.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ProviderError {
    #[error("provider network failure: {0}")]
    Network(String),
    #[error("provider returned status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("provider response could not be decoded: {0}")]
    Decode(String),
    #[error("provider call timed out after {secs}s")]
    Timeout { secs: u64 },
    #[error("provider call cancelled")]
    Cancelled,
    #[error("provider has no scripted response left for call {call}")]
    Exhausted { call: usize },
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum AgentError {
    #[error("configuration failure: {0}")]
    Configuration(String),
    #[error(transparent)]
    Tool(#[from] ToolError),
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error("routing failure: {0}")]
    Routing(String),
    #[error("tool loop exceeded {limit} iterations")]
    MaxIterations { limit: usize },
}

impl AgentError {
    pub fn error_class(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "configuration",
            Self::Tool(error) => error.error_class(),
            Self::Provider(ProviderError::Timeout { .. }) => "provider_timeout",
            Self::Provider(ProviderError::Cancelled) => "cancelled",
            Self::Provider(_) => "provider",
            Self::Routing(_) => "routing",
            Self::MaxIterations { .. } => "max_iterations",
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Provider(ProviderError::Cancelled))
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ApplicationError {
    #[error(transparent)]
    Agent(#[from] AgentError),
    #[error(transparent)]
    RunTransition(#[from] RunTransitionError),
    #[error(transparent)]
    Memory(#[from] MemoryStoreError),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("configuration failure: {0}")]
    Configuration(String),
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum InterfaceError {
    #[error("bad request: {message}")]
    BadRequest { message: String, correlation_id: String },
    #[error("service unavailable: {message}")]
    ServiceUnavailable { message: String, correlation_id: String },
    #[error("internal error: {message}")]
    Internal { message: String, correlation_id: String },
}

impl InterfaceError {
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::BadRequest { .. } => {
                "The request could not be processed. Check inputs and try again."
            }
            Self::ServiceUnavailable { .. } => {
                "The assistant is temporarily unavailable. Please retry shortly."
            }
            Self::Internal { .. } => "An unexpected internal error occurred.",
        }
    }

    pub fn correlation_id(&self) -> &str {
        match self {
            Self::BadRequest { correlation_id, .. }
            | Self::ServiceUnavailable { correlation_id, .. }
            | Self::Internal { correlation_id, .. } => correlation_id,
        }
    }
}

impl ApplicationError {
    pub fn into_interface(self, correlation_id: impl Into<String>) -> InterfaceError {
        let correlation_id = correlation_id.into();
        let mut mapped = InterfaceError::from(self);
        match &mut mapped {
            InterfaceError::BadRequest { correlation_id: id, .. }
            | InterfaceError::ServiceUnavailable { correlation_id: id, .. }
            | InterfaceError::Internal { correlation_id: id, .. } => *id = correlation_id,
        }
        mapped
    }
}

impl From<ApplicationError> for InterfaceError {
    fn from(value: ApplicationError) -> Self {
        let unassigned = || "unassigned".to_owned();
        match value {
            ApplicationError::InvalidRequest(message)
            | ApplicationError::Agent(AgentError::Routing(message)) => {
                Self::BadRequest { message, correlation_id: unassigned() }
            }
            ApplicationError::Agent(AgentError::Tool(error)) => {
                Self::BadRequest { message: error.to_string(), correlation_id: unassigned() }
            }
            ApplicationError::Agent(AgentError::Provider(error)) => {
                Self::ServiceUnavailable { message: error.to_string(), correlation_id: unassigned() }
            }
            ApplicationError::Memory(error) => {
                Self::ServiceUnavailable { message: error.to_string(), correlation_id: unassigned() }
            }
            ApplicationError::Agent(error @ AgentError::MaxIterations { .. }) => {
                Self::ServiceUnavailable { message: error.to_string(), correlation_id: unassigned() }
            }
            ApplicationError::Agent(AgentError::Configuration(message))
            | ApplicationError::Configuration(message) => {
                Self::Internal { message, correlation_id: unassigned() }
            }
            ApplicationError::RunTransition(error) => {
                Self::Internal { message: error.to_string(), correlation_id: unassigned() }
            }
        }
    }
}
