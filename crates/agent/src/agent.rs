//! Conversational tool-calling loop for one configured agent.
//!
//! `chat` iterates provider round-trips until a response carries no tool
//! calls, feeding every tool outcome (including failures) back to the model
//! as data. `chat_stream` runs a single streamed round on a producer task:
//! content deltas are forwarded as they arrive, accumulated tool calls are
//! executed once the provider finishes, and each result is reported as one
//! chunk. The model is not re-invoked after streamed tool calls.

use std::pin::Pin;
use std::sync::{Arc, PoisonError, RwLock};
use std::task::{Context, Poll};
use std::time::Duration;

use futures::{Stream, StreamExt};
use serde_json::{json, Value};
use syncso_core::config::AppConfig;
use syncso_core::domain::agent::{AgentConfig, AgentContext, AgentId};
use syncso_core::domain::message::{
    AgentResponse, Message, Role, StreamingChunk, ToolCall, Usage,
};
use syncso_core::errors::{AgentError, ProviderError, ToolError};
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info, warn};

use crate::guardrails::{ArgumentGuardrail, GuardrailDecision};
use crate::llm::{
    to_wire, CompletionProvider, CompletionRequest, CompletionResponse, CompletionStream,
    ToolCallAccumulator,
};
use crate::tools::{SharedToolHandler, ToolSet};

const STREAM_BUFFER: usize = 32;

#[derive(Clone, Debug, PartialEq)]
pub struct AgentSettings {
    pub default_temperature: f32,
    pub default_max_tokens: u32,
    pub max_tool_iterations: usize,
    pub provider_timeout: Duration,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            default_temperature: 0.7,
            default_max_tokens: 2048,
            max_tool_iterations: 8,
            provider_timeout: Duration::from_secs(60),
        }
    }
}

impl AgentSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            default_temperature: config.agent.default_temperature,
            default_max_tokens: config.agent.default_max_tokens,
            max_tool_iterations: config.agent.max_tool_iterations,
            provider_timeout: Duration::from_secs(config.llm.timeout_secs),
        }
    }
}

pub struct BaseAgent {
    config: AgentConfig,
    provider: Arc<dyn CompletionProvider>,
    settings: AgentSettings,
    tools: RwLock<ToolSet>,
    guardrail: ArgumentGuardrail,
}

impl std::fmt::Debug for BaseAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BaseAgent")
            .field("id", &self.config.id)
            .field("model", &self.config.model)
            .field("provider", &self.provider.name())
            .finish_non_exhaustive()
    }
}

impl BaseAgent {
    pub fn new(
        config: AgentConfig,
        provider: Arc<dyn CompletionProvider>,
        settings: AgentSettings,
    ) -> Result<Self, AgentError> {
        if config.id.as_str().trim().is_empty() {
            return Err(AgentError::Configuration("agent id must not be empty".to_string()));
        }
        if config.model.trim().is_empty() {
            return Err(AgentError::Configuration(format!(
                "agent `{}` has no model configured",
                config.id
            )));
        }
        if config.system_prompt.trim().is_empty() {
            return Err(AgentError::Configuration(format!(
                "agent `{}` has no system prompt configured",
                config.id
            )));
        }

        Ok(Self {
            config,
            provider,
            settings,
            tools: RwLock::new(ToolSet::new()),
            guardrail: ArgumentGuardrail,
        })
    }

    pub fn id(&self) -> &AgentId {
        &self.config.id
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn register_tool(&self, name: impl Into<String>, handler: SharedToolHandler) {
        let name = name.into();
        let replaced = self
            .tools
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .register(name.clone(), handler);
        if replaced {
            debug!(
                event_name = "agent.tool.replaced",
                agent_id = %self.config.id,
                tool = %name,
                "tool binding replaced"
            );
        }
    }

    pub fn has_tool(&self, name: &str) -> bool {
        self.tools.read().unwrap_or_else(PoisonError::into_inner).contains(name)
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.tools.read().unwrap_or_else(PoisonError::into_inner).names()
    }

    /// Runs a registered tool after its arguments pass the declared schema.
    pub async fn execute_tool(&self, name: &str, arguments: Value) -> Result<Value, ToolError> {
        let handler = self.handler(name)?;
        let decision = self.guardrail.evaluate(self.config.tool_spec(name), arguments);
        let arguments = self.check_arguments(name, decision)?;
        self.invoke(name, handler, arguments).await
    }

    async fn execute_tool_call(&self, call: &ToolCall) -> Result<Value, ToolError> {
        let name = call.function.name.as_str();
        let handler = self.handler(name)?;
        let decision =
            self.guardrail.evaluate_raw(self.config.tool_spec(name), &call.function.arguments);
        let arguments = self.check_arguments(name, decision)?;
        self.invoke(name, handler, arguments).await
    }

    fn handler(&self, name: &str) -> Result<SharedToolHandler, ToolError> {
        self.tools
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .ok_or_else(|| ToolError::NotRegistered { name: name.to_string() })
    }

    fn check_arguments(&self, name: &str, decision: GuardrailDecision) -> Result<Value, ToolError> {
        match decision {
            GuardrailDecision::Allow(arguments) => Ok(arguments),
            GuardrailDecision::Deny { reason_code, reason } => {
                debug!(
                    event_name = "agent.tool.arguments_denied",
                    agent_id = %self.config.id,
                    tool = %name,
                    reason_code,
                    "tool arguments rejected"
                );
                Err(ToolError::InvalidArguments { name: name.to_string(), reason })
            }
        }
    }

    async fn invoke(
        &self,
        name: &str,
        handler: SharedToolHandler,
        arguments: Value,
    ) -> Result<Value, ToolError> {
        handler.call(arguments).await.map_err(|error| ToolError::Execution {
            name: name.to_string(),
            message: error.to_string(),
        })
    }

    /// Serialized tool outcome fed back to the model. Failures become `{"error": ...}`.
    async fn tool_result_text(&self, call: &ToolCall) -> String {
        match self.execute_tool_call(call).await {
            Ok(value) => serde_json::to_string(&value).unwrap_or_else(|error| {
                json!({ "error": format!("tool result is not serializable: {error}") }).to_string()
            }),
            Err(error) => {
                warn!(
                    event_name = "agent.tool.failed",
                    agent_id = %self.config.id,
                    tool = %call.function.name,
                    tool_call_id = %call.id,
                    error_class = error.error_class(),
                    error = %error,
                    "tool call failed; reporting error to model"
                );
                json!({ "error": error.to_string() }).to_string()
            }
        }
    }

    pub fn system_message(&self, context: &AgentContext) -> Message {
        let mut prompt = self.config.system_prompt.clone();
        if !context.is_empty() {
            prompt.push_str("\n\nCurrent Context:");
            if let Some(user_id) = &context.user_id {
                prompt.push_str(&format!("\n- User ID: {user_id}"));
            }
            if let Some(company_id) = &context.company_id {
                prompt.push_str(&format!("\n- Company ID: {company_id}"));
            }
            if let Some(metadata) = &context.metadata {
                prompt.push_str(&format!("\n- Additional: {metadata}"));
            }
        }
        Message::system(prompt)
    }

    fn conversation(&self, messages: &[Message], context: &AgentContext) -> Vec<Message> {
        let mut history = Vec::with_capacity(messages.len() + 1);
        history.push(self.system_message(context));
        history.extend(messages.iter().filter(|message| message.role != Role::System).cloned());
        history
    }

    fn request(&self, history: &[Message], stream: bool) -> CompletionRequest {
        CompletionRequest {
            model: self.config.model.clone(),
            messages: to_wire(history),
            temperature: self.config.temperature.unwrap_or(self.settings.default_temperature),
            max_tokens: self.config.max_tokens.unwrap_or(self.settings.default_max_tokens),
            tools: self.config.tools.clone(),
            stream,
        }
    }

    fn timeout_error(&self) -> ProviderError {
        ProviderError::Timeout { secs: self.settings.provider_timeout.as_secs() }
    }

    async fn complete(
        &self,
        request: CompletionRequest,
        cancel: &CancellationToken,
    ) -> Result<CompletionResponse, ProviderError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ProviderError::Cancelled),
            outcome = tokio::time::timeout(
                self.settings.provider_timeout,
                self.provider.create_completion(request),
            ) => outcome.unwrap_or_else(|_| Err(self.timeout_error())),
        }
    }

    pub async fn chat(
        &self,
        messages: &[Message],
        context: &AgentContext,
    ) -> Result<AgentResponse, AgentError> {
        self.chat_with_cancel(messages, context, &CancellationToken::new()).await
    }

    pub async fn chat_with_cancel(
        &self,
        messages: &[Message],
        context: &AgentContext,
        cancel: &CancellationToken,
    ) -> Result<AgentResponse, AgentError> {
        let mut history = self.conversation(messages, context);
        let mut usage: Option<Usage> = None;
        let limit = self.settings.max_tool_iterations;

        for round in 1..=limit {
            let response = self.complete(self.request(&history, false), cancel).await?;
            if let Some(round_usage) = &response.usage {
                usage.get_or_insert_with(Usage::default).accumulate(round_usage);
            }

            debug!(
                event_name = "agent.chat.round_trip",
                agent_id = %self.config.id,
                round,
                tool_calls = response.tool_calls.len(),
                "provider round-trip finished"
            );

            if response.tool_calls.is_empty() {
                return Ok(AgentResponse {
                    content: response.content.unwrap_or_default(),
                    usage,
                    finish_reason: response.finish_reason,
                });
            }

            let calls = response.tool_calls;
            history.push(Message::assistant_tool_calls(
                response.content.unwrap_or_default(),
                calls.clone(),
            ));
            for call in &calls {
                if cancel.is_cancelled() {
                    return Err(ProviderError::Cancelled.into());
                }
                let result = self.tool_result_text(call).await;
                history.push(Message::tool_result(call.id.clone(), result));
            }
        }

        warn!(
            event_name = "agent.chat.max_iterations",
            agent_id = %self.config.id,
            limit,
            "tool loop exceeded its iteration bound"
        );
        Err(AgentError::MaxIterations { limit })
    }

    /// Starts a streamed completion. Dropping the returned stream cancels it.
    pub fn chat_stream(
        self: &Arc<Self>,
        messages: &[Message],
        context: &AgentContext,
    ) -> ChatStream {
        let history = self.conversation(messages, context);
        let (sender, receiver) = mpsc::channel(STREAM_BUFFER);
        let cancel = CancellationToken::new();
        let agent = Arc::clone(self);
        let producer_cancel = cancel.clone();

        tokio::spawn(async move {
            let outcome = agent.stream_round(history, &sender, &producer_cancel).await;
            let last = match outcome {
                Ok(()) => Ok(StreamingChunk::finished()),
                Err(error) => {
                    if !error.is_cancelled() {
                        warn!(
                            event_name = "agent.stream.failed",
                            agent_id = %agent.config.id,
                            error_class = error.error_class(),
                            error = %error,
                            "streamed completion failed"
                        );
                    }
                    Err(error)
                }
            };
            if !producer_cancel.is_cancelled() {
                let _ = sender.send(last).await;
            }
        });

        ChatStream { receiver, _guard: cancel.clone().drop_guard(), cancel }
    }

    async fn open_stream(
        &self,
        request: CompletionRequest,
        cancel: &CancellationToken,
    ) -> Result<CompletionStream, ProviderError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ProviderError::Cancelled),
            outcome = tokio::time::timeout(
                self.settings.provider_timeout,
                self.provider.stream_completion(request),
            ) => outcome.unwrap_or_else(|_| Err(self.timeout_error())),
        }
    }

    async fn stream_round(
        &self,
        history: Vec<Message>,
        sender: &mpsc::Sender<Result<StreamingChunk, AgentError>>,
        cancel: &CancellationToken,
    ) -> Result<(), AgentError> {
        let mut stream = self.open_stream(self.request(&history, true), cancel).await?;
        let mut accumulator = ToolCallAccumulator::default();

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ProviderError::Cancelled.into()),
                next = tokio::time::timeout(self.settings.provider_timeout, stream.next()) => next,
            };

            let chunk = match next {
                Err(_) => return Err(self.timeout_error().into()),
                Ok(None) => break,
                Ok(Some(chunk)) => chunk?,
            };

            for delta in &chunk.tool_calls {
                accumulator.push(delta)?;
            }
            if let Some(content) = chunk.content.filter(|content| !content.is_empty()) {
                if sender.send(Ok(StreamingChunk::content(content))).await.is_err() {
                    return Err(ProviderError::Cancelled.into());
                }
            }
        }

        let calls = accumulator.finish();
        if !calls.is_empty() {
            info!(
                event_name = "agent.stream.tool_calls",
                agent_id = %self.config.id,
                tool_calls = calls.len(),
                "executing streamed tool calls"
            );
        }

        for call in calls {
            if cancel.is_cancelled() {
                return Err(ProviderError::Cancelled.into());
            }
            let result = self.tool_result_text(&call).await;
            let chunk = StreamingChunk {
                content: Some(format!("\n[{}] {}", call.function.name, result)),
                tool_calls: Some(vec![call]),
                done: false,
            };
            if sender.send(Ok(chunk)).await.is_err() {
                return Err(ProviderError::Cancelled.into());
            }
        }

        Ok(())
    }
}

/// Consumer side of a streamed chat. Ends after the `done` chunk or an error.
pub struct ChatStream {
    receiver: mpsc::Receiver<Result<StreamingChunk, AgentError>>,
    cancel: CancellationToken,
    _guard: DropGuard,
}

impl ChatStream {
    /// Aborts the producer and the in-flight provider call.
    pub fn cancel(&mut self) {
        self.cancel.cancel();
        self.receiver.close();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Collects the stream, concatenating content in order.
    pub async fn collect_text(mut self) -> Result<String, AgentError> {
        let mut text = String::new();
        while let Some(chunk) = self.next().await {
            if let Some(content) = chunk?.content {
                text.push_str(&content);
            }
        }
        Ok(text)
    }
}

impl Stream for ChatStream {
    type Item = Result<StreamingChunk, AgentError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.receiver.poll_recv(cx)
    }
}

