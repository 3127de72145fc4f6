//! Completions-provider contract and the wire shapes exchanged with it.
//!
//! Internal [`Message`]s are converted into [`WireMessage`]s right before a
//! call, so providers never see the runtime's own types.

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use syncso_core::domain::agent::ToolSpec;
use syncso_core::domain::message::{FinishReason, Message, Role, ToolCall, Usage};
use syncso_core::errors::ProviderError;

pub type CompletionStream =
    Pin<Box<dyn Stream<Item = Result<CompletionChunk, ProviderError>> + Send>>;

#[async_trait]
pub trait CompletionProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn create_completion(
        &self,
        request: CompletionRequest,
    ) -> Result<CompletionResponse, ProviderError>;

    async fn stream_completion(
        &self,
        request: CompletionRequest,
    ) -> Result<CompletionStream, ProviderError>;
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WireMessage {
    pub role: String,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl From<&Message> for WireMessage {
    fn from(message: &Message) -> Self {
        let tool_calls = message.tool_calls.clone().filter(|calls| !calls.is_empty());
        // Assistant turns that only carry tool calls are sent with a null content.
        let content = if message.role == Role::Assistant
            && tool_calls.is_some()
            && message.content.is_empty()
        {
            None
        } else {
            Some(message.content.clone())
        };

        Self {
            role: message.role.as_str().to_string(),
            content,
            tool_calls,
            tool_call_id: message.tool_call_id.clone(),
        }
    }
}

pub fn to_wire(messages: &[Message]) -> Vec<WireMessage> {
    messages.iter().map(WireMessage::from).collect()
}

#[derive(Clone, Debug, PartialEq)]
pub struct CompletionRequest {
    pub model: String,
    pub messages: Vec<WireMessage>,
    pub temperature: f32,
    pub max_tokens: u32,
    pub tools: Vec<ToolSpec>,
    pub stream: bool,
}

impl CompletionRequest {
    /// OpenAI-compatible request body.
    pub fn to_body(&self) -> Value {
        let mut body = json!({
            "model": self.model,
            "messages": self.messages,
            "temperature": self.temperature,
            "max_tokens": self.max_tokens,
            "stream": self.stream,
        });

        if !self.tools.is_empty() {
            let tools: Vec<Value> = self
                .tools
                .iter()
                .map(|tool| {
                    json!({
                        "type": "function",
                        "function": {
                            "name": tool.name,
                            "description": tool.description,
                            "parameters": tool.parameters,
                        }
                    })
                })
                .collect();
            body["tools"] = Value::Array(tools);
        }

        body
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct CompletionResponse {
    pub content: Option<String>,
    pub tool_calls: Vec<ToolCall>,
    pub finish_reason: FinishReason,
    pub usage: Option<Usage>,
}

impl CompletionResponse {
    pub fn text(content: impl Into<String>) -> Self {
        Self { content: Some(content.into()), ..Self::default() }
    }

    pub fn tool_calls(calls: Vec<ToolCall>) -> Self {
        Self { tool_calls: calls, finish_reason: FinishReason::ToolCalls, ..Self::default() }
    }

    pub fn with_usage(mut self, usage: Usage) -> Self {
        self.usage = Some(usage);
        self
    }
}

/// One fragment of a streamed tool call. Fragments sharing an `index` are concatenated.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ToolCallDelta {
    pub index: usize,
    pub id: Option<String>,
    pub name: Option<String>,
    pub arguments: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct CompletionChunk {
    pub content: Option<String>,
    pub tool_calls: Vec<ToolCallDelta>,
    pub finish_reason: Option<FinishReason>,
    pub usage: Option<Usage>,
}

impl CompletionChunk {
    pub fn text(content: impl Into<String>) -> Self {
        Self { content: Some(content.into()), ..Self::default() }
    }

    pub fn tool_delta(delta: ToolCallDelta) -> Self {
        Self { tool_calls: vec![delta], ..Self::default() }
    }

    pub fn finish(reason: FinishReason) -> Self {
        Self { finish_reason: Some(reason), ..Self::default() }
    }
}

/// Upper bound on distinct tool calls in one streamed response.
pub const MAX_STREAMED_TOOL_CALLS: usize = 128;

/// Accumulates streamed tool-call fragments by emission index.
#[derive(Debug, Default)]
pub struct ToolCallAccumulator {
    slots: Vec<ToolCallDelta>,
}

impl ToolCallAccumulator {
    /// Rejects indices at or beyond [`MAX_STREAMED_TOOL_CALLS`] instead of growing without bound.
    pub fn push(&mut self, delta: &ToolCallDelta) -> Result<(), ProviderError> {
        if delta.index >= MAX_STREAMED_TOOL_CALLS {
            return Err(ProviderError::Decode(format!(
                "tool call index {} exceeds the limit of {MAX_STREAMED_TOOL_CALLS}",
                delta.index
            )));
        }
        if self.slots.len() <= delta.index {
            self.slots.resize_with(delta.index + 1, ToolCallDelta::default);
        }
        let slot = &mut self.slots[delta.index];
        slot.index = delta.index;
        if let Some(id) = &delta.id {
            slot.id.get_or_insert_with(String::new).push_str(id);
        }
        if let Some(name) = &delta.name {
            slot.name.get_or_insert_with(String::new).push_str(name);
        }
        if let Some(arguments) = &delta.arguments {
            slot.arguments.get_or_insert_with(String::new).push_str(arguments);
        }
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(|slot| slot.name.is_none())
    }

    /// Finalized calls in emission order; slots without a name are dropped.
    pub fn finish(self) -> Vec<ToolCall> {
        self.slots
            .into_iter()
            .filter_map(|slot| {
                let name = slot.name?;
                let id = slot.id.unwrap_or_else(|| format!("call_{}", slot.index));
                let arguments = slot.arguments.filter(|raw| !raw.trim().is_empty());
                Some(ToolCall::function(id, name, arguments.unwrap_or_else(|| "{}".to_string())))
            })
            .collect()
    }
}
