//! HTTP provider for OpenAI-compatible `/chat/completions` endpoints
//! (OpenAI, Together, Ollama).

use std::time::Duration;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use syncso_core::config::LlmConfig;
use syncso_core::domain::message::{FinishReason, ToolCall, Usage};
use syncso_core::errors::{AgentError, ProviderError};
use tracing::debug;

use crate::llm::{
    CompletionChunk, CompletionProvider, CompletionRequest, CompletionResponse, CompletionStream,
    ToolCallDelta,
};

const CONNECT_TIMEOUT_SECS: u64 = 10;

pub struct OpenAiCompatibleProvider {
    name: String,
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<SecretString>,
}

impl OpenAiCompatibleProvider {
    pub fn new(
        name: impl Into<String>,
        base_url: &str,
        api_key: Option<SecretString>,
    ) -> Result<Self, AgentError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .build()
            .map_err(|error| {
                AgentError::Configuration(format!("could not build http client: {error}"))
            })?;

        Ok(Self {
            name: name.into(),
            client,
            endpoint: format!("{}/chat/completions", base_url.trim_end_matches('/')),
            api_key,
        })
    }

    /// Fails fast when the provider needs a credential and none is configured.
    pub fn from_config(config: &LlmConfig) -> Result<Self, AgentError> {
        let api_key = config
            .api_key
            .clone()
            .filter(|key| !key.expose_secret().trim().is_empty());
        if config.provider.requires_api_key() && api_key.is_none() {
            return Err(AgentError::Configuration(format!(
                "llm.api_key is required for the {} provider",
                config.provider.as_str()
            )));
        }

        Self::new(config.provider.as_str(), &config.effective_base_url(), api_key)
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn send(&self, request: &CompletionRequest) -> Result<reqwest::Response, ProviderError> {
        let mut builder = self.client.post(&self.endpoint).json(&request.to_body());
        if let Some(api_key) = &self.api_key {
            builder = builder.bearer_auth(api_key.expose_secret());
        }

        let response = builder.send().await.map_err(network_error)?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Status { status: status.as_u16(), body });
        }

        Ok(response)
    }
}

#[async_trait]
impl CompletionProvider for OpenAiCompatibleProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn create_completion(
        &self,
        mut request: CompletionRequest,
    ) -> Result<CompletionResponse, ProviderError> {
        request.stream = false;
        debug!(
            event_name = "provider.completion.request",
            provider = %self.name,
            model = %request.model,
            messages = request.messages.len(),
            "sending completion request"
        );

        let response = self.send(&request).await?;
        let payload: ChatCompletion =
            response.json().await.map_err(|error| ProviderError::Decode(error.to_string()))?;
        payload.into_response()
    }

    async fn stream_completion(
        &self,
        mut request: CompletionRequest,
    ) -> Result<CompletionStream, ProviderError> {
        request.stream = true;
        debug!(
            event_name = "provider.stream.request",
            provider = %self.name,
            model = %request.model,
            "opening completion stream"
        );

        let response = self.send(&request).await?;
        Ok(sse_chunks(Box::pin(response.bytes_stream())))
    }
}

fn network_error(error: reqwest::Error) -> ProviderError {
    ProviderError::Network(error.to_string())
}

enum SseLine {
    Skip,
    Done,
    Data(String),
}

fn parse_sse_line(line: &str) -> SseLine {
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed.starts_with(':') {
        return SseLine::Skip;
    }

    let Some(data) = trimmed.strip_prefix("data:") else {
        return SseLine::Skip;
    };
    match data.trim() {
        "" => SseLine::Skip,
        "[DONE]" => SseLine::Done,
        payload => SseLine::Data(payload.to_string()),
    }
}

/// Decodes a `text/event-stream` body into chunks. Ends at `data: [DONE]`,
/// at end of body, or after the first error.
pub(crate) fn sse_chunks<S, B>(body: S) -> CompletionStream
where
    S: Stream<Item = Result<B, reqwest::Error>> + Send + Unpin + 'static,
    B: AsRef<[u8]> + Send + 'static,
{
    let stream = futures::stream::unfold(
        (body, Vec::<u8>::with_capacity(8192), false),
        |(mut body, mut buffer, finished)| async move {
            if finished {
                return None;
            }

            loop {
                if let Some(newline) = buffer.iter().position(|byte| *byte == b'\n') {
                    let line: Vec<u8> = buffer.drain(..=newline).collect();
                    let line = String::from_utf8_lossy(&line);
                    match parse_sse_line(&line) {
                        SseLine::Skip => continue,
                        SseLine::Done => return None,
                        SseLine::Data(data) => {
                            let chunk = decode_chunk(&data);
                            let failed = chunk.is_err();
                            return Some((chunk, (body, buffer, failed)));
                        }
                    }
                }

                match body.next().await {
                    Some(Ok(bytes)) => buffer.extend_from_slice(bytes.as_ref()),
                    Some(Err(error)) => {
                        return Some((Err(network_error(error)), (body, buffer, true)));
                    }
                    None => {
                        let rest = String::from_utf8_lossy(&buffer).to_string();
                        buffer.clear();
                        return match parse_sse_line(&rest) {
                            SseLine::Data(data) => Some((decode_chunk(&data), (body, buffer, true))),
                            SseLine::Skip | SseLine::Done => None,
                        };
                    }
                }
            }
        },
    );

    Box::pin(stream)
}

fn decode_chunk(data: &str) -> Result<CompletionChunk, ProviderError> {
    let payload: ChatChunk =
        serde_json::from_str(data).map_err(|error| ProviderError::Decode(error.to_string()))?;
    Ok(payload.into_chunk())
}

#[derive(Debug, Default, Deserialize)]
struct WireUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
    #[serde(default)]
    total_tokens: u32,
}

impl From<WireUsage> for Usage {
    fn from(value: WireUsage) -> Self {
        Usage {
            prompt_tokens: value.prompt_tokens,
            completion_tokens: value.completion_tokens,
            total_tokens: value.total_tokens,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ChatCompletion {
    #[serde(default)]
    choices: Vec<CompletionChoice>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    message: ChoiceMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<ToolCall>>,
}

impl ChatCompletion {
    fn into_response(self) -> Result<CompletionResponse, ProviderError> {
        let usage = self.usage.map(Usage::from);
        let choice = self
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| ProviderError::Decode("completion carried no choices".to_string()))?;

        Ok(CompletionResponse {
            content: choice.message.content,
            tool_calls: choice.message.tool_calls.unwrap_or_default(),
            finish_reason: choice
                .finish_reason
                .as_deref()
                .map(FinishReason::parse)
                .unwrap_or_default(),
            usage,
        })
    }
}

#[derive(Debug, Deserialize)]
struct ChatChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: ChunkDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<DeltaToolCall>>,
}

#[derive(Debug, Deserialize)]
struct DeltaToolCall {
    #[serde(default)]
    index: usize,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<DeltaFunction>,
}

#[derive(Debug, Default, Deserialize)]
struct DeltaFunction {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

impl ChatChunk {
    fn into_chunk(self) -> CompletionChunk {
        let usage = self.usage.map(Usage::from);
        let Some(choice) = self.choices.into_iter().next() else {
            return CompletionChunk { usage, ..CompletionChunk::default() };
        };

        let tool_calls = choice
            .delta
            .tool_calls
            .unwrap_or_default()
            .into_iter()
            .map(|call| {
                let function = call.function.unwrap_or_default();
                ToolCallDelta {
                    index: call.index,
                    id: call.id,
                    name: function.name,
                    arguments: function.arguments,
                }
            })
            .collect();

        CompletionChunk {
            content: choice.delta.content.filter(|content| !content.is_empty()),
            tool_calls,
            finish_reason: choice.finish_reason.as_deref().map(FinishReason::parse),
            usage,
        }
    }
}
