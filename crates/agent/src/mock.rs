//! Scripted completions provider for tests and offline runs.
//!
//! Replies are consumed in order by both blocking and streaming calls. A
//! blocking reply requested as a stream is split into chunks, and a chunk
//! script requested as a blocking call is folded back into one response.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use syncso_core::domain::message::FinishReason;
use syncso_core::errors::ProviderError;

use crate::llm::{
    CompletionChunk, CompletionProvider, CompletionRequest, CompletionResponse, CompletionStream,
    ToolCallAccumulator, ToolCallDelta,
};

#[derive(Clone, Debug)]
pub enum ScriptedReply {
    Completion(CompletionResponse),
    Chunks(Vec<CompletionChunk>),
    Failure(ProviderError),
    /// Never resolves; used to exercise timeouts and cancellation.
    Hang,
}

#[derive(Default)]
pub struct ScriptedProvider {
    replies: Mutex<VecDeque<ScriptedReply>>,
    requests: Mutex<Vec<CompletionRequest>>,
    calls: AtomicUsize,
    delay: Option<Duration>,
}

impl ScriptedProvider {
    pub fn new(replies: impl IntoIterator<Item = ScriptedReply>) -> Self {
        Self { replies: Mutex::new(replies.into_iter().collect()), ..Self::default() }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn push(&self, reply: ScriptedReply) {
        self.replies.lock().unwrap_or_else(PoisonError::into_inner).push_back(reply);
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn remaining(&self) -> usize {
        self.replies.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    async fn next_reply(&self, request: CompletionRequest) -> Result<ScriptedReply, ProviderError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.requests.lock().unwrap_or_else(PoisonError::into_inner).push(request);
        let reply = self.replies.lock().unwrap_or_else(PoisonError::into_inner).pop_front();

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        match reply {
            Some(ScriptedReply::Failure(error)) => Err(error),
            Some(reply) => Ok(reply),
            None => Err(ProviderError::Exhausted { call }),
        }
    }
}

#[async_trait]
impl CompletionProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn create_completion(
        &self,
        request: CompletionRequest,
    ) -> Result<CompletionResponse, ProviderError> {
        match self.next_reply(request).await? {
            ScriptedReply::Completion(response) => Ok(response),
            ScriptedReply::Chunks(chunks) => fold_chunks(chunks),
            ScriptedReply::Hang => futures::future::pending().await,
            ScriptedReply::Failure(error) => Err(error),
        }
    }

    async fn stream_completion(
        &self,
        request: CompletionRequest,
    ) -> Result<CompletionStream, ProviderError> {
        let chunks = match self.next_reply(request).await? {
            ScriptedReply::Completion(response) => split_response(response),
            ScriptedReply::Chunks(chunks) => chunks,
            ScriptedReply::Hang => {
                return Ok(futures::stream::pending::<Result<CompletionChunk, ProviderError>>()
                    .boxed())
            }
            ScriptedReply::Failure(error) => return Err(error),
        };

        Ok(futures::stream::iter(chunks.into_iter().map(Ok)).boxed())
    }
}

fn split_response(response: CompletionResponse) -> Vec<CompletionChunk> {
    let mut chunks = Vec::new();
    if let Some(content) = response.content.filter(|content| !content.is_empty()) {
        chunks.push(CompletionChunk::text(content));
    }
    for (index, call) in response.tool_calls.into_iter().enumerate() {
        chunks.push(CompletionChunk::tool_delta(ToolCallDelta {
            index,
            id: Some(call.id),
            name: Some(call.function.name),
            arguments: Some(call.function.arguments),
        }));
    }
    chunks.push(CompletionChunk {
        finish_reason: Some(response.finish_reason),
        usage: response.usage,
        ..CompletionChunk::default()
    });
    chunks
}

fn fold_chunks(chunks: Vec<CompletionChunk>) -> Result<CompletionResponse, ProviderError> {
    let mut content = String::new();
    let mut accumulator = ToolCallAccumulator::default();
    let mut finish_reason = FinishReason::Stop;
    let mut usage = None;

    for chunk in chunks {
        if let Some(text) = chunk.content {
            content.push_str(&text);
        }
        for delta in &chunk.tool_calls {
            accumulator.push(delta)?;
        }
        if let Some(reason) = chunk.finish_reason {
            finish_reason = reason;
        }
        if chunk.usage.is_some() {
            usage = chunk.usage;
        }
    }

    Ok(CompletionResponse {
        content: (!content.is_empty()).then_some(content),
        tool_calls: accumulator.finish(),
        finish_reason,
        usage,
    })
}
