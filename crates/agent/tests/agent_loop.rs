use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::StreamExt;
use serde_json::{json, Value};
use syncso_agent::llm::{CompletionChunk, CompletionResponse, ToolCallDelta};
use syncso_agent::mock::{ScriptedProvider, ScriptedReply};
use syncso_agent::tools::handler_fn;
use syncso_agent::{AgentSettings, BaseAgent};
use syncso_core::domain::agent::{AgentConfig, AgentContext, ToolSpec};
use syncso_core::domain::message::{Message, ToolCall};
use syncso_core::errors::{AgentError, ProviderError, ToolError};
use tokio_util::sync::CancellationToken;

fn agent_with(provider: Arc<ScriptedProvider>, settings: AgentSettings) -> Arc<BaseAgent> {
    let config = AgentConfig::new("research", "m1", "You research companies");
    Arc::new(BaseAgent::new(config, provider, settings).expect("agent"))
}

fn counting_tool(agent: &BaseAgent, name: &str) -> Arc<AtomicUsize> {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    agent.register_tool(
        name,
        handler_fn(move |_arguments| {
            let counter = Arc::clone(&counter);
            async move {
                let call = counter.fetch_add(1, Ordering::SeqCst) + 1;
                Ok(json!({ "call": call }))
            }
        }),
    );
    calls
}

#[tokio::test]
async fn chat_performs_one_round_trip_per_tool_round() {
    let provider = Arc::new(ScriptedProvider::new([
        ScriptedReply::Completion(CompletionResponse::tool_calls(vec![ToolCall::function(
            "call_1", "lookup", "{}",
        )])),
        ScriptedReply::Completion(CompletionResponse::tool_calls(vec![ToolCall::function(
            "call_2", "lookup", "{}",
        )])),
        ScriptedReply::Completion(CompletionResponse::text("Acme sells anvils.")),
    ]));
    let agent = agent_with(Arc::clone(&provider), AgentSettings::default());
    let tool_calls = counting_tool(&agent, "lookup");

    let response = agent
        .chat(&[Message::user("What does Acme sell?")], &AgentContext::default())
        .await
        .expect("chat");

    assert_eq!(response.content, "Acme sells anvils.");
    assert_eq!(provider.call_count(), 3);
    assert_eq!(tool_calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn tool_results_follow_call_ids_in_order() {
    let provider = Arc::new(ScriptedProvider::new([
        ScriptedReply::Completion(CompletionResponse::tool_calls(vec![
            ToolCall::function("call_a", "lookup", "{}"),
            ToolCall::function("call_b", "lookup", "{}"),
        ])),
        ScriptedReply::Completion(CompletionResponse::text("done")),
    ]));
    let agent = agent_with(Arc::clone(&provider), AgentSettings::default());
    counting_tool(&agent, "lookup");

    agent.chat(&[Message::user("look twice")], &AgentContext::default()).await.expect("chat");

    let requests = provider.requests();
    let follow_up = &requests[1].messages;
    let tail = &follow_up[follow_up.len() - 3..];
    assert_eq!(tail[0].role, "assistant");
    let ids: Vec<_> = tail[0]
        .tool_calls
        .as_ref()
        .expect("assistant tool calls")
        .iter()
        .map(|call| call.id.clone())
        .collect();
    assert_eq!(ids, vec!["call_a".to_string(), "call_b".to_string()]);
    assert_eq!(tail[1].role, "tool");
    assert_eq!(tail[1].tool_call_id.as_deref(), Some("call_a"));
    assert_eq!(tail[2].tool_call_id.as_deref(), Some("call_b"));
    assert_eq!(tail[1].content.as_deref(), Some(r#"{"call":1}"#));
}

#[tokio::test]
async fn unregistered_tool_is_reported_to_the_model() {
    let provider = Arc::new(ScriptedProvider::new([
        ScriptedReply::Completion(CompletionResponse::tool_calls(vec![ToolCall::function(
            "call_1", "missing", "{}",
        )])),
        ScriptedReply::Completion(CompletionResponse::text("I could not do that.")),
    ]));
    let agent = agent_with(Arc::clone(&provider), AgentSettings::default());

    let response =
        agent.chat(&[Message::user("do it")], &AgentContext::default()).await.expect("chat");
    assert_eq!(response.content, "I could not do that.");

    let requests = provider.requests();
    let tool_message = requests[1].messages.last().expect("tool message");
    let payload: Value =
        serde_json::from_str(tool_message.content.as_deref().unwrap_or_default()).expect("json");
    assert!(payload["error"].as_str().unwrap_or_default().contains("missing"));
}

#[tokio::test]
async fn invalid_arguments_never_reach_the_handler() {
    let provider = Arc::new(ScriptedProvider::new([
        ScriptedReply::Completion(CompletionResponse::tool_calls(vec![ToolCall::function(
            "call_1",
            "send_email",
            r#"{"subject":"hi"}"#,
        )])),
        ScriptedReply::Completion(CompletionResponse::text("Which address?")),
    ]));
    let config = AgentConfig::new("email", "m1", "You send emails").with_tool(ToolSpec::new(
        "send_email",
        "Send an email",
        json!({
            "type": "object",
            "properties": { "to": { "type": "string" } },
            "required": ["to"]
        }),
    ));
    let agent = BaseAgent::new(config, provider.clone(), AgentSettings::default())
        .expect("agent");
    let calls = counting_tool(&agent, "send_email");

    let response =
        agent.chat(&[Message::user("email them")], &AgentContext::default()).await.expect("chat");

    assert_eq!(response.content, "Which address?");
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    let requests = provider.requests();
    let tool_message = requests[1].messages.last().expect("tool message");
    assert!(tool_message.content.as_deref().unwrap_or_default().contains("error"));
}

#[tokio::test]
async fn nested_schema_constraints_are_checked_before_execution() {
    let config = AgentConfig::new("calendar", "m1", "You book meetings").with_tool(ToolSpec::new(
        "schedule_meeting",
        "Book a meeting",
        json!({
            "type": "object",
            "properties": {
                "title": { "type": "string", "minLength": 3 },
                "attendees": {
                    "type": "array",
                    "items": { "type": "string", "pattern": "^[^@]+@[^@]+$" }
                }
            },
            "required": ["title", "attendees"]
        }),
    ));
    let agent = BaseAgent::new(config, Arc::new(ScriptedProvider::new(Vec::new())), AgentSettings::default())
        .expect("agent");
    let calls = counting_tool(&agent, "schedule_meeting");

    let error = agent
        .execute_tool("schedule_meeting", json!({ "title": "Sync", "attendees": ["not-an-address"] }))
        .await
        .expect_err("pattern violation inside an array should be rejected");
    assert!(
        matches!(&error, ToolError::InvalidArguments { name, reason }
            if name == "schedule_meeting" && reason.contains("not-an-address")),
        "{error}"
    );
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    let result = agent
        .execute_tool("schedule_meeting", json!({ "title": "Sync", "attendees": ["a@b.io"] }))
        .await
        .expect("valid arguments");
    assert_eq!(result, json!({ "call": 1 }));
}

#[tokio::test]
async fn context_is_injected_into_the_system_prompt() {
    let provider =
        Arc::new(ScriptedProvider::new([ScriptedReply::Completion(CompletionResponse::text("hi"))]));
    let agent = agent_with(Arc::clone(&provider), AgentSettings::default());
    let context = AgentContext {
        user_id: Some("u-1".to_string()),
        company_id: Some("c-9".to_string()),
        metadata: Some(json!({ "plan": "pro" })),
    };

    agent
        .chat(&[Message::system("ignored"), Message::user("hello")], &context)
        .await
        .expect("chat");

    let request = &provider.requests()[0];
    assert_eq!(request.messages.len(), 2);
    assert_eq!(request.messages[0].role, "system");
    let prompt = request.messages[0].content.clone().unwrap_or_default();
    assert!(prompt.starts_with("You research companies\n\nCurrent Context:"));
    assert!(prompt.contains("- User ID: u-1"));
    assert!(prompt.contains("- Company ID: c-9"));
    assert!(prompt.contains(r#"- Additional: {"plan":"pro"}"#));
    assert_eq!(request.temperature, 0.7);
    assert_eq!(request.max_tokens, 2048);
}

#[tokio::test]
async fn tool_loop_is_bounded() {
    let looping = || {
        ScriptedReply::Completion(CompletionResponse::tool_calls(vec![ToolCall::function(
            "call", "lookup", "{}",
        )]))
    };
    let provider = Arc::new(ScriptedProvider::new([looping(), looping(), looping()]));
    let settings = AgentSettings { max_tool_iterations: 2, ..AgentSettings::default() };
    let agent = agent_with(Arc::clone(&provider), settings);
    counting_tool(&agent, "lookup");

    let result = agent.chat(&[Message::user("loop")], &AgentContext::default()).await;

    assert!(matches!(result, Err(AgentError::MaxIterations { limit: 2 })));
    assert_eq!(provider.call_count(), 2);
}

#[tokio::test]
async fn provider_failures_propagate() {
    let provider = Arc::new(ScriptedProvider::new([ScriptedReply::Failure(
        ProviderError::Status { status: 503, body: "overloaded".to_string() },
    )]));
    let agent = agent_with(provider, AgentSettings::default());

    let result = agent.chat(&[Message::user("hello")], &AgentContext::default()).await;
    assert!(matches!(
        result,
        Err(AgentError::Provider(ProviderError::Status { status: 503, .. }))
    ));
}

#[tokio::test]
async fn slow_provider_times_out() {
    let provider = Arc::new(ScriptedProvider::new([ScriptedReply::Hang]));
    let settings =
        AgentSettings { provider_timeout: Duration::from_millis(50), ..AgentSettings::default() };
    let agent = agent_with(provider, settings);

    let result = agent.chat(&[Message::user("hello")], &AgentContext::default()).await;
    assert!(matches!(result, Err(AgentError::Provider(ProviderError::Timeout { .. }))));
}

#[tokio::test]
async fn cancellation_aborts_the_provider_call() {
    let provider = Arc::new(ScriptedProvider::new([ScriptedReply::Hang]));
    let agent = agent_with(provider, AgentSettings::default());
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        trigger.cancel();
    });

    let result =
        agent.chat_with_cancel(&[Message::user("hello")], &AgentContext::default(), &cancel).await;
    let error = result.expect_err("cancelled");
    assert!(error.is_cancelled());
}

#[tokio::test]
async fn streamed_text_matches_blocking_content() {
    let script = || {
        ScriptedReply::Chunks(vec![
            CompletionChunk::text("Acme "),
            CompletionChunk::text("sells "),
            CompletionChunk::text("anvils."),
        ])
    };
    let blocking = agent_with(
        Arc::new(ScriptedProvider::new([script()])),
        AgentSettings::default(),
    );
    let streaming = agent_with(
        Arc::new(ScriptedProvider::new([script()])),
        AgentSettings::default(),
    );
    let messages = [Message::user("What does Acme sell?")];

    let response = blocking.chat(&messages, &AgentContext::default()).await.expect("chat");
    let streamed = streaming
        .chat_stream(&messages, &AgentContext::default())
        .collect_text()
        .await
        .expect("stream");

    assert_eq!(streamed, response.content);
    assert_eq!(streamed, "Acme sells anvils.");
}

#[tokio::test]
async fn streamed_tool_fragments_are_joined_and_executed_once() {
    let provider = Arc::new(ScriptedProvider::new([ScriptedReply::Chunks(vec![
        CompletionChunk::text("Checking."),
        CompletionChunk::tool_delta(ToolCallDelta {
            index: 0,
            id: Some("call_1".to_string()),
            name: Some("look".to_string()),
            arguments: Some(r#"{"q":"#.to_string()),
        }),
        CompletionChunk::tool_delta(ToolCallDelta {
            index: 0,
            id: None,
            name: Some("up".to_string()),
            arguments: Some(r#""acme"}"#.to_string()),
        }),
    ])]));
    let agent = agent_with(Arc::clone(&provider), AgentSettings::default());
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    agent.register_tool(
        "lookup",
        handler_fn(move |arguments| {
            let sink = Arc::clone(&sink);
            async move {
                sink.lock().expect("lock").push(arguments);
                Ok(json!({ "found": true }))
            }
        }),
    );

    let chunks: Vec<_> = agent
        .chat_stream(&[Message::user("find acme")], &AgentContext::default())
        .collect()
        .await;

    let chunks: Vec<_> = chunks.into_iter().map(|chunk| chunk.expect("chunk")).collect();
    assert_eq!(chunks.len(), 3);
    assert_eq!(chunks[0].content.as_deref(), Some("Checking."));
    assert_eq!(chunks[1].content.as_deref(), Some("\n[lookup] {\"found\":true}"));
    assert!(!chunks[1].done);
    assert!(chunks[2].done);
    assert_eq!(*seen.lock().expect("lock"), vec![json!({ "q": "acme" })]);
    assert_eq!(provider.call_count(), 1);
}

#[tokio::test]
async fn out_of_range_tool_index_ends_the_stream_with_an_error() {
    let provider = Arc::new(ScriptedProvider::new([ScriptedReply::Chunks(vec![
        CompletionChunk::text("hi"),
        CompletionChunk::tool_delta(ToolCallDelta {
            index: usize::MAX,
            id: Some("call_x".to_string()),
            name: Some("lookup".to_string()),
            arguments: None,
        }),
    ])]));
    let agent = agent_with(provider, AgentSettings::default());

    let items: Vec<_> =
        agent.chat_stream(&[Message::user("hello")], &AgentContext::default()).collect().await;

    assert_eq!(items.len(), 2);
    assert_eq!(items[0].as_ref().expect("text chunk").content.as_deref(), Some("hi"));
    assert!(matches!(items[1], Err(AgentError::Provider(ProviderError::Decode(_)))));
}

#[tokio::test]
async fn dropping_a_stream_cancels_the_producer() {
    let provider = Arc::new(ScriptedProvider::new([ScriptedReply::Hang]));
    let agent = agent_with(provider, AgentSettings::default());

    let mut stream = agent.chat_stream(&[Message::user("hello")], &AgentContext::default());
    stream.cancel();
    assert!(stream.is_cancelled());
    assert!(stream.next().await.is_none());
}

#[test]
fn agents_require_model_and_prompt() {
    let provider = Arc::new(ScriptedProvider::new(Vec::new()));
    let missing_model = BaseAgent::new(
        AgentConfig::new("a", "", "prompt"),
        provider.clone(),
        AgentSettings::default(),
    );
    let missing_prompt =
        BaseAgent::new(AgentConfig::new("a", "m1", " "), provider, AgentSettings::default());

    assert!(matches!(missing_model, Err(AgentError::Configuration(_))));
    assert!(matches!(missing_prompt, Err(AgentError::Configuration(_))));
}
