//! End-to-end pipeline tests: scripted upstream event streams driven
//! through the real routers, plus a live-HTTP rate-limit rotation check.

use std::{
    collections::VecDeque,
    net::SocketAddr,
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
};

use async_trait::async_trait;
use axum::{
    Router,
    http::{StatusCode, header},
    response::IntoResponse,
    routing::post,
};
use base64::Engine;
use futures::StreamExt;
use llm::{
    BridgeServer,
    upstream::{
        EventSource, EventStream, UpstreamClient,
        events::{Action, Finished, Init, TaskMessage, ToolCallEvent, UpstreamEvent},
    },
};

// --- scripted upstream -----------------------------------------------------

#[derive(Default)]
struct ScriptedSource {
    attempts: Mutex<VecDeque<Vec<UpstreamEvent>>>,
    packets: Mutex<Vec<codec::Value>>,
}

impl ScriptedSource {
    fn new(attempts: Vec<Vec<UpstreamEvent>>) -> Arc<Self> {
        Arc::new(Self {
            attempts: Mutex::new(attempts.into()),
            packets: Mutex::new(Vec::new()),
        })
    }

    fn recorded_packets(&self) -> Vec<codec::Value> {
        self.packets.lock().unwrap().clone()
    }
}

#[async_trait]
impl EventSource for ScriptedSource {
    async fn open(&self, packet: &codec::Value) -> Result<EventStream, llm::Error> {
        self.packets.lock().unwrap().push(packet.clone());

        let events = self.attempts.lock().unwrap().pop_front().unwrap_or_default();

        Ok(futures::stream::iter(events.into_iter().map(Ok)).boxed())
    }
}

fn init_event() -> UpstreamEvent {
    UpstreamEvent {
        init: Some(Init {
            conversation_id: Some("conv-1".to_owned()),
            task_id: Some("task-1".to_owned()),
        }),
        ..Default::default()
    }
}

fn append_event(text: &str) -> UpstreamEvent {
    UpstreamEvent {
        actions: vec![Action::AppendContent { text: text.to_owned() }],
        ..Default::default()
    }
}

fn finished_event(ratio: Option<f64>) -> UpstreamEvent {
    UpstreamEvent {
        finished: Some(Finished {
            context_window_usage: ratio,
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn internal_error_event(message: &str) -> UpstreamEvent {
    UpstreamEvent {
        finished: Some(Finished {
            internal_error: Some(message.to_owned()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn tool_call_event(id: &str, name: &str, args: serde_json::Value) -> UpstreamEvent {
    UpstreamEvent {
        actions: vec![Action::AddMessages {
            messages: vec![TaskMessage {
                tool_call: Some(ToolCallEvent {
                    tool_call_id: Some(id.to_owned()),
                    name: Some(name.to_owned()),
                    args,
                }),
                ..Default::default()
            }],
        }],
        ..Default::default()
    }
}

// --- harness ---------------------------------------------------------------

async fn serve(router: Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });

    addr
}

#[derive(Debug)]
struct SseRecord {
    event: Option<String>,
    data: String,
}

fn parse_sse(body: &str) -> Vec<SseRecord> {
    let mut records = Vec::new();
    let mut event: Option<String> = None;
    let mut data_lines: Vec<&str> = Vec::new();

    for line in body.lines() {
        if let Some(rest) = line.strip_prefix("event:") {
            event = Some(rest.trim().to_owned());
        } else if let Some(rest) = line.strip_prefix("data:") {
            data_lines.push(rest.trim_start());
        } else if line.is_empty() && (!data_lines.is_empty() || event.is_some()) {
            records.push(SseRecord {
                event: event.take(),
                data: data_lines.join("\n"),
            });
            data_lines.clear();
        }
    }

    if !data_lines.is_empty() || event.is_some() {
        records.push(SseRecord {
            event,
            data: data_lines.join("\n"),
        });
    }

    records
}

fn chunk_json(record: &SseRecord) -> serde_json::Value {
    serde_json::from_str(&record.data).unwrap()
}

fn final_query(packet: &codec::Value) -> String {
    packet
        .get("input")
        .and_then(|v| v.get("user_inputs"))
        .and_then(|v| v.get("inputs"))
        .and_then(codec::Value::as_list)
        .and_then(|inputs| inputs.last())
        .and_then(|input| input.get("user_query"))
        .and_then(|query| query.get("query"))
        .and_then(codec::Value::as_text)
        .unwrap_or_default()
        .to_owned()
}

// --- scenarios -------------------------------------------------------------

#[tokio::test]
async fn text_echo_streams_role_content_usage_and_done() {
    let source = ScriptedSource::new(vec![vec![
        init_event(),
        append_event("hello"),
        finished_event(Some(0.01)),
    ]]);

    let addr = serve(llm::routes(BridgeServer::with_event_source(source.clone()))).await;

    let body = reqwest::Client::new()
        .post(format!("http://{addr}/v1/chat/completions"))
        .json(&serde_json::json!({
            "model": "claude-4-sonnet",
            "messages": [{"role": "user", "content": "hi"}],
            "stream": true
        }))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();

    let records = parse_sse(&body);

    assert_eq!(records.last().unwrap().data, "[DONE]");

    let chunks: Vec<serde_json::Value> = records[..records.len() - 1].iter().map(chunk_json).collect();

    assert_eq!(chunks[0]["choices"][0]["delta"]["role"], "assistant");
    assert_eq!(chunks[1]["choices"][0]["delta"]["content"], "hello");

    let done = chunks.last().unwrap();
    assert_eq!(done["choices"][0]["finish_reason"], "stop");
    assert_eq!(done["usage"]["prompt_tokens"], 2000); // 0.01 of a 200k window
    assert!(done["usage"]["completion_tokens"].as_u64().unwrap() >= 1);
}

#[tokio::test]
async fn tool_calls_stream_with_tool_call_finish_reason() {
    let source = ScriptedSource::new(vec![vec![
        init_event(),
        tool_call_event("c1", "Bash", serde_json::json!({"command": "ls"})),
        finished_event(None),
    ]]);

    let addr = serve(llm::routes(BridgeServer::with_event_source(source.clone()))).await;

    let body = reqwest::Client::new()
        .post(format!("http://{addr}/v1/chat/completions"))
        .json(&serde_json::json!({
            "messages": [{"role": "user", "content": "list the files"}],
            "stream": true,
            "tools": [{"type": "function", "function": {"name": "Bash", "parameters": {"type": "object"}}}]
        }))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();

    let records = parse_sse(&body);
    let chunks: Vec<serde_json::Value> = records[..records.len() - 1].iter().map(chunk_json).collect();

    let tool_chunk = chunks
        .iter()
        .find(|c| c["choices"][0]["delta"]["tool_calls"].is_array())
        .expect("a tool_calls chunk");

    let call = &tool_chunk["choices"][0]["delta"]["tool_calls"][0];
    assert_eq!(call["index"], 0);
    assert_eq!(call["id"], "c1");
    assert_eq!(call["type"], "function");
    assert_eq!(call["function"]["name"], "Bash");
    assert_eq!(call["function"]["arguments"], r#"{"command":"ls"}"#);

    assert_eq!(chunks.last().unwrap()["choices"][0]["finish_reason"], "tool_calls");

    // The caller's tool definition landed in mcp_context.
    let packet = &source.recorded_packets()[0];
    let tool_name = packet
        .get("mcp_context")
        .and_then(|v| v.get("tools"))
        .and_then(codec::Value::as_list)
        .and_then(|tools| tools.first())
        .and_then(|tool| tool.get("name"))
        .and_then(codec::Value::as_text)
        .unwrap()
        .to_owned();
    assert_eq!(tool_name, "Bash");
}

#[tokio::test]
async fn internal_error_recovers_once_with_injected_hint() {
    let source = ScriptedSource::new(vec![
        vec![
            init_event(),
            internal_error_event("agent aborted: tool_call:{read_files:{}} is not permitted"),
        ],
        vec![append_event("ok"), finished_event(Some(0.01))],
    ]);

    let addr = serve(llm::routes(BridgeServer::with_event_source(source.clone()))).await;

    let body = reqwest::Client::new()
        .post(format!("http://{addr}/v1/chat/completions"))
        .json(&serde_json::json!({
            "model": "claude-4-sonnet",
            "messages": [{"role": "user", "content": "hi"}],
            "stream": true
        }))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();

    let records = parse_sse(&body);
    assert_eq!(records.last().unwrap().data, "[DONE]");

    let chunks: Vec<serde_json::Value> = records[..records.len() - 1].iter().map(chunk_json).collect();

    // Role chunk exactly once, despite the retry.
    let role_chunks = chunks
        .iter()
        .filter(|c| c["choices"][0]["delta"]["role"] == "assistant")
        .count();
    assert_eq!(role_chunks, 1);

    let contents: Vec<&str> = chunks
        .iter()
        .filter_map(|c| c["choices"][0]["delta"]["content"].as_str())
        .collect();

    assert!(contents[0].contains("Auto-recovering"));
    assert!(contents.contains(&"ok"));

    assert_eq!(chunks.last().unwrap()["choices"][0]["finish_reason"], "stop");

    // The retried packet carries the recovery hint and the blocked tool.
    let packets = source.recorded_packets();
    assert_eq!(packets.len(), 2);

    let retried_query = final_query(&packets[1]);
    assert!(retried_query.contains("[system auto-recovery]"));
    assert!(retried_query.contains("read_files"));

    // First attempt had no hint.
    assert!(!final_query(&packets[0]).contains("[system auto-recovery]"));
}

#[tokio::test]
async fn recovery_exhaustion_surfaces_an_error_chunk_and_still_terminates() {
    let failure = "agent aborted: tool_call:{read_files:{}} is not permitted";
    let source = ScriptedSource::new(vec![
        vec![internal_error_event(failure)],
        vec![internal_error_event(failure)],
    ]);

    let addr = serve(llm::routes(BridgeServer::with_event_source(source.clone()))).await;

    let body = reqwest::Client::new()
        .post(format!("http://{addr}/v1/chat/completions"))
        .json(&serde_json::json!({
            "messages": [{"role": "user", "content": "hi"}],
            "stream": true
        }))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();

    let records = parse_sse(&body);
    assert_eq!(records.last().unwrap().data, "[DONE]");

    let chunks: Vec<serde_json::Value> = records[..records.len() - 1].iter().map(chunk_json).collect();

    let contents: Vec<&str> = chunks
        .iter()
        .filter_map(|c| c["choices"][0]["delta"]["content"].as_str())
        .collect();

    assert!(contents.iter().any(|c| c.contains("auto-recovery failed")));
    assert!(contents.iter().any(|c| c.contains("read_files")));
    assert_eq!(chunks.last().unwrap()["choices"][0]["finish_reason"], "stop");
    assert_eq!(source.recorded_packets().len(), 2);
}

#[tokio::test]
async fn empty_query_is_sent_as_a_single_space() {
    let source = ScriptedSource::new(vec![vec![append_event("fine"), finished_event(None)]]);

    let addr = serve(llm::routes(BridgeServer::with_event_source(source.clone()))).await;

    reqwest::Client::new()
        .post(format!("http://{addr}/v1/chat/completions"))
        .json(&serde_json::json!({
            "messages": [{"role": "user", "content": "  "}],
            "stream": true
        }))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();

    let query = final_query(&source.recorded_packets()[0]);

    // The restriction preamble is prepended; the user part collapses to a
    // single space rather than vanishing.
    assert!(query.ends_with(' '));
}

#[tokio::test]
async fn anthropic_round_trip_emits_the_standard_event_sequence() {
    let source = ScriptedSource::new(vec![vec![
        init_event(),
        append_event("hello"),
        finished_event(Some(0.01)),
    ]]);

    let addr = serve(llm::routes(BridgeServer::with_event_source(source.clone()))).await;

    let body = reqwest::Client::new()
        .post(format!("http://{addr}/v1/messages"))
        .json(&serde_json::json!({
            "model": "claude-4-sonnet",
            "max_tokens": 1024,
            "messages": [{"role": "user", "content": "hi"}],
            "stream": true
        }))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();

    let records = parse_sse(&body);
    let names: Vec<&str> = records.iter().filter_map(|r| r.event.as_deref()).collect();

    insta::assert_debug_snapshot!(names, @r#"
    [
        "message_start",
        "content_block_start",
        "content_block_delta",
        "content_block_stop",
        "message_delta",
        "message_stop",
    ]
    "#);

    let delta = records
        .iter()
        .find(|r| r.event.as_deref() == Some("content_block_delta"))
        .unwrap();
    let delta_json = chunk_json(delta);
    assert_eq!(delta_json["delta"]["type"], "text_delta");
    assert_eq!(delta_json["delta"]["text"], "hello");

    let message_delta = records
        .iter()
        .find(|r| r.event.as_deref() == Some("message_delta"))
        .unwrap();
    assert_eq!(chunk_json(message_delta)["delta"]["stop_reason"], "end_turn");
}

#[tokio::test]
async fn anthropic_non_streaming_returns_message_shaped_body() {
    let source = ScriptedSource::new(vec![vec![
        init_event(),
        tool_call_event("c7", "Read", serde_json::json!({"path": "a.txt"})),
        finished_event(None),
    ]]);

    let addr = serve(llm::routes(BridgeServer::with_event_source(source))).await;

    let body: serde_json::Value = reqwest::Client::new()
        .post(format!("http://{addr}/v1/messages"))
        .json(&serde_json::json!({
            "model": "claude-4-sonnet",
            "max_tokens": 1024,
            "messages": [{"role": "user", "content": "read the file"}]
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(body["type"], "message");
    assert_eq!(body["role"], "assistant");
    assert_eq!(body["stop_reason"], "tool_use");
    assert_eq!(body["content"][0]["type"], "tool_use");
    assert_eq!(body["content"][0]["name"], "Read");
    assert_eq!(body["content"][0]["input"]["path"], "a.txt");
}

#[tokio::test]
async fn empty_messages_is_a_400() {
    let source = ScriptedSource::new(vec![]);
    let addr = serve(llm::routes(BridgeServer::with_event_source(source))).await;

    let response = reqwest::Client::new()
        .post(format!("http://{addr}/v1/chat/completions"))
        .json(&serde_json::json!({ "messages": [] }))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status().as_u16(), 400);
}

#[tokio::test]
async fn non_streaming_completion_collects_text_and_usage() {
    let source = ScriptedSource::new(vec![vec![
        init_event(),
        append_event("the answer"),
        finished_event(None),
    ]]);

    let addr = serve(llm::routes(BridgeServer::with_event_source(source))).await;

    let body: serde_json::Value = reqwest::Client::new()
        .post(format!("http://{addr}/v1/chat/completions"))
        .json(&serde_json::json!({
            "messages": [{"role": "user", "content": "question"}]
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(body["object"], "chat.completion");
    assert_eq!(body["choices"][0]["message"]["content"], "the answer");
    assert_eq!(body["choices"][0]["finish_reason"], "stop");
    assert!(body["usage"]["prompt_tokens"].as_u64().unwrap() > 0);
}

// --- live 429 rotation -----------------------------------------------------

#[derive(Default)]
struct CountingBroker {
    issued: AtomicUsize,
}

fn fake_jwt(seed: usize) -> String {
    let exp = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_secs()
        + 3600;

    let header = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(r#"{"alg":"none"}"#);
    let payload = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(format!(r#"{{"exp":{exp},"seed":{seed}}}"#));

    format!("{header}.{payload}.sig")
}

#[async_trait]
impl broker::SessionBroker for CountingBroker {
    async fn acquire(&self) -> Result<broker::Session, broker::BrokerError> {
        let n = self.issued.fetch_add(1, Ordering::SeqCst);

        Ok(broker::Session {
            access_token: fake_jwt(n),
            session_id: Some(format!("session-{n}")),
            email: None,
        })
    }

    async fn release(&self, _session_id: &str) {}

    async fn mark_blocked(&self, _token: Option<&str>, _email: Option<&str>) {}
}

fn sse_body_for(events: &[codec::Value]) -> String {
    let mut body = String::new();

    for event in events {
        let bytes = codec::encode(event, codec::RESPONSE_EVENT_MESSAGE).unwrap();
        let hex: String = bytes.iter().map(|b| format!("{b:02x}")).collect();
        body.push_str(&format!("data: {hex}\n\n"));
    }

    body.push_str("data: [DONE]\n\n");
    body
}

#[tokio::test]
async fn rate_limited_credential_is_rotated_and_the_stream_succeeds() {
    let events = vec![
        codec::Value::object([(
            "init",
            codec::Value::object([("conversation_id", "c".into()), ("task_id", "t".into())]),
        )]),
        codec::Value::object([(
            "client_actions",
            codec::Value::object([(
                "actions",
                codec::Value::List(vec![codec::Value::object([(
                    "append_to_message_content",
                    codec::Value::object([(
                        "message",
                        codec::Value::object([("agent_output", codec::Value::object([("text", "hello".into())]))]),
                    )]),
                )])]),
            )]),
        )]),
        codec::Value::object([("finished", codec::Value::object([]))]),
    ];

    let hits = Arc::new(AtomicUsize::new(0));
    let sse_body = sse_body_for(&events);

    let upstream_app = Router::new().route(
        "/chat",
        post({
            let hits = hits.clone();
            let sse_body = sse_body.clone();

            move || {
                let hits = hits.clone();
                let sse_body = sse_body.clone();

                async move {
                    if hits.fetch_add(1, Ordering::SeqCst) == 0 {
                        StatusCode::TOO_MANY_REQUESTS.into_response()
                    } else {
                        ([(header::CONTENT_TYPE, "text/event-stream")], sse_body).into_response()
                    }
                }
            }
        }),
    );

    let upstream_addr = serve(upstream_app).await;

    let pool = broker::CredentialPool::new(
        Arc::new(CountingBroker::default()),
        3,
        std::time::Duration::from_secs(300),
    );
    pool.fill().await;

    let upstream_config = config::UpstreamConfig {
        url: format!("http://{upstream_addr}/chat"),
        models_url: None,
        client_headers: config::ClientHeaders::default(),
        insecure_tls: false,
        request_timeout_secs: 30,
    };

    let client = UpstreamClient::new(&upstream_config, pool.clone()).unwrap();

    let packet = codec::Value::object([(
        "input",
        codec::Value::object([(
            "user_inputs",
            codec::Value::object([(
                "inputs",
                codec::Value::List(vec![codec::Value::object([(
                    "user_query",
                    codec::Value::object([("query", "hi".into())]),
                )])]),
            )]),
        )]),
    )]);

    let mut stream = client.open(&packet).await.unwrap();

    let mut text = String::new();
    while let Some(event) = stream.next().await {
        let event = event.unwrap();

        for action in &event.actions {
            if let llm::upstream::events::Action::AppendContent { text: delta } = action {
                text.push_str(delta);
            }
        }
    }

    assert_eq!(text, "hello");
    assert_eq!(hits.load(Ordering::SeqCst), 2);

    let stats = pool.stats().await;
    assert_eq!(stats.rate_limit_hits, 1);
    assert_eq!(stats.successful_switches, 1);
}
