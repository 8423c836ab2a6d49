//! Protocol-translating chat proxy core.
//!
//! Exposes OpenAI Chat Completions and Anthropic Messages endpoints while
//! speaking the upstream binary agent protocol: requests are normalized,
//! projected onto an upstream packet, streamed, and the resulting event
//! stream is translated back into the caller's protocol on the fly.

use std::{convert::Infallible, sync::Arc};

use axum::{
    Json, Router,
    extract::State,
    http::{HeaderValue, header},
    response::{IntoResponse, Response, Sse, sse::Event},
    routing::{get, post},
};
use futures::StreamExt;

mod error;
mod messages;
mod normalize;
mod oneshot;
mod packet;
mod recovery;
mod server;
mod state;
mod token_counter;
mod translate;
pub mod upstream;

pub use error::{AnthropicResult, Error, Result};
pub use messages::{anthropic, convert, openai};
pub use server::BridgeServer;

use messages::openai::{ChatCompletionRequest, ChatMessage, ChatRole};
use translate::{anthropic::AnthropicTranslator, openai::ChunkContext};

/// Creates an axum router for the proxy endpoints.
pub async fn router(config: &config::Config) -> anyhow::Result<Router> {
    let server = BridgeServer::build(config).await?;

    Ok(routes(server))
}

/// Routes over an already-built server. Tests use this with a scripted
/// event source.
pub fn routes(server: Arc<BridgeServer>) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/healthz", get(healthz))
        .route("/v1/models", get(list_models))
        .route("/v1/chat/completions", post(chat_completions))
        .route("/v1/messages", post(anthropic_messages))
        .with_state(server)
}

async fn root() -> impl IntoResponse {
    Json(serde_json::json!({
        "service": "Bifrost chat proxy",
        "status": "ok",
    }))
}

async fn healthz() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn list_models(State(server): State<Arc<BridgeServer>>) -> impl IntoResponse {
    let response = server.models().await;

    log::debug!("returning {} models", response.data.len());
    Json(response)
}

/// Normalized request pieces shared by both protocol handlers.
struct PreparedRequest {
    packet: codec::Value,
    ctx: ChunkContext,
}

async fn prepare(server: &Arc<BridgeServer>, request: &ChatCompletionRequest) -> PreparedRequest {
    let history = normalize::normalize_history(request.messages.clone());

    log::debug!("normalized history holds {} message(s)", history.len());

    let system_prompt = collect_system_prompt(&history);
    let continuity = server.continuity_snapshot().await;

    let packet = packet::build_packet(
        &history,
        system_prompt.as_deref(),
        request.model.as_deref(),
        request.tools.as_deref(),
        &continuity,
    );

    let model_id = packet::map_model_name(request.model.as_deref().unwrap_or(packet::default_model()));

    PreparedRequest {
        packet,
        ctx: ChunkContext::new(model_id),
    }
}

fn collect_system_prompt(history: &[ChatMessage]) -> Option<String> {
    let chunks: Vec<String> = history
        .iter()
        .filter(|message| message.role == ChatRole::System)
        .map(ChatMessage::content_text)
        .filter(|text| !text.trim().is_empty())
        .collect();

    if chunks.is_empty() { None } else { Some(chunks.join("\n\n")) }
}

/// Handle chat completion requests.
///
/// With `stream: true` the response is Server-Sent Events of completion
/// chunks terminated by `data: [DONE]`; otherwise a single JSON body.
async fn chat_completions(
    State(server): State<Arc<BridgeServer>>,
    Json(request): Json<ChatCompletionRequest>,
) -> Result<Response> {
    log::debug!(
        "chat completions: model {:?}, {} message(s), streaming {}",
        request.model,
        request.messages.len(),
        request.stream.unwrap_or(false)
    );

    if request.messages.is_empty() {
        return Err(Error::EmptyMessages);
    }

    let prepared = prepare(&server, &request).await;

    if request.stream.unwrap_or(false) {
        Ok(openai_sse_response(server, prepared))
    } else {
        let response = oneshot::run(&server, prepared.packet, &prepared.ctx).await?;
        Ok(Json(response).into_response())
    }
}

fn openai_sse_response(server: Arc<BridgeServer>, prepared: PreparedRequest) -> Response {
    let chunks = recovery::chat_stream(server, prepared.packet, prepared.ctx);

    let events = chunks.map(|chunk| {
        let json = sonic_rs::to_string(&chunk).unwrap_or_else(|e| {
            log::error!("failed to serialize chunk: {e}");
            r#"{"error":"serialization failed"}"#.to_owned()
        });

        Ok::<_, Infallible>(Event::default().data(json))
    });

    let with_done = events.chain(futures::stream::once(async {
        Ok::<_, Infallible>(Event::default().data("[DONE]"))
    }));

    sse_with_headers(Sse::new(with_done).into_response())
}

/// Handle Anthropic messages requests: converted to the internal OpenAI
/// shape, driven through the same pipeline, and translated back.
async fn anthropic_messages(
    State(server): State<Arc<BridgeServer>>,
    Json(request): Json<anthropic::AnthropicChatRequest>,
) -> AnthropicResult<Response> {
    log::debug!(
        "anthropic messages: model {:?}, {} message(s), streaming {}",
        request.model,
        request.messages.len(),
        request.stream.unwrap_or(false)
    );

    if request.messages.is_empty() {
        return Err(Error::EmptyMessages.into());
    }

    let streaming = request.stream.unwrap_or(false);
    let openai_request = convert::chat_request_from_anthropic(request);
    let prepared = prepare(&server, &openai_request).await;

    if streaming {
        let model = prepared.ctx.model.clone();
        let chunks = recovery::chat_stream(server, prepared.packet, prepared.ctx);

        let translator = AnthropicTranslator::new(model);
        let opening = futures::stream::iter(vec![translator.message_start()]);

        let translated = chunks
            .scan(translator, |translator, chunk| {
                futures::future::ready(Some(translator.process(&chunk)))
            })
            .flat_map(futures::stream::iter);

        let events = opening.chain(translated).map(|event| {
            let json = sonic_rs::to_string(&event).unwrap_or_else(|e| {
                log::error!("failed to serialize Anthropic event: {e}");
                r#"{"type":"error","error":{"type":"internal_error","message":"serialization failed"}}"#.to_owned()
            });

            Ok::<_, Infallible>(Event::default().event(event.event_name()).data(json))
        });

        Ok(sse_with_headers(Sse::new(events).into_response()))
    } else {
        let response = oneshot::run(&server, prepared.packet, &prepared.ctx)
            .await
            .map_err(error::AnthropicErrorResponse::from)?;

        Ok(Json(convert::anthropic_response_from_openai(&response)).into_response())
    }
}

fn sse_with_headers(mut response: Response) -> Response {
    response
        .headers_mut()
        .insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    response
        .headers_mut()
        .insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));

    response
}
