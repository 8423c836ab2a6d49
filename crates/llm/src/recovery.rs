//! Self-healing recovery driver.
//!
//! Wraps the upstream exchange with bounded retries: when the translator
//! reports a recoverable failure, the request packet is re-driven once with
//! a recovery hint appended to the final user query. The hint injection is
//! idempotent; running it twice changes nothing.

use std::{collections::HashSet, sync::Arc};

use codec::Value;
use futures::{SinkExt, StreamExt, channel::mpsc};

use crate::{
    messages::openai::{ChatCompletionChunk, FinishReason, Usage},
    server::BridgeServer,
    translate::{
        Interrupt,
        openai::{ChunkContext, OpenAiTranslator},
    },
};

const MAX_RETRIES: u32 = 1;

const INTERNAL_TOOL_MARKERS: [&str; 1] = ["[system auto-recovery]"];
const LLM_UNAVAILABLE_MARKERS: [&str; 2] = ["continue task", "[auto-recovery]"];

pub(crate) fn internal_tool_hint(tool_name: Option<&str>) -> String {
    match tool_name {
        Some(tool) => format!(
            "\n\n[system auto-recovery] Please continue the task but do not use the {tool} tool. \
             Available tools: Read, Write, Edit, Bash, Glob, Grep, and other MCP tools."
        ),
        None => "\n\n[system auto-recovery] Please continue the task using the available MCP tools.".to_owned(),
    }
}

pub(crate) fn llm_unavailable_hint() -> &'static str {
    "\n\n[auto-recovery] Continue the previous task."
}

fn internal_tool_notice() -> &'static str {
    "\n\n🔄 **Auto-recovering...**\n\nA restricted-tool conflict was detected; the task is being retried.\n"
}

fn internal_tool_exhausted(tool_name: Option<&str>) -> String {
    format!(
        "\n\n⚠️ **Internal service error (auto-recovery failed)**\n\n\
         The model repeatedly tried to call a restricted tool: `{}`\n\n\
         Try rephrasing the request, narrowing its scope, or explicitly ruling the operation out.\n",
        tool_name.unwrap_or("<unknown>")
    )
}

fn llm_unavailable_notice() -> &'static str {
    "\n\n🔄 **The model is temporarily unavailable, retrying...**\n\n"
}

fn llm_unavailable_exhausted() -> &'static str {
    "\n\n⚠️ **The model is temporarily unavailable**\n\nPlease try again later.\n"
}

/// Append a recovery hint to the packet's final `user_query`. No-op when
/// any of the markers is already present or the final input is not a user
/// query. Returns whether the packet changed.
pub(crate) fn append_recovery_hint(packet: &mut Value, hint: &str, markers: &[&str]) -> bool {
    let Some(inputs) = packet
        .get_mut("input")
        .and_then(|input| input.get_mut("user_inputs"))
        .and_then(|user_inputs| user_inputs.get_mut("inputs"))
    else {
        return false;
    };

    let Value::List(items) = inputs else {
        return false;
    };

    let Some(query) = items
        .last_mut()
        .and_then(|last| last.get_mut("user_query"))
        .and_then(|user_query| user_query.get_mut("query"))
    else {
        return false;
    };

    let Value::Text(query) = query else {
        return false;
    };

    if markers.iter().any(|marker| query.contains(marker)) {
        log::info!("recovery hint already present, skipping injection");
        return false;
    }

    query.push_str(hint);
    true
}

/// Streaming entry point: drives the upstream exchange (with recovery) in a
/// background task and hands chunks over a channel. Dropping the returned
/// stream tears the exchange down.
pub(crate) fn chat_stream(
    server: Arc<BridgeServer>,
    packet: Value,
    ctx: ChunkContext,
) -> impl futures::Stream<Item = ChatCompletionChunk> + Send + 'static {
    let (tx, rx) = mpsc::channel(32);

    tokio::spawn(drive(server, packet, ctx, tx));

    rx
}

async fn drive(server: Arc<BridgeServer>, mut packet: Value, ctx: ChunkContext, mut tx: mpsc::Sender<ChatCompletionChunk>) {
    let input_tokens = crate::token_counter::count_packet(&packet);

    let mut retry_count = 0u32;
    let mut restricted_tools: HashSet<String> = HashSet::new();

    // The opening role chunk is emitted exactly once, never on retries.
    if tx.send(ctx.role_chunk()).await.is_err() {
        return;
    }

    loop {
        let stream = match server.source().open(&packet).await {
            Ok(stream) => stream,
            Err(e) => {
                log::error!("upstream exchange failed: {e}");
                let _ = tx.send(ctx.fatal_chunk(e.client_message())).await;
                return;
            }
        };

        let mut translator = OpenAiTranslator::new(ctx.clone(), input_tokens);
        let mut stream = stream.fuse();
        let mut interrupt: Option<Interrupt> = None;

        while let Some(item) = stream.next().await {
            let event = match item {
                Ok(event) => event,
                Err(e) => {
                    log::error!("upstream stream failed mid-response: {e}");
                    let _ = tx.send(ctx.fatal_chunk(e.client_message())).await;
                    return;
                }
            };

            if let Some(init) = &event.init {
                server.remember_continuity(init).await;
            }

            let mut chunks = Vec::new();
            let outcome = translator.process(&event, &mut chunks);

            for chunk in chunks {
                if tx.send(chunk).await.is_err() {
                    // Client went away; drop the upstream connection with
                    // the stream.
                    return;
                }
            }

            if let Err(signal) = outcome {
                interrupt = Some(signal);
                break;
            }
        }

        let Some(signal) = interrupt else {
            // Clean finish: the terminating chunk is already out.
            return;
        };

        match signal {
            Interrupt::InternalTool { tool_name, .. } => {
                if retry_count >= MAX_RETRIES {
                    log::error!(
                        "restricted-tool recovery exhausted (tool: {})",
                        tool_name.as_deref().unwrap_or("<unknown>")
                    );

                    let _ = tx.send(ctx.text_chunk(internal_tool_exhausted(tool_name.as_deref()))).await;
                    let _ = tx
                        .send(ctx.finish_chunk(FinishReason::Stop, Usage::new(input_tokens as u32, 50)))
                        .await;
                    return;
                }

                if let Some(tool) = &tool_name {
                    restricted_tools.insert(tool.clone());
                }

                log::info!(
                    "auto-recovering from internal_error (tool: {}, restricted so far: {})",
                    tool_name.as_deref().unwrap_or("<unknown>"),
                    restricted_tools.len()
                );

                append_recovery_hint(&mut packet, &internal_tool_hint(tool_name.as_deref()), &INTERNAL_TOOL_MARKERS);

                if tx.send(ctx.text_chunk(internal_tool_notice())).await.is_err() {
                    return;
                }
            }
            Interrupt::LlmUnavailable => {
                if retry_count >= MAX_RETRIES {
                    log::error!("llm_unavailable recovery exhausted");

                    let _ = tx.send(ctx.text_chunk(llm_unavailable_exhausted())).await;
                    let _ = tx
                        .send(ctx.finish_chunk(FinishReason::Stop, Usage::new(input_tokens as u32, 10)))
                        .await;
                    return;
                }

                log::info!("auto-recovering from llm_unavailable");

                append_recovery_hint(&mut packet, llm_unavailable_hint(), &LLM_UNAVAILABLE_MARKERS);

                if tx.send(ctx.text_chunk(llm_unavailable_notice())).await.is_err() {
                    return;
                }
            }
        }

        retry_count += 1;
    }
}
