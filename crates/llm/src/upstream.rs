//! Upstream streamer: posts the encoded request packet and yields decoded
//! events from the SSE response.

pub mod events;

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use base64::Engine;
use broker::CredentialPool;
use codec::Value;
use eventsource_stream::Eventsource;
use futures::{StreamExt, future::ready, stream::BoxStream};
use reqwest::header::{ACCEPT, CONTENT_TYPE};

use crate::error::Error;
use events::UpstreamEvent;

pub type EventStream = BoxStream<'static, Result<UpstreamEvent, Error>>;

/// Source of upstream event streams. The HTTP implementation talks to the
/// real service; tests script their own.
#[async_trait]
pub trait EventSource: Send + Sync {
    async fn open(&self, packet: &Value) -> Result<EventStream, Error>;
}

/// HTTP client for the upstream chat endpoint.
pub struct UpstreamClient {
    client: reqwest::Client,
    url: String,
    headers: config::ClientHeaders,
    pool: Arc<CredentialPool>,
}

impl UpstreamClient {
    pub fn new(config: &config::UpstreamConfig, pool: Arc<CredentialPool>) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .tcp_nodelay(true)
            .tcp_keepalive(Some(Duration::from_secs(60)));

        if config.insecure_tls {
            log::warn!("TLS verification disabled for the upstream connection");
            builder = builder.danger_accept_invalid_certs(true);
        }

        let client = builder
            .build()
            .map_err(|e| anyhow::anyhow!("failed to build upstream HTTP client: {e}"))?;

        Ok(Self {
            client,
            url: config.url.clone(),
            headers: config.client_headers.clone(),
            pool,
        })
    }
}

#[async_trait]
impl EventSource for UpstreamClient {
    async fn open(&self, packet: &Value) -> Result<EventStream, Error> {
        let body = codec::encode(packet, codec::REQUEST_MESSAGE)?;

        log::debug!("sending {} bytes to the upstream", body.len());

        let mut credential = self.pool.acquire().await?;

        // One rotation on 429: mark the credential, take another, retry.
        for attempt in 0..2 {
            let response = self
                .client
                .post(&self.url)
                .header(ACCEPT, "text/event-stream")
                .header(CONTENT_TYPE, "application/x-protobuf")
                .header("x-client-version", &self.headers.version)
                .header("x-client-os-category", &self.headers.os_category)
                .header("x-client-os-name", &self.headers.os_name)
                .header("x-client-os-version", &self.headers.os_version)
                .bearer_auth(&credential.token)
                .body(body.clone())
                .send()
                .await
                .map_err(|e| Error::Connection(e.to_string()))?;

            let status = response.status();

            if status.as_u16() == 429 && attempt == 0 {
                log::warn!("upstream rate-limited the credential, rotating");

                credential = self
                    .pool
                    .report_rate_limited(&credential.token)
                    .await
                    .ok_or(Error::BrokerUnreachable("no replacement credential".to_owned()))?;

                continue;
            }

            if !status.is_success() {
                let mut message = response.text().await.unwrap_or_default();
                message.truncate(300);

                return Err(Error::UpstreamHttp {
                    status: status.as_u16(),
                    message,
                });
            }

            return Ok(event_stream(response));
        }

        unreachable!("the retry loop always returns")
    }
}

fn event_stream(response: reqwest::Response) -> EventStream {
    response
        .bytes_stream()
        .eventsource()
        .scan(false, |done, item| {
            if *done {
                return ready(None);
            }

            let out = match item {
                Err(e) => {
                    *done = true;
                    Some(Some(Err(Error::Connection(format!("upstream stream failed: {e}")))))
                }
                Ok(event) => {
                    // A [DONE] payload ends parsing no matter what else has
                    // accumulated in the frame.
                    if event.data.lines().any(|line| line.trim() == "[DONE]") {
                        *done = true;
                        Some(None)
                    } else {
                        Some(decode_frame(&event.data).map(Ok))
                    }
                }
            };

            ready(out)
        })
        .filter_map(ready)
        .boxed()
}

/// Decode one SSE frame payload into an event. Returns `None` for frames
/// that are empty, undecodable, or carry an unparseable message; the stream
/// skips those.
pub(crate) fn decode_frame(data: &str) -> Option<UpstreamEvent> {
    let stripped: String = data.chars().filter(|c| !c.is_whitespace()).collect();

    if stripped.is_empty() {
        return None;
    }

    let bytes = decode_payload_bytes(&stripped)?;

    match codec::decode(&bytes, codec::RESPONSE_EVENT_MESSAGE) {
        Ok(value) => Some(UpstreamEvent::from_value(&value)),
        Err(e) => {
            log::debug!("skipping undecodable frame: {e}");
            None
        }
    }
}

/// Frame payloads are whitespace-packed hex or base64: try hex first, then
/// URL-safe base64 with padding repair, then standard base64.
pub(crate) fn decode_payload_bytes(stripped: &str) -> Option<Vec<u8>> {
    if stripped.chars().all(|c| c.is_ascii_hexdigit())
        && let Some(bytes) = decode_hex(stripped)
    {
        return Some(bytes);
    }

    let padding = (4 - stripped.len() % 4) % 4;
    let padded = format!("{stripped}{}", "=".repeat(padding));

    base64::engine::general_purpose::URL_SAFE
        .decode(&padded)
        .or_else(|_| base64::engine::general_purpose::STANDARD.decode(&padded))
        .ok()
}

fn decode_hex(hex: &str) -> Option<Vec<u8>> {
    if hex.len() % 2 != 0 {
        return None;
    }

    hex.as_bytes()
        .chunks(2)
        .map(|pair| {
            let text = std::str::from_utf8(pair).ok()?;
            u8::from_str_radix(text, 16).ok()
        })
        .collect()
}

/// Drain an event stream into a vector. Used by the non-streaming paths.
pub(crate) async fn collect_events(source: &dyn EventSource, packet: &Value) -> Result<Vec<UpstreamEvent>, Error> {
    let mut stream = source.open(packet).await?;
    let mut events = Vec::new();

    while let Some(item) = stream.next().await {
        events.push(item?);
    }

    Ok(events)
}
