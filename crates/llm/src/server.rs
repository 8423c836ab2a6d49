//! Bridge server: owns the upstream event source, the credential pool, and
//! the conversation continuity state.

use std::{sync::Arc, time::Duration};

use broker::{CredentialPool, HttpSessionBroker, PoolStats};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::{
    messages::openai::{Model, ModelsResponse, ObjectType},
    state::{Continuity, ContinuitySnapshot},
    upstream::{EventSource, UpstreamClient, events::Init},
};

/// Models served when the configured model listing endpoint is absent or
/// unreachable.
const FALLBACK_MODELS: [&str; 8] = [
    "claude-4.1-opus",
    "claude-4-opus",
    "claude-4-sonnet",
    "claude-3-5-sonnet",
    "claude-3-5-haiku",
    "gpt-5",
    "o3",
    "auto",
];

pub struct BridgeServer {
    source: Arc<dyn EventSource>,
    pool: Option<Arc<CredentialPool>>,
    models_url: Option<String>,
    http: reqwest::Client,
    continuity: RwLock<Continuity>,
    shutdown: CancellationToken,
}

impl BridgeServer {
    /// Build the server from configuration: broker client, credential pool
    /// (warming up in the background), and the upstream streamer.
    pub async fn build(config: &config::Config) -> anyhow::Result<Arc<Self>> {
        let broker = HttpSessionBroker::new(&config.broker, config.upstream.client_headers.clone())?;

        let pool = CredentialPool::new(
            Arc::new(broker),
            config.credentials.pool_size,
            Duration::from_secs(config.credentials.expiry_buffer_minutes * 60),
        );

        let shutdown = CancellationToken::new();

        // Fill and maintain the pool in the background; the first request
        // falls back to emergency acquisition if it arrives before warm-up
        // completes.
        {
            let pool = Arc::clone(&pool);
            let interval = Duration::from_secs(config.credentials.maintenance_interval_secs);
            let cancel = shutdown.child_token();

            tokio::spawn(async move {
                pool.start(interval, cancel).await;
            });
        }

        let upstream = UpstreamClient::new(&config.upstream, Arc::clone(&pool))?;

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| anyhow::anyhow!("failed to build HTTP client: {e}"))?;

        Ok(Arc::new(Self {
            source: Arc::new(upstream),
            pool: Some(pool),
            models_url: config.upstream.models_url.clone(),
            http,
            continuity: RwLock::new(Continuity::default()),
            shutdown,
        }))
    }

    /// Server over a custom event source. No pool, no model proxying; used
    /// by tests and embedding.
    pub fn with_event_source(source: Arc<dyn EventSource>) -> Arc<Self> {
        Arc::new(Self {
            source,
            pool: None,
            models_url: None,
            http: reqwest::Client::new(),
            continuity: RwLock::new(Continuity::default()),
            shutdown: CancellationToken::new(),
        })
    }

    pub(crate) fn source(&self) -> &Arc<dyn EventSource> {
        &self.source
    }

    pub(crate) async fn continuity_snapshot(&self) -> ContinuitySnapshot {
        self.continuity.read().await.snapshot()
    }

    /// Record the ids the upstream assigned; later requests echo them back
    /// for multi-turn continuity.
    pub(crate) async fn remember_continuity(&self, init: &Init) {
        let mut continuity = self.continuity.write().await;

        if let Some(conversation_id) = &init.conversation_id
            && !conversation_id.is_empty()
        {
            continuity.conversation_id = Some(conversation_id.clone());
        }

        if let Some(task_id) = &init.task_id
            && !task_id.is_empty()
        {
            continuity.baseline_task_id = Some(task_id.clone());
        }
    }

    /// Model listing: proxied from the configured provider, with a locally
    /// known fallback.
    pub async fn models(&self) -> ModelsResponse {
        if let Some(url) = &self.models_url {
            match self.fetch_models(url).await {
                Ok(models) => return models,
                Err(e) => log::warn!("model listing unreachable, serving local fallback: {e}"),
            }
        }

        ModelsResponse {
            object: ObjectType::List,
            data: FALLBACK_MODELS
                .iter()
                .map(|id| Model {
                    id: (*id).to_owned(),
                    object: ObjectType::Model,
                    created: 0,
                    owned_by: "bifrost".to_owned(),
                })
                .collect(),
        }
    }

    async fn fetch_models(&self, url: &str) -> anyhow::Result<ModelsResponse> {
        let response = self.http.get(url).send().await?;

        if !response.status().is_success() {
            anyhow::bail!("model listing answered HTTP {}", response.status());
        }

        Ok(response.json().await?)
    }

    /// Pool counters, when a pool is attached.
    pub async fn pool_stats(&self) -> Option<PoolStats> {
        match &self.pool {
            Some(pool) => Some(pool.stats().await),
            None => None,
        }
    }

    /// Stop background maintenance.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

impl Drop for BridgeServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
