use std::{
    sync::Arc,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::{BrokerError, Session, SessionBroker, jwt};

const ACQUIRE_ATTEMPTS: u32 = 2;

/// Lifecycle state of a pooled credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialStatus {
    /// Usable for new requests.
    Valid,
    /// Observed a 429; will be evicted on the next sweep.
    RateLimited,
    /// Marked expired outside the JWT check.
    Expired,
}

/// One pooled upstream credential.
#[derive(Debug, Clone)]
pub struct Credential {
    /// Bearer token for the upstream service.
    pub token: String,
    /// Broker session backing the token.
    pub session_id: Option<String>,
    /// Email of the backing account, used for ban reports.
    pub email: Option<String>,
    /// Unix seconds at creation.
    pub created_at: u64,
    /// Unix seconds at last use; zero when never used.
    pub last_used_at: u64,
    /// Number of requests served with this credential.
    pub use_count: u64,
    /// Lifecycle state.
    pub status: CredentialStatus,
}

impl Credential {
    fn from_session(session: Session, used: bool) -> Self {
        let now = unix_now();

        Self {
            token: session.access_token,
            session_id: session.session_id,
            email: session.email,
            created_at: now,
            last_used_at: if used { now } else { 0 },
            use_count: u64::from(used),
            status: CredentialStatus::Valid,
        }
    }
}

/// Pool observability counters.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct PoolStats {
    /// Credential lookups served.
    pub total_requests: u64,
    /// Rate-limited tokens successfully swapped for a pooled one.
    pub successful_switches: u64,
    /// Credentials created over the pool's lifetime.
    pub tokens_created: u64,
    /// 429 reports received.
    pub rate_limit_hits: u64,
    /// Credentials currently held, any status.
    pub pool_size: usize,
    /// Credentials currently valid.
    pub valid_tokens: usize,
    /// Sum of use counts across held credentials.
    pub total_token_uses: u64,
    /// Mean age of valid credentials, in seconds.
    pub average_token_age_secs: f64,
}

#[derive(Default)]
struct Counters {
    total_requests: u64,
    successful_switches: u64,
    tokens_created: u64,
    rate_limit_hits: u64,
}

#[derive(Default)]
struct Inner {
    credentials: Vec<Credential>,
    counters: Counters,
}

/// Warm pool of upstream credentials with background replenishment.
///
/// A single coarse lock serializes mutations; acquisitions run as
/// fire-and-forget tasks that re-take the lock to append their result.
pub struct CredentialPool {
    broker: Arc<dyn SessionBroker>,
    size: usize,
    expiry_buffer: Duration,
    inner: Mutex<Inner>,
}

impl CredentialPool {
    /// Create a pool over the given broker.
    pub fn new(broker: Arc<dyn SessionBroker>, size: usize, expiry_buffer: Duration) -> Arc<Self> {
        Arc::new(Self {
            broker,
            size: size.max(1),
            expiry_buffer,
            inner: Mutex::new(Inner::default()),
        })
    }

    /// Fill the pool to capacity, then keep it healthy in the background
    /// until the token is cancelled.
    pub async fn start(self: &Arc<Self>, interval: Duration, cancel: CancellationToken) {
        self.fill().await;

        let pool = Arc::clone(self);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The interval fires immediately once; the fill above already
            // covered that round.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        pool.sweep().await;
                        pool.ensure_health();
                    }
                }
            }

            log::info!("credential pool maintenance stopped");
        });
    }

    /// Acquire a valid credential, creating one on the spot when the pool is
    /// dry.
    pub async fn acquire(self: &Arc<Self>) -> Result<Credential, BrokerError> {
        {
            let mut inner = self.inner.lock().await;
            inner.counters.total_requests += 1;

            if let Some(credential) = self.checkout(&mut inner, None) {
                drop(inner);
                self.ensure_health();
                return Ok(credential);
            }
        }

        log::warn!("credential pool has no valid entry, acquiring synchronously");

        let credential = self.emergency_acquire().await;
        self.ensure_health();

        credential.ok_or(BrokerError::NoCredential)
    }

    /// Mark a credential as rate-limited and hand back a different valid one
    /// when available. Reports the ban to the broker in the background.
    pub async fn report_rate_limited(self: &Arc<Self>, failed_token: &str) -> Option<Credential> {
        let (backup, email) = {
            let mut inner = self.inner.lock().await;
            inner.counters.rate_limit_hits += 1;

            let mut email = None;

            for credential in &mut inner.credentials {
                if credential.token == failed_token {
                    credential.status = CredentialStatus::RateLimited;
                    email = credential.email.clone();
                    log::warn!("credential rate-limited, rotating it out");
                }
            }

            let backup = self.checkout(&mut inner, Some(failed_token));

            if backup.is_some() {
                inner.counters.successful_switches += 1;
            }

            (backup, email)
        };

        let broker = Arc::clone(&self.broker);
        let token = failed_token.to_owned();
        tokio::spawn(async move {
            broker.mark_blocked(Some(&token), email.as_deref()).await;
        });

        self.ensure_health();

        match backup {
            Some(credential) => Some(credential),
            None => {
                log::warn!("no backup credential available, acquiring synchronously");
                self.emergency_acquire().await
            }
        }
    }

    /// Current pool counters.
    pub async fn stats(&self) -> PoolStats {
        let inner = self.inner.lock().await;
        let now = unix_now();

        let valid: Vec<&Credential> = inner
            .credentials
            .iter()
            .filter(|c| self.is_usable(c))
            .collect();

        let average_token_age_secs = if valid.is_empty() {
            0.0
        } else {
            valid.iter().map(|c| now.saturating_sub(c.created_at) as f64).sum::<f64>() / valid.len() as f64
        };

        PoolStats {
            total_requests: inner.counters.total_requests,
            successful_switches: inner.counters.successful_switches,
            tokens_created: inner.counters.tokens_created,
            rate_limit_hits: inner.counters.rate_limit_hits,
            pool_size: inner.credentials.len(),
            valid_tokens: valid.len(),
            total_token_uses: inner.credentials.iter().map(|c| c.use_count).sum(),
            average_token_age_secs,
        }
    }

    /// Fill the pool to capacity, awaiting the acquisitions.
    pub async fn fill(self: &Arc<Self>) {
        let needed = {
            let inner = self.inner.lock().await;
            self.size.saturating_sub(self.valid_count(&inner))
        };

        if needed == 0 {
            return;
        }

        log::info!("filling credential pool, {needed} credential(s) needed");

        let mut tasks = tokio::task::JoinSet::new();

        for _ in 0..needed {
            let pool = Arc::clone(self);
            tasks.spawn(async move { pool.create_and_add().await });
        }

        let results = tasks.join_all().await;
        let created = results.into_iter().filter(|added| *added).count();

        log::info!("credential pool fill complete: {created}/{needed} created");
    }

    /// Evict expired and rate-limited credentials, releasing their broker
    /// sessions.
    pub async fn sweep(self: &Arc<Self>) {
        let evicted: Vec<Credential> = {
            let mut inner = self.inner.lock().await;
            let drained = std::mem::take(&mut inner.credentials);

            let (kept, evicted): (Vec<_>, Vec<_>) = drained
                .into_iter()
                .partition(|c| c.status == CredentialStatus::Valid && !self.token_expired(&c.token));

            inner.credentials = kept;
            evicted
        };

        if evicted.is_empty() {
            return;
        }

        log::debug!("evicted {} credential(s) during maintenance", evicted.len());

        for credential in evicted {
            if let Some(session_id) = credential.session_id {
                let broker = Arc::clone(&self.broker);
                tokio::spawn(async move {
                    broker.release(&session_id).await;
                });
            }
        }
    }

    /// Refill in the background when the valid count drops to half capacity.
    fn ensure_health(self: &Arc<Self>) {
        let pool = Arc::clone(self);

        tokio::spawn(async move {
            let needed = {
                let inner = pool.inner.lock().await;
                let valid = pool.valid_count(&inner);
                let threshold = pool.size.div_ceil(2);

                if valid <= threshold { pool.size - valid } else { 0 }
            };

            if needed == 0 {
                return;
            }

            log::info!("credential pool below half capacity, replenishing {needed} credential(s)");

            for _ in 0..needed {
                let pool = Arc::clone(&pool);
                tokio::spawn(async move {
                    pool.create_and_add().await;
                });
            }
        });
    }

    fn checkout(&self, inner: &mut Inner, exclude_token: Option<&str>) -> Option<Credential> {
        let now = unix_now();

        let expiry_buffer = self.expiry_buffer;
        let credential = inner.credentials.iter_mut().find(|c| {
            if exclude_token.is_some_and(|excluded| c.token == excluded) {
                return false;
            }

            c.status == CredentialStatus::Valid && !jwt::is_token_expired(&c.token, expiry_buffer)
        })?;

        credential.last_used_at = now;
        credential.use_count += 1;

        Some(credential.clone())
    }

    async fn emergency_acquire(self: &Arc<Self>) -> Option<Credential> {
        match self.create_with_retry().await {
            Some(session) => {
                let credential = Credential::from_session(session, true);

                let mut inner = self.inner.lock().await;
                inner.credentials.push(credential.clone());
                inner.counters.tokens_created += 1;

                Some(credential)
            }
            None => None,
        }
    }

    async fn create_and_add(self: &Arc<Self>) -> bool {
        let Some(session) = self.create_with_retry().await else {
            return false;
        };

        let surplus = {
            let mut inner = self.inner.lock().await;

            // Concurrent refills may land after the pool is already full;
            // capacity is a hard ceiling.
            if self.valid_count(&inner) >= self.size {
                Some(session)
            } else {
                inner.credentials.push(Credential::from_session(session, false));
                inner.counters.tokens_created += 1;

                log::debug!("added credential to pool, size now {}", inner.credentials.len());
                None
            }
        };

        match surplus {
            Some(session) => {
                if let Some(session_id) = session.session_id {
                    self.broker.release(&session_id).await;
                }
                false
            }
            None => true,
        }
    }

    async fn create_with_retry(&self) -> Option<Session> {
        for attempt in 0..ACQUIRE_ATTEMPTS {
            match self.broker.acquire().await {
                Ok(session) => return Some(session),
                Err(e) => {
                    log::error!("credential acquisition failed (attempt {}/{ACQUIRE_ATTEMPTS}): {e}", attempt + 1);

                    if attempt + 1 < ACQUIRE_ATTEMPTS {
                        tokio::time::sleep(Duration::from_secs(1 << attempt)).await;
                    }
                }
            }
        }

        None
    }

    fn valid_count(&self, inner: &Inner) -> usize {
        inner.credentials.iter().filter(|c| self.is_usable(c)).count()
    }

    fn is_usable(&self, credential: &Credential) -> bool {
        credential.status == CredentialStatus::Valid && !self.token_expired(&credential.token)
    }

    fn token_expired(&self, token: &str) -> bool {
        jwt::is_token_expired(token, self.expiry_buffer)
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU64, Ordering};

    use async_trait::async_trait;
    use base64::Engine;

    use super::*;

    fn fake_jwt(exp_offset_secs: i64, seed: u64) -> String {
        let exp = unix_now() as i64 + exp_offset_secs;
        let header = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(r#"{"alg":"none"}"#);
        let payload = base64::engine::general_purpose::URL_SAFE_NO_PAD
            .encode(format!(r#"{{"exp":{exp},"seed":{seed}}}"#));

        format!("{header}.{payload}.sig")
    }

    #[derive(Default)]
    struct ScriptedBroker {
        issued: AtomicU64,
        released: AtomicU64,
        blocked: AtomicU64,
        fail: bool,
    }

    #[async_trait]
    impl SessionBroker for ScriptedBroker {
        async fn acquire(&self) -> Result<Session, BrokerError> {
            if self.fail {
                return Err(BrokerError::Unreachable("scripted failure".to_owned()));
            }

            let n = self.issued.fetch_add(1, Ordering::SeqCst);

            Ok(Session {
                access_token: fake_jwt(3600, n),
                session_id: Some(format!("session-{n}")),
                email: Some(format!("account-{n}@example.com")),
            })
        }

        async fn release(&self, _session_id: &str) {
            self.released.fetch_add(1, Ordering::SeqCst);
        }

        async fn mark_blocked(&self, _token: Option<&str>, _email: Option<&str>) {
            self.blocked.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn pool_with(broker: Arc<ScriptedBroker>, size: usize) -> Arc<CredentialPool> {
        CredentialPool::new(broker, size, Duration::from_secs(300))
    }

    #[tokio::test]
    async fn fill_reaches_capacity() {
        let broker = Arc::new(ScriptedBroker::default());
        let pool = pool_with(broker.clone(), 3);

        pool.fill().await;

        let stats = pool.stats().await;
        assert_eq!(stats.pool_size, 3);
        assert_eq!(stats.valid_tokens, 3);
        assert_eq!(stats.tokens_created, 3);
    }

    #[tokio::test]
    async fn acquire_from_empty_pool_goes_through_emergency_path() {
        let broker = Arc::new(ScriptedBroker::default());
        let pool = pool_with(broker.clone(), 3);

        let credential = pool.acquire().await.unwrap();

        assert_eq!(credential.use_count, 1);
        assert_eq!(pool.stats().await.tokens_created, 1);
    }

    #[tokio::test]
    async fn acquire_fails_when_broker_is_down() {
        let broker = Arc::new(ScriptedBroker {
            fail: true,
            ..Default::default()
        });
        let pool = pool_with(broker, 3);

        let err = pool.acquire().await.unwrap_err();
        assert!(matches!(err, BrokerError::NoCredential));
    }

    #[tokio::test]
    async fn rate_limited_credential_is_swapped_for_another() {
        let broker = Arc::new(ScriptedBroker::default());
        let pool = pool_with(broker.clone(), 3);
        pool.fill().await;

        let first = pool.acquire().await.unwrap();
        let backup = pool.report_rate_limited(&first.token).await.unwrap();

        assert_ne!(backup.token, first.token);

        let stats = pool.stats().await;
        assert_eq!(stats.rate_limit_hits, 1);
        assert_eq!(stats.successful_switches, 1);
    }

    #[tokio::test]
    async fn sweep_evicts_rate_limited_and_expired_entries() {
        let broker = Arc::new(ScriptedBroker::default());
        let pool = pool_with(broker.clone(), 3);
        pool.fill().await;

        let victim = pool.acquire().await.unwrap();
        pool.report_rate_limited(&victim.token).await;

        // An expired entry alongside the rate-limited one.
        {
            let mut inner = pool.inner.lock().await;
            inner.credentials.push(Credential {
                token: fake_jwt(-60, 99),
                session_id: Some("session-expired".to_owned()),
                email: None,
                created_at: unix_now(),
                last_used_at: 0,
                use_count: 0,
                status: CredentialStatus::Valid,
            });
        }

        pool.sweep().await;

        let stats = pool.stats().await;
        assert_eq!(stats.pool_size, stats.valid_tokens);
        assert!(!pool.inner.lock().await.credentials.iter().any(|c| c.token == victim.token));
    }

    #[tokio::test]
    async fn acquire_updates_usage_metadata() {
        let broker = Arc::new(ScriptedBroker::default());
        let pool = pool_with(broker, 1);
        pool.fill().await;

        let first = pool.acquire().await.unwrap();
        let second = pool.acquire().await.unwrap();

        assert_eq!(first.token, second.token);
        assert_eq!(second.use_count, 2);
        assert!(second.last_used_at > 0);
    }
}
