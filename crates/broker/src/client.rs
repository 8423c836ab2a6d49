use std::time::Duration;

use async_trait::async_trait;
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};

use crate::BrokerError;

/// An account allocated by the broker.
#[derive(Debug, Clone, Deserialize)]
pub struct Account {
    /// Account email, used when reporting a ban.
    #[serde(default)]
    pub email: Option<String>,
    /// Long-lived refresh token exchanged for bearer tokens.
    #[serde(default)]
    pub refresh_token: Option<String>,
    /// Fallback identity token, usable directly when refresh fails.
    #[serde(default)]
    pub id_token: Option<String>,
}

/// A ready-to-use upstream session: a bearer token plus the broker-side
/// session id needed to release it.
#[derive(Debug, Clone)]
pub struct Session {
    /// Bearer token for the upstream service.
    pub access_token: String,
    /// Broker session id, if the broker tracks one.
    pub session_id: Option<String>,
    /// Email of the backing account.
    pub email: Option<String>,
}

/// Source of upstream sessions. The HTTP implementation talks to the account
/// broker service; tests substitute a scripted one.
#[async_trait]
pub trait SessionBroker: Send + Sync {
    /// Allocate an account and exchange it for a bearer token.
    async fn acquire(&self) -> Result<Session, BrokerError>;

    /// Release a broker session. Best-effort.
    async fn release(&self, session_id: &str);

    /// Report an account as rate-limited or banned. Best-effort.
    async fn mark_blocked(&self, token: Option<&str>, email: Option<&str>);
}

#[derive(Debug, Deserialize)]
struct AllocateResponse {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    accounts: Vec<Account>,
    #[serde(default)]
    session_id: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RefreshResponse {
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    id_token: Option<String>,
}

#[derive(Debug, Serialize)]
struct MarkBlockedRequest<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    jwt_token: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    email: Option<&'a str>,
}

/// HTTP client for the account broker service.
pub struct HttpSessionBroker {
    client: reqwest::Client,
    base_url: String,
    refresh_url: Option<String>,
    client_headers: config::ClientHeaders,
}

impl HttpSessionBroker {
    /// Build a broker client from configuration.
    pub fn new(config: &config::BrokerConfig, client_headers: config::ClientHeaders) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| anyhow::anyhow!("failed to build broker HTTP client: {e}"))?;

        let refresh_url = config.refresh_url.clone().map(|url| {
            match config.refresh_api_key.as_ref() {
                Some(key) if !url.contains("key=") => {
                    let separator = if url.contains('?') { '&' } else { '?' };
                    format!("{url}{separator}key={}", key.expose_secret())
                }
                _ => url,
            }
        });

        Ok(Self {
            client,
            base_url: config.url.trim_end_matches('/').to_owned(),
            refresh_url,
            client_headers,
        })
    }

    /// Exchange the account's refresh token for a bearer token, falling back
    /// to its id token when the exchange is unavailable or fails.
    async fn access_token_for(&self, account: &Account) -> Result<String, BrokerError> {
        let Some(refresh_token) = account.refresh_token.as_deref() else {
            return account.id_token.clone().ok_or(BrokerError::NoToken);
        };

        let Some(refresh_url) = self.refresh_url.as_deref() else {
            log::warn!("no refresh endpoint configured, using account id_token directly");
            return account.id_token.clone().ok_or(BrokerError::NoToken);
        };

        let body = format!("grant_type=refresh_token&refresh_token={refresh_token}");

        let response = self
            .client
            .post(refresh_url)
            .header("content-type", "application/x-www-form-urlencoded")
            .header("x-client-version", &self.client_headers.version)
            .header("x-client-os-category", &self.client_headers.os_category)
            .header("x-client-os-name", &self.client_headers.os_name)
            .header("x-client-os-version", &self.client_headers.os_version)
            .body(body)
            .send()
            .await;

        let response = match response {
            Ok(response) => response,
            Err(e) => {
                log::warn!("token refresh failed, falling back to id_token: {e}");
                return account.id_token.clone().ok_or(BrokerError::NoToken);
            }
        };

        if !response.status().is_success() {
            log::warn!("token refresh answered HTTP {}, falling back to id_token", response.status());
            return account.id_token.clone().ok_or(BrokerError::NoToken);
        }

        let tokens: RefreshResponse = match response.json().await {
            Ok(tokens) => tokens,
            Err(e) => {
                log::warn!("token refresh body unreadable, falling back to id_token: {e}");
                return account.id_token.clone().ok_or(BrokerError::NoToken);
            }
        };

        tokens
            .access_token
            .or(tokens.id_token)
            .or_else(|| account.id_token.clone())
            .ok_or(BrokerError::NoToken)
    }
}

#[async_trait]
impl SessionBroker for HttpSessionBroker {
    async fn acquire(&self) -> Result<Session, BrokerError> {
        let response = self
            .client
            .post(format!("{}/api/accounts/allocate", self.base_url))
            .json(&serde_json::json!({ "count": 1 }))
            .send()
            .await
            .map_err(|e| BrokerError::Unreachable(e.to_string()))?;

        let status = response.status();

        if !status.is_success() {
            let message = truncated_body(response).await;
            return Err(BrokerError::Status {
                status: status.as_u16(),
                message,
            });
        }

        let allocated: AllocateResponse = response
            .json()
            .await
            .map_err(|e| BrokerError::Unreachable(format!("invalid allocate response: {e}")))?;

        if !allocated.success {
            return Err(BrokerError::Status {
                status: status.as_u16(),
                message: allocated.message.unwrap_or_else(|| "allocation refused".to_owned()),
            });
        }

        let Some(account) = allocated.accounts.into_iter().next() else {
            return Err(BrokerError::NoAccounts);
        };

        log::info!(
            "allocated broker account {} (session {})",
            account.email.as_deref().unwrap_or("<unknown>"),
            allocated.session_id.as_deref().unwrap_or("<none>"),
        );

        let access_token = match self.access_token_for(&account).await {
            Ok(token) => token,
            Err(e) => {
                // The account is unusable; hand the session back right away.
                if let Some(session_id) = allocated.session_id.as_deref() {
                    self.release(session_id).await;
                }
                return Err(e);
            }
        };

        Ok(Session {
            access_token,
            session_id: allocated.session_id,
            email: account.email,
        })
    }

    async fn release(&self, session_id: &str) {
        let result = self
            .client
            .post(format!("{}/api/accounts/release", self.base_url))
            .json(&serde_json::json!({ "session_id": session_id }))
            .send()
            .await;

        match result {
            Ok(response) if response.status().is_success() => {
                log::debug!("released broker session {session_id}");
            }
            Ok(response) => {
                log::warn!("failed to release broker session {session_id}: HTTP {}", response.status());
            }
            Err(e) => {
                log::warn!("failed to release broker session {session_id}: {e}");
            }
        }
    }

    async fn mark_blocked(&self, token: Option<&str>, email: Option<&str>) {
        if token.is_none() && email.is_none() {
            return;
        }

        let payload = MarkBlockedRequest { jwt_token: token, email };

        let result = self
            .client
            .post(format!("{}/api/accounts/mark_blocked", self.base_url))
            .json(&payload)
            .send()
            .await;

        match result {
            Ok(response) if response.status().is_success() => {
                log::info!("reported blocked account to broker");
            }
            Ok(response) => {
                log::warn!("mark_blocked answered HTTP {}", response.status());
            }
            Err(e) => {
                log::warn!("mark_blocked call failed: {e}");
            }
        }
    }
}

async fn truncated_body(response: reqwest::Response) -> String {
    let mut body = response.text().await.unwrap_or_default();
    body.truncate(300);
    body
}
