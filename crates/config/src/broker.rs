use secrecy::SecretString;
use serde::Deserialize;

use crate::env_var;

/// Session broker settings. The broker allocates upstream accounts and
/// exchanges their refresh tokens for bearer tokens.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BrokerConfig {
    /// Base URL of the account broker service.
    pub url: String,
    /// Token refresh endpoint. The endpoint key, when required, is part of
    /// the URL query string supplied by the deployment.
    pub refresh_url: Option<String>,
    /// Optional API key sent with refresh requests.
    pub refresh_api_key: Option<SecretString>,
    /// Timeout for broker HTTP calls, in seconds.
    pub timeout_secs: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:8019".to_owned(),
            refresh_url: None,
            refresh_api_key: None,
            timeout_secs: 30,
        }
    }
}

impl BrokerConfig {
    pub(crate) fn apply_env_overrides(&mut self) {
        if let Some(url) = env_var("BROKER_URL") {
            self.url = url;
        }

        if let Some(url) = env_var("REFRESH_URL") {
            self.refresh_url = Some(url);
        }

        if let Some(key) = env_var("REFRESH_API_KEY") {
            self.refresh_api_key = Some(key.into());
        }
    }
}
