use serde::Deserialize;

use crate::env_var;

/// Settings for the upstream agent service.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct UpstreamConfig {
    /// The chat endpoint accepting binary request packets and answering with
    /// an SSE stream of binary event frames.
    pub url: String,
    /// Optional model listing endpoint. When unset or unreachable, a locally
    /// known model list is served instead.
    pub models_url: Option<String>,
    /// Client identification headers sent with every upstream request.
    pub client_headers: ClientHeaders,
    /// Disable TLS certificate verification for the upstream connection.
    pub insecure_tls: bool,
    /// Total deadline for one upstream exchange, in seconds. The stream may
    /// suspend arbitrarily long between frames within this budget.
    pub request_timeout_secs: u64,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            url: "https://app.agents.example/ai/multi-agent".to_owned(),
            models_url: None,
            client_headers: ClientHeaders::default(),
            insecure_tls: false,
            request_timeout_secs: 600,
        }
    }
}

impl UpstreamConfig {
    pub(crate) fn apply_env_overrides(&mut self) {
        if let Some(url) = env_var("UPSTREAM_URL") {
            self.url = url;
        }

        if let Some(url) = env_var("UPSTREAM_MODELS_URL") {
            self.models_url = Some(url);
        }

        if let Some(value) = env_var("UPSTREAM_INSECURE_TLS") {
            self.insecure_tls = matches!(value.to_lowercase().as_str(), "1" | "true" | "yes");
        }

        self.client_headers.apply_env_overrides();
    }
}

/// Client identification header triplet expected by the upstream service.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClientHeaders {
    /// Client version string.
    pub version: String,
    /// Operating system category.
    pub os_category: String,
    /// Operating system name.
    pub os_name: String,
    /// Operating system version.
    pub os_version: String,
}

impl Default for ClientHeaders {
    fn default() -> Self {
        Self {
            version: "v0.2025.08.06.08.12.stable_02".to_owned(),
            os_category: "Windows".to_owned(),
            os_name: "Windows".to_owned(),
            os_version: "11 (26100)".to_owned(),
        }
    }
}

impl ClientHeaders {
    fn apply_env_overrides(&mut self) {
        if let Some(version) = env_var("CLIENT_VERSION") {
            self.version = version;
        }

        if let Some(category) = env_var("OS_CATEGORY") {
            self.os_category = category;
        }

        if let Some(name) = env_var("OS_NAME") {
            self.os_name = name;
        }

        if let Some(version) = env_var("OS_VERSION") {
            self.os_version = version;
        }
    }
}
