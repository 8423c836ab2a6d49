//! Bifrost configuration structures to map the bifrost.toml configuration.
//!
//! Configuration is loaded from an optional TOML file and then overridden
//! from the environment, so a container deployment can run without any file
//! at all.

#![deny(missing_docs)]

mod broker;
mod credentials;
mod server;
mod upstream;

use std::path::Path;

pub use broker::BrokerConfig;
pub use credentials::CredentialsConfig;
use serde::Deserialize;
pub use server::ServerConfig;
pub use upstream::{ClientHeaders, UpstreamConfig};

/// Main configuration structure for the Bifrost application.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// HTTP server configuration settings.
    pub server: ServerConfig,
    /// Upstream agent service settings.
    pub upstream: UpstreamConfig,
    /// Session broker settings.
    pub broker: BrokerConfig,
    /// Credential pool settings.
    pub credentials: CredentialsConfig,
}

impl Config {
    /// Load configuration from an optional file path, then apply environment
    /// overrides.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Config> {
        let mut config = match path {
            Some(path) => {
                let content = std::fs::read_to_string(path)
                    .map_err(|e| anyhow::anyhow!("failed to read config file {}: {e}", path.display()))?;

                toml::from_str(&content)
                    .map_err(|e| anyhow::anyhow!("failed to parse config file {}: {e}", path.display()))?
            }
            None => Config::default(),
        };

        config.apply_env_overrides();

        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        self.server.apply_env_overrides();
        self.upstream.apply_env_overrides();
        self.broker.apply_env_overrides();
    }
}

pub(crate) fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use indoc::indoc;
    use insta::assert_debug_snapshot;

    use crate::Config;

    #[test]
    fn defaults() {
        let config: Config = toml::from_str("").unwrap();

        assert_eq!(config.server.listen_address.to_string(), "127.0.0.1:8010");
        assert_eq!(config.credentials.pool_size, 3);
        assert_eq!(config.credentials.maintenance_interval_secs, 30);
        assert_eq!(config.credentials.expiry_buffer_minutes, 5);
        assert_eq!(config.upstream.request_timeout_secs, 600);
        assert_eq!(config.broker.timeout_secs, 30);
        assert!(!config.upstream.insecure_tls);
    }

    #[test]
    fn parses_full_file() {
        let config: Config = toml::from_str(indoc! {r#"
            [server]
            listen_address = "0.0.0.0:9000"

            [upstream]
            url = "https://agents.internal/api/send"
            models_url = "https://agents.internal/v1/models"
            insecure_tls = true

            [upstream.client_headers]
            version = "v0.2025.08.06.08.12.stable_02"
            os_category = "Windows"
            os_name = "Windows"
            os_version = "11 (26100)"

            [broker]
            url = "http://localhost:8019"
            refresh_url = "https://auth.internal/token?key=abc"

            [credentials]
            pool_size = 5
        "#})
        .unwrap();

        assert_debug_snapshot!(config.upstream.client_headers, @r#"
        ClientHeaders {
            version: "v0.2025.08.06.08.12.stable_02",
            os_category: "Windows",
            os_name: "Windows",
            os_version: "11 (26100)",
        }
        "#);

        assert_eq!(config.server.listen_address.to_string(), "0.0.0.0:9000");
        assert_eq!(config.credentials.pool_size, 5);
        assert!(config.upstream.insecure_tls);
        assert_eq!(config.broker.refresh_url.as_deref(), Some("https://auth.internal/token?key=abc"));
    }

    #[test]
    fn rejects_unknown_fields() {
        let result: Result<Config, _> = toml::from_str("[server]\nlisten = \"x\"\n");
        assert!(result.is_err());
    }
}
