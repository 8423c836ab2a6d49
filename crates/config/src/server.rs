use std::net::SocketAddr;

use serde::Deserialize;

use crate::env_var;

/// HTTP server configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    /// The socket address the server binds to.
    pub listen_address: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_address: SocketAddr::from(([127, 0, 0, 1], 8010)),
        }
    }
}

impl ServerConfig {
    pub(crate) fn apply_env_overrides(&mut self) {
        if let Some(listen) = env_var("BIFROST_LISTEN")
            && let Ok(addr) = listen.parse()
        {
            self.listen_address = addr;
        }
    }
}
