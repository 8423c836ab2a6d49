use serde::Deserialize;

/// Credential pool sizing and timing.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CredentialsConfig {
    /// Number of warm credentials the pool keeps ready.
    pub pool_size: usize,
    /// Interval between maintenance sweeps, in seconds.
    pub maintenance_interval_secs: u64,
    /// Tokens expiring within this many minutes count as expired.
    pub expiry_buffer_minutes: u64,
}

impl Default for CredentialsConfig {
    fn default() -> Self {
        Self {
            pool_size: 3,
            maintenance_interval_secs: 30,
            expiry_buffer_minutes: 5,
        }
    }
}
