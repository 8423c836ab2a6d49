//! Session broker client and the warm credential pool.
//!
//! The upstream service authenticates with short-lived bearer tokens issued
//! per account. A separate broker service hands out accounts; this crate
//! exchanges their refresh tokens for bearer tokens and keeps a small pool of
//! ready credentials so a rate-limited token can be swapped without stalling
//! the request in flight.

mod client;
mod jwt;
mod pool;

pub use client::{Account, HttpSessionBroker, Session, SessionBroker};
pub use jwt::is_token_expired;
pub use pool::{Credential, CredentialPool, CredentialStatus, PoolStats};

use thiserror::Error;

/// Broker and pool failures.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// The broker HTTP call failed at the transport level.
    #[error("broker unreachable: {0}")]
    Unreachable(String),

    /// The broker answered with a non-success status.
    #[error("broker error (HTTP {status}): {message}")]
    Status {
        /// HTTP status code returned by the broker.
        status: u16,
        /// Response body, truncated for logging.
        message: String,
    },

    /// The broker allocated no accounts.
    #[error("broker returned no accounts")]
    NoAccounts,

    /// Neither a refreshed access token nor a fallback id token is available.
    #[error("account carries no usable token")]
    NoToken,

    /// The pool has no valid credential and emergency acquisition failed.
    #[error("no valid upstream credential available")]
    NoCredential,
}
