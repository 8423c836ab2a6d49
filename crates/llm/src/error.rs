use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Request-fatal errors with appropriate HTTP status codes.
///
/// Recoverable in-stream failures (restricted-tool errors, transient model
/// unavailability) are not errors in this sense; they travel as
/// [`crate::translate::Interrupt`] values so the recovery driver can re-drive
/// the request.
#[derive(Debug, Error)]
pub enum Error {
    /// The request carried no messages.
    #[error("messages must not be empty")]
    EmptyMessages,

    /// Malformed request payload.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The session broker could not provide a credential.
    #[error("session broker unavailable: {0}")]
    BrokerUnreachable(String),

    /// The upstream answered with a non-success status. A 429 only lands
    /// here after the one credential rotation has been spent.
    #[error("upstream error (HTTP {status}): {message}")]
    UpstreamHttp {
        /// Upstream HTTP status.
        status: u16,
        /// Response body, truncated.
        message: String,
    },

    /// Transport-level failure talking to the upstream.
    #[error("upstream connection failed: {0}")]
    Connection(String),

    /// Request packet could not be encoded.
    #[error("codec: {0}")]
    Codec(#[from] codec::CodecError),

    /// Internal error. A `Some` message came from the upstream and can be
    /// shown; `None` must not leak details.
    #[error("internal server error")]
    Internal(Option<String>),
}

impl Error {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::EmptyMessages | Self::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Self::BrokerUnreachable(_) | Self::UpstreamHttp { .. } | Self::Connection(_) => StatusCode::BAD_GATEWAY,
            Self::Codec(_) | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn error_type(&self) -> &'static str {
        match self {
            Self::EmptyMessages | Self::InvalidRequest(_) => "invalid_request_error",
            Self::BrokerUnreachable(_) | Self::UpstreamHttp { .. } | Self::Connection(_) => "api_error",
            Self::Codec(_) | Self::Internal(_) => "internal_error",
        }
    }

    /// Message that is safe to expose to API consumers.
    pub fn client_message(&self) -> String {
        match self {
            Self::Internal(Some(upstream_msg)) => upstream_msg.clone(),
            Self::Internal(None) | Self::Codec(_) => "Internal server error".to_owned(),
            _ => self.to_string(),
        }
    }
}

impl From<broker::BrokerError> for Error {
    fn from(error: broker::BrokerError) -> Self {
        Error::BrokerUnreachable(error.to_string())
    }
}

/// Error response format compatible with the OpenAI API.
#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: ErrorDetails,
}

#[derive(Debug, Serialize)]
struct ErrorDetails {
    message: String,
    r#type: String,
    code: u16,
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status_code();

        let body = ErrorResponse {
            error: ErrorDetails {
                message: self.client_message(),
                r#type: self.error_type().to_owned(),
                code: status.as_u16(),
            },
        };

        (status, Json(body)).into_response()
    }
}

/// Error response in the Anthropic Messages shape.
#[derive(Debug, Serialize)]
pub struct AnthropicErrorBody {
    pub r#type: &'static str,
    pub error: AnthropicErrorDetails,
}

#[derive(Debug, Serialize)]
pub struct AnthropicErrorDetails {
    pub r#type: String,
    pub message: String,
}

pub struct AnthropicErrorResponse {
    status: StatusCode,
    body: AnthropicErrorBody,
}

impl From<Error> for AnthropicErrorResponse {
    fn from(error: Error) -> Self {
        Self {
            status: error.status_code(),
            body: AnthropicErrorBody {
                r#type: "error",
                error: AnthropicErrorDetails {
                    r#type: error.error_type().to_owned(),
                    message: error.client_message(),
                },
            },
        }
    }
}

impl IntoResponse for AnthropicErrorResponse {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

pub type AnthropicResult<T> = std::result::Result<T, AnthropicErrorResponse>;
