use mcp_oauth::{AuthorizationHandler, OAuthError};
use std::fmt;
use std::sync::Arc;

pub type Result<T> = std::result::Result<T, ClientError>;

/// The remote server rejected our credentials, or we had none to send.
///
/// Carries the handler able to run the interactive authorization for this
/// transport.
#[derive(Clone)]
pub struct AuthorizationRequired {
    handler: Arc<dyn AuthorizationHandler>,
}

impl AuthorizationRequired {
    pub fn new(handler: Arc<dyn AuthorizationHandler>) -> Self {
        Self { handler }
    }

    pub fn handler(&self) -> Arc<dyn AuthorizationHandler> {
        Arc::clone(&self.handler)
    }
}

impl fmt::Debug for AuthorizationRequired {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthorizationRequired")
            .field("client_id", &self.handler.client_id())
            .finish()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("Authorization required")]
    AuthorizationRequired(AuthorizationRequired),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Server returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Server error {code}: {message}")]
    Rpc { code: i32, message: String },

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Credential storage error: {0}")]
    Storage(#[from] OAuthError),

    #[error("Invalid header: {0}")]
    InvalidHeader(String),
}

impl ClientError {
    pub fn protocol(message: impl Into<String>) -> Self {
        ClientError::Protocol(message.into())
    }

    pub fn authorization_handler(&self) -> Option<Arc<dyn AuthorizationHandler>> {
        match self {
            ClientError::AuthorizationRequired(required) => Some(required.handler()),
            _ => None,
        }
    }
}
