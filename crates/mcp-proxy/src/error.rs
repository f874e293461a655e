use mcp_client::ClientError;
use mcp_oauth::OAuthError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("Client error: {0}")]
    Client(#[from] ClientError),

    #[error("Authorization failed: {0}")]
    Authorization(#[from] OAuthError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Configuration(String),
}

pub type Result<T> = std::result::Result<T, ProxyError>;
