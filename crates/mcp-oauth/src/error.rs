pub type Result<T> = std::result::Result<T, OAuthError>;

#[derive(Debug, thiserror::Error)]
pub enum OAuthError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON serialization/deserialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("URL parsing error: {0}")]
    Url(#[from] url::ParseError),

    #[error("OAuth2 client error: {0}")]
    OAuth2(String),

    #[error("No stored credentials")]
    NoCredentials,

    #[error("No stored token")]
    NoToken,

    #[error("Server metadata discovery failed: {0}")]
    Discovery(String),

    #[error("Dynamic client registration failed: {0}")]
    ClientRegistration(String),

    #[error("Callback server error: {0}")]
    CallbackServer(String),

    #[error("State mismatch: expected {expected}, got {received}")]
    StateMismatch { expected: String, received: String },

    #[error("Missing required parameter: {0}")]
    MissingParameter(String),

    #[error("Authorization denied: {0}")]
    AuthorizationDenied(String),

    #[error("Token exchange failed: {0}")]
    TokenExchange(String),

    #[error("Authentication timeout")]
    AuthTimeout,

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),
}

impl OAuthError {
    /// True for the two "nothing stored yet" outcomes of a token lookup.
    pub fn is_not_found(&self) -> bool {
        matches!(self, OAuthError::NoCredentials | OAuthError::NoToken)
    }
}
