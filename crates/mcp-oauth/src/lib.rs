//! OAuth 2.0 support for the MCP proxy
//!
//! Credential persistence, PKCE, the local callback listener and the
//! interactive Authorization Code flow run when the remote server rejects us.

pub mod browser;
pub mod callback_server;
pub mod client_registration;
pub mod error;
pub mod flow;
pub mod handler;
pub mod pkce;
pub mod storage;
pub mod types;

pub use browser::{Browser, SystemBrowser};
pub use error::{OAuthError, Result};
pub use flow::{AuthorizationFlow, FlowConfig, FlowState, CLIENT_NAME};
pub use handler::{AuthorizationHandler, OAuthConfig, OAuthHandler};
pub use storage::{CredentialStore, TargetId, TargetStore, TokenStore};
pub use types::*;
