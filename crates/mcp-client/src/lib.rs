//! MCP Client - authenticated streamable HTTP client for remote MCP servers
//!
//! Failures caused by missing or rejected credentials are reported as
//! [`ClientError::AuthorizationRequired`], which carries the OAuth handler
//! needed to recover.

pub mod client;
pub mod error;
pub mod transport;

pub use client::{RemoteClient, RemoteService};
pub use error::{AuthorizationRequired, ClientError, Result};
pub use transport::HttpTransport;
