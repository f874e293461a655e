//! MCP Proxy - stdio front end for an OAuth-protected remote MCP server

pub mod config;
pub mod error;
pub mod proxy;
pub mod retry;
pub mod stdio_proxy;

pub use config::{expand_storage_root, parse_header, ProxyConfig};
pub use error::{ProxyError, Result};
pub use proxy::McpProxy;
pub use retry::{AuthRetry, AuthenticatedRemote, Authorizer, FlowAuthorizer};
pub use stdio_proxy::StdioProxy;
