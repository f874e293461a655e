//! Transports towards the remote MCP server

pub mod http;
pub mod sse;

pub use http::HttpTransport;
