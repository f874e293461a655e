//! Remote MCP client
//!
//! Covers the four operations the proxy needs: authorization check,
//! initialization, tool listing and tool invocation.

use crate::error::{ClientError, Result};
use crate::transport::HttpTransport;
use async_trait::async_trait;
use mcp_types::{
    CallToolRequestParam, CallToolResult, ClientInfo, Implementation, InitializeResult,
    ListToolsResult, Tool,
};
use serde_json::{json, Value};
use std::collections::HashSet;
use tracing::{debug, info, warn};

/// Operations the proxy performs against the remote server
#[async_trait]
pub trait RemoteService: Send + Sync {
    /// Check that credentials are available before talking to the server.
    async fn start(&self) -> Result<()>;

    async fn initialize(&self) -> Result<InitializeResult>;

    /// All tools, following pagination cursors.
    async fn list_tools(&self) -> Result<Vec<Tool>>;

    async fn call_tool(&self, params: CallToolRequestParam) -> Result<CallToolResult>;
}

pub struct RemoteClient {
    transport: HttpTransport,
    client_info: ClientInfo,
}

impl RemoteClient {
    pub fn new(transport: HttpTransport) -> Self {
        let client_info = ClientInfo {
            client_info: Implementation {
                name: "mcp-oauth-proxy".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                ..Default::default()
            },
            ..Default::default()
        };
        Self {
            transport,
            client_info,
        }
    }

    pub fn transport(&self) -> &HttpTransport {
        &self.transport
    }
}

#[async_trait]
impl RemoteService for RemoteClient {
    async fn start(&self) -> Result<()> {
        info!("Connecting to MCP server: {}", self.transport.endpoint());
        self.transport.authorization_header().await?;
        Ok(())
    }

    async fn initialize(&self) -> Result<InitializeResult> {
        info!("Initializing MCP connection");
        let params = serde_json::to_value(&self.client_info)?;
        let result = self.transport.request("initialize", Some(params)).await?;
        let result: InitializeResult = serde_json::from_value(result)?;

        if let Value::String(version) = serde_json::to_value(&result.protocol_version)? {
            self.transport.set_protocol_version(version);
        }
        self.transport
            .notify("notifications/initialized", None)
            .await?;

        info!(
            "Connected to {} {}",
            result.server_info.name, result.server_info.version
        );
        Ok(result)
    }

    async fn list_tools(&self) -> Result<Vec<Tool>> {
        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;
        let mut seen = HashSet::new();

        loop {
            let params = cursor.as_ref().map(|c| json!({ "cursor": c }));
            let page: ListToolsResult =
                serde_json::from_value(self.transport.request("tools/list", params).await?)?;
            tools.extend(page.tools);

            match page.next_cursor {
                Some(next) if seen.insert(next.clone()) => cursor = Some(next),
                Some(next) => {
                    warn!("Server repeated tools/list cursor {}, stopping", next);
                    break;
                }
                None => break,
            }
        }

        info!("Retrieved {} tools from server", tools.len());
        Ok(tools)
    }

    async fn call_tool(&self, params: CallToolRequestParam) -> Result<CallToolResult> {
        info!("Calling tool: {}", params.name);
        debug!("Tool call request: {:?}", params);

        let result = self
            .transport
            .request("tools/call", Some(serde_json::to_value(&params)?))
            .await?;
        let result: CallToolResult = serde_json::from_value(result)
            .map_err(|e| ClientError::protocol(format!("Invalid tools/call result: {}", e)))?;

        if result.is_error == Some(true) {
            warn!("Tool {} reported an error", params.name);
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::http::tests::{handler, MemoryTokenStore};
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use url::Url;
    use warp::Filter;

    fn spawn_server(calls: Arc<AtomicUsize>) -> SocketAddr {
        let route = warp::post()
            .and(warp::path("mcp"))
            .and(warp::body::json())
            .map(move |body: Value| {
                calls.fetch_add(1, Ordering::SeqCst);
                let id = body["id"].clone();
                let result = match body["method"].as_str() {
                    Some("initialize") => json!({
                        "protocolVersion": "2025-03-26",
                        "capabilities": {"tools": {}},
                        "serverInfo": {"name": "remote", "version": "1.2.3"},
                        "instructions": "be nice"
                    }),
                    Some("tools/list") => match body["params"]["cursor"].as_str() {
                        None => json!({
                            "tools": [{"name": "echo", "inputSchema": {"type": "object"}}],
                            "nextCursor": "page2"
                        }),
                        Some("page2") => json!({
                            "tools": [{"name": "add", "inputSchema": {"type": "object"}}],
                            "nextCursor": "page2"
                        }),
                        Some(_) => json!({"tools": []}),
                    },
                    Some("tools/call") => json!({
                        "content": [{
                            "type": "text",
                            "text": format!("called {}", body["params"]["name"].as_str().unwrap_or_default())
                        }],
                        "isError": false
                    }),
                    _ => {
                        return warp::reply::with_status(
                            warp::reply::json(&json!({})),
                            warp::http::StatusCode::ACCEPTED,
                        )
                    }
                };
                warp::reply::with_status(
                    warp::reply::json(&json!({"jsonrpc": "2.0", "id": id, "result": result})),
                    warp::http::StatusCode::OK,
                )
            });
        let (addr, server) = warp::serve(route).bind_ephemeral(([127, 0, 0, 1], 0));
        tokio::spawn(server);
        addr
    }

    fn client(addr: SocketAddr, store: MemoryTokenStore) -> RemoteClient {
        let endpoint = Url::parse(&format!("http://{}/mcp", addr)).unwrap();
        RemoteClient::new(HttpTransport::new(endpoint, Arc::new(store), handler(addr)))
    }

    #[tokio::test]
    async fn test_start_without_token_requires_authorization() {
        let calls = Arc::new(AtomicUsize::new(0));
        let addr = spawn_server(calls.clone());
        let client = client(addr, MemoryTokenStore::default());

        assert!(matches!(
            client.start().await,
            Err(ClientError::AuthorizationRequired(_))
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_initialize_sets_protocol_version() {
        let calls = Arc::new(AtomicUsize::new(0));
        let addr = spawn_server(calls.clone());
        let client = client(addr, MemoryTokenStore::with_token("tok"));

        client.start().await.unwrap();
        let result = client.initialize().await.unwrap();

        assert_eq!(result.server_info.name, "remote");
        assert_eq!(result.instructions.as_deref(), Some("be nice"));
        // initialize + notifications/initialized
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_list_tools_follows_cursor_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let addr = spawn_server(calls);
        let client = client(addr, MemoryTokenStore::with_token("tok"));

        let tools = client.list_tools().await.unwrap();
        let names: Vec<_> = tools.iter().map(|t| t.name.to_string()).collect();

        assert_eq!(names, vec!["echo", "add"]);
    }

    #[tokio::test]
    async fn test_call_tool() {
        let calls = Arc::new(AtomicUsize::new(0));
        let addr = spawn_server(calls);
        let client = client(addr, MemoryTokenStore::with_token("tok"));

        let result = client
            .call_tool(CallToolRequestParam {
                name: "echo".into(),
                arguments: None,
            })
            .await
            .unwrap();

        assert_eq!(result.is_error, Some(false));
        let text = serde_json::to_value(&result.content).unwrap();
        assert_eq!(text[0]["text"], "called echo");
    }
}
