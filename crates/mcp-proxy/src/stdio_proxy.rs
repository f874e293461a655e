//! JSON-RPC over STDIO towards the local MCP client
//!
//! Requests are handled one at a time in arrival order; each produces exactly
//! one response line. Notifications are consumed silently.

use crate::error::Result;
use crate::retry::{AuthenticatedRemote, Authorizer};
use mcp_client::RemoteService;
use mcp_types::{
    CallToolRequestParam, InitializeResult, JsonRpcError, JsonRpcResponse, Tool,
};
use serde_json::{json, Value};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};

pub struct StdioProxy<S, A> {
    remote: AuthenticatedRemote<S, A>,
    server: InitializeResult,
    tools: Vec<Tool>,
}

impl<S: RemoteService, A: Authorizer> StdioProxy<S, A> {
    /// `server` and `tools` are what the remote reported at startup.
    pub fn new(remote: AuthenticatedRemote<S, A>, server: InitializeResult, tools: Vec<Tool>) -> Self {
        Self {
            remote,
            server,
            tools,
        }
    }

    /// Serve line-delimited JSON-RPC until `reader` reaches EOF
    pub async fn serve<R, W>(&self, reader: R, mut writer: W) -> Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        info!("STDIO proxy ready - listening for MCP requests");
        let mut lines = reader.lines();

        while let Some(line) = lines.next_line().await? {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            debug!("Received: {}", line);

            let response = match serde_json::from_str::<Value>(line) {
                Ok(message) => self.handle_message(message).await,
                Err(e) => {
                    warn!("Failed to parse JSON-RPC message: {}", e);
                    Some(JsonRpcResponse::failure(
                        Value::Null,
                        JsonRpcError::parse_error(format!("Invalid JSON: {}", e)),
                    ))
                }
            };

            if let Some(response) = response {
                let mut out = serde_json::to_vec(&response)?;
                out.push(b'\n');
                writer.write_all(&out).await?;
                writer.flush().await?;
            }
        }

        info!("End of input - shutting down proxy");
        Ok(())
    }

    /// Answer one message; `None` for notifications
    pub async fn handle_message(&self, message: Value) -> Option<JsonRpcResponse> {
        let Some(object) = message.as_object() else {
            return Some(JsonRpcResponse::failure(
                Value::Null,
                JsonRpcError::invalid_request("Message must be a JSON object"),
            ));
        };

        let method = object.get("method").and_then(Value::as_str);
        let Some(id) = object.get("id").cloned() else {
            debug!("Notification: {}", method.unwrap_or("<none>"));
            return None;
        };
        let params = object.get("params");

        let outcome = match method {
            Some("initialize") => Ok(self.initialize_result(params)),
            Some("ping") => Ok(json!({})),
            Some("tools/list") => Ok(json!({ "tools": self.tools })),
            Some("tools/call") => self.call_tool(params).await,
            Some(other) => {
                warn!("Unknown method: {}", other);
                Err(JsonRpcError::method_not_found(other))
            }
            None => Err(JsonRpcError::invalid_request("Missing method field")),
        };

        Some(match outcome {
            Ok(result) => JsonRpcResponse::success(id, result),
            Err(error) => JsonRpcResponse::failure(id, error),
        })
    }

    fn initialize_result(&self, params: Option<&Value>) -> Value {
        let remote_version =
            serde_json::to_value(&self.server.protocol_version).unwrap_or(Value::Null);
        let protocol_version = params
            .and_then(|p| p.get("protocolVersion"))
            .cloned()
            .unwrap_or(remote_version);

        let mut result = json!({
            "protocolVersion": protocol_version,
            "capabilities": { "tools": { "listChanged": false } },
            "serverInfo": {
                "name": self.server.server_info.name,
                "version": self.server.server_info.version,
            },
        });
        if let Some(instructions) = &self.server.instructions {
            result["instructions"] = json!(instructions);
        }
        result
    }

    async fn call_tool(&self, params: Option<&Value>) -> std::result::Result<Value, JsonRpcError> {
        let params: CallToolRequestParam = params
            .cloned()
            .ok_or_else(|| "missing params".to_string())
            .and_then(|p| serde_json::from_value(p).map_err(|e| e.to_string()))
            .map_err(|e| JsonRpcError::invalid_params(format!("Invalid tools/call params: {}", e)))?;

        match self.remote.call_tool(params).await {
            Ok(result) => serde_json::to_value(result)
                .map_err(|e| JsonRpcError::internal(e.to_string())),
            Err(e) => {
                warn!("Tool call failed: {}", e);
                Err(JsonRpcError::internal(e.to_string()))
            }
        }
    }
}
