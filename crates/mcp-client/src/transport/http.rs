use crate::error::{AuthorizationRequired, ClientError, Result};
use crate::transport::sse;
use mcp_oauth::{AuthorizationHandler, TokenStore};
use mcp_types::{JsonRpcNotification, JsonRpcRequest, JsonRpcResponse};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Client, Response, StatusCode};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, info, warn};
use url::Url;

const SESSION_ID_HEADER: &str = "mcp-session-id";
const PROTOCOL_VERSION_HEADER: &str = "mcp-protocol-version";

/// Streamable HTTP transport with bearer authentication
///
/// Every request carries the token currently held by the store. A missing
/// token or a 401 answer surfaces as [`ClientError::AuthorizationRequired`]
/// carrying the handler able to obtain a new one.
pub struct HttpTransport {
    client: Client,
    endpoint: Url,
    headers: HeaderMap,
    token_store: Arc<dyn TokenStore>,
    handler: Arc<dyn AuthorizationHandler>,
    session_id: RwLock<Option<String>>,
    protocol_version: RwLock<Option<String>>,
    next_id: AtomicI64,
}

impl HttpTransport {
    pub fn new(
        endpoint: Url,
        token_store: Arc<dyn TokenStore>,
        handler: Arc<dyn AuthorizationHandler>,
    ) -> Self {
        Self {
            client: Client::new(),
            endpoint,
            headers: HeaderMap::new(),
            token_store,
            handler,
            session_id: RwLock::new(None),
            protocol_version: RwLock::new(None),
            next_id: AtomicI64::new(1),
        }
    }

    /// Add headers sent with every request
    pub fn with_headers(mut self, headers: &HashMap<String, String>) -> Result<Self> {
        for (key, value) in headers {
            let name = HeaderName::from_str(key).map_err(|e| {
                ClientError::InvalidHeader(format!("Invalid header name '{}': {}", key, e))
            })?;
            let value = HeaderValue::from_str(value).map_err(|e| {
                ClientError::InvalidHeader(format!("Invalid header value for '{}': {}", key, e))
            })?;
            self.headers.insert(name, value);
        }
        Ok(self)
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    pub fn session_id(&self) -> Option<String> {
        self.session_id
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Sent as `MCP-Protocol-Version` on every request after initialization.
    pub fn set_protocol_version(&self, version: impl Into<String>) {
        *self
            .protocol_version
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(version.into());
    }

    fn authorization_required(&self) -> ClientError {
        ClientError::AuthorizationRequired(AuthorizationRequired::new(Arc::clone(&self.handler)))
    }

    /// `Authorization` header value built from the stored token
    pub async fn authorization_header(&self) -> Result<String> {
        match self.token_store.get_token().await {
            Ok(token) => Ok(token.authorization_header()),
            Err(e) if e.is_not_found() => {
                info!("No stored token for {}", self.endpoint);
                Err(self.authorization_required())
            }
            Err(e) => Err(ClientError::Storage(e)),
        }
    }

    /// Send a request and wait for its result
    pub async fn request(&self, method: &str, params: Option<Value>) -> Result<Value> {
        let id = json!(self.next_id.fetch_add(1, Ordering::SeqCst));
        let request = JsonRpcRequest::new(id.clone(), method, params);
        debug!("Sending request {} ({})", method, id);

        let response = self.post(&serde_json::to_value(&request)?).await?;
        if response.status() == StatusCode::ACCEPTED {
            return Err(ClientError::protocol(format!(
                "Server accepted {} without a response",
                method
            )));
        }

        let is_event_stream = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.starts_with("text/event-stream"))
            .unwrap_or(false);

        let message = if is_event_stream {
            sse::read_response(response, &id).await?
        } else {
            response.json::<Value>().await?
        };

        let response: JsonRpcResponse = serde_json::from_value(message)?;
        if let Some(error) = response.error {
            warn!("{} failed: {} ({})", method, error.message, error.code);
            return Err(ClientError::Rpc {
                code: error.code,
                message: error.message,
            });
        }
        Ok(response.result.unwrap_or(Value::Null))
    }

    /// Send a notification; the server owes us no response
    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        let notification = JsonRpcNotification::new(method, params);
        debug!("Sending notification {}", method);
        self.post(&serde_json::to_value(&notification)?).await?;
        Ok(())
    }

    async fn post(&self, body: &Value) -> Result<Response> {
        let mut headers = self.headers.clone();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(
            ACCEPT,
            HeaderValue::from_static("application/json, text/event-stream"),
        );
        headers.insert(AUTHORIZATION, header_value(&self.authorization_header().await?)?);
        if let Some(session_id) = self.session_id() {
            headers.insert(SESSION_ID_HEADER, header_value(&session_id)?);
        }
        let protocol_version = self
            .protocol_version
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(version) = protocol_version {
            headers.insert(PROTOCOL_VERSION_HEADER, header_value(&version)?);
        }

        let response = self
            .client
            .post(self.endpoint.clone())
            .headers(headers)
            .json(body)
            .send()
            .await?;

        if let Some(session_id) = response
            .headers()
            .get(SESSION_ID_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            debug!("Session id: {}", session_id);
            *self
                .session_id
                .write()
                .unwrap_or_else(PoisonError::into_inner) = Some(session_id.to_string());
        }

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            info!("Server at {} requires authorization", self.endpoint);
            return Err(self.authorization_required());
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ClientError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }
}

fn header_value(value: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(value).map_err(|e| ClientError::InvalidHeader(e.to_string()))
}
