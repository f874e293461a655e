//! Authorization-retry around remote calls
//!
//! A remote call rejected for lack of authorization triggers one interactive
//! OAuth flow and is then replayed exactly once.

use crate::error::Result;
use async_trait::async_trait;
use mcp_client::{ClientError, RemoteService};
use mcp_oauth::{
    AuthorizationFlow, AuthorizationHandler, Browser, FlowConfig, OAuthError, TargetStore,
};
use mcp_types::{CallToolRequestParam, CallToolResult, InitializeResult, Tool};
use std::future::Future;
use std::sync::Arc;
use tracing::{info, warn};

/// Obtains and persists a new token
#[async_trait]
pub trait Authorizer: Send + Sync {
    async fn authorize(
        &self,
        handler: Arc<dyn AuthorizationHandler>,
    ) -> std::result::Result<(), OAuthError>;
}

/// Runs the interactive flow and stores the resulting token
pub struct FlowAuthorizer {
    store: TargetStore,
    browser: Box<dyn Browser>,
    flow_config: FlowConfig,
}

impl FlowAuthorizer {
    pub fn new(store: TargetStore, browser: Box<dyn Browser>, flow_config: FlowConfig) -> Self {
        Self {
            store,
            browser,
            flow_config,
        }
    }
}

#[async_trait]
impl Authorizer for FlowAuthorizer {
    async fn authorize(
        &self,
        handler: Arc<dyn AuthorizationHandler>,
    ) -> std::result::Result<(), OAuthError> {
        let mut flow = AuthorizationFlow::new(&self.store, self.browser.as_ref(), &self.flow_config);
        let token = flow.run(handler.as_ref()).await?;
        self.store.save_token(&token).await
    }
}

pub struct AuthRetry<A> {
    authorizer: A,
}

impl<A: Authorizer> AuthRetry<A> {
    pub fn new(authorizer: A) -> Self {
        Self { authorizer }
    }

    /// Run `op`, authorizing and retrying once if it needs authorization.
    ///
    /// Only [`ClientError::AuthorizationRequired`] triggers the flow. A failed
    /// flow ends the operation with that failure, and the retried attempt's
    /// outcome is final.
    pub async fn run<T, F, Fut>(&self, operation: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = mcp_client::Result<T>>,
    {
        let required = match op().await {
            Err(ClientError::AuthorizationRequired(required)) => required,
            other => return Ok(other?),
        };

        info!("{} requires authorization, starting OAuth flow", operation);
        if let Err(e) = self.authorizer.authorize(required.handler()).await {
            warn!("Authorization for {} failed: {}", operation, e);
            return Err(e.into());
        }

        info!("Authorization complete, retrying {}", operation);
        Ok(op().await?)
    }
}

/// Remote service whose operations all go through [`AuthRetry`]
pub struct AuthenticatedRemote<S, A> {
    remote: S,
    retry: AuthRetry<A>,
}

impl<S: RemoteService, A: Authorizer> AuthenticatedRemote<S, A> {
    pub fn new(remote: S, authorizer: A) -> Self {
        Self {
            remote,
            retry: AuthRetry::new(authorizer),
        }
    }

    pub fn remote(&self) -> &S {
        &self.remote
    }

    pub async fn start(&self) -> Result<()> {
        let remote = &self.remote;
        self.retry.run("start", move || remote.start()).await
    }

    pub async fn initialize(&self) -> Result<InitializeResult> {
        let remote = &self.remote;
        self.retry.run("initialize", move || remote.initialize()).await
    }

    pub async fn list_tools(&self) -> Result<Vec<Tool>> {
        let remote = &self.remote;
        self.retry.run("tools/list", move || remote.list_tools()).await
    }

    pub async fn call_tool(&self, params: CallToolRequestParam) -> Result<CallToolResult> {
        let remote = &self.remote;
        self.retry
            .run("tools/call", move || remote.call_tool(params.clone()))
            .await
    }
}
