use crate::config::ProxyConfig;
use crate::error::Result;
use crate::retry::{AuthenticatedRemote, FlowAuthorizer};
use crate::stdio_proxy::StdioProxy;
use mcp_client::{HttpTransport, RemoteClient};
use mcp_oauth::{
    CredentialStore, FlowConfig, OAuthConfig, OAuthHandler, SystemBrowser, TargetId,
};
use std::sync::Arc;
use tokio::io::BufReader;
use tracing::{debug, info};

/// Local stdio proxy in front of an OAuth-protected remote MCP server
pub struct McpProxy {
    remote: AuthenticatedRemote<RemoteClient, FlowAuthorizer>,
}

impl McpProxy {
    /// Wire the credential store, OAuth handler and remote client together.
    ///
    /// A client id given on the command line wins over one stored from an
    /// earlier registration.
    pub async fn new(config: &ProxyConfig) -> Result<Self> {
        let target = TargetId::from_url(&config.server_url)?;
        let store = CredentialStore::new(&config.storage_root).target(&target);
        debug!("Credentials for {} at {}", target, store.path().display());

        let (client_id, client_secret) = match &config.client_id {
            Some(id) => (Some(id.clone()), config.client_secret.clone()),
            None => match store.get_client_registration().await? {
                Some(registration) => {
                    info!("Using stored client registration {}", registration.id);
                    (Some(registration.id), Some(registration.secret))
                }
                None => (None, None),
            },
        };

        let handler = Arc::new(OAuthHandler::new(OAuthConfig {
            server_url: config.server_url.clone(),
            client_id,
            client_secret,
            redirect_uri: config.redirect_uri(),
            scopes: config.scopes.clone(),
        }));

        let transport = HttpTransport::new(
            config.server_url.clone(),
            Arc::new(store.clone()),
            handler,
        )
        .with_headers(&config.headers)?;

        let authorizer = FlowAuthorizer::new(
            store,
            Box::new(SystemBrowser),
            FlowConfig {
                callback_port: config.auth_port,
                callback_timeout: config.auth_timeout,
            },
        );

        Ok(Self {
            remote: AuthenticatedRemote::new(RemoteClient::new(transport), authorizer),
        })
    }

    /// Connect to the remote server, then serve stdin/stdout until EOF or Ctrl+C
    pub async fn run(self) -> Result<()> {
        self.remote.start().await?;
        let server = self.remote.initialize().await?;
        let tools = self.remote.list_tools().await?;
        info!(
            "Proxying {} tools from {} {}",
            tools.len(),
            server.server_info.name,
            server.server_info.version
        );

        let proxy = StdioProxy::new(self.remote, server, tools);
        let stdin = BufReader::new(tokio::io::stdin());
        let stdout = tokio::io::stdout();

        tokio::select! {
            result = proxy.serve(stdin, stdout) => result,
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C, shutting down");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mcp_oauth::ClientRegistration;
    use tempfile::TempDir;
    use url::Url;

    fn config(dir: &TempDir) -> ProxyConfig {
        let mut config = ProxyConfig::new(Url::parse("https://mcp.example.com/mcp").unwrap());
        config.storage_root = dir.path().to_path_buf();
        config
    }

    #[tokio::test]
    async fn test_stored_registration_is_loaded() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir);
        let target = TargetId::from_url(&config.server_url).unwrap();
        CredentialStore::new(dir.path())
            .save_client_registration(
                &target,
                &ClientRegistration {
                    id: "abc".to_string(),
                    secret: "xyz".to_string(),
                },
            )
            .await
            .unwrap();

        let proxy = McpProxy::new(&config).await.unwrap();
        let err = proxy.remote.remote().transport().authorization_header().await.unwrap_err();
        let handler = err.authorization_handler().unwrap();

        assert_eq!(handler.client_id().as_deref(), Some("abc"));
        assert_eq!(handler.client_secret().as_deref(), Some("xyz"));
    }

    #[tokio::test]
    async fn test_command_line_client_wins() {
        let dir = TempDir::new().unwrap();
        let mut config = config(&dir);
        config.client_id = Some("cli-id".to_string());

        let proxy = McpProxy::new(&config).await.unwrap();
        let err = proxy.remote.remote().transport().authorization_header().await.unwrap_err();

        assert_eq!(
            err.authorization_handler().unwrap().client_id().as_deref(),
            Some("cli-id")
        );
    }

    #[tokio::test]
    async fn test_invalid_header_rejected() {
        let dir = TempDir::new().unwrap();
        let mut config = config(&dir);
        config.headers.insert("bad header".to_string(), "x".to_string());

        assert!(McpProxy::new(&config).await.is_err());
    }
}
