use clap::Parser;
use mcp_proxy::{expand_storage_root, parse_header, McpProxy, ProxyConfig};
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use url::Url;

#[derive(Parser)]
#[command(
    name = "mcp-oauth-proxy",
    about = "Bridge a local stdio MCP client to a remote OAuth-protected MCP server",
    version = env!("CARGO_PKG_VERSION")
)]
struct Args {
    /// Remote MCP server URL
    #[arg(value_name = "URL")]
    server_url: String,

    /// OAuth client id (skips dynamic registration)
    #[arg(long)]
    client_id: Option<String>,

    /// OAuth client secret
    #[arg(long, requires = "client_id")]
    client_secret: Option<String>,

    /// Port of the local OAuth callback listener
    #[arg(long, default_value_t = mcp_proxy::config::DEFAULT_AUTH_PORT)]
    auth_port: u16,

    /// OAuth scopes to request
    #[arg(long, value_delimiter = ',', default_value = "openid,profile,email")]
    scopes: Vec<String>,

    /// Directory holding stored credentials
    #[arg(long, default_value = mcp_proxy::config::DEFAULT_STORAGE_ROOT)]
    data_path: String,

    /// Give up waiting for browser authorization after this many seconds
    #[arg(long, value_name = "SECONDS")]
    auth_timeout: Option<u64>,

    /// Allow HTTP connections (default is HTTPS only)
    #[arg(long)]
    allow_http: bool,

    /// Enable debug logging
    #[arg(long, short)]
    debug: bool,

    /// Custom HTTP headers (format: key:value)
    #[arg(long = "header", value_name = "KEY:VALUE")]
    headers: Vec<String>,
}

impl Args {
    fn into_config(self) -> anyhow::Result<ProxyConfig> {
        let server_url = validate_server_url(&self.server_url, self.allow_http)?;

        let mut config = ProxyConfig::new(server_url);
        config.client_id = self.client_id;
        config.client_secret = self.client_secret;
        config.auth_port = self.auth_port;
        config.scopes = self
            .scopes
            .into_iter()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        config.storage_root = expand_storage_root(&self.data_path);
        config.auth_timeout = self.auth_timeout.map(Duration::from_secs);
        for raw in &self.headers {
            let (key, value) = parse_header(raw)?;
            config.headers.insert(key, value);
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // stdout carries the protocol, so logs go to stderr
    let default_level = if args.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_target(false)
        .init();

    let config = args.into_config()?;

    info!("MCP OAuth proxy starting");
    info!("Server URL: {}", config.server_url);
    info!("Credential storage: {}", config.storage_root.display());
    if !config.headers.is_empty() {
        info!("Custom headers: {:?}", config.headers.keys().collect::<Vec<_>>());
    }

    let proxy = McpProxy::new(&config).await?;
    if let Err(e) = proxy.run().await {
        error!("Proxy error: {}", e);
        return Err(anyhow::anyhow!("Proxy failed: {}", e));
    }

    info!("MCP OAuth proxy stopped");
    Ok(())
}

fn validate_server_url(url: &str, allow_http: bool) -> anyhow::Result<Url> {
    let parsed = Url::parse(url).map_err(|e| anyhow::anyhow!("Invalid URL '{}': {}", url, e))?;

    match parsed.scheme() {
        "https" => {}
        "http" if allow_http => {}
        "http" => anyhow::bail!(
            "HTTP URLs are not allowed by default. Use --allow-http flag for trusted networks."
        ),
        scheme => anyhow::bail!("Unsupported URL scheme '{}'. Use http:// or https://", scheme),
    }
    if parsed.host_str().is_none() {
        anyhow::bail!("URL '{}' has no host", url);
    }
    Ok(parsed)
}
