use crate::error::{ProxyError, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

pub const DEFAULT_AUTH_PORT: u16 = 8080;
pub const DEFAULT_STORAGE_ROOT: &str = "~/.mcp-oauth-proxy";

pub fn default_scopes() -> Vec<String> {
    ["openid", "profile", "email"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

/// Everything needed to assemble a proxy
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub server_url: Url,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub auth_port: u16,
    pub scopes: Vec<String>,
    pub storage_root: PathBuf,
    /// How long to wait for the browser redirect; `None` waits indefinitely
    pub auth_timeout: Option<Duration>,
    /// Extra headers sent with every request to the remote server
    pub headers: HashMap<String, String>,
}

impl ProxyConfig {
    pub fn new(server_url: Url) -> Self {
        Self {
            server_url,
            client_id: None,
            client_secret: None,
            auth_port: DEFAULT_AUTH_PORT,
            scopes: default_scopes(),
            storage_root: expand_storage_root(DEFAULT_STORAGE_ROOT),
            auth_timeout: None,
            headers: HashMap::new(),
        }
    }

    pub fn redirect_uri(&self) -> String {
        format!("http://localhost:{}/oauth/callback", self.auth_port)
    }
}

/// Expand a leading `~` to the home directory
pub fn expand_storage_root(path: &str) -> PathBuf {
    let home = dirs::home_dir();
    match (path.strip_prefix('~'), home) {
        (Some(rest), Some(home)) if rest.is_empty() => home,
        (Some(rest), Some(home)) if rest.starts_with('/') || rest.starts_with('\\') => {
            home.join(&rest[1..])
        }
        _ => Path::new(path).to_path_buf(),
    }
}

/// Parse a `KEY:VALUE` header argument
pub fn parse_header(raw: &str) -> Result<(String, String)> {
    let (key, value) = raw.split_once(':').ok_or_else(|| {
        ProxyError::Configuration(format!("Header must be KEY:VALUE, got '{}'", raw))
    })?;
    let key = key.trim();
    if key.is_empty() {
        return Err(ProxyError::Configuration(format!(
            "Header name is empty in '{}'",
            raw
        )));
    }
    Ok((key.to_string(), value.trim().to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ProxyConfig::new(Url::parse("https://example.com/mcp").unwrap());

        assert_eq!(config.auth_port, 8080);
        assert_eq!(config.scopes, vec!["openid", "profile", "email"]);
        assert_eq!(config.redirect_uri(), "http://localhost:8080/oauth/callback");
        assert!(config.auth_timeout.is_none());
    }

    #[test]
    fn test_expand_storage_root() {
        if let Some(home) = dirs::home_dir() {
            assert_eq!(expand_storage_root("~/.mcp-oauth-proxy"), home.join(".mcp-oauth-proxy"));
            assert_eq!(expand_storage_root("~"), home);
        }
        assert_eq!(expand_storage_root("/var/lib/creds"), PathBuf::from("/var/lib/creds"));
        assert_eq!(expand_storage_root("~other/x"), PathBuf::from("~other/x"));
    }

    #[test]
    fn test_parse_header() {
        assert_eq!(
            parse_header("X-Api-Key: secret:value").unwrap(),
            ("X-Api-Key".to_string(), "secret:value".to_string())
        );
        assert!(parse_header("no-separator").is_err());
        assert!(parse_header(":value").is_err());
    }
}
