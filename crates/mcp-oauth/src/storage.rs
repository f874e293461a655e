use crate::types::{ClientRegistration, CredentialFile, Token};
use crate::{OAuthError, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tracing::{debug, info};
use url::Url;

/// Storage partition key derived from the remote server's host
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TargetId(String);

impl TargetId {
    pub fn from_url(url: &Url) -> Result<Self> {
        let host = url.host_str().ok_or_else(|| {
            OAuthError::InvalidConfiguration(format!("URL has no host: {}", url))
        })?;
        // Windows does not accept ':' in file names (IPv6 literals)
        let sanitized = host
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_ascii_lowercase()
            .replace(':', "_");
        Ok(Self(sanitized))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn file_name(&self) -> String {
        format!("{}.json", self.0)
    }
}

impl fmt::Display for TargetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Token lookup and persistence as seen by the HTTP transport
#[async_trait]
pub trait TokenStore: Send + Sync {
    async fn get_token(&self) -> Result<Token>;
    async fn save_token(&self, token: &Token) -> Result<()>;
}

/// File-backed credential store, one JSON file per target
///
/// Reads of a target may run concurrently; a save holds the target's write lock
/// for the whole read-modify-write so concurrent saves never lose each other's
/// fields.
pub struct CredentialStore {
    root: PathBuf,
    locks: Mutex<HashMap<TargetId, Arc<RwLock<()>>>>,
}

impl CredentialStore {
    /// Create a store rooted at `root`. Nothing is created until the first write.
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Handle bound to a single target. Handles for the same target share a lock.
    pub fn target(&self, target: &TargetId) -> TargetStore {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(locks.entry(target.clone()).or_default())
        };
        TargetStore {
            root: self.root.clone(),
            path: self.root.join(target.file_name()),
            target: target.clone(),
            lock,
        }
    }

    pub async fn get_token(&self, target: &TargetId) -> Result<Token> {
        self.target(target).get_token().await
    }

    pub async fn save_token(&self, target: &TargetId, token: &Token) -> Result<()> {
        self.target(target).save_token(token).await
    }

    pub async fn get_client_registration(
        &self,
        target: &TargetId,
    ) -> Result<Option<ClientRegistration>> {
        self.target(target).get_client_registration().await
    }

    pub async fn save_client_registration(
        &self,
        target: &TargetId,
        registration: &ClientRegistration,
    ) -> Result<()> {
        self.target(target)
            .save_client_registration(registration)
            .await
    }
}

/// Credential file of one target
#[derive(Clone)]
pub struct TargetStore {
    root: PathBuf,
    path: PathBuf,
    target: TargetId,
    lock: Arc<RwLock<()>>,
}

impl TargetStore {
    pub fn target(&self) -> &TargetId {
        &self.target
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stored token, or `NoCredentials`/`NoToken` when there is none yet.
    pub async fn get_token(&self) -> Result<Token> {
        let _guard = self.lock.read().await;
        let file = self.read_file().await?.ok_or(OAuthError::NoCredentials)?;
        file.token.ok_or(OAuthError::NoToken)
    }

    pub async fn get_client_registration(&self) -> Result<Option<ClientRegistration>> {
        let _guard = self.lock.read().await;
        Ok(self.read_file().await?.and_then(|file| file.client_info))
    }

    pub async fn save_token(&self, token: &Token) -> Result<()> {
        self.update(|file| file.token = Some(token.clone())).await?;
        info!("Saved token for {}", self.target);
        Ok(())
    }

    pub async fn save_client_registration(&self, registration: &ClientRegistration) -> Result<()> {
        self.update(|file| file.client_info = Some(registration.clone()))
            .await?;
        info!("Saved client registration for {}", self.target);
        Ok(())
    }

    async fn update<F>(&self, apply: F) -> Result<()>
    where
        F: FnOnce(&mut CredentialFile),
    {
        let _guard = self.lock.write().await;
        let mut file = self.read_file().await?.unwrap_or_default();
        apply(&mut file);
        self.write_file(&file).await
    }

    async fn read_file(&self) -> Result<Option<CredentialFile>> {
        let content = match fs::read(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No credential file at {}", self.path.display());
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };
        Ok(Some(serde_json::from_slice(&content)?))
    }

    async fn write_file(&self, file: &CredentialFile) -> Result<()> {
        let mut dir = fs::DirBuilder::new();
        dir.recursive(true);
        #[cfg(unix)]
        dir.mode(0o700);
        dir.create(&self.root).await?;

        let content = serde_json::to_vec_pretty(file)?;
        let tmp_path = self.path.with_extension("json.tmp");

        let mut options = fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        options.mode(0o600);

        let mut tmp = options.open(&tmp_path).await?;
        tmp.write_all(&content).await?;
        tmp.sync_all().await?;
        drop(tmp);

        fs::rename(&tmp_path, &self.path).await?;
        debug!("Wrote credential file {}", self.path.display());
        Ok(())
    }
}

#[async_trait]
impl TokenStore for TargetStore {
    async fn get_token(&self) -> Result<Token> {
        TargetStore::get_token(self).await
    }

    async fn save_token(&self, token: &Token) -> Result<()> {
        TargetStore::save_token(self, token).await
    }
}
