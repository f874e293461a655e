use crate::client_registration::{discover_server_metadata, register_client};
use crate::pkce;
use crate::types::{ClientRegistration, OAuthServerMetadata, Token};
use crate::{OAuthError, Result};
use async_trait::async_trait;
use chrono::Utc;
use oauth2::basic::BasicClient;
use oauth2::reqwest::async_http_client;
use oauth2::{
    AuthType, AuthUrl, AuthorizationCode, ClientId, ClientSecret, PkceCodeVerifier, RedirectUrl,
    TokenResponse, TokenUrl,
};
use reqwest::Client;
use std::sync::{Mutex, PoisonError, RwLock};
use tokio::sync::OnceCell;
use tracing::{debug, info};
use url::Url;

/// OAuth operations needed to complete an interactive authorization
///
/// A transport that gets rejected hands one of these to its caller inside the
/// authorization-required error, so the caller can run the flow without knowing
/// how the transport was configured.
#[async_trait]
pub trait AuthorizationHandler: Send + Sync {
    /// Client id in use, `None` until a client is registered or configured.
    fn client_id(&self) -> Option<String>;

    fn client_secret(&self) -> Option<String>;

    /// Install previously obtained credentials so registration is skipped.
    fn set_client_credentials(&self, registration: &ClientRegistration);

    /// Register a new client and start using it.
    async fn register_client(&self, client_name: &str) -> Result<ClientRegistration>;

    async fn authorization_url(&self, state: &str, code_challenge: &str) -> Result<String>;

    async fn process_authorization_response(
        &self,
        code: &str,
        state: &str,
        code_verifier: &str,
    ) -> Result<Token>;

    fn generate_code_verifier(&self) -> String {
        pkce::generate_code_verifier()
    }

    fn generate_code_challenge(&self, code_verifier: &str) -> String {
        pkce::generate_code_challenge(code_verifier)
    }

    fn generate_state(&self) -> String {
        pkce::generate_state()
    }
}

#[derive(Debug, Clone)]
pub struct OAuthConfig {
    pub server_url: Url,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub redirect_uri: String,
    pub scopes: Vec<String>,
}

/// Authorization handler talking to a real OAuth 2.0 server
pub struct OAuthHandler {
    config: OAuthConfig,
    http_client: Client,
    credentials: RwLock<ClientRegistration>,
    metadata: OnceCell<OAuthServerMetadata>,
    expected_state: Mutex<Option<String>>,
}

impl OAuthHandler {
    pub fn new(config: OAuthConfig) -> Self {
        let credentials = ClientRegistration {
            id: config.client_id.clone().unwrap_or_default(),
            secret: config.client_secret.clone().unwrap_or_default(),
        };
        Self {
            config,
            http_client: Client::new(),
            credentials: RwLock::new(credentials),
            metadata: OnceCell::new(),
            expected_state: Mutex::new(None),
        }
    }

    /// Server metadata, discovered on first use and cached afterwards
    pub async fn server_metadata(&self) -> Result<&OAuthServerMetadata> {
        self.metadata
            .get_or_try_init(|| discover_server_metadata(&self.http_client, &self.config.server_url))
            .await
    }

    fn credentials(&self) -> ClientRegistration {
        self.credentials
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn check_state(&self, received: &str) -> Result<()> {
        let expected = self
            .expected_state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| {
                OAuthError::InvalidConfiguration("No authorization request in progress".to_string())
            })?;

        if expected != received {
            return Err(OAuthError::StateMismatch {
                expected,
                received: received.to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl AuthorizationHandler for OAuthHandler {
    fn client_id(&self) -> Option<String> {
        let id = self.credentials().id;
        (!id.is_empty()).then_some(id)
    }

    fn client_secret(&self) -> Option<String> {
        let secret = self.credentials().secret;
        (!secret.is_empty()).then_some(secret)
    }

    fn set_client_credentials(&self, registration: &ClientRegistration) {
        debug!("Using client id {}", registration.id);
        *self
            .credentials
            .write()
            .unwrap_or_else(PoisonError::into_inner) = registration.clone();
    }

    async fn register_client(&self, client_name: &str) -> Result<ClientRegistration> {
        let metadata = self.server_metadata().await?;
        let response = register_client(
            &self.http_client,
            metadata,
            client_name,
            &self.config.redirect_uri,
            &self.config.scopes,
        )
        .await?;

        let registration = ClientRegistration {
            id: response.client_id,
            secret: response.client_secret.unwrap_or_default(),
        };
        self.set_client_credentials(&registration);
        Ok(registration)
    }

    async fn authorization_url(&self, state: &str, code_challenge: &str) -> Result<String> {
        let client_id = self.client_id().ok_or_else(|| {
            OAuthError::InvalidConfiguration("No client id available".to_string())
        })?;
        let metadata = self.server_metadata().await?;

        let mut url = Url::parse(&metadata.authorization_endpoint)?;
        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("response_type", "code")
                .append_pair("client_id", &client_id)
                .append_pair("redirect_uri", &self.config.redirect_uri)
                .append_pair("code_challenge", code_challenge)
                .append_pair("code_challenge_method", pkce::CODE_CHALLENGE_METHOD)
                .append_pair("state", state);
            if !self.config.scopes.is_empty() {
                query.append_pair("scope", &self.config.scopes.join(" "));
            }
        }

        *self
            .expected_state
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(state.to_string());

        Ok(url.into())
    }

    async fn process_authorization_response(
        &self,
        code: &str,
        state: &str,
        code_verifier: &str,
    ) -> Result<Token> {
        self.check_state(state)?;

        let credentials = self.credentials();
        let metadata = self.server_metadata().await?;

        let auth_url = AuthUrl::new(metadata.authorization_endpoint.clone())
            .map_err(|e| OAuthError::OAuth2(format!("Invalid authorization endpoint: {}", e)))?;
        let token_url = TokenUrl::new(metadata.token_endpoint.clone())
            .map_err(|e| OAuthError::OAuth2(format!("Invalid token endpoint: {}", e)))?;
        let redirect_url = RedirectUrl::new(self.config.redirect_uri.clone())
            .map_err(|e| OAuthError::OAuth2(format!("Invalid redirect URI: {}", e)))?;
        let client_secret =
            (!credentials.secret.is_empty()).then(|| ClientSecret::new(credentials.secret.clone()));

        let client = BasicClient::new(
            ClientId::new(credentials.id.clone()),
            client_secret,
            auth_url,
            Some(token_url),
        )
        .set_auth_type(AuthType::RequestBody)
        .set_redirect_uri(redirect_url);

        info!("Exchanging authorization code for access token");
        let response = client
            .exchange_code(AuthorizationCode::new(code.to_string()))
            .set_pkce_verifier(PkceCodeVerifier::new(code_verifier.to_string()))
            .request_async(async_http_client)
            .await
            .map_err(|e| OAuthError::TokenExchange(e.to_string()))?;

        let expires_in = response.expires_in().map(|d| d.as_secs());
        let token = Token {
            access_token: response.access_token().secret().clone(),
            token_type: AsRef::<str>::as_ref(response.token_type()).to_string(),
            refresh_token: response.refresh_token().map(|t| t.secret().clone()),
            expires_in,
            scope: response.scopes().map(|scopes| {
                scopes
                    .iter()
                    .map(|s| s.as_str())
                    .collect::<Vec<_>>()
                    .join(" ")
            }),
            expires_at: expires_in.map(|secs| Utc::now() + chrono::Duration::seconds(secs as i64)),
        };

        info!("Obtained access token");
        Ok(token)
    }
}
