use crate::browser::Browser;
use crate::callback_server::CallbackServer;
use crate::handler::AuthorizationHandler;
use crate::storage::TargetStore;
use crate::types::{CallbackParams, Token};
use crate::{OAuthError, Result};
use std::fmt;
use std::io::Write;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Client name sent with dynamic registration
pub const CLIENT_NAME: &str = "mcp-oauth-proxy";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowState {
    Idle,
    AwaitingClientRegistration,
    AwaitingUserConsent,
    AwaitingCallback,
    ExchangingCode,
    Complete,
    Failed,
}

impl fmt::Display for FlowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FlowState::Idle => "idle",
            FlowState::AwaitingClientRegistration => "awaiting client registration",
            FlowState::AwaitingUserConsent => "awaiting user consent",
            FlowState::AwaitingCallback => "awaiting callback",
            FlowState::ExchangingCode => "exchanging code",
            FlowState::Complete => "complete",
            FlowState::Failed => "failed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone)]
pub struct FlowConfig {
    /// Port of the local callback listener
    pub callback_port: u16,
    /// Maximum wait for the browser redirect; `None` waits indefinitely
    pub callback_timeout: Option<Duration>,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            callback_port: 8080,
            callback_timeout: None,
        }
    }
}

/// One interactive Authorization Code + PKCE exchange
///
/// The flow persists the client registration it creates but not the token; the
/// caller decides what to do with the returned token. It never retries itself:
/// the first failing step moves it to [`FlowState::Failed`].
pub struct AuthorizationFlow<'a> {
    store: &'a TargetStore,
    browser: &'a dyn Browser,
    config: &'a FlowConfig,
    prompt: Box<dyn Write + Send + Sync + 'a>,
    state: FlowState,
}

impl<'a> AuthorizationFlow<'a> {
    pub fn new(store: &'a TargetStore, browser: &'a dyn Browser, config: &'a FlowConfig) -> Self {
        Self {
            store,
            browser,
            config,
            prompt: Box::new(std::io::stderr()),
            state: FlowState::Idle,
        }
    }

    /// Write the manual authorization prompt to `out` instead of stderr.
    pub fn with_prompt(mut self, out: impl Write + Send + Sync + 'a) -> Self {
        self.prompt = Box::new(out);
        self
    }

    pub fn state(&self) -> FlowState {
        self.state
    }

    pub async fn run(&mut self, handler: &dyn AuthorizationHandler) -> Result<Token> {
        info!("Starting OAuth authorization for {}", self.store.target());
        match self.execute(handler).await {
            Ok(token) => {
                self.transition(FlowState::Complete);
                Ok(token)
            }
            Err(e) => {
                warn!("OAuth authorization failed: {}", e);
                self.transition(FlowState::Failed);
                Err(e)
            }
        }
    }

    async fn execute(&mut self, handler: &dyn AuthorizationHandler) -> Result<Token> {
        self.transition(FlowState::AwaitingClientRegistration);
        self.ensure_client(handler).await?;

        self.transition(FlowState::AwaitingUserConsent);
        let code_verifier = handler.generate_code_verifier();
        let code_challenge = handler.generate_code_challenge(&code_verifier);
        let state = handler.generate_state();
        let auth_url = handler.authorization_url(&state, &code_challenge).await?;

        let mut server = CallbackServer::bind(self.config.callback_port)?;
        self.open_browser(&auth_url);

        self.transition(FlowState::AwaitingCallback);
        let received = server.wait(self.config.callback_timeout).await;
        server.shutdown().await;
        let params = received?;

        let code = verify_callback(&params, &state)?;

        self.transition(FlowState::ExchangingCode);
        handler
            .process_authorization_response(code, &state, &code_verifier)
            .await
    }

    async fn ensure_client(&self, handler: &dyn AuthorizationHandler) -> Result<()> {
        if handler.client_id().is_some() {
            debug!("Client already configured");
            return Ok(());
        }

        if let Some(registration) = self.store.get_client_registration().await? {
            info!("Using stored client registration {}", registration.id);
            handler.set_client_credentials(&registration);
            return Ok(());
        }

        let registration = handler.register_client(CLIENT_NAME).await?;
        self.store.save_client_registration(&registration).await?;
        Ok(())
    }

    fn open_browser(&mut self, auth_url: &str) {
        info!("Opening browser to: {}", auth_url);
        if let Err(e) = write_authorization_prompt(&mut self.prompt, auth_url) {
            debug!("Could not write authorization prompt: {}", e);
        }
        if let Err(e) = self.browser.open(auth_url) {
            warn!(
                "Failed to launch browser ({}), open the URL above manually",
                e
            );
        }
    }

    fn transition(&mut self, next: FlowState) {
        debug!("OAuth flow: {} -> {}", self.state, next);
        self.state = next;
    }
}

/// Tell the user where to authorize in case no browser window shows up
fn write_authorization_prompt(out: &mut impl Write, auth_url: &str) -> std::io::Result<()> {
    writeln!(out, "Please open the following URL in your browser to authorize:")?;
    writeln!(out, "  {}", auth_url)?;
    out.flush()
}

/// Check the redirect parameters and extract the authorization code
fn verify_callback<'p>(params: &'p CallbackParams, expected_state: &str) -> Result<&'p str> {
    let received = params.get("state").map(String::as_str).unwrap_or_default();
    if received != expected_state {
        return Err(OAuthError::StateMismatch {
            expected: expected_state.to_string(),
            received: received.to_string(),
        });
    }

    if let Some(error) = params.get("error") {
        let description = params
            .get("error_description")
            .map(String::as_str)
            .unwrap_or("No description provided");
        return Err(OAuthError::AuthorizationDenied(format!(
            "{}: {}",
            error, description
        )));
    }

    match params.get("code") {
        Some(code) if !code.is_empty() => Ok(code.as_str()),
        _ => Err(OAuthError::MissingParameter("code".to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callback_server::{free_port, CALLBACK_PATH};
    use crate::storage::{CredentialStore, TargetId};
    use crate::types::ClientRegistration;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tempfile::TempDir;
    use url::Url;

    #[derive(Default)]
    struct MockHandler {
        client: Mutex<Option<ClientRegistration>>,
        fail_registration: bool,
        registrations: AtomicUsize,
        exchanges: AtomicUsize,
    }

    #[async_trait]
    impl AuthorizationHandler for MockHandler {
        fn client_id(&self) -> Option<String> {
            self.client.lock().unwrap().as_ref().map(|c| c.id.clone())
        }

        fn client_secret(&self) -> Option<String> {
            self.client.lock().unwrap().as_ref().map(|c| c.secret.clone())
        }

        fn set_client_credentials(&self, registration: &ClientRegistration) {
            *self.client.lock().unwrap() = Some(registration.clone());
        }

        async fn register_client(&self, client_name: &str) -> Result<ClientRegistration> {
            assert_eq!(client_name, CLIENT_NAME);
            self.registrations.fetch_add(1, Ordering::SeqCst);
            if self.fail_registration {
                return Err(OAuthError::ClientRegistration("rejected".to_string()));
            }
            let registration = ClientRegistration {
                id: "abc".to_string(),
                secret: "xyz".to_string(),
            };
            self.set_client_credentials(&registration);
            Ok(registration)
        }

        async fn authorization_url(&self, state: &str, code_challenge: &str) -> Result<String> {
            Ok(format!(
                "https://auth.example/authorize?state={}&code_challenge={}",
                state, code_challenge
            ))
        }

        async fn process_authorization_response(
            &self,
            code: &str,
            _state: &str,
            code_verifier: &str,
        ) -> Result<Token> {
            assert_eq!(self.generate_code_challenge(code_verifier).len(), 43);
            self.exchanges.fetch_add(1, Ordering::SeqCst);
            Ok(Token::bearer(format!("token-for-{}", code)))
        }
    }

    /// Follows the authorization URL by calling the callback endpoint directly
    struct RedirectingBrowser {
        port: u16,
        query: Option<String>,
        fail_launch: bool,
    }

    impl RedirectingBrowser {
        fn new(port: u16) -> Self {
            Self {
                port,
                query: None,
                fail_launch: false,
            }
        }

        fn with_query(mut self, query: &str) -> Self {
            self.query = Some(query.to_string());
            self
        }
    }

    impl Browser for RedirectingBrowser {
        fn open(&self, url: &str) -> Result<()> {
            let state = Url::parse(url)
                .unwrap()
                .query_pairs()
                .find(|(k, _)| k == "state")
                .map(|(_, v)| v.into_owned())
                .unwrap();
            let query = self
                .query
                .clone()
                .unwrap_or_else(|| format!("code=c1&state={}", state));
            let callback = format!("http://127.0.0.1:{}{}?{}", self.port, CALLBACK_PATH, query);
            tokio::spawn(async move {
                let _ = reqwest::get(callback).await;
            });

            if self.fail_launch {
                return Err(OAuthError::InvalidConfiguration("no browser".to_string()));
            }
            Ok(())
        }
    }

    struct Fixture {
        _dir: TempDir,
        store: TargetStore,
        config: FlowConfig,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let target = TargetId::from_url(&Url::parse("https://example.com/mcp").unwrap()).unwrap();
        let store = CredentialStore::new(dir.path()).target(&target);
        let config = FlowConfig {
            callback_port: free_port(),
            callback_timeout: Some(Duration::from_secs(10)),
        };
        Fixture {
            _dir: dir,
            store,
            config,
        }
    }

    #[tokio::test]
    async fn test_flow_registers_and_returns_token() {
        let fx = fixture();
        let browser = RedirectingBrowser::new(fx.config.callback_port);
        let handler = MockHandler::default();

        let mut flow = AuthorizationFlow::new(&fx.store, &browser, &fx.config);
        let token = flow.run(&handler).await.unwrap();

        assert_eq!(token.access_token, "token-for-c1");
        assert_eq!(flow.state(), FlowState::Complete);
        assert_eq!(handler.registrations.load(Ordering::SeqCst), 1);
        assert_eq!(
            fx.store.get_client_registration().await.unwrap().unwrap().id,
            "abc"
        );
        // the flow leaves token persistence to its caller
        assert!(fx.store.get_token().await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_stored_registration_is_reused() {
        let fx = fixture();
        let stored = ClientRegistration {
            id: "stored".to_string(),
            secret: "s".to_string(),
        };
        fx.store.save_client_registration(&stored).await.unwrap();
        let browser = RedirectingBrowser::new(fx.config.callback_port);
        let handler = MockHandler::default();

        AuthorizationFlow::new(&fx.store, &browser, &fx.config)
            .run(&handler)
            .await
            .unwrap();

        assert_eq!(handler.registrations.load(Ordering::SeqCst), 0);
        assert_eq!(handler.client_id().as_deref(), Some("stored"));
    }

    #[tokio::test]
    async fn test_second_flow_does_not_register_again() {
        let fx = fixture();
        let handler = MockHandler::default();

        for _ in 0..2 {
            let browser = RedirectingBrowser::new(fx.config.callback_port);
            AuthorizationFlow::new(&fx.store, &browser, &fx.config)
                .run(&handler)
                .await
                .unwrap();
        }

        assert_eq!(handler.registrations.load(Ordering::SeqCst), 1);
        assert_eq!(handler.exchanges.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_state_mismatch_fails_without_exchange() {
        let fx = fixture();
        fx.store
            .save_client_registration(&ClientRegistration {
                id: "abc".to_string(),
                secret: "xyz".to_string(),
            })
            .await
            .unwrap();
        let before = std::fs::read(fx.store.path()).unwrap();
        let browser =
            RedirectingBrowser::new(fx.config.callback_port).with_query("code=c1&state=s1");
        let handler = MockHandler::default();

        let mut flow = AuthorizationFlow::new(&fx.store, &browser, &fx.config);
        let result = flow.run(&handler).await;

        assert!(matches!(result, Err(OAuthError::StateMismatch { ref received, .. }) if received == "s1"));
        assert_eq!(flow.state(), FlowState::Failed);
        assert_eq!(handler.exchanges.load(Ordering::SeqCst), 0);
        assert_eq!(std::fs::read(fx.store.path()).unwrap(), before);
    }

    #[tokio::test]
    async fn test_missing_code_fails() {
        let fx = fixture();
        let handler = MockHandler::default();
        handler.set_client_credentials(&ClientRegistration {
            id: "abc".to_string(),
            secret: String::new(),
        });

        struct NoCode(u16);
        impl Browser for NoCode {
            fn open(&self, url: &str) -> Result<()> {
                let state = Url::parse(url)
                    .unwrap()
                    .query_pairs()
                    .find(|(k, _)| k == "state")
                    .map(|(_, v)| v.into_owned())
                    .unwrap();
                let callback = format!("http://127.0.0.1:{}{}?state={}", self.0, CALLBACK_PATH, state);
                tokio::spawn(async move {
                    let _ = reqwest::get(callback).await;
                });
                Ok(())
            }
        }

        let browser = NoCode(fx.config.callback_port);
        let result = AuthorizationFlow::new(&fx.store, &browser, &fx.config)
            .run(&handler)
            .await;

        assert!(matches!(result, Err(OAuthError::MissingParameter(ref p)) if p == "code"));
    }

    #[tokio::test]
    async fn test_browser_failure_is_not_fatal() {
        let fx = fixture();
        let mut browser = RedirectingBrowser::new(fx.config.callback_port);
        browser.fail_launch = true;
        let handler = MockHandler::default();

        let token = AuthorizationFlow::new(&fx.store, &browser, &fx.config)
            .run(&handler)
            .await
            .unwrap();

        assert_eq!(token.access_token, "token-for-c1");
    }

    #[tokio::test]
    async fn test_url_is_shown_even_when_browser_launches() {
        let fx = fixture();
        let browser = RedirectingBrowser::new(fx.config.callback_port);
        let handler = MockHandler::default();
        let mut prompt = Vec::new();

        AuthorizationFlow::new(&fx.store, &browser, &fx.config)
            .with_prompt(&mut prompt)
            .run(&handler)
            .await
            .unwrap();

        let text = String::from_utf8(prompt).unwrap();
        assert!(text.contains("  https://auth.example/authorize?state="));
    }

    #[tokio::test]
    async fn test_listener_released_after_flow() {
        let fx = fixture();
        let browser = RedirectingBrowser::new(fx.config.callback_port);
        let handler = MockHandler::default();

        AuthorizationFlow::new(&fx.store, &browser, &fx.config)
            .run(&handler)
            .await
            .unwrap();

        let server = CallbackServer::bind(fx.config.callback_port).unwrap();
        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_callback_timeout() {
        struct NoRedirect;
        impl Browser for NoRedirect {
            fn open(&self, _url: &str) -> Result<()> {
                Ok(())
            }
        }

        let mut fx = fixture();
        fx.config.callback_timeout = Some(Duration::from_millis(100));
        let handler = MockHandler::default();

        let mut flow = AuthorizationFlow::new(&fx.store, &NoRedirect, &fx.config);
        let result = flow.run(&handler).await;

        assert!(matches!(result, Err(OAuthError::AuthTimeout)));
        assert_eq!(flow.state(), FlowState::Failed);
    }

    #[tokio::test]
    async fn test_registration_failure_writes_nothing() {
        let fx = fixture();
        let browser = RedirectingBrowser::new(fx.config.callback_port);
        let handler = MockHandler {
            fail_registration: true,
            ..Default::default()
        };

        let result = AuthorizationFlow::new(&fx.store, &browser, &fx.config)
            .run(&handler)
            .await;

        assert!(matches!(result, Err(OAuthError::ClientRegistration(_))));
        assert!(!fx.store.path().exists());
    }

    #[test]
    fn test_authorization_prompt_contains_url() {
        let mut out = Vec::new();
        write_authorization_prompt(&mut out, "https://auth.example/authorize?state=s1").unwrap();

        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("\n  https://auth.example/authorize?state=s1\n"));
    }

    #[test]
    fn test_verify_callback_reports_denial() {
        let mut params = CallbackParams::new();
        params.insert("state".to_string(), "s1".to_string());
        params.insert("error".to_string(), "access_denied".to_string());

        assert!(matches!(
            verify_callback(&params, "s1"),
            Err(OAuthError::AuthorizationDenied(_))
        ));
    }
}
