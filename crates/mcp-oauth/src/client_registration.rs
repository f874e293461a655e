use crate::types::{
    ClientRegistrationRequest, ClientRegistrationResponse, OAuthServerMetadata,
    ProtectedResourceMetadata,
};
use crate::{OAuthError, Result};
use reqwest::Client;
use std::collections::HashMap;
use tracing::{debug, info, warn};
use url::Url;

/// Scheme, host and port of `server_url`, without path or query
pub fn base_url(server_url: &Url) -> String {
    let mut base = server_url.clone();
    base.set_path("");
    base.set_query(None);
    base.set_fragment(None);
    base.as_str().trim_end_matches('/').to_string()
}

/// Discover the authorization server for an MCP server
///
/// Looks up the protected resource metadata (RFC 9728) to find the issuer, then
/// its authorization server metadata (RFC 8414). Any failure along the way falls
/// back to `/authorize`, `/token` and `/register` on the MCP server's origin.
pub async fn discover_server_metadata(
    http_client: &Client,
    server_url: &Url,
) -> Result<OAuthServerMetadata> {
    let base = base_url(server_url);

    match try_discover(http_client, &base).await {
        Ok(metadata) => {
            debug!("OAuth server metadata: {:#?}", metadata);
            Ok(metadata)
        }
        Err(e) => {
            warn!("OAuth metadata discovery failed, using default endpoints: {}", e);
            Ok(fallback_metadata(&base))
        }
    }
}

async fn try_discover(http_client: &Client, base: &str) -> Result<OAuthServerMetadata> {
    let resource_url = format!("{}/.well-known/oauth-protected-resource", base);
    info!("Discovering protected resource metadata from: {}", resource_url);

    let response = http_client.get(&resource_url).send().await?;
    if !response.status().is_success() {
        return Err(OAuthError::Discovery(format!(
            "{} returned {}",
            resource_url,
            response.status()
        )));
    }
    let resource: ProtectedResourceMetadata = response.json().await?;
    let issuer = resource
        .authorization_servers
        .first()
        .ok_or_else(|| OAuthError::Discovery("No authorization servers listed".to_string()))?;

    let metadata_url = format!(
        "{}/.well-known/oauth-authorization-server",
        issuer.trim_end_matches('/')
    );
    info!("Discovering OAuth server metadata from: {}", metadata_url);

    let response = http_client.get(&metadata_url).send().await?;
    if !response.status().is_success() {
        return Err(OAuthError::Discovery(format!(
            "{} returned {}",
            metadata_url,
            response.status()
        )));
    }
    Ok(response.json().await?)
}

fn fallback_metadata(base: &str) -> OAuthServerMetadata {
    OAuthServerMetadata {
        issuer: base.to_string(),
        authorization_endpoint: format!("{}/authorize", base),
        token_endpoint: format!("{}/token", base),
        registration_endpoint: Some(format!("{}/register", base)),
        scopes_supported: None,
        code_challenge_methods_supported: None,
        additional_metadata: HashMap::new(),
    }
}

/// Register a public client (RFC 7591)
pub async fn register_client(
    http_client: &Client,
    metadata: &OAuthServerMetadata,
    client_name: &str,
    redirect_uri: &str,
    scopes: &[String],
) -> Result<ClientRegistrationResponse> {
    let registration_endpoint = metadata.registration_endpoint.as_ref().ok_or_else(|| {
        OAuthError::ClientRegistration(
            "Server does not support dynamic client registration".to_string(),
        )
    })?;

    info!("Registering OAuth client with server at: {}", registration_endpoint);

    let request = ClientRegistrationRequest {
        client_name: client_name.to_string(),
        redirect_uris: vec![redirect_uri.to_string()],
        grant_types: vec![
            "authorization_code".to_string(),
            "refresh_token".to_string(),
        ],
        response_types: vec!["code".to_string()],
        token_endpoint_auth_method: "none".to_string(),
        scope: (!scopes.is_empty()).then(|| scopes.join(" ")),
    };
    debug!("Registration request: {:?}", request);

    let response = http_client
        .post(registration_endpoint)
        .json(&request)
        .send()
        .await?;

    if !response.status().is_success() {
        let status = response.status();
        let error_body = response.text().await.unwrap_or_default();
        warn!("Client registration failed: {} - {}", status, error_body);
        return Err(OAuthError::ClientRegistration(format!(
            "Registration failed with status {}: {}",
            status, error_body
        )));
    }

    let registration: ClientRegistrationResponse = response.json().await?;
    info!("Registered OAuth client: {}", registration.client_id);
    Ok(registration)
}
