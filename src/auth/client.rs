//! OAuth 2.0 client for provider token endpoints
//!
//! [`TokenEndpoint`] is the seam between the broker and the network: the
//! coordinator exchanges authorization codes through it and the credential
//! broker refreshes through it. [`OAuth2TokenEndpoint`] is the production
//! implementation built on the `oauth2` crate.

use crate::model::{OAuthSpec, OAuthToken};
use crate::{BrokerError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use oauth2::{
    AuthUrl, AuthorizationCode, ClientId, ClientSecret, CsrfToken, EndpointNotSet, EndpointSet,
    HttpClientError, PkceCodeChallenge, PkceCodeVerifier, RedirectUrl, RefreshToken,
    RequestTokenError, Scope, TokenResponse, TokenUrl,
    basic::{BasicClient, BasicErrorResponse, BasicTokenResponse},
};

const HTTP_TIMEOUT_SECS: u64 = 30;

type ConfiguredClient =
    BasicClient<EndpointSet, EndpointNotSet, EndpointNotSet, EndpointNotSet, EndpointSet>;

type TokenRequestError = RequestTokenError<HttpClientError<reqwest::Error>, BasicErrorResponse>;

/// Token material returned by a provider, before it is stamped with an expiry
#[derive(Clone)]
pub struct TokenSet {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub token_type: String,
    pub expires_in: Option<Duration>,
    pub scopes: Option<Vec<String>>,
}

impl TokenSet {
    /// Convert into a stored token, computing the absolute expiry from `now`
    ///
    /// A missing refresh token or scope list falls back to `previous`, since
    /// providers that do not rotate refresh tokens omit them on refresh.
    pub fn into_token(self, now: DateTime<Utc>, previous: Option<&OAuthToken>) -> OAuthToken {
        OAuthToken {
            access_token: self.access_token,
            refresh_token: self
                .refresh_token
                .or_else(|| previous.and_then(|p| p.refresh_token.clone())),
            token_type: self.token_type,
            expires_at: self.expires_in.map(|d| now + d),
            issued_at: Some(now),
            scopes: self
                .scopes
                .or_else(|| previous.map(|p| p.scopes.clone()))
                .unwrap_or_default(),
        }
    }
}

impl std::fmt::Debug for TokenSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenSet")
            .field("access_token", &"[REDACTED]")
            .field("has_refresh_token", &self.refresh_token.is_some())
            .field("expires_in", &self.expires_in)
            .field("scopes", &self.scopes)
            .finish()
    }
}

/// Provider token endpoint operations
#[async_trait]
pub trait TokenEndpoint: Send + Sync {
    /// Exchange an authorization code for tokens
    async fn exchange_code(
        &self,
        provider: &str,
        oauth: &OAuthSpec,
        code: &str,
        pkce_verifier: Option<&str>,
    ) -> Result<TokenSet>;

    /// Obtain a new access token using a refresh token
    async fn refresh(
        &self,
        provider: &str,
        oauth: &OAuthSpec,
        refresh_token: &str,
    ) -> Result<TokenSet>;
}

/// PKCE material generated for one authorization attempt
pub struct PkcePair {
    pub challenge: PkceCodeChallenge,
    pub verifier: String,
}

impl PkcePair {
    pub fn generate() -> Self {
        let (challenge, verifier) = PkceCodeChallenge::new_random_sha256();
        Self {
            challenge,
            verifier: verifier.secret().clone(),
        }
    }
}

fn build_client(oauth: &OAuthSpec) -> Result<ConfiguredClient> {
    let client = BasicClient::new(ClientId::new(oauth.client_id.clone()))
        .set_auth_uri(
            AuthUrl::new(oauth.auth_url.clone())
                .map_err(|e| BrokerError::config(format!("Invalid auth URL: {}", e)))?,
        )
        .set_token_uri(
            TokenUrl::new(oauth.token_url.clone())
                .map_err(|e| BrokerError::config(format!("Invalid token URL: {}", e)))?,
        )
        .set_redirect_uri(
            RedirectUrl::new(oauth.redirect_uri.clone())
                .map_err(|e| BrokerError::config(format!("Invalid redirect URI: {}", e)))?,
        );

    Ok(match &oauth.client_secret {
        Some(secret) => client.set_client_secret(ClientSecret::new(secret.clone())),
        None => client,
    })
}

/// Build the provider authorization URL carrying `state` and the merged scopes
pub fn build_authorization_url(
    oauth: &OAuthSpec,
    state: &str,
    scopes: &[String],
    pkce_challenge: Option<PkceCodeChallenge>,
) -> Result<String> {
    let client = build_client(oauth)?;
    let state = state.to_string();

    let mut request = client
        .authorize_url(|| CsrfToken::new(state))
        .add_scopes(scopes.iter().map(|s| Scope::new(s.clone())));
    if let Some(challenge) = pkce_challenge {
        request = request.set_pkce_challenge(challenge);
    }
    let (mut url, _) = request.url();

    if !oauth.auth_params.is_empty() {
        let mut params: Vec<_> = oauth.auth_params.iter().collect();
        params.sort();
        let mut query = url.query_pairs_mut();
        for (key, value) in params {
            query.append_pair(key, value);
        }
    }

    Ok(url.to_string())
}

/// Build the app installation URL carrying `state`
///
/// Fails when the provider has no installation page configured.
pub fn build_installation_url(provider: &str, oauth: &OAuthSpec, state: &str) -> Result<String> {
    let install_url = oauth.install_url.as_deref().ok_or_else(|| {
        BrokerError::validation(format!(
            "Provider '{}' has no app installation configured",
            provider
        ))
    })?;
    let mut url = url::Url::parse(install_url)
        .map_err(|e| BrokerError::config(format!("Invalid install URL: {}", e)))?;
    url.query_pairs_mut().append_pair("state", state);
    Ok(url.to_string())
}

/// Summarize a token endpoint failure without echoing the upstream body
fn safe_reason(err: &TokenRequestError) -> String {
    match err {
        RequestTokenError::ServerResponse(resp) => resp.error().to_string(),
        RequestTokenError::Request(_) => "token endpoint request failed".to_string(),
        RequestTokenError::Parse(_, _) => "unparseable token response".to_string(),
        RequestTokenError::Other(_) => "unexpected token endpoint response".to_string(),
    }
}

fn into_token_set(response: BasicTokenResponse) -> TokenSet {
    TokenSet {
        access_token: response.access_token().secret().clone(),
        refresh_token: response.refresh_token().map(|t| t.secret().clone()),
        token_type: response.token_type().as_ref().to_string(),
        expires_in: response
            .expires_in()
            .map(|d| Duration::seconds(d.as_secs() as i64)),
        scopes: response
            .scopes()
            .map(|scopes| scopes.iter().map(|s| s.to_string()).collect()),
    }
}

/// [`TokenEndpoint`] backed by the `oauth2` crate and reqwest
#[derive(Clone)]
pub struct OAuth2TokenEndpoint {
    http_client: reqwest::Client,
}

impl OAuth2TokenEndpoint {
    pub fn new() -> Result<Self> {
        // Redirects are disabled to prevent authorization code interception
        let http_client = reqwest::ClientBuilder::new()
            .redirect(reqwest::redirect::Policy::none())
            .timeout(std::time::Duration::from_secs(HTTP_TIMEOUT_SECS))
            .build()
            .map_err(|e| {
                BrokerError::config(format!("Failed to build HTTP client for OAuth: {}", e))
            })?;
        Ok(Self { http_client })
    }
}

#[async_trait]
impl TokenEndpoint for OAuth2TokenEndpoint {
    async fn exchange_code(
        &self,
        provider: &str,
        oauth: &OAuthSpec,
        code: &str,
        pkce_verifier: Option<&str>,
    ) -> Result<TokenSet> {
        let client = build_client(oauth)?;

        let mut request = client.exchange_code(AuthorizationCode::new(code.to_string()));
        if let Some(verifier) = pkce_verifier {
            request = request.set_pkce_verifier(PkceCodeVerifier::new(verifier.to_string()));
        }

        let response = request
            .request_async(&self.http_client)
            .await
            .map_err(|e| {
                let reason = safe_reason(&e);
                tracing::warn!(provider, reason = %reason, "Authorization code exchange failed");
                BrokerError::CodeExchangeFailed {
                    provider: provider.to_string(),
                    reason,
                }
            })?;

        Ok(into_token_set(response))
    }

    async fn refresh(
        &self,
        provider: &str,
        oauth: &OAuthSpec,
        refresh_token: &str,
    ) -> Result<TokenSet> {
        let client = build_client(oauth)?;

        let response = client
            .exchange_refresh_token(&RefreshToken::new(refresh_token.to_string()))
            .request_async(&self.http_client)
            .await
            .map_err(|e| {
                let reason = safe_reason(&e);
                tracing::warn!(provider, reason = %reason, "Token refresh failed");
                BrokerError::RefreshFailed {
                    provider: provider.to_string(),
                    reason,
                }
            })?;

        Ok(into_token_set(response))
    }
}
