// web-server/src/identity.rs
//! Identity provider collaborator: authorization-code exchange, token
//! refresh and user lookup against a Keycloak realm.

use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use thiserror::Error;
use url::Url;

use crate::config::OidcConfig;

/// Tokens returned by the provider's token endpoint
#[derive(Debug, Clone, Deserialize)]
pub struct TokenSet {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub id_token: Option<String>,
    /// Access token lifetime in seconds
    pub expires_in: i64,
}

impl TokenSet {
    /// Absolute access token expiry in milliseconds since the epoch
    pub fn expires_at_millis(&self) -> i64 {
        Utc::now()
            .timestamp_millis()
            .saturating_add(self.expires_in.saturating_mul(1000))
    }
}

/// Who the tokens belong to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub subject: String,
    pub username: String,
    pub roles: Vec<String>,
}

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("invalid identity provider configuration: {0}")]
    Config(String),

    #[error("identity provider request failed: {0}")]
    Request(String),

    #[error("identity provider rejected the request with status {status}")]
    Rejected { status: u16 },

    #[error("invalid identity provider response: {0}")]
    InvalidResponse(String),
}

impl From<reqwest::Error> for IdentityError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            Self::InvalidResponse(err.to_string())
        } else {
            Self::Request(err.to_string())
        }
    }
}

#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Where to send the browser to start a login
    fn authorization_url(&self, state: &str, code_challenge: &str) -> String;

    async fn exchange_code(&self, code: &str, code_verifier: &str) -> Result<TokenSet, IdentityError>;

    async fn refresh(&self, refresh_token: &str) -> Result<TokenSet, IdentityError>;

    async fn user_info(&self, access_token: &str) -> Result<Identity, IdentityError>;

    /// Provider logout URL, with the id token as hint when available
    fn end_session_url(&self, id_token_hint: Option<&str>) -> Option<String>;
}

#[derive(Debug, Deserialize)]
struct UserInfoResponse {
    sub: String,
    preferred_username: Option<String>,
    name: Option<String>,
    #[serde(default)]
    realm_access: Option<RealmAccess>,
}

#[derive(Debug, Deserialize)]
struct RealmAccess {
    #[serde(default)]
    roles: Vec<String>,
}

impl From<UserInfoResponse> for Identity {
    fn from(info: UserInfoResponse) -> Self {
        let username = info
            .preferred_username
            .or(info.name)
            .unwrap_or_else(|| info.sub.clone());

        Self {
            subject: info.sub,
            username,
            roles: info.realm_access.map(|access| access.roles).unwrap_or_default(),
        }
    }
}

/// OpenID Connect client for a Keycloak realm
pub struct KeycloakClient {
    http: reqwest::Client,
    config: OidcConfig,
    auth_endpoint: Url,
    token_endpoint: Url,
    userinfo_endpoint: Url,
    logout_endpoint: Url,
}

impl KeycloakClient {
    pub fn new(config: OidcConfig) -> Result<Self, IdentityError> {
        let endpoint = |name: &str| {
            let base = config.issuer_url.trim_end_matches('/');
            Url::parse(&format!("{}/protocol/openid-connect/{}", base, name))
                .map_err(|e| IdentityError::Config(format!("issuer_url: {}", e)))
        };

        Ok(Self {
            http: reqwest::Client::new(),
            auth_endpoint: endpoint("auth")?,
            token_endpoint: endpoint("token")?,
            userinfo_endpoint: endpoint("userinfo")?,
            logout_endpoint: endpoint("logout")?,
            config,
        })
    }

    async fn token_request(&self, grant: &[(&str, &str)]) -> Result<TokenSet, IdentityError> {
        let mut form: Vec<(&str, &str)> = vec![("client_id", self.config.client_id.as_str())];
        if let Some(secret) = &self.config.client_secret {
            form.push(("client_secret", secret.as_str()));
        }
        form.extend_from_slice(grant);

        let response = self.http.post(self.token_endpoint.clone()).form(&form).send().await?;
        if !response.status().is_success() {
            return Err(IdentityError::Rejected {
                status: response.status().as_u16(),
            });
        }
        Ok(response.json::<TokenSet>().await?)
    }
}

#[async_trait]
impl IdentityProvider for KeycloakClient {
    fn authorization_url(&self, state: &str, code_challenge: &str) -> String {
        let mut url = self.auth_endpoint.clone();
        url.query_pairs_mut()
            .append_pair("response_type", "code")
            .append_pair("client_id", &self.config.client_id)
            .append_pair("redirect_uri", &self.config.redirect_uri)
            .append_pair("scope", &self.config.scopes.join(" "))
            .append_pair("state", state)
            .append_pair("code_challenge", code_challenge)
            .append_pair("code_challenge_method", "S256");
        url.into()
    }

    async fn exchange_code(&self, code: &str, code_verifier: &str) -> Result<TokenSet, IdentityError> {
        self.token_request(&[
            ("grant_type", "authorization_code"),
            ("code", code),
            ("code_verifier", code_verifier),
            ("redirect_uri", self.config.redirect_uri.as_str()),
        ])
        .await
    }

    async fn refresh(&self, refresh_token: &str) -> Result<TokenSet, IdentityError> {
        self.token_request(&[("grant_type", "refresh_token"), ("refresh_token", refresh_token)])
            .await
    }

    async fn user_info(&self, access_token: &str) -> Result<Identity, IdentityError> {
        let response = self
            .http
            .get(self.userinfo_endpoint.clone())
            .bearer_auth(access_token)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(IdentityError::Rejected {
                status: response.status().as_u16(),
            });
        }
        Ok(response.json::<UserInfoResponse>().await?.into())
    }

    fn end_session_url(&self, id_token_hint: Option<&str>) -> Option<String> {
        let mut url = self.logout_endpoint.clone();
        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("client_id", &self.config.client_id)
                .append_pair("post_logout_redirect_uri", &self.config.post_logout_redirect_uri);
            if let Some(hint) = id_token_hint {
                query.append_pair("id_token_hint", hint);
            }
        }
        Some(url.into())
    }
}
