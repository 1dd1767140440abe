// session-core/src/models/session.rs
use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Authenticated session payload stored behind a session id.
///
/// Records are never mutated once stored. Refreshing tokens produces a new
/// record under a new session id (see `SessionStore::rotate`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    /// Stable identity-provider user id
    pub subject: String,
    /// Display name
    pub username: String,
    /// Bearer credential for upstream API calls
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    /// Only used as the logout hint for the identity provider
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id_token: Option<String>,
    #[serde(default)]
    pub roles: Vec<String>,
    /// Access token expiry, milliseconds since the Unix epoch
    pub expires_at: i64,
}

impl SessionRecord {
    pub fn new(
        subject: impl Into<String>,
        username: impl Into<String>,
        access_token: impl Into<String>,
        expires_at: i64,
    ) -> Self {
        Self {
            subject: subject.into(),
            username: username.into(),
            access_token: access_token.into(),
            refresh_token: None,
            id_token: None,
            roles: Vec::new(),
            expires_at,
        }
    }

    pub fn with_refresh_token(mut self, token: Option<String>) -> Self {
        self.refresh_token = token;
        self
    }

    pub fn with_id_token(mut self, token: Option<String>) -> Self {
        self.id_token = token;
        self
    }

    pub fn with_roles(mut self, roles: Vec<String>) -> Self {
        self.roles = roles;
        self
    }

    /// Whether the access token has passed its expiry instant
    pub fn is_access_token_expired(&self) -> bool {
        Utc::now().timestamp_millis() >= self.expires_at
    }
}

/// Response structure for session API endpoints
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfoResponse {
    pub authenticated: bool,
    pub subject: String,
    pub username: String,
    pub roles: Vec<String>,
    pub expires_at: i64,
    pub access_token_expired: bool,
    // Omit tokens
}

impl From<&SessionRecord> for SessionInfoResponse {
    fn from(record: &SessionRecord) -> Self {
        Self {
            authenticated: true,
            subject: record.subject.clone(),
            username: record.username.clone(),
            roles: record.roles.clone(),
            expires_at: record.expires_at,
            access_token_expired: record.is_access_token_expired(),
        }
    }
}
