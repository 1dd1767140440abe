// web-server/src/api/auth.rs
use actix_web::cookie::time::Duration as CookieDuration;
use actix_web::cookie::{Cookie, SameSite};
use actix_web::http::header;
use actix_web::{get, post, web, HttpRequest, HttpResponse, ResponseError};
use serde::Deserialize;
use serde_json::json;
use session_core::{sid_prefix, SessionError, SessionInfoResponse, SessionRecord, SessionStore};
use std::sync::Arc;
use thiserror::Error;

use crate::config::{CookieConfig, RedirectConfig};
use crate::identity::{IdentityError, IdentityProvider};
use crate::utils::token::{generate_secure_token, pkce_challenge};

const PKCE_COOKIE_NAME: &str = "oidc_verifier";
const STATE_COOKIE_NAME: &str = "oidc_state";
// PKCE and state cookies only need to survive the round trip to the provider
const LOGIN_COOKIE_MAX_AGE: i64 = 300;
const AUTH_PATH: &str = "/api/auth";

/// Shared state for the auth handlers
pub struct AuthState {
    pub sessions: SessionStore,
    pub identity: Arc<dyn IdentityProvider>,
    pub cookie: CookieConfig,
    pub redirects: RedirectConfig,
}

impl AuthState {
    fn session_cookie(&self, sid: String) -> Cookie<'static> {
        Cookie::build(self.cookie.name.clone(), sid)
            .path("/")
            .secure(self.cookie.secure)
            .http_only(true)
            .same_site(SameSite::Lax)
            .max_age(CookieDuration::seconds(i64::try_from(self.sessions.ttl_secs()).unwrap_or(i64::MAX)))
            .finish()
    }

    fn clear_session_cookie(&self) -> Cookie<'static> {
        Cookie::build(self.cookie.name.clone(), "")
            .path("/")
            .secure(self.cookie.secure)
            .http_only(true)
            .same_site(SameSite::Lax)
            .max_age(CookieDuration::seconds(0))
            .finish()
    }

    fn login_cookie(&self, name: &'static str, value: String) -> Cookie<'static> {
        Cookie::build(name, value)
            .path(AUTH_PATH)
            .secure(self.cookie.secure)
            .http_only(true)
            .same_site(SameSite::Lax)
            .max_age(CookieDuration::seconds(LOGIN_COOKIE_MAX_AGE))
            .finish()
    }

    fn session_id(&self, req: &HttpRequest) -> Option<String> {
        req.cookie(&self.cookie.name).map(|c| c.value().to_string())
    }

    fn error_redirect(&self, code: &str) -> HttpResponse {
        HttpResponse::Found()
            .insert_header((header::LOCATION, format!("{}?error={}", self.redirects.on_error, code)))
            .finish()
    }
}

/// Errors returned by the JSON endpoints
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Not authenticated")]
    Unauthenticated,

    #[error("Session refresh rejected")]
    RefreshRejected(#[from] IdentityError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),
}

impl ResponseError for ApiError {
    fn error_response(&self) -> HttpResponse {
        match self {
            ApiError::Unauthenticated => HttpResponse::Unauthorized().json(json!({
                "authenticated": false
            })),
            ApiError::RefreshRejected(e) => {
                tracing::info!("Token refresh rejected by identity provider: {}", e);
                HttpResponse::Unauthorized().json(json!({
                    "error": "Session expired, please sign in again"
                }))
            }
            ApiError::Session(SessionError::CreateConflict { .. }) => {
                tracing::error!("{}", self);
                HttpResponse::ServiceUnavailable().json(json!({
                    "error": "Could not start session, please try again"
                }))
            }
            ApiError::Session(e) => {
                tracing::error!("Session store error: {}", e);
                HttpResponse::InternalServerError().json(json!({
                    "error": "Internal server error"
                }))
            }
        }
    }
}

// Start the authorization-code flow
#[get("/login")]
pub async fn login(state: web::Data<AuthState>) -> HttpResponse {
    let verifier = generate_secure_token(64);
    let oauth_state = generate_secure_token(32);
    let url = state.identity.authorization_url(&oauth_state, &pkce_challenge(&verifier));

    HttpResponse::Found()
        .insert_header((header::LOCATION, url))
        .cookie(state.login_cookie(PKCE_COOKIE_NAME, verifier))
        .cookie(state.login_cookie(STATE_COOKIE_NAME, oauth_state))
        .finish()
}

#[derive(Debug, Deserialize)]
pub struct CallbackParams {
    code: Option<String>,
    state: Option<String>,
    error: Option<String>,
}

// Provider redirect target: exchange the code and open a session
#[get("/callback")]
pub async fn callback(
    req: HttpRequest,
    params: web::Query<CallbackParams>,
    state: web::Data<AuthState>,
) -> HttpResponse {
    match complete_login(&req, &params, &state).await {
        Ok(sid) => {
            tracing::info!("Login completed, session {}", sid_prefix(&sid));

            let mut clear_pkce = Cookie::named(PKCE_COOKIE_NAME);
            clear_pkce.set_path(AUTH_PATH);
            let mut clear_state = Cookie::named(STATE_COOKIE_NAME);
            clear_state.set_path(AUTH_PATH);

            let mut response = HttpResponse::Found();
            response
                .insert_header((header::LOCATION, state.redirects.after_login.clone()))
                .cookie(state.session_cookie(sid));
            let mut response = response.finish();
            // The login cookies expire on their own if this fails
            for cookie in [&clear_pkce, &clear_state] {
                if let Err(e) = response.add_removal_cookie(cookie) {
                    tracing::debug!("Could not clear {} cookie: {}", cookie.name(), e);
                }
            }
            response
        }
        Err(code) => state.error_redirect(code),
    }
}

/// Run the login callback; on failure return a generic error code for the
/// error page
async fn complete_login(
    req: &HttpRequest,
    params: &CallbackParams,
    state: &AuthState,
) -> Result<String, &'static str> {
    if let Some(error) = &params.error {
        tracing::warn!("Identity provider returned error: {}", error);
        return Err("provider_error");
    }

    let code = params.code.as_deref().ok_or("missing_code")?;
    let received_state = params.state.as_deref().ok_or("state_mismatch")?;
    let stored_state = req.cookie(STATE_COOKIE_NAME).ok_or("state_mismatch")?;
    if stored_state.value() != received_state {
        tracing::warn!("OAuth state mismatch on callback");
        return Err("state_mismatch");
    }
    let verifier = req.cookie(PKCE_COOKIE_NAME).ok_or("missing_verifier")?;

    let tokens = state
        .identity
        .exchange_code(code, verifier.value())
        .await
        .map_err(|e| {
            tracing::error!("Token exchange failed: {}", e);
            "token_exchange_failed"
        })?;

    let identity = state.identity.user_info(&tokens.access_token).await.map_err(|e| {
        tracing::error!("User info request failed: {}", e);
        "userinfo_failed"
    })?;

    let record = SessionRecord::new(
        identity.subject,
        identity.username,
        tokens.access_token.clone(),
        tokens.expires_at_millis(),
    )
    .with_refresh_token(tokens.refresh_token)
    .with_id_token(tokens.id_token)
    .with_roles(identity.roles);

    state.sessions.create(&record).await.map_err(|e| {
        tracing::error!("Session creation failed: {}", e);
        "session_failed"
    })
}

// End the session locally and hand back the provider logout URL
#[post("/logout")]
pub async fn logout(req: HttpRequest, state: web::Data<AuthState>) -> Result<HttpResponse, ApiError> {
    let id_token_hint = match state.session_id(&req) {
        // A session that may still be live must not be reported as ended
        Some(sid) => state.sessions.take(&sid).await?.and_then(|record| record.id_token),
        None => None,
    };

    Ok(HttpResponse::Ok()
        .cookie(state.clear_session_cookie())
        .json(json!({
            "status": "success",
            "logoutUrl": state.identity.end_session_url(id_token_hint.as_deref())
        })))
}

// Exchange the refresh token and move the session to a new id
#[post("/refresh")]
pub async fn refresh(req: HttpRequest, state: web::Data<AuthState>) -> Result<HttpResponse, ApiError> {
    let sid = state.session_id(&req).ok_or(ApiError::Unauthenticated)?;
    let current = state.sessions.get(&sid).await?.ok_or(ApiError::Unauthenticated)?;
    let refresh_token = current.refresh_token.as_deref().ok_or(ApiError::Unauthenticated)?;

    let tokens = state.identity.refresh(refresh_token).await?;

    let record = SessionRecord::new(
        current.subject.clone(),
        current.username.clone(),
        tokens.access_token.clone(),
        tokens.expires_at_millis(),
    )
    .with_refresh_token(tokens.refresh_token.or_else(|| current.refresh_token.clone()))
    .with_id_token(tokens.id_token.or_else(|| current.id_token.clone()))
    .with_roles(current.roles.clone());

    let new_sid = state.sessions.rotate(&sid, &record).await?;
    tracing::info!(
        "Session {} rotated to {}",
        sid_prefix(&sid),
        sid_prefix(&new_sid)
    );

    Ok(HttpResponse::Ok()
        .cookie(state.session_cookie(new_sid))
        .json(SessionInfoResponse::from(&record)))
}

// Validation endpoint for the current session
#[get("/session")]
pub async fn session_info(req: HttpRequest, state: web::Data<AuthState>) -> Result<HttpResponse, ApiError> {
    let sid = state.session_id(&req).ok_or(ApiError::Unauthenticated)?;
    let record = state.sessions.get(&sid).await?.ok_or(ApiError::Unauthenticated)?;

    Ok(HttpResponse::Ok().json(SessionInfoResponse::from(&record)))
}
