//! Session lifecycle API endpoints.
//!
//! - POST `/session` - Record a login: create a session and mint tokens
//! - POST `/renew` - Exchange a stale access token for a fresh pair
//! - POST `/logout` - End the current session
//! - GET `/me` - Describe the authenticated principal
//!
//! Identity verification happens upstream; this service is handed an
//! already-authenticated username and owns everything session-shaped from
//! that point on.

use axum::{
    Json, Router,
    extract::State,
    http::{StatusCode, request::Parts},
    response::IntoResponse,
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info};

use super::error::{ApiError, ResultExt};
use crate::db::Database;
use crate::enrich::{EnrichmentJob, EnrichmentQueue};
use crate::fingerprint::{ClientSignals, HeaderComponents, fast_fingerprint};
use crate::gate::{GateRejection, Principal, SESSION_ID};
use crate::jwt::{TokenPair, TokenService};
use crate::renewal::RenewalService;
use crate::session::SessionManager;

#[derive(Clone)]
pub struct AuthState {
    pub db: Database,
    pub sessions: Arc<SessionManager>,
    pub tokens: Arc<TokenService>,
    pub renewal: Arc<RenewalService>,
    pub enrichment: EnrichmentQueue,
}

pub fn router(state: AuthState) -> Router {
    Router::new()
        .route("/session", post(create_session))
        .route("/renew", post(renew))
        .route("/logout", post(logout))
        .route("/me", get(me))
        .with_state(state)
}

#[derive(Deserialize)]
struct CreateSessionRequest {
    username: String,
    #[serde(default)]
    persistent: bool,
    /// Optional client-reported fingerprint signals, enriched off-path.
    #[serde(default)]
    signals: Option<ClientSignals>,
}

#[derive(Serialize)]
struct UserInfo {
    uuid: String,
    username: String,
    role: String,
    verified: bool,
}

#[derive(Serialize)]
struct SessionResponse {
    #[serde(flatten)]
    tokens: TokenPair,
    /// Raw session id for the client to persist and echo via X-Session-Id.
    session_id: String,
    user: UserInfo,
}

impl UserInfo {
    fn from_user(user: &crate::db::User) -> Self {
        Self {
            uuid: user.uuid.clone(),
            username: user.username.clone(),
            role: user.role.as_str().to_string(),
            verified: user.verified,
        }
    }
}

/// Record a login: create the session first, then mint the token pair bound
/// to it. Tokens are never issued before their session exists.
async fn create_session(
    State(state): State<AuthState>,
    request: axum::extract::Request,
) -> Result<impl IntoResponse, ApiError> {
    let (parts, body) = request.into_parts();
    let bytes = axum::body::to_bytes(body, 64 * 1024)
        .await
        .map_err(|_| ApiError::bad_request("Invalid request body"))?;
    let payload: CreateSessionRequest =
        serde_json::from_slice(&bytes).map_err(|_| ApiError::bad_request("Invalid JSON body"))?;

    let user = state
        .db
        .users()
        .get_by_username(&payload.username)
        .await
        .db_err("Failed to look up user")?
        .ok_or_else(|| ApiError::unauthorized("Unknown user"))?;
    if !user.is_usable() {
        return Err(ApiError::forbidden("Account is deactivated"));
    }

    let components = HeaderComponents::from_headers(&parts.headers);
    let fingerprint = fast_fingerprint(&components);
    let ip = extract_client_ip(&parts).unwrap_or_default();
    let user_agent = components.user_agent.clone();

    let session = state
        .sessions
        .create(Some(user.id), &fingerprint, &ip, &user_agent, payload.persistent)
        .await
        .map_err(|e| {
            error!(error = %e, "Failed to create session");
            ApiError::internal("Failed to create session")
        })?;

    if let Err(e) = state.sessions.enforce_limit(user.id).await {
        tracing::warn!(error = %e, "Failed to enforce session limit");
    }

    let pair = state.tokens.issue_pair(&user, Some(&session.raw_id)).map_err(|e| {
        error!(error = %e, "Failed to mint tokens for new session");
        ApiError::internal("Failed to create tokens")
    })?;

    if let Some(signals) = payload.signals {
        if !signals.is_empty() {
            state.enrichment.enqueue(EnrichmentJob {
                session_key: session.key.clone(),
                components,
                signals,
            });
        }
    }

    info!(user_id = user.id, persistent = payload.persistent, "Session created");

    Ok((
        StatusCode::OK,
        [(SESSION_ID, session.raw_id.clone())],
        Json(SessionResponse {
            tokens: pair,
            session_id: session.raw_id,
            user: UserInfo::from_user(&user),
        }),
    ))
}

#[derive(Deserialize)]
struct RenewRequest {
    access_token: String,
    /// Raw session id fallback for tokens without a `sid` claim.
    #[serde(default)]
    session_id: Option<String>,
}

#[derive(Serialize)]
struct RenewResponse {
    #[serde(flatten)]
    tokens: TokenPair,
    #[serde(skip_serializing_if = "Option::is_none")]
    session_id: Option<String>,
    user: UserInfo,
}

/// Explicit renewal endpoint for clients that noticed expiry themselves
/// rather than being renewed in-flight by the gate.
async fn renew(
    State(state): State<AuthState>,
    Json(payload): Json<RenewRequest>,
) -> Result<impl IntoResponse, GateRejection> {
    let renewal = state
        .renewal
        .renew(&payload.access_token, payload.session_id.as_deref())
        .await
        .map_err(|e| GateRejection::from(&e))?;

    Ok((
        StatusCode::OK,
        Json(RenewResponse {
            tokens: renewal.pair,
            session_id: renewal.raw_session_id,
            user: UserInfo::from_user(&renewal.user),
        }),
    ))
}

/// End the caller's session. Idempotent from the client's perspective.
async fn logout(
    State(state): State<AuthState>,
    Principal(principal): Principal,
) -> Result<impl IntoResponse, ApiError> {
    if let Some(key) = &principal.session_key {
        state
            .sessions
            .invalidate(key, "logout")
            .await
            .db_err("Failed to end session")?;
        info!(user_id = principal.user.id, "Logged out");
    }
    Ok((StatusCode::OK, Json(serde_json::json!({ "success": true }))))
}

#[derive(Serialize)]
struct MeResponse {
    user: UserInfo,
    has_session: bool,
}

async fn me(Principal(principal): Principal) -> impl IntoResponse {
    Json(MeResponse {
        user: UserInfo::from_user(&principal.user),
        has_session: principal.session_key.is_some(),
    })
}

/// Extract client IP address from request parts.
fn extract_client_ip(parts: &Parts) -> Option<String> {
    use axum::extract::ConnectInfo;
    use std::net::SocketAddr;

    // Check X-Forwarded-For header first (reverse proxy)
    if let Some(forwarded_for) = parts.headers.get("x-forwarded-for") {
        if let Ok(value) = forwarded_for.to_str() {
            if let Some(first_ip) = value.split(',').next() {
                let ip = first_ip.trim();
                if !ip.is_empty() {
                    return Some(ip.to_string());
                }
            }
        }
    }

    parts
        .extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ci| ci.0.ip().to_string())
}
