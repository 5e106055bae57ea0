//! HTTP authentication middleware.

use axum::extract::{Request, State};
use axum::http::header::AUTHORIZATION;
use axum::http::{HeaderName, HeaderValue};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use tracing::{debug, warn};

use crate::fingerprint::{HeaderComponents, fast_fingerprint};
use crate::renewal::Renewal;
use crate::session::hash_session_id;

use super::{AuthenticatedPrincipal, GateRejection, GateState, RejectCode};

/// Replacement access token, set when the gate renewed in-flight.
pub const NEW_ACCESS_TOKEN: HeaderName = HeaderName::from_static("x-new-access-token");
/// Replacement refresh token.
pub const NEW_REFRESH_TOKEN: HeaderName = HeaderName::from_static("x-new-refresh-token");
/// Marker telling clients to swap in the replacement tokens.
pub const TOKEN_RENEWED: HeaderName = HeaderName::from_static("x-token-renewed");
/// Raw session id of the backing session, for clients to persist.
pub const SESSION_ID: HeaderName = HeaderName::from_static("x-session-id");

/// The gate: runs for every request and either attaches an authenticated
/// principal or answers 401 itself. Expired tokens are renewed in-flight so
/// the original request still succeeds; renewed credentials ride back on
/// response headers.
pub async fn authenticate(State(state): State<GateState>, req: Request, next: Next) -> Response {
    let path = req.uri().path().to_string();
    if state.is_exempt(&path) {
        return next.run(req).await;
    }

    let token = bearer_token(&req);

    let Some(token) = token else {
        return recover_by_fingerprint(state, req, next).await;
    };

    match state.tokens.validate_access_token(&token) {
        Ok(claims) => match validated_request(&state, claims).await {
            Ok(principal) => {
                if let Some(key) = principal.session_key.clone() {
                    // Proactive renewal: rate-limited probe, session-only
                    // extension. The still-valid access token is untouched.
                    if state.sessions.should_probe_renewal(&key).await
                        && state.sessions.smart_renew_if_needed(&key, true).await
                    {
                        debug!(session_key = %key, "Proactively extended session");
                    }
                }
                let mut req = req;
                req.extensions_mut().insert(principal);
                next.run(req).await
            }
            Err(rejection) => rejection.into_response(),
        },
        Err(_) if state.tokens.is_expired(&token) == Some(true) => {
            renew_in_flight(state, req, next, &token).await
        }
        Err(e) => {
            debug!(error = %e, "Rejected token that failed validation");
            GateRejection::new(RejectCode::ValidationError, "Invalid authentication token")
                .into_response()
        }
    }
}

fn bearer_token(req: &Request) -> Option<String> {
    req.headers()
        .get(AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::to_string)
}

/// Cookie carrying the raw session id, for clients that lean on the
/// framework session instead of the custom header.
const SESSION_COOKIE_NAME: &str = "session_id";

/// Raw session id supplied out of band, by header or cookie. Either way it
/// funnels through the same hash before lookup.
fn session_id_hint(req: &Request) -> Option<String> {
    if let Some(value) = req.headers().get(&SESSION_ID).and_then(|v| v.to_str().ok()) {
        return Some(value.to_string());
    }
    let cookies = req.headers().get("cookie")?.to_str().ok()?;
    cookies.split(';').find_map(|pair| {
        let (name, value) = pair.trim().split_once('=')?;
        (name == SESSION_COOKIE_NAME).then(|| value.to_string())
    })
}

/// Check a cryptographically valid token against the live session and user.
/// Token validity alone is never sufficient.
async fn validated_request(
    state: &GateState,
    claims: crate::jwt::AccessClaims,
) -> Result<AuthenticatedPrincipal, GateRejection> {
    let user = state
        .db
        .users()
        .get_by_uuid(&claims.sub)
        .await
        .unwrap_or(None)
        .ok_or_else(|| GateRejection::new(RejectCode::UserNotFound, "Unknown user"))?;
    if !user.is_usable() {
        return Err(GateRejection::new(
            RejectCode::UserNotFound,
            "Account is deactivated",
        ));
    }

    let session_key = match &claims.sid {
        Some(raw_sid) => {
            let key = hash_session_id(raw_sid);
            if !state.sessions.is_valid_for_token_issuance(&key).await {
                return Err(GateRejection::new(
                    RejectCode::SessionExpired,
                    "Session has expired",
                ));
            }
            if let Some(session) = state.sessions.get(&key).await {
                if let Some(profile_id) = session.profile_id {
                    if profile_id != user.id {
                        warn!(
                            session_key = %key,
                            user_id = user.id,
                            "Token subject does not own its session"
                        );
                        return Err(GateRejection::new(
                            RejectCode::SessionMismatch,
                            "Session does not belong to this user",
                        ));
                    }
                }
            }
            Some(key)
        }
        // Session-less tokens exist only for admin continuity.
        None if user.role == crate::db::UserRole::Admin => None,
        None => {
            return Err(GateRejection::new(
                RejectCode::NoSessionId,
                "Token carries no session",
            ));
        }
    };

    Ok(AuthenticatedPrincipal {
        user,
        session_key,
        claims,
    })
}

/// Expired token: renew against the live session and replay the request
/// with the fresh token, returning the new pair on response headers.
async fn renew_in_flight(
    state: GateState,
    mut req: Request,
    next: Next,
    stale_token: &str,
) -> Response {
    let hint = session_id_hint(&req);
    let renewal = match state.renewal.renew(stale_token, hint.as_deref()).await {
        Ok(renewal) => renewal,
        Err(e) => {
            debug!(error = %e, "In-flight renewal refused");
            return GateRejection::from(&e).into_response();
        }
    };

    run_with_renewal(state, &mut req, renewal, next).await
}

/// No token at all: attempt device-fingerprint session recovery before
/// giving up. A recovered session mints a brand-new pair.
async fn recover_by_fingerprint(state: GateState, mut req: Request, next: Next) -> Response {
    let components = HeaderComponents::from_headers(req.headers());
    let fingerprint = fast_fingerprint(&components);

    let Some(session) = state.sessions.find_active_by_fingerprint(&fingerprint).await else {
        return GateRejection::new(
            RejectCode::SessionNotFound,
            "No credentials and no recoverable session",
        )
        .into_response();
    };

    let renewal = match state.renewal.create_from_session(&session.key).await {
        Ok(renewal) => renewal,
        Err(e) => {
            debug!(error = %e, "Fingerprint recovery could not mint tokens");
            return GateRejection::new(
                RejectCode::FingerprintFailed,
                "Session recovery failed",
            )
            .into_response();
        }
    };

    debug!(session_key = %session.key, "Recovered session by device fingerprint");
    run_with_renewal(state, &mut req, renewal, next).await
}

/// Attach the renewed identity, replay the request with the fresh access
/// token in place, and advertise the new credentials on response headers.
async fn run_with_renewal(
    state: GateState,
    req: &mut Request,
    renewal: Renewal,
    next: Next,
) -> Response {
    let claims = match state.tokens.validate_access_token(&renewal.pair.access_token) {
        Ok(claims) => claims,
        Err(e) => {
            warn!(error = %e, "Freshly minted token failed validation");
            return GateRejection::new(
                RejectCode::TokenCreationFailed,
                "Token creation failed",
            )
            .into_response();
        }
    };

    if let Ok(value) = HeaderValue::from_str(&format!("Bearer {}", renewal.pair.access_token)) {
        req.headers_mut().insert(AUTHORIZATION, value);
    }
    req.extensions_mut().insert(AuthenticatedPrincipal {
        user: renewal.user.clone(),
        session_key: renewal.session_key.clone(),
        claims,
    });

    let mut response = next.run(std::mem::take(req)).await;

    let headers = response.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&renewal.pair.access_token) {
        headers.insert(NEW_ACCESS_TOKEN, value);
    }
    if let Ok(value) = HeaderValue::from_str(&renewal.pair.refresh_token) {
        headers.insert(NEW_REFRESH_TOKEN, value);
    }
    headers.insert(TOKEN_RENEWED, HeaderValue::from_static("true"));
    if let Some(raw_sid) = &renewal.raw_session_id {
        if let Ok(value) = HeaderValue::from_str(raw_sid) {
            headers.insert(SESSION_ID, value);
        }
    }

    response
}
