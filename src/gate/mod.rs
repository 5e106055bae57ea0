//! The authentication gate.
//!
//! One middleware guards every non-exempt route and owns the full decision
//! tree: validate token, probe proactive renewal, renew expired tokens
//! in-flight, or recover a session by device fingerprint when no token was
//! presented. Handlers downstream only ever see an authenticated principal.

mod errors;
mod http;
mod ws;

use std::sync::Arc;

use axum::extract::FromRequestParts;
use axum::http::request::Parts;

use crate::db::{Database, User};
use crate::jwt::{AccessClaims, TokenService};
use crate::renewal::RenewalService;
use crate::session::SessionManager;

pub use errors::{GateRejection, RejectCode};
pub use http::{NEW_ACCESS_TOKEN, NEW_REFRESH_TOKEN, SESSION_ID, TOKEN_RENEWED, authenticate};
pub use ws::ws_handler;

/// Shared state for the gate and the WebSocket variant.
#[derive(Clone)]
pub struct GateState {
    pub db: Database,
    pub sessions: Arc<SessionManager>,
    pub tokens: Arc<TokenService>,
    pub renewal: Arc<RenewalService>,
    /// Path prefixes that bypass authentication entirely.
    pub exempt: Arc<Vec<String>>,
}

impl GateState {
    fn is_exempt(&self, path: &str) -> bool {
        self.exempt.iter().any(|prefix| path.starts_with(prefix))
    }
}

/// The authenticated identity attached to a request by the gate.
#[derive(Debug, Clone)]
pub struct AuthenticatedPrincipal {
    pub user: User,
    /// Hashed key of the backing session. `None` only for admin continuity
    /// tokens, which carry no session.
    pub session_key: Option<String>,
    pub claims: AccessClaims,
}

/// Extractor giving handlers the gate-attached principal.
pub struct Principal(pub AuthenticatedPrincipal);

impl<S> FromRequestParts<S> for Principal
where
    S: Send + Sync,
{
    type Rejection = GateRejection;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<AuthenticatedPrincipal>()
            .cloned()
            .map(Principal)
            .ok_or_else(|| {
                GateRejection::new(RejectCode::ValidationError, "Authentication required")
            })
    }
}
