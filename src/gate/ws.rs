//! WebSocket authentication variant.
//!
//! Browsers cannot set an Authorization header on a WebSocket handshake, so
//! credentials arrive as query parameters and both the token AND the session
//! id are required. Failures are reported with distinguishing close codes
//! after the upgrade completes, since a refused handshake gives clients no
//! way to tell why.

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::Response;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tracing::debug;

use crate::db::User;
use crate::jwt::TokenPair;
use crate::session::hash_session_id;

use super::GateState;

/// Close code: required query parameters missing.
const CLOSE_MISSING_PARAMS: u16 = 4400;
/// Close code: token invalid and not renewable.
const CLOSE_INVALID_TOKEN: u16 = 4401;
/// Close code: session expired, not found, or not owned by the subject.
const CLOSE_SESSION_REFUSED: u16 = 4403;

const PING_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
pub struct WsAuthParams {
    token: Option<String>,
    session_id: Option<String>,
}

struct WsIdentity {
    user: User,
    /// Fresh pair when the presented token was expired and renewed during
    /// the handshake; delivered in the first server message.
    renewed: Option<TokenPair>,
}

pub async fn ws_handler(
    State(state): State<GateState>,
    Query(params): Query<WsAuthParams>,
    ws: WebSocketUpgrade,
) -> Response {
    let outcome = authorize(&state, &params).await;
    ws.on_upgrade(move |socket| handle_socket(socket, outcome))
}

async fn authorize(
    state: &GateState,
    params: &WsAuthParams,
) -> Result<WsIdentity, (u16, &'static str)> {
    let (Some(token), Some(raw_sid)) = (&params.token, &params.session_id) else {
        return Err((CLOSE_MISSING_PARAMS, "token and session_id are required"));
    };

    let session_key = hash_session_id(raw_sid);
    if !state.sessions.is_valid_for_token_issuance(&session_key).await {
        return Err((CLOSE_SESSION_REFUSED, "session expired or not found"));
    }

    match state.tokens.validate_access_token(token) {
        Ok(claims) => {
            // A token bound to some other session cannot ride this one.
            if let Some(sid) = &claims.sid {
                if hash_session_id(sid) != session_key {
                    return Err((CLOSE_SESSION_REFUSED, "token is bound to another session"));
                }
            }
            let user = state
                .db
                .users()
                .get_by_uuid(&claims.sub)
                .await
                .unwrap_or(None)
                .filter(User::is_usable)
                .ok_or((CLOSE_INVALID_TOKEN, "unknown or deactivated user"))?;
            if let Some(session) = state.sessions.get(&session_key).await {
                if session.profile_id.is_some_and(|id| id != user.id) {
                    return Err((CLOSE_SESSION_REFUSED, "session does not belong to this user"));
                }
            }
            Ok(WsIdentity { user, renewed: None })
        }
        Err(_) if state.tokens.is_expired(token) == Some(true) => {
            match state.renewal.renew(token, Some(raw_sid)).await {
                Ok(renewal) => {
                    debug!(user_id = renewal.user.id, "Renewed token during ws handshake");
                    Ok(WsIdentity {
                        user: renewal.user,
                        renewed: Some(renewal.pair),
                    })
                }
                Err(e) => {
                    debug!(error = %e, "WebSocket renewal refused");
                    Err((CLOSE_SESSION_REFUSED, "session expired or not found"))
                }
            }
        }
        Err(_) => Err((CLOSE_INVALID_TOKEN, "invalid authentication token")),
    }
}

async fn handle_socket(mut socket: WebSocket, outcome: Result<WsIdentity, (u16, &'static str)>) {
    let identity = match outcome {
        Ok(identity) => identity,
        Err((code, reason)) => {
            let _ = socket
                .send(Message::Close(Some(CloseFrame {
                    code,
                    reason: reason.into(),
                })))
                .await;
            return;
        }
    };

    let mut connected = json!({
        "type": "connected",
        "user": identity.user.uuid,
    });
    if let Some(pair) = &identity.renewed {
        connected["token_renewed"] = json!(true);
        connected["access_token"] = json!(pair.access_token);
        connected["refresh_token"] = json!(pair.refresh_token);
    }
    if socket
        .send(Message::Text(connected.to_string().into()))
        .await
        .is_err()
    {
        return;
    }

    let mut ping = tokio::time::interval(PING_INTERVAL);
    ping.tick().await;

    loop {
        tokio::select! {
            _ = ping.tick() => {
                if socket.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
            }
            msg = socket.recv() => {
                match msg {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
        }
    }
}
