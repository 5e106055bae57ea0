//! Structured authentication rejections.
//!
//! Every refusal leaves the gate as the same 401 JSON shape with a stable
//! machine-readable code, so clients can branch on `code` and always know to
//! fall back to login from `action`.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

use crate::renewal::RenewalError;

/// Machine-readable reason an authentication attempt was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectCode {
    SessionExpired,
    UserNotFound,
    RenewalFailed,
    NoSessionId,
    ValidationError,
    FingerprintFailed,
    SessionNotFound,
    TokenCreationFailed,
    SessionMismatch,
}

impl RejectCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectCode::SessionExpired => "SESSION_EXPIRED",
            RejectCode::UserNotFound => "USER_NOT_FOUND",
            RejectCode::RenewalFailed => "RENEWAL_FAILED",
            RejectCode::NoSessionId => "NO_SESSION_ID",
            RejectCode::ValidationError => "VALIDATION_ERROR",
            RejectCode::FingerprintFailed => "FINGERPRINT_FAILED",
            RejectCode::SessionNotFound => "SESSION_NOT_FOUND",
            RejectCode::TokenCreationFailed => "TOKEN_CREATION_FAILED",
            RejectCode::SessionMismatch => "SESSION_MISMATCH",
        }
    }
}

impl From<&RenewalError> for RejectCode {
    fn from(err: &RenewalError) -> Self {
        match err {
            RenewalError::NoSessionId => RejectCode::NoSessionId,
            RenewalError::SessionExpired => RejectCode::SessionExpired,
            RenewalError::UserNotFound => RejectCode::UserNotFound,
            RenewalError::UserInactive => RejectCode::UserNotFound,
            RenewalError::SessionMismatch => RejectCode::SessionMismatch,
            RenewalError::TokenCreationFailed(_) => RejectCode::TokenCreationFailed,
        }
    }
}

/// A 401 refusal with the uniform JSON body.
#[derive(Debug, Clone)]
pub struct GateRejection {
    pub code: RejectCode,
    pub detail: String,
}

impl GateRejection {
    pub fn new(code: RejectCode, detail: impl Into<String>) -> Self {
        Self {
            code,
            detail: detail.into(),
        }
    }
}

impl From<&RenewalError> for GateRejection {
    fn from(err: &RenewalError) -> Self {
        Self::new(RejectCode::from(err), err.to_string())
    }
}

impl IntoResponse for GateRejection {
    fn into_response(self) -> Response {
        let body = json!({
            "error": "authentication_failed",
            "detail": self.detail,
            "code": self.code.as_str(),
            "action": "login_required",
        });
        (StatusCode::UNAUTHORIZED, Json(body)).into_response()
    }
}
