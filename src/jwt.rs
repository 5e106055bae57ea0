//! JWT issuance and validation with an embedded session claim.
//!
//! Every token carries a `sid` claim naming the session it belongs to, so a
//! token can never act independently of its session: possession of a valid,
//! unexpired token is necessary but not sufficient, the session must
//! independently validate. The one exception is admin continuity renewal,
//! where `sid` may be absent.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::db::{User, UserRole};

/// Token type for distinguishing access vs refresh tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenType {
    Access,
    Refresh,
}

/// Access token duration: 15 minutes. Deliberately much shorter than the
/// session lifetime so renewal is exercised routinely, not only at session end.
pub const ACCESS_TOKEN_DURATION_SECS: u64 = 15 * 60;

/// Refresh token duration: 2 weeks.
pub const REFRESH_TOKEN_DURATION_SECS: u64 = 14 * 24 * 60 * 60;

/// JWT claims for access tokens.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessClaims {
    /// Subject (user UUID)
    pub sub: String,
    /// Raw session id this token is bound to. Absent only for admin
    /// continuity tokens.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub sid: Option<String>,
    /// User role
    pub role: UserRole,
    /// Whether the account is verified
    pub verified: bool,
    /// Token type
    #[serde(rename = "typ")]
    pub token_type: TokenType,
    /// Issued at (Unix timestamp)
    pub iat: u64,
    /// Expiration time (Unix timestamp)
    pub exp: u64,
}

/// JWT claims for refresh tokens (tracked with JTI).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshClaims {
    /// JWT ID (unique identifier for rotation tracking)
    pub jti: String,
    /// Subject (user UUID)
    pub sub: String,
    /// Raw session id this token is bound to.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub sid: Option<String>,
    /// Token type
    #[serde(rename = "typ")]
    pub token_type: TokenType,
    /// Issued at (Unix timestamp)
    pub iat: u64,
    /// Expiration time (Unix timestamp)
    pub exp: u64,
}

/// An access/refresh token pair minted together.
#[derive(Debug, Clone, Serialize)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    /// Access token lifetime in seconds
    pub expires_in: u64,
}

/// Claims recovered from a token payload WITHOUT verifying signature or
/// expiry. Only the renewal path may use this, and only to recover the
/// session id; the session check is the real trust boundary.
#[derive(Debug, Clone, Default)]
pub struct PeekedClaims {
    pub sub: Option<String>,
    pub sid: Option<String>,
    pub role: Option<UserRole>,
}

/// Service for JWT operations. Constructed once at startup and shared.
#[derive(Clone)]
pub struct TokenService {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
}

impl TokenService {
    /// Create a new token service with the given signing secret.
    pub fn new(secret: &[u8]) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(secret),
            decoding_key: DecodingKey::from_secret(secret),
        }
    }

    /// Issue an access/refresh token pair for a user, bound to a session.
    ///
    /// Callers must have validated the session before calling this: a token
    /// is never issued for a session that does not exist or is not active
    /// (session-first ordering). `raw_session_id` is `None` only for the
    /// admin continuity path.
    pub fn issue_pair(
        &self,
        user: &User,
        raw_session_id: Option<&str>,
    ) -> Result<TokenPair, JwtError> {
        let now = unix_now()?;
        let sid = raw_session_id.map(str::to_string);

        let access = AccessClaims {
            sub: user.uuid.clone(),
            sid: sid.clone(),
            role: user.role,
            verified: user.verified,
            token_type: TokenType::Access,
            iat: now,
            exp: now + ACCESS_TOKEN_DURATION_SECS,
        };

        let refresh = RefreshClaims {
            jti: uuid::Uuid::new_v4().to_string(),
            sub: user.uuid.clone(),
            sid,
            token_type: TokenType::Refresh,
            iat: now,
            exp: now + REFRESH_TOKEN_DURATION_SECS,
        };

        let access_token = jsonwebtoken::encode(&Header::default(), &access, &self.encoding_key)
            .map_err(JwtError::Encoding)?;
        let refresh_token = jsonwebtoken::encode(&Header::default(), &refresh, &self.encoding_key)
            .map_err(JwtError::Encoding)?;

        Ok(TokenPair {
            access_token,
            refresh_token,
            expires_in: ACCESS_TOKEN_DURATION_SECS,
        })
    }

    /// Validate and decode an access token. Verifies signature and expiry
    /// with zero leeway. Does NOT check the session; that is a separate,
    /// deliberately decoupled step composed by the authentication gate.
    pub fn validate_access_token(&self, token: &str) -> Result<AccessClaims, JwtError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;

        let token_data =
            jsonwebtoken::decode::<AccessClaims>(token, &self.decoding_key, &validation)
                .map_err(JwtError::Decoding)?;

        if token_data.claims.token_type != TokenType::Access {
            return Err(JwtError::WrongTokenType);
        }

        Ok(token_data.claims)
    }

    /// Validate and decode a refresh token.
    pub fn validate_refresh_token(&self, token: &str) -> Result<RefreshClaims, JwtError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;

        let token_data =
            jsonwebtoken::decode::<RefreshClaims>(token, &self.decoding_key, &validation)
                .map_err(JwtError::Decoding)?;

        if token_data.claims.token_type != TokenType::Refresh {
            return Err(JwtError::WrongTokenType);
        }

        Ok(token_data.claims)
    }

    /// Cheap expiry probe without full validation. Returns `None` when the
    /// payload cannot be parsed at all.
    pub fn is_expired(&self, token: &str) -> Option<bool> {
        let payload = decode_payload(token).ok()?;
        let exp = payload.get("exp")?.as_u64()?;
        let now = unix_now().ok()?;
        Some(exp <= now)
    }

    /// Recover claims from a token WITHOUT verifying signature or expiry.
    ///
    /// This is not token validation. It exists so the renewal path can
    /// recover the `sid` claim from an expired token and then check
    /// session-level validity, which is the real trust boundary.
    pub fn peek_claims(&self, token: &str) -> Result<PeekedClaims, JwtError> {
        let payload = decode_payload(token)?;
        let get_str =
            |name: &str| payload.get(name).and_then(|v| v.as_str()).map(str::to_string);

        Ok(PeekedClaims {
            sub: get_str("sub"),
            sid: get_str("sid"),
            role: get_str("role").map(|r| UserRole::from_str(&r)),
        })
    }
}

/// Decode the payload segment of a JWT without any verification.
fn decode_payload(token: &str) -> Result<serde_json::Value, JwtError> {
    let mut segments = token.split('.');
    let payload = match (segments.next(), segments.next(), segments.next()) {
        (Some(_), Some(payload), Some(_)) => payload,
        _ => return Err(JwtError::MalformedToken),
    };
    let bytes = URL_SAFE_NO_PAD
        .decode(payload)
        .map_err(|_| JwtError::MalformedToken)?;
    serde_json::from_slice(&bytes).map_err(|_| JwtError::MalformedToken)
}

fn unix_now() -> Result<u64, JwtError> {
    Ok(SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|_| JwtError::TimeError)?
        .as_secs())
}

/// Errors that can occur during JWT operations.
#[derive(Debug)]
pub enum JwtError {
    /// Error encoding the token
    Encoding(jsonwebtoken::errors::Error),
    /// Error decoding the token
    Decoding(jsonwebtoken::errors::Error),
    /// Token is not structurally a JWT
    MalformedToken,
    /// System time error
    TimeError,
    /// Wrong token type (e.g., using refresh token as access token)
    WrongTokenType,
}

impl std::fmt::Display for JwtError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JwtError::Encoding(e) => write!(f, "Failed to encode token: {}", e),
            JwtError::Decoding(e) => write!(f, "Failed to decode token: {}", e),
            JwtError::MalformedToken => write!(f, "Malformed token"),
            JwtError::TimeError => write!(f, "System time error"),
            JwtError::WrongTokenType => write!(f, "Wrong token type"),
        }
    }
}

impl std::error::Error for JwtError {}
