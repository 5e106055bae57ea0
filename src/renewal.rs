//! Token renewal bound to session validity.
//!
//! A stale or expiring token is exchanged for a fresh pair only if the
//! session it names is still alive. The expired token is used purely as a
//! carrier for the session id; the session check is the trust boundary.

use std::sync::Arc;

use tracing::{info, warn};

use crate::db::{Database, User, UserRole};
use crate::jwt::{TokenPair, TokenService};
use crate::session::{SessionManager, hash_session_id};

/// Why a renewal was refused. Maps one-to-one onto gate reject codes.
#[derive(Debug, thiserror::Error)]
pub enum RenewalError {
    #[error("no session id available for renewal")]
    NoSessionId,
    #[error("session expired or not found")]
    SessionExpired,
    #[error("user not found")]
    UserNotFound,
    #[error("user account is not usable")]
    UserInactive,
    #[error("token subject does not own the session")]
    SessionMismatch,
    #[error("failed to mint replacement tokens: {0}")]
    TokenCreationFailed(#[from] crate::jwt::JwtError),
}

/// A successful renewal: the fresh pair plus the identity it was minted for.
#[derive(Debug, Clone)]
pub struct Renewal {
    pub pair: TokenPair,
    pub user: User,
    /// Hashed key of the backing session. `None` for admin continuity.
    pub session_key: Option<String>,
    /// Raw session id embedded in the new tokens. `None` for admin continuity.
    pub raw_session_id: Option<String>,
}

/// Exchanges stale tokens for fresh pairs, session permitting.
pub struct RenewalService {
    db: Database,
    sessions: Arc<SessionManager>,
    tokens: Arc<TokenService>,
}

impl RenewalService {
    pub fn new(db: Database, sessions: Arc<SessionManager>, tokens: Arc<TokenService>) -> Self {
        Self { db, sessions, tokens }
    }

    /// Renew an expired (or expiring) access token.
    ///
    /// The token's signature and expiry are deliberately NOT verified here;
    /// its payload is only peeked to recover the session id and subject.
    /// `session_id_hint` is a raw session id supplied out of band (header or
    /// query parameter) and is used when the token carries no `sid` claim.
    pub async fn renew(
        &self,
        stale_token: &str,
        session_id_hint: Option<&str>,
    ) -> Result<Renewal, RenewalError> {
        let peeked = self
            .tokens
            .peek_claims(stale_token)
            .map_err(|_| RenewalError::NoSessionId)?;

        let raw_sid = peeked.sid.clone().or_else(|| session_id_hint.map(str::to_string));

        let Some(raw_sid) = raw_sid else {
            // Admin continuity: a privileged account may renew without a
            // session so an expiring token cannot lock an operator out
            // mid-intervention. The only path that mints sid-less tokens.
            if peeked.role == Some(UserRole::Admin) {
                if let Some(sub) = &peeked.sub {
                    return self.renew_admin_continuity(sub).await;
                }
            }
            return Err(RenewalError::NoSessionId);
        };

        let session_key = hash_session_id(&raw_sid);

        if !self.sessions.is_valid_for_token_issuance(&session_key).await {
            return Err(RenewalError::SessionExpired);
        }
        let session = self
            .sessions
            .get(&session_key)
            .await
            .ok_or(RenewalError::SessionExpired)?;

        // Prefer the token subject; an anonymous-recovery session row may
        // predate login and carry no profile.
        let user = match &peeked.sub {
            Some(uuid) => self.db.users().get_by_uuid(uuid).await.unwrap_or(None),
            None => match session.profile_id {
                Some(id) => self.db.users().get_by_id(id).await.unwrap_or(None),
                None => None,
            },
        };
        let user = user.ok_or(RenewalError::UserNotFound)?;
        if !user.is_usable() {
            return Err(RenewalError::UserInactive);
        }

        // The subject must own the session it is trying to renew against.
        if let Some(profile_id) = session.profile_id {
            if profile_id != user.id {
                warn!(
                    session_key = %session_key,
                    user_id = user.id,
                    session_profile = profile_id,
                    "Renewal refused: token subject does not own session"
                );
                return Err(RenewalError::SessionMismatch);
            }
        }

        let pair = self.tokens.issue_pair(&user, Some(&session.raw_id))?;

        // Renewal already decided: extend unconditionally.
        self.sessions.smart_renew_if_needed(&session_key, false).await;

        info!(user_id = user.id, session_key = %session_key, "Renewed token pair");

        Ok(Renewal {
            pair,
            user,
            session_key: Some(session_key),
            raw_session_id: Some(session.raw_id),
        })
    }

    /// Mint a token pair directly from a live session, used by the
    /// fingerprint recovery path where no token exists at all.
    pub async fn create_from_session(&self, session_key: &str) -> Result<Renewal, RenewalError> {
        if !self.sessions.is_valid_for_token_issuance(session_key).await {
            return Err(RenewalError::SessionExpired);
        }
        let session = self
            .sessions
            .get(session_key)
            .await
            .ok_or(RenewalError::SessionExpired)?;

        let profile_id = session.profile_id.ok_or(RenewalError::UserNotFound)?;
        let user = self
            .db
            .users()
            .get_by_id(profile_id)
            .await
            .unwrap_or(None)
            .ok_or(RenewalError::UserNotFound)?;
        if !user.is_usable() {
            return Err(RenewalError::UserInactive);
        }

        let pair = self.tokens.issue_pair(&user, Some(&session.raw_id))?;

        // Recovery also counts as activity; extend only if near expiry.
        self.sessions.smart_renew_if_needed(session_key, true).await;

        info!(user_id = user.id, session_key = %session_key, "Minted tokens from recovered session");

        Ok(Renewal {
            pair,
            user,
            session_key: Some(session_key.to_string()),
            raw_session_id: Some(session.raw_id),
        })
    }

    async fn renew_admin_continuity(&self, sub: &str) -> Result<Renewal, RenewalError> {
        let user = self
            .db
            .users()
            .get_by_uuid(sub)
            .await
            .unwrap_or(None)
            .ok_or(RenewalError::UserNotFound)?;
        if !user.is_usable() {
            return Err(RenewalError::UserInactive);
        }
        // Role comes from the database, not the unverified token payload.
        if user.role != UserRole::Admin {
            return Err(RenewalError::NoSessionId);
        }

        warn!(user_id = user.id, "Admin continuity renewal without session");

        let pair = self.tokens.issue_pair(&user, None)?;
        Ok(Renewal {
            pair,
            user,
            session_key: None,
            raw_session_id: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::session::SessionConfig;

    struct Fixture {
        db: Database,
        sessions: Arc<SessionManager>,
        tokens: Arc<TokenService>,
        renewal: RenewalService,
    }

    async fn fixture() -> Fixture {
        let db = Database::open(":memory:").await.unwrap();
        let sessions = Arc::new(SessionManager::new(
            db.clone(),
            Some(Arc::new(MemoryCache::new())),
            SessionConfig::default(),
        ));
        let tokens = Arc::new(TokenService::new(b"test-secret-key-for-testing"));
        let renewal = RenewalService::new(db.clone(), sessions.clone(), tokens.clone());
        Fixture { db, sessions, tokens, renewal }
    }

    async fn create_user(db: &Database, uuid: &str, role: UserRole) -> User {
        let id = db.users().create(uuid, uuid, role).await.unwrap();
        db.users().get_by_id(id).await.unwrap().unwrap()
    }

    /// An access token whose exp is in the past but whose claims are intact.
    fn stale_token(user: &User, raw_sid: Option<&str>) -> String {
        use crate::jwt::{AccessClaims, TokenType};
        use jsonwebtoken::{EncodingKey, Header};
        let now = crate::session::unix_now() as u64;
        let claims = AccessClaims {
            sub: user.uuid.clone(),
            sid: raw_sid.map(str::to_string),
            role: user.role,
            verified: user.verified,
            token_type: TokenType::Access,
            iat: now - 1000,
            exp: now - 100,
        };
        jsonwebtoken::encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(b"test-secret-key-for-testing"),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_renew_with_live_session() {
        let f = fixture().await;
        let user = create_user(&f.db, "uuid-1", UserRole::User).await;
        let session = f
            .sessions
            .create(Some(user.id), "fp", "ip", "ua", false)
            .await
            .unwrap();

        let token = stale_token(&user, Some(&session.raw_id));
        let renewal = f.renewal.renew(&token, None).await.unwrap();

        assert_eq!(renewal.user.id, user.id);
        assert_eq!(renewal.session_key.as_deref(), Some(session.key.as_str()));

        // The fresh token is fully valid and bound to the same session.
        let claims = f.tokens.validate_access_token(&renewal.pair.access_token).unwrap();
        assert_eq!(claims.sid.as_deref(), Some(session.raw_id.as_str()));
        assert_eq!(claims.sub, user.uuid);
    }

    #[tokio::test]
    async fn test_renew_refused_without_session() {
        let f = fixture().await;
        let user = create_user(&f.db, "uuid-1", UserRole::User).await;
        let session = f
            .sessions
            .create(Some(user.id), "fp", "ip", "ua", false)
            .await
            .unwrap();
        f.sessions.invalidate(&session.key, "logout").await.unwrap();

        let token = stale_token(&user, Some(&session.raw_id));
        let err = f.renewal.renew(&token, None).await.unwrap_err();
        assert!(matches!(err, RenewalError::SessionExpired));
    }

    #[tokio::test]
    async fn test_renew_uses_session_id_hint() {
        let f = fixture().await;
        let user = create_user(&f.db, "uuid-1", UserRole::User).await;
        let session = f
            .sessions
            .create(Some(user.id), "fp", "ip", "ua", false)
            .await
            .unwrap();

        // Token has no sid claim; hint supplies the raw id out of band.
        let token = stale_token(&user, None);
        let renewal = f.renewal.renew(&token, Some(&session.raw_id)).await.unwrap();
        assert_eq!(renewal.session_key.as_deref(), Some(session.key.as_str()));
    }

    #[tokio::test]
    async fn test_renew_no_session_id_anywhere() {
        let f = fixture().await;
        let user = create_user(&f.db, "uuid-1", UserRole::User).await;

        let token = stale_token(&user, None);
        let err = f.renewal.renew(&token, None).await.unwrap_err();
        assert!(matches!(err, RenewalError::NoSessionId));
    }

    #[tokio::test]
    async fn test_renew_rejects_session_mismatch() {
        let f = fixture().await;
        let owner = create_user(&f.db, "uuid-owner", UserRole::User).await;
        let intruder = create_user(&f.db, "uuid-intruder", UserRole::User).await;
        let session = f
            .sessions
            .create(Some(owner.id), "fp", "ip", "ua", false)
            .await
            .unwrap();

        let token = stale_token(&intruder, Some(&session.raw_id));
        let err = f.renewal.renew(&token, None).await.unwrap_err();
        assert!(matches!(err, RenewalError::SessionMismatch));
    }

    #[tokio::test]
    async fn test_renew_rejects_unusable_user() {
        let f = fixture().await;
        let user = create_user(&f.db, "uuid-1", UserRole::User).await;
        let session = f
            .sessions
            .create(Some(user.id), "fp", "ip", "ua", false)
            .await
            .unwrap();
        f.db.users().mark_profile_deleted(user.id).await.unwrap();

        let token = stale_token(&user, Some(&session.raw_id));
        let err = f.renewal.renew(&token, None).await.unwrap_err();
        assert!(matches!(err, RenewalError::UserInactive));
    }

    #[tokio::test]
    async fn test_admin_continuity_without_session() {
        let f = fixture().await;
        let admin = create_user(&f.db, "uuid-admin", UserRole::Admin).await;

        let token = stale_token(&admin, None);
        let renewal = f.renewal.renew(&token, None).await.unwrap();

        assert!(renewal.session_key.is_none());
        let claims = f.tokens.validate_access_token(&renewal.pair.access_token).unwrap();
        assert_eq!(claims.sid, None);
    }

    #[tokio::test]
    async fn test_admin_continuity_requires_db_role() {
        let f = fixture().await;
        let user = create_user(&f.db, "uuid-1", UserRole::User).await;

        // Forge an admin role into the unverified payload; the database
        // row still says plain user, so continuity must be refused.
        use crate::jwt::{AccessClaims, TokenType};
        use jsonwebtoken::{EncodingKey, Header};
        let now = crate::session::unix_now() as u64;
        let claims = AccessClaims {
            sub: user.uuid.clone(),
            sid: None,
            role: UserRole::Admin,
            verified: true,
            token_type: TokenType::Access,
            iat: now - 1000,
            exp: now - 100,
        };
        let token = jsonwebtoken::encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(b"test-secret-key-for-testing"),
        )
        .unwrap();

        let err = f.renewal.renew(&token, None).await.unwrap_err();
        assert!(matches!(err, RenewalError::NoSessionId));
    }

    #[tokio::test]
    async fn test_create_from_session() {
        let f = fixture().await;
        let user = create_user(&f.db, "uuid-1", UserRole::User).await;
        let session = f
            .sessions
            .create(Some(user.id), "fp", "ip", "ua", false)
            .await
            .unwrap();

        let renewal = f.renewal.create_from_session(&session.key).await.unwrap();
        assert_eq!(renewal.user.id, user.id);
        assert_eq!(renewal.raw_session_id.as_deref(), Some(session.raw_id.as_str()));
    }

    #[tokio::test]
    async fn test_create_from_session_requires_profile() {
        let f = fixture().await;
        let session = f.sessions.create(None, "fp", "ip", "ua", false).await.unwrap();

        let err = f.renewal.create_from_session(&session.key).await.unwrap_err();
        assert!(matches!(err, RenewalError::UserNotFound));
    }

    #[tokio::test]
    async fn test_concurrent_renewals_both_succeed() {
        let f = fixture().await;
        let user = create_user(&f.db, "uuid-1", UserRole::User).await;
        let session = f
            .sessions
            .create(Some(user.id), "fp", "ip", "ua", false)
            .await
            .unwrap();

        let t1 = stale_token(&user, Some(&session.raw_id));
        let t2 = stale_token(&user, Some(&session.raw_id));
        let (r1, r2) = tokio::join!(f.renewal.renew(&t1, None), f.renewal.renew(&t2, None));

        // Monotonic expiry makes the race harmless: both renewals win.
        assert!(r1.is_ok());
        assert!(r2.is_ok());
        let after = f.sessions.get(&session.key).await.unwrap();
        assert!(after.expires_at >= session.expires_at);
    }
}
