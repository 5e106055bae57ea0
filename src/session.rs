//! Hybrid session store and lifecycle management.
//!
//! Sessions live in two independently-owned backends: a TTL cache that is
//! authoritative for liveness while enabled, and a durable SQLite store that
//! keeps the audit trail and serves as the only backend when the cache is
//! disabled. The two are not transactionally linked; the session manager
//! sequences writes (durable first, then cache) and applies one fail-closed
//! policy to every backend error on the authentication path.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::cache::{Cache, CacheError, TimedCache};
use crate::db::{Database, SessionRow};

/// Cache key prefix for session records.
const SESSION_KEY_PREFIX: &str = "sess:";

/// Cache key prefix for proactive-renewal probe markers.
const PROBE_KEY_PREFIX: &str = "probe:";

/// How ambiguous fingerprint matches are resolved when several active
/// sessions share a fingerprint (shared-device scenario).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum FingerprintPolicy {
    /// Return the most recently started matching session.
    #[default]
    MostRecent,
    /// Return the oldest matching session.
    Oldest,
}

/// Session layer configuration, resolved once at startup.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Lifetime of a standard session, in hours.
    pub session_hours: u64,
    /// Lifetime of a persistent ("remember me") session, in days.
    pub persistent_days: u64,
    /// Whether the cache backend is enabled. When enabled the cache is
    /// authoritative for liveness; when disabled the durable store is used.
    pub cache_enabled: bool,
    /// Per-operation cache timeout. Must stay sub-second so a degraded
    /// cache never stalls the request path.
    pub cache_op_timeout: Duration,
    /// Fraction of total lifetime below which smart renewal triggers.
    pub renewal_fraction: f64,
    /// Maximum concurrent active sessions per user. 0 means unlimited.
    pub max_sessions_per_user: u32,
    /// Ambiguous fingerprint match resolution.
    pub fingerprint_policy: FingerprintPolicy,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            session_hours: 4,
            persistent_days: 30,
            cache_enabled: true,
            cache_op_timeout: Duration::from_millis(250),
            renewal_fraction: 0.10,
            max_sessions_per_user: 5,
            fingerprint_policy: FingerprintPolicy::MostRecent,
        }
    }
}

impl SessionConfig {
    /// Total configured lifetime in seconds for a session.
    pub fn total_secs(&self, persistent: bool) -> u64 {
        if persistent {
            self.persistent_days * 24 * 60 * 60
        } else {
            self.session_hours * 60 * 60
        }
    }
}

/// A session record: one authenticated (or anonymous-but-fingerprinted)
/// browsing context on one device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    /// Hashed id, the storage key in both backends.
    pub key: String,
    /// Raw id, embedded as the `sid` token claim. Never used as a lookup key.
    pub raw_id: String,
    pub profile_id: Option<i64>,
    pub fingerprint: String,
    pub enhanced_fingerprint: Option<String>,
    pub ip: String,
    pub user_agent: String,
    pub persistent: bool,
    pub created_at: i64,
    pub expires_at: i64,
    pub is_active: bool,
    pub is_ended: bool,
    pub end_reason: Option<String>,
    /// Open-ended enrichment data (device/location details).
    #[serde(default)]
    pub extra: BTreeMap<String, String>,
}

impl Session {
    /// A session is valid iff active, not ended, and not past its expiry.
    pub fn is_valid(&self, now: i64) -> bool {
        self.is_active && !self.is_ended && now < self.expires_at
    }

    pub fn remaining_secs(&self, now: i64) -> u64 {
        (self.expires_at - now).max(0) as u64
    }

    fn from_row(row: SessionRow) -> Self {
        let extra = serde_json::from_str(&row.extra).unwrap_or_default();
        Self {
            key: row.session_key,
            raw_id: row.raw_id,
            profile_id: row.profile_id,
            fingerprint: row.fingerprint,
            enhanced_fingerprint: row.enhanced_fingerprint,
            ip: row.ip,
            user_agent: row.user_agent,
            persistent: row.persistent != 0,
            created_at: row.created_at,
            expires_at: row.expires_at,
            is_active: row.is_active != 0,
            is_ended: row.is_ended != 0,
            end_reason: row.end_reason,
            extra,
        }
    }

    fn to_row(&self) -> SessionRow {
        SessionRow {
            session_key: self.key.clone(),
            raw_id: self.raw_id.clone(),
            profile_id: self.profile_id,
            fingerprint: self.fingerprint.clone(),
            enhanced_fingerprint: self.enhanced_fingerprint.clone(),
            ip: self.ip.clone(),
            user_agent: self.user_agent.clone(),
            persistent: self.persistent as i64,
            created_at: self.created_at,
            expires_at: self.expires_at,
            is_active: self.is_active as i64,
            is_ended: self.is_ended as i64,
            end_reason: self.end_reason.clone(),
            extra: serde_json::to_string(&self.extra).unwrap_or_else(|_| "{}".to_string()),
        }
    }
}

/// Errors from the session layer. On the authentication path these are
/// translated to "not found / not renewed" by the manager itself; they only
/// surface to callers for write operations like `create`.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Which backend is authoritative for session liveness.
///
/// The asymmetry is deliberate: when the cache is enabled a missing cache
/// key means "not found" with no durable fallback; the durable store is
/// consulted only when the cache backend is disabled entirely.
enum StorePolicy {
    CacheAuthoritative(TimedCache),
    DurableOnly,
}

/// Hybrid session store with smart renewal and device-recovery lookup.
///
/// Constructed once at process start and shared by reference; all
/// collaborators (gate, renewal service, enrichment worker) receive it via
/// dependency injection so tests can substitute cache backends.
pub struct SessionManager {
    db: Database,
    policy: StorePolicy,
    config: SessionConfig,
}

/// Hash a raw session id into the storage key. The raw id is never used as
/// a lookup key; every transport (cookie, header, `sid` claim) funnels
/// through this one function.
pub fn hash_session_id(raw_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(raw_id.as_bytes());
    hex::encode(hasher.finalize())
}

/// Generate a new unpredictable raw session id.
fn new_raw_session_id() -> String {
    let mut bytes = [0u8; 32];
    rand::rng().fill(&mut bytes[..]);
    hex::encode(bytes)
}

pub(crate) fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}

impl SessionManager {
    pub fn new(db: Database, cache: Option<Arc<dyn Cache>>, config: SessionConfig) -> Self {
        let policy = match cache {
            Some(cache) if config.cache_enabled => {
                StorePolicy::CacheAuthoritative(TimedCache::new(cache, config.cache_op_timeout))
            }
            _ => StorePolicy::DurableOnly,
        };
        Self { db, policy, config }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    fn cache(&self) -> Option<&TimedCache> {
        match &self.policy {
            StorePolicy::CacheAuthoritative(cache) => Some(cache),
            StorePolicy::DurableOnly => None,
        }
    }

    fn cache_key(session_key: &str) -> String {
        format!("{}{}", SESSION_KEY_PREFIX, session_key)
    }

    fn probe_key(session_key: &str) -> String {
        format!("{}{}", PROBE_KEY_PREFIX, session_key)
    }

    /// Create a new session. Writes the durable row first, then the cache
    /// entry with TTL equal to the remaining lifetime. Returns the session;
    /// its `raw_id` is what callers embed as the `sid` claim (and may use to
    /// seed a framework session cookie).
    pub async fn create(
        &self,
        profile_id: Option<i64>,
        fingerprint: &str,
        ip: &str,
        user_agent: &str,
        persistent: bool,
    ) -> Result<Session, SessionError> {
        let raw_id = new_raw_session_id();
        let key = hash_session_id(&raw_id);
        let now = unix_now();
        let total = self.config.total_secs(persistent);

        let session = Session {
            key: key.clone(),
            raw_id,
            profile_id,
            fingerprint: fingerprint.to_string(),
            enhanced_fingerprint: None,
            ip: ip.to_string(),
            user_agent: user_agent.to_string(),
            persistent,
            created_at: now,
            expires_at: now + total as i64,
            is_active: true,
            is_ended: false,
            end_reason: None,
            extra: BTreeMap::new(),
        };

        self.db.sessions().upsert(&session.to_row()).await?;

        if let Some(cache) = self.cache() {
            let payload = serde_json::to_string(&session)?;
            cache
                .set(&Self::cache_key(&key), &payload, Duration::from_secs(total))
                .await?;
        }

        Ok(session)
    }

    /// Write an updated session record back to the cache, preserving the
    /// given TTL. Fail-closed helper: errors are reported, not swallowed.
    async fn cache_put(
        &self,
        cache: &TimedCache,
        session: &Session,
        ttl: Duration,
    ) -> Result<(), SessionError> {
        let payload = serde_json::to_string(session)?;
        cache.set(&Self::cache_key(&session.key), &payload, ttl).await?;
        Ok(())
    }

    /// Read a session from the cache, treating backend errors and corrupt
    /// payloads as a miss.
    async fn cache_get(&self, cache: &TimedCache, session_key: &str) -> Option<Session> {
        let payload = match cache.get(&Self::cache_key(session_key)).await {
            Ok(Some(payload)) => payload,
            Ok(None) => return None,
            Err(e) => {
                warn!(error = %e, "Cache read failed; treating session as not found");
                return None;
            }
        };
        match serde_json::from_str(&payload) {
            Ok(session) => Some(session),
            Err(e) => {
                warn!(error = %e, "Corrupt cached session payload; treating as not found");
                None
            }
        }
    }

    /// Look up a session by its hashed key.
    ///
    /// Cache enabled: the cache is authoritative, a missing key is "not
    /// found" with no durable fallback. Cache disabled: the durable store is
    /// consulted instead. This asymmetry is a deliberate
    /// performance/consistency tradeoff and must be preserved.
    pub async fn get(&self, session_key: &str) -> Option<Session> {
        match &self.policy {
            StorePolicy::CacheAuthoritative(cache) => self.cache_get(cache, session_key).await,
            StorePolicy::DurableOnly => match self.db.sessions().get(session_key).await {
                Ok(row) => row.map(Session::from_row),
                Err(e) => {
                    warn!(error = %e, "Durable session read failed; treating as not found");
                    None
                }
            },
        }
    }

    /// The sole gate before minting or renewing a token: the session must
    /// exist, be active, not ended, and not expired. When falling back to
    /// the durable store, an expired row is marked ended as a side effect
    /// (lazy expiry).
    pub async fn is_valid_for_token_issuance(&self, session_key: &str) -> bool {
        let now = unix_now();
        let Some(session) = self.get(session_key).await else {
            return false;
        };

        if session.is_valid(now) {
            return true;
        }

        // Lazy expiry on the durable path: the cache evicts by TTL but the
        // durable store keeps stale rows until someone notices.
        if matches!(self.policy, StorePolicy::DurableOnly) && now >= session.expires_at {
            if let Err(e) = self.db.sessions().mark_ended(session_key, "expired").await {
                warn!(error = %e, "Failed to lazily end expired session");
            }
        }

        false
    }

    /// Extend a session nearing expiry.
    ///
    /// With `check_first`, renews only when the remaining lifetime is at or
    /// below the configured fraction (default 10%) of the total duration.
    /// With `check_first = false` renews unconditionally; used by the
    /// renewal service which has already decided renewal is warranted.
    /// Renewal is monotonic: an existing expiry is never shortened, so
    /// concurrent renewals are a harmless last-write-wins race.
    pub async fn smart_renew_if_needed(&self, session_key: &str, check_first: bool) -> bool {
        let now = unix_now();
        let Some(mut session) = self.get(session_key).await else {
            return false;
        };
        if !session.is_valid(now) {
            return false;
        }

        let total = self.config.total_secs(session.persistent);

        if check_first {
            let remaining = match self.cache() {
                Some(cache) => match cache.ttl(&Self::cache_key(session_key)).await {
                    Ok(Some(ttl)) => ttl.as_secs(),
                    Ok(None) => return false,
                    Err(e) => {
                        warn!(error = %e, "Cache TTL probe failed; not renewing");
                        return false;
                    }
                },
                None => session.remaining_secs(now),
            };
            let threshold = (total as f64 * self.config.renewal_fraction).round() as u64;
            if remaining > threshold {
                return false;
            }
        }

        let new_expires = now + total as i64;
        session.expires_at = session.expires_at.max(new_expires);

        if let Err(e) = self.db.sessions().extend_expiry(session_key, new_expires).await {
            warn!(error = %e, "Durable expiry extension failed; not renewing");
            return false;
        }

        if let Some(cache) = self.cache() {
            let ttl = Duration::from_secs(session.remaining_secs(now));
            if let Err(e) = self.cache_put(cache, &session, ttl).await {
                warn!(error = %e, "Cache refresh after renewal failed; not renewing");
                return false;
            }
        }

        true
    }

    /// End a session. Removes the cache entry and marks the durable row
    /// ended with the supplied reason. Idempotent: invalidating twice is
    /// not an error and the first reason wins.
    pub async fn invalidate(&self, session_key: &str, reason: &str) -> Result<(), SessionError> {
        if let Some(cache) = self.cache() {
            if let Err(e) = cache.delete(&Self::cache_key(session_key)).await {
                warn!(error = %e, "Cache delete during invalidation failed");
            }
            if let Err(e) = cache.delete(&Self::probe_key(session_key)).await {
                warn!(error = %e, "Probe marker delete during invalidation failed");
            }
        }
        self.db.sessions().mark_ended(session_key, reason).await?;
        Ok(())
    }

    /// Find a live session by device fingerprint (fast or enhanced match).
    ///
    /// This is the recovery path used only when no token was presented at
    /// all, so the O(active sessions) cache scan is acceptable. Falls back
    /// to the durable store when the cache has no match; a durable hit is
    /// re-warmed into the cache so subsequent lookups see it.
    pub async fn find_active_by_fingerprint(&self, fingerprint: &str) -> Option<Session> {
        let now = unix_now();

        if let Some(cache) = self.cache() {
            let keys = match cache.keys(SESSION_KEY_PREFIX).await {
                Ok(keys) => keys,
                Err(e) => {
                    warn!(error = %e, "Cache scan failed during fingerprint lookup");
                    Vec::new()
                }
            };
            let mut matches = Vec::new();
            for key in keys {
                let session_key = key.trim_start_matches(SESSION_KEY_PREFIX);
                if let Some(session) = self.cache_get(cache, session_key).await {
                    let fp_match = session.fingerprint == fingerprint
                        || session.enhanced_fingerprint.as_deref() == Some(fingerprint);
                    if fp_match && session.is_valid(now) {
                        matches.push(session);
                    }
                }
            }
            if let Some(session) = self.pick_by_policy(matches) {
                return Some(session);
            }
        }

        let rows = match self.db.sessions().list_active_by_fingerprint(fingerprint, now).await {
            Ok(rows) => rows,
            Err(e) => {
                warn!(error = %e, "Durable fingerprint lookup failed");
                return None;
            }
        };
        let session = self.pick_by_policy(rows.into_iter().map(Session::from_row).collect())?;

        if let Some(cache) = self.cache() {
            let ttl = Duration::from_secs(session.remaining_secs(now));
            if let Err(e) = self.cache_put(cache, &session, ttl).await {
                warn!(error = %e, "Failed to re-warm recovered session into cache");
                return None;
            }
        }
        Some(session)
    }

    fn pick_by_policy(&self, matches: Vec<Session>) -> Option<Session> {
        match self.config.fingerprint_policy {
            FingerprintPolicy::MostRecent => {
                matches.into_iter().max_by_key(|s| s.created_at)
            }
            FingerprintPolicy::Oldest => matches.into_iter().min_by_key(|s| s.created_at),
        }
    }

    /// Enforce the per-user concurrent session cap, ending the oldest
    /// sessions beyond the limit. Returns how many were ended.
    pub async fn enforce_limit(&self, profile_id: i64) -> Result<u64, SessionError> {
        let max = self.config.max_sessions_per_user as usize;
        if max == 0 {
            return Ok(0);
        }

        let now = unix_now();
        let rows = self.db.sessions().list_active_by_profile(profile_id, now).await?;
        if rows.len() <= max {
            return Ok(0);
        }

        let excess = rows.len() - max;
        let mut ended = 0;
        for row in rows.into_iter().take(excess) {
            self.invalidate(&row.session_key, "session_limit").await?;
            ended += 1;
        }
        if ended > 0 {
            tracing::info!(profile_id, ended, "Enforced concurrent session limit");
        }
        Ok(ended)
    }

    /// Merge asynchronously-computed enrichment into a session. Any failure
    /// here must be treated by the caller as grounds to end the session
    /// (fail closed), never left half-applied.
    pub async fn apply_enrichment(
        &self,
        session_key: &str,
        enhanced_fingerprint: &str,
        extra: BTreeMap<String, String>,
    ) -> Result<bool, SessionError> {
        let extra_json = serde_json::to_string(&extra)?;
        let updated = self
            .db
            .sessions()
            .merge_enrichment(session_key, enhanced_fingerprint, &extra_json)
            .await?;
        if !updated {
            return Ok(false);
        }

        if let Some(cache) = self.cache() {
            let cache_key = Self::cache_key(session_key);
            if let Some(mut session) = self.cache_get(cache, session_key).await {
                let ttl = cache.ttl(&cache_key).await?.unwrap_or(Duration::ZERO);
                if !ttl.is_zero() {
                    session.enhanced_fingerprint = Some(enhanced_fingerprint.to_string());
                    session.extra.extend(extra);
                    self.cache_put(cache, &session, ttl).await?;
                }
            }
        }

        Ok(true)
    }

    /// Rate limiter for the gate's proactive renewal check: at most one
    /// probe per ~renewal-fraction of the session lifetime, tracked with a
    /// cache marker key. Without a cache the durable check is cheap enough
    /// to run every time.
    pub async fn should_probe_renewal(&self, session_key: &str) -> bool {
        let Some(cache) = self.cache() else {
            return true;
        };
        let probe_key = Self::probe_key(session_key);
        match cache.get(&probe_key).await {
            Ok(Some(_)) => false,
            Ok(None) => {
                // The marker lives for ~renewal-fraction of the session's own
                // lifetime, so persistent sessions are probed on their longer
                // cadence rather than the standard one.
                let persistent = self
                    .cache_get(cache, session_key)
                    .await
                    .map(|s| s.persistent)
                    .unwrap_or(false);
                let ttl = Duration::from_secs(
                    (self.config.total_secs(persistent) as f64 * self.config.renewal_fraction)
                        as u64,
                );
                if let Err(e) = cache.set(&probe_key, "1", ttl).await {
                    warn!(error = %e, "Failed to set renewal probe marker");
                }
                true
            }
            Err(e) => {
                warn!(error = %e, "Renewal probe marker read failed; skipping probe");
                false
            }
        }
    }
}
