//! Durable session records.
//!
//! The durable store is the audit log and the fallback backend when the
//! cache is disabled. Rows are keyed by the hashed session id and are never
//! deleted; ending a session flips `is_ended` and records a reason.

use sqlx::sqlite::SqlitePool;

/// A durable session row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SessionRow {
    pub session_key: String,
    pub raw_id: String,
    pub profile_id: Option<i64>,
    pub fingerprint: String,
    pub enhanced_fingerprint: Option<String>,
    pub ip: String,
    pub user_agent: String,
    pub persistent: i64,
    pub created_at: i64,
    pub expires_at: i64,
    pub is_active: i64,
    pub is_ended: i64,
    pub end_reason: Option<String>,
    pub extra: String,
}

const SESSION_COLUMNS: &str = "session_key, raw_id, profile_id, fingerprint, \
     enhanced_fingerprint, ip, user_agent, persistent, created_at, expires_at, \
     is_active, is_ended, end_reason, extra";

/// Store for durable session records.
#[derive(Clone)]
pub struct SessionRecordStore {
    pool: SqlitePool,
}

impl SessionRecordStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert or update a session row. Idempotent: a retry with the same key
    /// updates the existing row rather than duplicating it.
    pub async fn upsert(&self, row: &SessionRow) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO sessions (session_key, raw_id, profile_id, fingerprint, \
             enhanced_fingerprint, ip, user_agent, persistent, created_at, expires_at, \
             is_active, is_ended, end_reason, extra) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(session_key) DO UPDATE SET \
             profile_id = excluded.profile_id, \
             enhanced_fingerprint = excluded.enhanced_fingerprint, \
             expires_at = excluded.expires_at, \
             is_active = excluded.is_active, \
             is_ended = excluded.is_ended, \
             end_reason = excluded.end_reason, \
             extra = excluded.extra",
        )
        .bind(&row.session_key)
        .bind(&row.raw_id)
        .bind(row.profile_id)
        .bind(&row.fingerprint)
        .bind(&row.enhanced_fingerprint)
        .bind(&row.ip)
        .bind(&row.user_agent)
        .bind(row.persistent)
        .bind(row.created_at)
        .bind(row.expires_at)
        .bind(row.is_active)
        .bind(row.is_ended)
        .bind(&row.end_reason)
        .bind(&row.extra)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Get a session row by its hashed key.
    pub async fn get(&self, session_key: &str) -> Result<Option<SessionRow>, sqlx::Error> {
        let row: Option<SessionRow> = sqlx::query_as(&format!(
            "SELECT {} FROM sessions WHERE session_key = ?",
            SESSION_COLUMNS
        ))
        .bind(session_key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    /// Mark a session ended with a reason. Idempotent: the first reason wins
    /// and calling again affects nothing.
    pub async fn mark_ended(&self, session_key: &str, reason: &str) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE sessions SET is_active = 0, is_ended = 1, end_reason = ? \
             WHERE session_key = ? AND is_ended = 0",
        )
        .bind(reason)
        .bind(session_key)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Extend a session's expiry. Monotonic: never shortens an existing expiry.
    pub async fn extend_expiry(
        &self,
        session_key: &str,
        new_expires_at: i64,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE sessions SET expires_at = MAX(expires_at, ?) \
             WHERE session_key = ? AND is_ended = 0",
        )
        .bind(new_expires_at)
        .bind(session_key)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// List active, unexpired sessions matching a fingerprint on either the
    /// fast or enhanced field, most recently started first. Which match wins
    /// is the caller's policy decision, not the store's.
    pub async fn list_active_by_fingerprint(
        &self,
        fingerprint: &str,
        now: i64,
    ) -> Result<Vec<SessionRow>, sqlx::Error> {
        let rows: Vec<SessionRow> = sqlx::query_as(&format!(
            "SELECT {} FROM sessions \
             WHERE (fingerprint = ?1 OR enhanced_fingerprint = ?1) \
             AND is_active = 1 AND is_ended = 0 AND expires_at > ?2 \
             ORDER BY created_at DESC",
            SESSION_COLUMNS
        ))
        .bind(fingerprint)
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// List a user's live sessions, oldest first.
    pub async fn list_active_by_profile(
        &self,
        profile_id: i64,
        now: i64,
    ) -> Result<Vec<SessionRow>, sqlx::Error> {
        let rows: Vec<SessionRow> = sqlx::query_as(&format!(
            "SELECT {} FROM sessions \
             WHERE profile_id = ? AND is_active = 1 AND is_ended = 0 AND expires_at > ? \
             ORDER BY created_at ASC",
            SESSION_COLUMNS
        ))
        .bind(profile_id)
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Merge enrichment data into a session row.
    pub async fn merge_enrichment(
        &self,
        session_key: &str,
        enhanced_fingerprint: &str,
        extra_json: &str,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE sessions SET enhanced_fingerprint = ?, extra = ? \
             WHERE session_key = ? AND is_ended = 0",
        )
        .bind(enhanced_fingerprint)
        .bind(extra_json)
        .bind(session_key)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Mark all wall-clock-expired sessions ended. Returns the number swept.
    pub async fn sweep_expired(&self, now: i64) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE sessions SET is_active = 0, is_ended = 1, end_reason = 'expired' \
             WHERE is_ended = 0 AND expires_at <= ?",
        )
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}
