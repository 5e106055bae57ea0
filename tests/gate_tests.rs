//! End-to-end authentication gate behavior over HTTP.

mod common;

use common::{TEST_UA, create_user, expired_access_token, login, setup, setup_without_cache};
use sessiongate::db::UserRole;

#[tokio::test]
async fn test_login_returns_tokens_and_session_id() {
    let ctx = setup().await;
    create_user(&ctx.db, "alice", UserRole::User).await;

    let result = login(&ctx, "alice").await;
    assert!(!result.access_token.is_empty());
    assert!(!result.refresh_token.is_empty());
    // Raw session id, not the hashed storage key.
    assert_eq!(result.session_id.len(), 64);
}

#[tokio::test]
async fn test_login_unknown_user_rejected() {
    let ctx = setup().await;

    let response = ctx
        .client
        .post(ctx.url("/auth/session"))
        .header("user-agent", TEST_UA)
        .json(&serde_json::json!({ "username": "nobody" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 401);

    // Login is gate-exempt: this is the handler's error shape, which has
    // no machine-readable reject code.
    let body: serde_json::Value = response.json().await.unwrap();
    assert!(body.get("code").is_none());
}

#[tokio::test]
async fn test_valid_token_reaches_handler() {
    let ctx = setup().await;
    create_user(&ctx.db, "alice", UserRole::User).await;
    let auth = login(&ctx, "alice").await;

    let response = ctx
        .client
        .get(ctx.url("/auth/me"))
        .bearer_auth(&auth.access_token)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["user"]["username"], "alice");
    assert_eq!(body["has_session"], true);
}

#[tokio::test]
async fn test_missing_token_rejected_with_code() {
    let ctx = setup().await;

    let response = ctx.client.get(ctx.url("/auth/me")).send().await.unwrap();
    assert_eq!(response.status(), 401);

    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["code"], "SESSION_NOT_FOUND");
    assert_eq!(body["action"], "login_required");
}

#[tokio::test]
async fn test_garbage_token_rejected() {
    let ctx = setup().await;

    let response = ctx
        .client
        .get(ctx.url("/auth/me"))
        .bearer_auth("not-a-jwt")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 401);

    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["code"], "VALIDATION_ERROR");
}

#[tokio::test]
async fn test_expired_token_renewed_in_flight() {
    let ctx = setup().await;
    let user = create_user(&ctx.db, "alice", UserRole::User).await;
    let auth = login(&ctx, "alice").await;

    let stale = expired_access_token(&user, Some(&auth.session_id));
    let response = ctx
        .client
        .get(ctx.url("/auth/me"))
        .bearer_auth(&stale)
        .send()
        .await
        .unwrap();

    // The original request succeeds and the fresh pair rides the response.
    assert_eq!(response.status(), 200);
    assert_eq!(
        response.headers().get("x-token-renewed").unwrap(),
        "true"
    );
    let new_access = response
        .headers()
        .get("x-new-access-token")
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    assert!(response.headers().get("x-new-refresh-token").is_some());
    assert_eq!(
        response.headers().get("x-session-id").unwrap().to_str().unwrap(),
        auth.session_id
    );

    // The replacement token works on its own.
    let response = ctx
        .client
        .get(ctx.url("/auth/me"))
        .bearer_auth(&new_access)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
}

#[tokio::test]
async fn test_expired_token_after_logout_is_dead() {
    let ctx = setup().await;
    let user = create_user(&ctx.db, "alice", UserRole::User).await;
    let auth = login(&ctx, "alice").await;

    let response = ctx
        .client
        .post(ctx.url("/auth/logout"))
        .bearer_auth(&auth.access_token)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    // With the session gone, an expired token cannot be renewed.
    let stale = expired_access_token(&user, Some(&auth.session_id));
    let response = ctx
        .client
        .get(ctx.url("/auth/me"))
        .bearer_auth(&stale)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 401);

    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["code"], "SESSION_EXPIRED");
    assert_eq!(body["action"], "login_required");
}

#[tokio::test]
async fn test_valid_token_dies_with_its_session() {
    let ctx = setup().await;
    create_user(&ctx.db, "alice", UserRole::User).await;
    let auth = login(&ctx, "alice").await;

    ctx.client
        .post(ctx.url("/auth/logout"))
        .bearer_auth(&auth.access_token)
        .send()
        .await
        .unwrap();

    // The token is cryptographically pristine and unexpired, yet useless:
    // session validity is required on every request.
    let response = ctx
        .client
        .get(ctx.url("/auth/me"))
        .bearer_auth(&auth.access_token)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 401);

    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["code"], "SESSION_EXPIRED");
}

#[tokio::test]
async fn test_fingerprint_recovery_without_token() {
    let ctx = setup().await;
    create_user(&ctx.db, "alice", UserRole::User).await;
    login(&ctx, "alice").await;

    // Same device headers, no Authorization at all.
    let response = ctx
        .client
        .get(ctx.url("/auth/me"))
        .header("user-agent", TEST_UA)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    // Recovery minted a brand-new pair.
    assert_eq!(response.headers().get("x-token-renewed").unwrap(), "true");
    assert!(response.headers().get("x-new-access-token").is_some());

    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["user"]["username"], "alice");
}

#[tokio::test]
async fn test_fingerprint_recovery_needs_matching_device() {
    let ctx = setup().await;
    create_user(&ctx.db, "alice", UserRole::User).await;
    login(&ctx, "alice").await;

    // Different user agent, different fingerprint: no recovery.
    let response = ctx
        .client
        .get(ctx.url("/auth/me"))
        .header("user-agent", "curl/8.0")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 401);

    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["code"], "SESSION_NOT_FOUND");
}

#[tokio::test]
async fn test_renew_endpoint_with_session_hint() {
    let ctx = setup().await;
    let user = create_user(&ctx.db, "alice", UserRole::User).await;
    let auth = login(&ctx, "alice").await;

    // Token without a sid claim; the body supplies the session id.
    let stale = expired_access_token(&user, None);
    let response = ctx
        .client
        .post(ctx.url("/auth/renew"))
        .json(&serde_json::json!({
            "access_token": stale,
            "session_id": auth.session_id,
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["session_id"], auth.session_id.as_str());
    assert!(body["access_token"].as_str().is_some());
}

#[tokio::test]
async fn test_in_flight_renewal_accepts_cookie_session_id() {
    let ctx = setup().await;
    let user = create_user(&ctx.db, "alice", UserRole::User).await;
    let auth = login(&ctx, "alice").await;

    // Expired token without a sid claim; the session cookie carries the id.
    let stale = expired_access_token(&user, None);
    let response = ctx
        .client
        .get(ctx.url("/auth/me"))
        .bearer_auth(&stale)
        .header("cookie", format!("theme=dark; session_id={}", auth.session_id))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.headers().get("x-token-renewed").unwrap(), "true");
}

#[tokio::test]
async fn test_in_flight_renewal_accepts_header_session_id() {
    let ctx = setup().await;
    let user = create_user(&ctx.db, "alice", UserRole::User).await;
    let auth = login(&ctx, "alice").await;

    let stale = expired_access_token(&user, None);
    let response = ctx
        .client
        .get(ctx.url("/auth/me"))
        .bearer_auth(&stale)
        .header("x-session-id", &auth.session_id)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.headers().get("x-token-renewed").unwrap(), "true");
}

#[tokio::test]
async fn test_renew_endpoint_rejects_stolen_session() {
    let ctx = setup().await;
    create_user(&ctx.db, "alice", UserRole::User).await;
    let intruder = create_user(&ctx.db, "mallory", UserRole::User).await;
    let auth = login(&ctx, "alice").await;

    let stale = expired_access_token(&intruder, Some(&auth.session_id));
    let response = ctx
        .client
        .post(ctx.url("/auth/renew"))
        .json(&serde_json::json!({ "access_token": stale }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 401);

    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["code"], "SESSION_MISMATCH");
}

#[tokio::test]
async fn test_renew_without_any_session_id() {
    let ctx = setup().await;
    let user = create_user(&ctx.db, "alice", UserRole::User).await;

    let stale = expired_access_token(&user, None);
    let response = ctx
        .client
        .post(ctx.url("/auth/renew"))
        .json(&serde_json::json!({ "access_token": stale }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 401);

    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["code"], "NO_SESSION_ID");
}

#[tokio::test]
async fn test_admin_continuity_renewal() {
    let ctx = setup().await;
    let admin = create_user(&ctx.db, "root", UserRole::Admin).await;

    // No session anywhere, but the account is a database-verified admin.
    let stale = expired_access_token(&admin, None);
    let response = ctx
        .client
        .post(ctx.url("/auth/renew"))
        .json(&serde_json::json!({ "access_token": stale }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let body: serde_json::Value = response.json().await.unwrap();
    assert!(body.get("session_id").is_none());

    // The continuity token authenticates without a session.
    let access = body["access_token"].as_str().unwrap();
    let response = ctx
        .client
        .get(ctx.url("/auth/me"))
        .bearer_auth(access)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["has_session"], false);
}

#[tokio::test]
async fn test_deactivated_user_rejected() {
    let ctx = setup().await;
    let user = create_user(&ctx.db, "alice", UserRole::User).await;
    let auth = login(&ctx, "alice").await;

    ctx.db.users().set_active(user.id, false).await.unwrap();

    let response = ctx
        .client
        .get(ctx.url("/auth/me"))
        .bearer_auth(&auth.access_token)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 401);

    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["code"], "USER_NOT_FOUND");
}

#[tokio::test]
async fn test_works_without_cache_backend() {
    let ctx = setup_without_cache().await;
    let user = create_user(&ctx.db, "alice", UserRole::User).await;
    let auth = login(&ctx, "alice").await;

    let response = ctx
        .client
        .get(ctx.url("/auth/me"))
        .bearer_auth(&auth.access_token)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    // Renewal also runs against the durable store alone.
    let stale = expired_access_token(&user, Some(&auth.session_id));
    let response = ctx
        .client
        .get(ctx.url("/auth/me"))
        .bearer_auth(&stale)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.headers().get("x-token-renewed").unwrap(), "true");
}

#[tokio::test]
async fn test_session_limit_ends_oldest_session() {
    let ctx = common::TestSetup::new().with_max_sessions(2).build().await;
    create_user(&ctx.db, "alice", UserRole::User).await;

    let first = login(&ctx, "alice").await;
    login(&ctx, "alice").await;
    let third = login(&ctx, "alice").await;

    // The oldest session was ended by the cap; its token is dead.
    let response = ctx
        .client
        .get(ctx.url("/auth/me"))
        .bearer_auth(&first.access_token)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 401);

    let response = ctx
        .client
        .get(ctx.url("/auth/me"))
        .bearer_auth(&third.access_token)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
}

#[tokio::test]
async fn test_login_with_signals_enriches_session() {
    let ctx = setup().await;
    create_user(&ctx.db, "alice", UserRole::User).await;

    let response = ctx
        .client
        .post(ctx.url("/auth/session"))
        .header("user-agent", TEST_UA)
        .json(&serde_json::json!({
            "username": "alice",
            "signals": {
                "timezone": "Europe/Berlin",
                "screen_resolution": "2560x1440",
            },
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    // Enrichment is asynchronous; poll the durable row briefly.
    let mut enriched = false;
    for _ in 0..50 {
        let row: (Option<String>,) = sqlx::query_as(
            "SELECT enhanced_fingerprint FROM sessions ORDER BY created_at DESC LIMIT 1",
        )
        .fetch_one(ctx.db.pool())
        .await
        .unwrap();
        if row.0.is_some() {
            enriched = true;
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    assert!(enriched, "session should gain an enhanced fingerprint");
}
