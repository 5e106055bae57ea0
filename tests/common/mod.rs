#![allow(dead_code)]

use sessiongate::db::{Database, User, UserRole};
use sessiongate::jwt::{AccessClaims, TokenType};
use sessiongate::session::SessionConfig;
use sessiongate::{ServerConfig, start_server};
use std::time::{SystemTime, UNIX_EPOCH};

/// Signing secret shared by every test server in this binary.
pub const TEST_SECRET: &[u8] = b"integration-test-secret-0123456789abcdef";

/// Browser-like headers that produce a stable device fingerprint.
pub const TEST_UA: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
     (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

pub struct TestContext {
    pub base_url: String,
    pub db: Database,
    pub client: reqwest::Client,
    server_handle: tokio::task::JoinHandle<()>,
}

pub async fn setup() -> TestContext {
    TestSetup::new().build().await
}

pub async fn setup_without_cache() -> TestContext {
    TestSetup::new().with_cache(false).build().await
}

/// Builder for test setup with various options
pub struct TestSetup {
    cache_enabled: bool,
    max_sessions: u32,
}

impl TestSetup {
    pub fn new() -> Self {
        Self {
            cache_enabled: true,
            max_sessions: 5,
        }
    }

    pub fn with_cache(mut self, enabled: bool) -> Self {
        self.cache_enabled = enabled;
        self
    }

    pub fn with_max_sessions(mut self, max: u32) -> Self {
        self.max_sessions = max;
        self
    }

    pub async fn build(self) -> TestContext {
        let db = Database::open(":memory:").await.expect("Failed to open database");

        let config = ServerConfig {
            db: db.clone(),
            jwt_secret: TEST_SECRET.to_vec(),
            session: SessionConfig {
                cache_enabled: self.cache_enabled,
                max_sessions_per_user: self.max_sessions,
                ..Default::default()
            },
            exempt_paths: vec![
                "/auth/session".to_string(),
                "/auth/renew".to_string(),
                "/ws".to_string(),
            ],
        };

        let (server_handle, addr) = start_server(config, 0).await;

        TestContext {
            base_url: format!("http://{}", addr),
            db,
            client: reqwest::Client::new(),
            server_handle,
        }
    }
}

impl TestContext {
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    pub fn ws_url(&self, query: &str) -> String {
        format!(
            "ws{}/ws{}",
            self.base_url.trim_start_matches("http"),
            query
        )
    }
}

pub async fn create_user(db: &Database, username: &str, role: UserRole) -> User {
    let uuid = format!("uuid-{}", username);
    let id = db.users().create(&uuid, username, role).await.expect("Failed to create user");
    db.users().get_by_id(id).await.unwrap().unwrap()
}

#[derive(Debug)]
pub struct LoginResult {
    pub access_token: String,
    pub refresh_token: String,
    pub session_id: String,
}

/// Log in through the API with the standard test headers.
pub async fn login(ctx: &TestContext, username: &str) -> LoginResult {
    let response = ctx
        .client
        .post(ctx.url("/auth/session"))
        .header("user-agent", TEST_UA)
        .json(&serde_json::json!({ "username": username }))
        .send()
        .await
        .expect("Login request failed");
    assert_eq!(response.status(), 200, "login should succeed");

    let session_id = response
        .headers()
        .get("x-session-id")
        .expect("missing x-session-id header")
        .to_str()
        .unwrap()
        .to_string();
    let body: serde_json::Value = response.json().await.unwrap();

    LoginResult {
        access_token: body["access_token"].as_str().unwrap().to_string(),
        refresh_token: body["refresh_token"].as_str().unwrap().to_string(),
        session_id,
    }
}

fn unix_now() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs()
}

/// Mint an access token whose expiry is already in the past but whose
/// claims are intact, as a client would hold after its token aged out.
pub fn expired_access_token(user: &User, raw_session_id: Option<&str>) -> String {
    let now = unix_now();
    let claims = AccessClaims {
        sub: user.uuid.clone(),
        sid: raw_session_id.map(str::to_string),
        role: user.role,
        verified: user.verified,
        token_type: TokenType::Access,
        iat: now - 1000,
        exp: now - 100,
    };
    jsonwebtoken::encode(
        &jsonwebtoken::Header::default(),
        &claims,
        &jsonwebtoken::EncodingKey::from_secret(TEST_SECRET),
    )
    .expect("Failed to encode token")
}
