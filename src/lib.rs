pub mod api;
pub mod cache;
pub mod cleanup;
pub mod cli;
pub mod db;
pub mod enrich;
pub mod fingerprint;
pub mod gate;
pub mod jwt;
pub mod renewal;
pub mod session;

use api::{AuthState, create_api_router};
use axum::{Router, middleware, routing::get};
use cache::{Cache, MemoryCache};
use db::Database;
use enrich::spawn_enrichment_worker;
use gate::GateState;
use jwt::TokenService;
use renewal::RenewalService;
use session::{SessionConfig, SessionManager};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;

pub struct ServerConfig {
    /// Database connection (cloneable, uses connection pool internally)
    pub db: Database,
    /// JWT secret for signing tokens
    pub jwt_secret: Vec<u8>,
    /// Session layer configuration
    pub session: SessionConfig,
    /// Path prefixes that bypass the authentication gate
    pub exempt_paths: Vec<String>,
}

/// Create the application router with the given configuration.
///
/// Must be called inside a Tokio runtime: the enrichment worker is spawned
/// here so every copy of the router shares one queue.
pub fn create_app(config: &ServerConfig) -> Router {
    let tokens = Arc::new(TokenService::new(&config.jwt_secret));

    let cache: Option<Arc<dyn Cache>> = config
        .session
        .cache_enabled
        .then(|| Arc::new(MemoryCache::new()) as Arc<dyn Cache>);

    let sessions = Arc::new(SessionManager::new(
        config.db.clone(),
        cache,
        config.session.clone(),
    ));
    let renewal = Arc::new(RenewalService::new(
        config.db.clone(),
        sessions.clone(),
        tokens.clone(),
    ));
    let (enrichment, _worker) = spawn_enrichment_worker(sessions.clone());

    let gate_state = GateState {
        db: config.db.clone(),
        sessions: sessions.clone(),
        tokens: tokens.clone(),
        renewal: renewal.clone(),
        exempt: Arc::new(config.exempt_paths.clone()),
    };

    let api_router = create_api_router(AuthState {
        db: config.db.clone(),
        sessions,
        tokens,
        renewal,
        enrichment,
    });

    Router::new()
        .merge(api_router)
        .route("/ws", get(gate::ws_handler).with_state(gate_state.clone()))
        .layer(middleware::from_fn_with_state(gate_state, gate::authenticate))
}

/// Run cleanup tasks and spawn background scheduler.
/// Call this before starting the server.
pub async fn init_cleanup(db: &Database) {
    cleanup::run_cleanup(db).await;
    cleanup::spawn_cleanup_scheduler(db.clone());
}

/// Run the server on the given listener. This function blocks until the server exits.
/// Call `init_cleanup` before this to run cleanup on startup.
pub async fn run_server(config: ServerConfig, listener: TcpListener) -> Result<(), std::io::Error> {
    let app = create_app(&config);
    let make_service = app.into_make_service_with_connect_info::<SocketAddr>();
    axum::serve(listener, make_service).await
}

/// Start the server on the given port in a background task. Use port 0 to let the OS choose a random port.
/// Returns the actual address the server is listening on.
/// Note: For production use, prefer `run_server` directly in main.
pub async fn start_server(
    config: ServerConfig,
    port: u16,
) -> (tokio::task::JoinHandle<()>, SocketAddr) {
    // Run cleanup tasks on startup
    init_cleanup(&config.db).await;

    let addr = format!("127.0.0.1:{}", port);
    let listener = TcpListener::bind(&addr).await.expect("Failed to bind");
    let local_addr = listener.local_addr().expect("Failed to get local address");

    let handle = tokio::spawn(async move {
        run_server(config, listener).await.ok();
    });

    (handle, local_addr)
}
