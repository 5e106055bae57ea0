//! CLI argument parsing, validation, and startup helpers.

use crate::ServerConfig;
use crate::db::{Database, UserRole};
use crate::session::{FingerprintPolicy, SessionConfig};
use clap::Parser;
use std::time::Duration;
use tracing::{error, info};
use uuid::Uuid;

const MIN_JWT_SECRET_LENGTH: usize = 32;

/// Paths that never require authentication.
const DEFAULT_EXEMPT_PATHS: &[&str] = &["/auth/session", "/auth/renew", "/ws"];

#[derive(clap::ValueEnum, Clone, Debug, Default)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
    Compact,
}

#[derive(Parser, Debug, Clone)]
#[command(
    name = "Sessiongate",
    about = "Hybrid session and token renewal service"
)]
pub struct Args {
    /// Port to listen on
    #[arg(short, long, default_value = "7391")]
    pub port: u16,

    /// Path to SQLite database file
    #[arg(short, long, default_value = "sessiongate.db")]
    pub database: String,

    /// Path to file containing JWT secret. Prefer using JWT_SECRET env var instead
    #[arg(long)]
    pub jwt_secret_file: Option<String>,

    /// Standard session lifetime in hours
    #[arg(long, default_value = "4")]
    pub session_hours: u64,

    /// Persistent ("remember me") session lifetime in days
    #[arg(long, default_value = "30")]
    pub persistent_days: u64,

    /// Disable the cache backend and serve sessions from the durable store
    #[arg(long)]
    pub no_cache: bool,

    /// Per-operation cache timeout in milliseconds
    #[arg(long, default_value = "250", value_parser = validate_cache_timeout)]
    pub cache_timeout_ms: u64,

    /// Fraction of session lifetime remaining below which renewal triggers
    #[arg(long, default_value = "0.10", value_parser = validate_fraction)]
    pub renewal_fraction: f64,

    /// Maximum concurrent sessions per user (0 = unlimited)
    #[arg(long, default_value = "5")]
    pub max_sessions: u32,

    /// How ambiguous fingerprint matches are resolved
    #[arg(long, value_enum, default_value = "most-recent")]
    pub fingerprint_policy: FingerprintPolicy,

    /// Additional path prefix exempt from authentication (repeatable)
    #[arg(long = "exempt-path", value_name = "PREFIX")]
    pub exempt_paths: Vec<String>,

    /// Create a user on startup and print its UUID
    #[arg(long, value_name = "USERNAME")]
    pub create_user: Option<String>,

    /// Give the created user the admin role
    #[arg(long, requires = "create_user")]
    pub admin: bool,

    /// Log output format
    #[arg(short, long, default_value = "pretty")]
    pub log_format: LogFormat,
}

fn validate_fraction(s: &str) -> Result<f64, String> {
    let value: f64 = s.parse().map_err(|_| format!("Not a number: {}", s))?;
    if !(0.0..=0.5).contains(&value) || value == 0.0 {
        return Err(format!(
            "Renewal fraction must be in (0, 0.5], got {}",
            value
        ));
    }
    Ok(value)
}

fn validate_cache_timeout(s: &str) -> Result<u64, String> {
    let value: u64 = s.parse().map_err(|_| format!("Not a number: {}", s))?;
    // A degraded cache must never stall the request path.
    if value == 0 || value >= 1000 {
        return Err(format!(
            "Cache timeout must be between 1 and 999 milliseconds, got {}",
            value
        ));
    }
    Ok(value)
}

/// Initialize logging based on the specified format.
pub fn init_logging(format: &LogFormat) {
    match format {
        LogFormat::Pretty => tracing_subscriber::fmt::init(),
        LogFormat::Json => tracing_subscriber::fmt().json().init(),
        LogFormat::Compact => tracing_subscriber::fmt().compact().init(),
    }
}

/// Load JWT secret from environment variable or file.
/// Returns None and logs an error if the secret cannot be loaded.
pub fn load_jwt_secret(jwt_secret_file: Option<&str>) -> Option<String> {
    let secret = if let Ok(secret) = std::env::var("JWT_SECRET") {
        // Clear the environment variable to prevent leaking
        // SAFETY: We're single-threaded at this point during startup,
        // and no other code is reading this environment variable.
        unsafe { std::env::remove_var("JWT_SECRET") };
        secret
    } else if let Some(path) = jwt_secret_file {
        match std::fs::read_to_string(path) {
            Ok(content) => content.trim().to_string(),
            Err(e) => {
                error!(path = %path, error = %e, "Failed to read JWT secret file");
                return None;
            }
        }
    } else {
        error!(
            "JWT secret is required. Set JWT_SECRET environment variable (recommended) or use --jwt-secret-file"
        );
        return None;
    };

    if secret.len() < MIN_JWT_SECRET_LENGTH {
        error!(
            "JWT secret is shorter than {} characters. Use a longer secret",
            MIN_JWT_SECRET_LENGTH
        );
        return None;
    }

    Some(secret)
}

/// Handle the --create-user flag: create a user row and print its UUID so an
/// upstream identity system (or an operator) can hand out credentials.
pub async fn handle_create_user(db: &Database, username: &str, admin: bool) {
    let uuid = Uuid::new_v4().to_string();
    let role = if admin { UserRole::Admin } else { UserRole::User };

    match db.users().create(&uuid, username, role).await {
        Ok(_) => {
            println!();
            println!("User created: {} ({})", username, role.as_str());
            println!("UUID: {}", uuid);
            println!();
        }
        Err(e) => {
            error!(error = %e, "Failed to create user");
            std::process::exit(1);
        }
    }
}

/// Build ServerConfig from validated arguments.
pub fn build_config(args: &Args, db: Database, jwt_secret: String) -> ServerConfig {
    let mut exempt_paths: Vec<String> = DEFAULT_EXEMPT_PATHS
        .iter()
        .map(|p| p.to_string())
        .collect();
    exempt_paths.extend(args.exempt_paths.iter().cloned());

    ServerConfig {
        db,
        jwt_secret: jwt_secret.into_bytes(),
        session: SessionConfig {
            session_hours: args.session_hours,
            persistent_days: args.persistent_days,
            cache_enabled: !args.no_cache,
            cache_op_timeout: Duration::from_millis(args.cache_timeout_ms),
            renewal_fraction: args.renewal_fraction,
            max_sessions_per_user: args.max_sessions,
            fingerprint_policy: args.fingerprint_policy,
        },
        exempt_paths,
    }
}

/// Open the database, logging errors if it fails.
pub async fn open_database(path: &str) -> Option<Database> {
    match Database::open(path).await {
        Ok(db) => {
            info!(path = %path, "Database opened");
            Some(db)
        }
        Err(e) => {
            error!(path = %path, error = %e, "Failed to open database");
            None
        }
    }
}
