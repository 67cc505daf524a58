//! Rowfence server binary.
//!
//! Wires configuration, the session layer, and the HTTP surface together,
//! then serves until SIGINT/SIGTERM. Without the `postgres` feature (or
//! without `--database-url`) the server runs on the in-memory backend,
//! which emulates the row policy and is intended for development only.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use rowfence_server::auth::{AuthConfig, IdentityResolver};
use rowfence_server::db::memory::{MemoryDb, MemoryFactory};
use rowfence_server::db::SessionFactory;
use rowfence_server::network::{NetworkConfig, NetworkModule};
use rowfence_server::session::{
    ConnectionPool, PoolConfig, ScopeManager, SessionConfig, SessionContextBinder,
};

/// Rowfence: multi-tenant task API over row-level security.
#[derive(Parser, Debug)]
#[command(name = "rowfence-server")]
#[command(about = "Multi-tenant task API backed by PostgreSQL row-level security")]
struct Args {
    /// Bind address for the HTTP listener.
    #[arg(long, default_value = "0.0.0.0", env = "ROWFENCE_HOST")]
    host: String,

    /// Port to listen on (0 for OS-assigned).
    #[arg(long, default_value = "8080", env = "ROWFENCE_PORT")]
    port: u16,

    /// HMAC secret used to verify bearer credentials.
    #[arg(long, env = "ROWFENCE_JWT_SECRET")]
    jwt_secret: String,

    /// Number of pooled database connections.
    #[arg(long, default_value = "5", env = "ROWFENCE_POOL_CAPACITY")]
    pool_capacity: usize,

    /// Milliseconds to wait for a pooled connection before failing with 503.
    #[arg(long, default_value = "5000", env = "ROWFENCE_ACQUIRE_TIMEOUT_MS")]
    acquire_timeout_ms: u64,

    /// Seconds before an HTTP request is timed out.
    #[arg(long, default_value = "30", env = "ROWFENCE_REQUEST_TIMEOUT_SECS")]
    request_timeout_secs: u64,

    /// PostgreSQL connection string. Falls back to the in-memory backend
    /// when omitted.
    #[cfg(feature = "postgres")]
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,
}

fn build_factory(session: &SessionConfig, args: &Args) -> Arc<dyn SessionFactory> {
    #[cfg(not(feature = "postgres"))]
    let _ = args;
    #[cfg(feature = "postgres")]
    if let Some(url) = &args.database_url {
        info!("using PostgreSQL backend");
        return Arc::new(rowfence_server::db::postgres::PgSessionFactory::new(
            url.clone(),
            session.sub_claim_key.clone(),
        ));
    }

    info!("using in-memory backend (development only)");
    Arc::new(MemoryFactory::new(Arc::new(MemoryDb::new(
        session.authenticated_role.clone(),
        session.sub_claim_key.clone(),
    ))))
}

async fn shutdown_signal() {
    // SIGTERM matters under orchestrators; ctrl_c covers the terminal.
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = match signal(SignalKind::terminate()) {
            Ok(term) => term,
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
    info!("shutdown signal received");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let session_config = SessionConfig::default();
    let factory = build_factory(&session_config, &args);
    let binder = Arc::new(SessionContextBinder::new(session_config));
    let pool = ConnectionPool::new(
        PoolConfig {
            capacity: args.pool_capacity,
            acquire_timeout: Duration::from_millis(args.acquire_timeout_ms),
        },
        factory,
        Arc::clone(&binder),
    );
    let resolver = IdentityResolver::new(&AuthConfig {
        secret: args.jwt_secret.clone(),
        leeway: Duration::from_secs(30),
    });
    let scopes = Arc::new(ScopeManager::new(resolver, pool, binder));

    let mut network = NetworkModule::new(
        NetworkConfig {
            host: args.host.clone(),
            port: args.port,
            request_timeout: Duration::from_secs(args.request_timeout_secs),
            ..NetworkConfig::default()
        },
        scopes,
    );
    let port = network.start().await?;
    info!(port, "rowfence server started");

    network.serve(shutdown_signal()).await
}
