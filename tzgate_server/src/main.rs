//! Tzgate Server - Timezone-challenge gateway
//!
//! This server sits in front of a web application and:
//! - Proxies every request to the protected upstream
//! - Intercepts HTML page loads behind a browser timezone probe
//! - Compares the probe answer with the GeoIP timezone of the client
//! - Releases the original response or rejects likely VPN/proxy clients

mod client_ip;
mod config;
mod geoip;
mod routes;
mod session;
mod vpn;

use axum::{extract::State, response::IntoResponse, routing::get, Router};
use geoip::{DisabledResolver, MaxMindResolver, TimezoneResolver};
use session::{MemorySessionStore, RedisSessionStore, SessionStore};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use vpn::{ChallengeEngine, VpnCheckLayer};

/// How often expired in-memory sessions are purged
const SESSION_CLEANUP_INTERVAL: Duration = Duration::from_secs(300);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tzgate_server=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = config::Config::from_env()?;
    tracing::info!("Starting Tzgate on {}:{}", config.host, config.port);
    tracing::info!("Upstream: {}", config.upstream_url);
    tracing::info!(
        "VPN check: {}",
        if config.vpn.enabled { "enabled" } else { "disabled" }
    );
    if let Some(url) = &config.vpn.forbidden_url {
        tracing::info!("Denied clients are redirected to {}", url);
    }

    // GeoIP database
    let resolver: Arc<dyn TimezoneResolver> = match &config.geoip_db_path {
        Some(path) => Arc::new(MaxMindResolver::open(path)?),
        None => {
            tracing::warn!("GEOIP_DB_PATH not set, every client resolves to N/A");
            Arc::new(DisabledResolver)
        }
    };
    let geoip_loaded = config.geoip_db_path.is_some();

    // Session store
    let sessions = match &config.redis_url {
        Some(url) => {
            tracing::info!("Connecting to Redis...");
            let client = session::init_client(url).await?;
            SessionStore::Redis(RedisSessionStore::new(client, config.session_ttl))
        }
        None => {
            tracing::info!("Using in-memory session store");
            let store = MemorySessionStore::new(config.session_ttl);
            session::spawn_cleanup(store.clone(), SESSION_CLEANUP_INTERVAL);
            SessionStore::Memory(store)
        }
    };

    let engine = ChallengeEngine::new(
        config.vpn.clone(),
        resolver,
        sessions.clone(),
        &config.session_cookie,
        config.trust_forwarded,
    );

    // Create app state
    let state = routes::AppState::new(config.clone(), sessions, geoip_loaded)?;

    // Everything that is not a gateway endpoint goes upstream, behind the check
    let protected = Router::new()
        .fallback(routes::proxy::handle_upstream)
        .layer(VpnCheckLayer::new(engine))
        .with_state(state.clone());

    let app = Router::new()
        .route("/_tzgate/health", get(health_check))
        .with_state(state)
        .fallback_service(protected)
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    tracing::info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}

/// Health check endpoint
async fn health_check(State(state): State<routes::AppState>) -> impl IntoResponse {
    let session_status = state
        .sessions
        .ping()
        .await
        .map(|_| "ok")
        .unwrap_or("error");

    let status = if session_status == "ok" {
        "healthy"
    } else {
        "degraded"
    };

    axum::Json(serde_json::json!({
        "status": status,
        "sessions": {
            "backend": state.sessions.backend(),
            "status": session_status
        },
        "geoip": state.geoip_loaded,
        "vpn_check": state.config.vpn.enabled
    }))
}
