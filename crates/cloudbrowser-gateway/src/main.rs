//! Process entry point: wires C1-C5 via constructor injection, spawns
//! the four background loops (§5), and serves the `/api` HTTP surface
//! plus the realtime WebSocket endpoint.

use axum::middleware;
use axum::routing::{delete, get, post};
use axum::Router;
use bollard::Docker;
use cloudbrowser_common::Config;
use cloudbrowser_common::NullLogSink;
use cloudbrowser_core::pool::PoolConfig;
use cloudbrowser_core::{AdminControl, AdmissionQueue, ContainerPool, RealtimeChannel, SessionManager};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

mod admin_auth;
mod admin_routes;
mod error;
mod handlers;
mod state;
#[cfg(test)]
mod tests;
mod ws;

use state::AppState;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::from_env();

    tracing_subscriber::fmt()
        .with_env_filter(format!("{},cloudbrowser_gateway=debug", config.log_level))
        .init();

    let docker = Arc::new(Docker::connect_with_local_defaults()?);

    let pool_config = PoolConfig {
        image: config.container_image.clone(),
        pool_size: config.pool_size,
        port_range_start: config.port_range_start,
        port_range_end: config.port_range_end,
        policy_mount: None,
        assets_mount: None,
        enable_gpu: true,
    };
    let pool = ContainerPool::init(docker, pool_config).await?;

    // The persistent log store (SQLite) is out of scope (§1); the core
    // only depends on the `LogSink` seam, so production wiring without a
    // store configured simply drops events through `NullLogSink`.
    let log_sink: Arc<dyn cloudbrowser_common::LogSink> = Arc::new(NullLogSink);

    let sessions = SessionManager::new(pool.clone(), log_sink, config.session_duration, config.rate_limit_per_day);
    let queue = AdmissionQueue::new(pool.clone(), sessions.clone());
    let realtime = RealtimeChannel::new(sessions.clone());
    let admin = AdminControl::new(pool.clone(), sessions.clone(), queue.clone(), realtime.clone(), config.rate_limit_per_day);

    tokio::spawn(pool.clone().run_health_loop());
    tokio::spawn(sessions.clone().run_expiry_loop());
    tokio::spawn(queue.clone().run_worker());
    tokio::spawn(realtime.clone().run_timer_loop());

    let state = AppState {
        pool,
        sessions,
        queue,
        realtime,
        admin,
        admin_user: config.admin_user.clone(),
        admin_password: config.admin_password.clone(),
    };

    let app = create_app(state, &config.frontend_url);

    let addr = SocketAddr::from(([0, 0, 0, 0], 8080));
    info!("cloud-browser gateway listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>()).await?;

    Ok(())
}

fn create_app(state: AppState, frontend_url: &str) -> Router {
    let cors = if frontend_url == "*" {
        CorsLayer::permissive()
    } else {
        CorsLayer::new()
            .allow_origin(AllowOrigin::exact(frontend_url.parse().expect("valid FRONTEND_URL origin")))
            .allow_methods(tower_http::cors::Any)
            .allow_headers(tower_http::cors::Any)
    };

    let admin_routes = Router::new()
        .route("/sessions", get(admin_routes::list_sessions))
        .route("/sessions/history", get(admin_routes::session_history))
        .route("/sessions/:id", delete(admin_routes::kill_session))
        .route("/queue", get(admin_routes::list_queue))
        .route("/stats", get(admin_routes::stats))
        .route("/rate-limits", get(admin_routes::rate_limit_stats))
        .route("/rate-limits/:ip/block", post(admin_routes::block_ip))
        .route("/rate-limits/:ip/unblock", post(admin_routes::unblock_ip))
        .route("/rate-limits/:ip/whitelist", post(admin_routes::whitelist_ip))
        .route("/rate-limits/:ip/unwhitelist", post(admin_routes::unwhitelist_ip))
        .route("/rate-limits/:ip/clear", post(admin_routes::clear_limit))
        .route("/pause", post(admin_routes::pause))
        .route("/resume", post(admin_routes::resume))
        .route("/drain", post(admin_routes::drain_queue))
        .route("/restart-pool", post(admin_routes::restart_pool))
        .route("/config/pool-size", post(admin_routes::set_pool_size))
        .route("/config/duration", post(admin_routes::set_duration))
        .route_layer(middleware::from_fn_with_state(state.clone(), admin_auth::require_admin_auth));

    Router::new()
        .route("/api/session", post(handlers::create_session))
        .route("/api/session/rate-limit/status", get(handlers::rate_limit_status))
        .route("/api/session/:id", get(handlers::get_session).delete(handlers::end_session))
        .route("/api/queue/:id", get(handlers::get_queue_entry).delete(handlers::leave_queue))
        .route("/api/health", get(handlers::health))
        .route("/api/metrics", get(handlers::metrics))
        .route("/api/realtime", get(ws::ws_handler))
        .nest("/api/admin", admin_routes)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
