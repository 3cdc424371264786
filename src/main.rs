use serde::Deserialize;
use serde_json::json;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::signal;
use tracing::{error, info};
use warp::Filter;

mod auth;
mod config;
mod error;
mod metrics;
mod models;
mod services;

use auth::rate_limit::RateLimiter;
use auth::services::AuthService;
use config::Config;
use error::CollabError;
use services::annotations::AnnotationBroadcaster;
use services::cluster::ClusterAdapter;
use services::conflict::ConflictResolver;
use services::cursor::CursorTracker;
use services::notifications::NotificationDispatcher;
use services::ot::OtEngine;
use services::presence::PresenceTracker;
use services::queue::MessageQueue;
use services::rest_api::RestApiClient;
use services::room_manager::RoomManager;
use services::session::SessionGate;

#[derive(Debug, Deserialize)]
struct WsQuery {
    token: Option<String>,
}

struct AppState {
    gate: Arc<SessionGate>,
    rooms: Arc<RoomManager>,
    cluster: Option<Arc<ClusterAdapter>>,
    started_at: Instant,
}

async fn health_check(state: Arc<AppState>) -> Result<impl warp::Reply, Infallible> {
    let mut body = json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now(),
        "websocket": {
            "connected_users": state.rooms.connected_users(),
            "active_rooms": state.rooms.active_rooms(),
            "total_messages": state.rooms.total_messages(),
            "uptime": state.started_at.elapsed().as_secs(),
        }
    });
    if let Some(cluster) = &state.cluster {
        let health = cluster.health().await;
        if !health.connected {
            body["status"] = json!("degraded");
        }
        body["cluster"] = serde_json::to_value(&health).unwrap_or_default();
    }
    Ok(warp::reply::json(&body))
}

async fn root_handler() -> Result<impl warp::Reply, Infallible> {
    Ok(warp::reply::json(&json!({
        "service": "annotation-collab-backend",
        "version": env!("CARGO_PKG_VERSION"),
        "endpoints": {
            "websocket": "/ws?token=<bearer>",
            "health": "/health",
            "metrics": "/metrics",
        }
    })))
}

fn init_tracing(config: &Config) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(config.logging.log_level.clone()));

    match &config.logging.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "collab-server.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_ansi(false)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_target(false)
                .with_thread_ids(true)
                .init();
            None
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration
    let config = Config::from_env().map_err(|e| {
        eprintln!("❌ Failed to load configuration: {}", e);
        anyhow::anyhow!("configuration error: {}", e)
    })?;

    let _log_guard = init_tracing(&config);

    info!(
        "🚀 Starting annotation collaboration server v{}",
        env!("CARGO_PKG_VERSION")
    );
    info!("📊 Configuration loaded:");
    info!("  - Listen: {}:{}", config.server.host, config.server.port);
    info!("  - CORS origins: {:?}", config.cors.allowed_origins);
    info!("  - REST API: {}", config.auth.rest_api_url);
    info!(
        "  - Cluster adapter: {}",
        if config.cluster.url.is_some() { "enabled" } else { "disabled" }
    );
    info!(
        "  - Queue persistence: {}",
        if config.persistence.persist_queues { "enabled" } else { "disabled" }
    );

    // The signing key is required; refuse to start without one
    if config.auth.jwt_secret.is_empty() {
        let err = CollabError::Config("JWT_SECRET is not set".to_string());
        err.log_with_context("startup");
        return Err(anyhow::anyhow!("JWT_SECRET is required"));
    }

    // Cluster adapter: fatal when configured but unreachable
    let cluster = match &config.cluster.url {
        Some(url) => {
            info!("🔗 Connecting to cluster store...");
            let adapter = ClusterAdapter::connect(url, config.cluster.max_reconnect_attempts)
                .await
                .map_err(|e| {
                    e.log_with_context("cluster store connection");
                    anyhow::anyhow!("cluster store unavailable: {}", e)
                })?;
            info!("✅ Cluster store connected");
            Some(adapter)
        }
        None => None,
    };

    // Assemble services
    let rest_api = Arc::new(RestApiClient::new(&config.auth.rest_api_url));
    let auth_service = AuthService::new(&config.auth.jwt_secret, Arc::clone(&rest_api));
    let rate_limiter = RateLimiter::new(
        config.auth.rate_limit_max_events,
        config.auth.rate_limit_window_ms,
    );
    info!("🔐 Authentication service created");

    let rooms = Arc::new(RoomManager::new(
        config.rooms.max_users,
        config.rooms.idle_threshold_ms,
        config.rooms.room_salt.clone(),
        cluster.clone(),
    ));
    let presence = Arc::new(PresenceTracker::new(Arc::clone(&rooms), cluster.clone()));
    let cursors = Arc::new(CursorTracker::new(Arc::clone(&rooms)));
    let ot = Arc::new(OtEngine::new());
    let conflicts = Arc::new(ConflictResolver::new());

    let persist_dir = config
        .persistence
        .persist_queues
        .then(|| std::path::PathBuf::from(&config.persistence.persist_dir));
    let queue = Arc::new(MessageQueue::new(config.queue.clone(), persist_dir));
    match queue.load() {
        Ok(0) => {}
        Ok(count) => info!("📬 Restored {} persisted queues", count),
        Err(e) => e.log_with_context("queue restore"),
    }

    let notifications = Arc::new(NotificationDispatcher::new(
        Arc::clone(&rooms),
        Arc::clone(&queue),
    ));
    let annotations = Arc::new(AnnotationBroadcaster::new(
        Arc::clone(&rooms),
        Arc::clone(&ot),
        Arc::clone(&conflicts),
        Arc::clone(&queue),
        cluster.clone(),
    ));

    let gate = Arc::new(SessionGate::new(
        auth_service,
        rate_limiter,
        Arc::clone(&rooms),
        Arc::clone(&presence),
        Arc::clone(&cursors),
        Arc::clone(&annotations),
        Arc::clone(&ot),
        Arc::clone(&notifications),
    ));
    info!("🎯 Collaboration services created");

    // Initialize metrics
    let _metrics = &metrics::METRICS;
    info!("✅ Prometheus metrics initialized");

    // Cross-node fan-out: peer broadcasts arrive over the backplane
    if let Some(cluster_ref) = &cluster {
        let rooms_for_sub = Arc::clone(&rooms);
        cluster_ref
            .subscribe(
                "websocket:*",
                Arc::new(move |message| {
                    if message.category == "room" {
                        rooms_for_sub.handle_cluster_broadcast(&message.payload);
                    }
                }),
            )
            .await
            .map_err(|e| anyhow::anyhow!("pub/sub subscription failed: {}", e))?;
        info!("📡 Subscribed to cluster broadcasts");
    }

    // Background sweeps
    {
        let rooms = Arc::clone(&rooms);
        let cursors = Arc::clone(&cursors);
        let ot = Arc::clone(&ot);
        let conflicts = Arc::clone(&conflicts);
        let annotations = Arc::clone(&annotations);
        let sweep_interval = Duration::from_millis(config.rooms.sweep_interval_ms);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(sweep_interval);
            loop {
                interval.tick().await;
                for room_id in rooms.sweep_idle_rooms().await {
                    cursors.cleanup_room(&room_id);
                    ot.cleanup_room(&room_id);
                    conflicts.cleanup_room(&room_id);
                    annotations.cleanup_room(&room_id);
                }
            }
        });
    }
    {
        let presence = Arc::clone(&presence);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(30));
            loop {
                interval.tick().await;
                presence.sweep_statuses().await;
            }
        });
    }
    {
        let cursors = Arc::clone(&cursors);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(60));
            loop {
                interval.tick().await;
                cursors.sweep_stale();
            }
        });
    }
    {
        let queue = Arc::clone(&queue);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(5 * 60));
            loop {
                interval.tick().await;
                queue.sweep_expired();
            }
        });
    }
    {
        let queue = Arc::clone(&queue);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(60));
            loop {
                interval.tick().await;
                if let Err(e) = queue.flush_dirty() {
                    e.log_with_context("queue persistence flush");
                }
            }
        });
    }
    tokio::spawn(async {
        let mut interval = tokio::time::interval(Duration::from_secs(60));
        loop {
            interval.tick().await;
            metrics::increment_uptime(60);
        }
    });
    info!("🔄 Background sweeps started");

    let state = Arc::new(AppState {
        gate: Arc::clone(&gate),
        rooms: Arc::clone(&rooms),
        cluster: cluster.clone(),
        started_at: Instant::now(),
    });

    // Warp routes
    let cors = warp::cors()
        .allow_origins(
            config
                .cors
                .allowed_origins
                .iter()
                .map(|origin| origin.as_str()),
        )
        .allow_headers(vec!["content-type", "authorization"])
        .allow_methods(vec!["GET", "POST", "OPTIONS"]);

    let state_filter = {
        let state = Arc::clone(&state);
        warp::any().map(move || Arc::clone(&state))
    };

    let ws_route = warp::path("ws")
        .and(warp::ws())
        .and(warp::query::<WsQuery>())
        .and(warp::addr::remote())
        .and(state_filter.clone())
        .map(
            |ws: warp::ws::Ws,
             query: WsQuery,
             remote: Option<SocketAddr>,
             state: Arc<AppState>| {
                ws.on_upgrade(move |socket| {
                    Arc::clone(&state.gate).handle_socket(socket, query.token, remote)
                })
            },
        );

    let health_route = warp::path("health")
        .and(warp::get())
        .and(state_filter.clone())
        .and_then(health_check);

    let metrics_route = warp::path("metrics")
        .and(warp::get())
        .and_then(metrics::metrics_handler);

    let root_route = warp::path::end().and(warp::get()).and_then(root_handler);

    let routes = root_route
        .or(ws_route)
        .or(health_route)
        .or(metrics_route)
        .with(cors)
        .with(warp::trace::request());

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid listen address: {}", e))?;

    info!("🌐 Server starting on http://{}", addr);
    info!("  - GET /ws - collaboration WebSocket");
    info!("  - GET /health - health check");
    info!("  - GET /metrics - Prometheus metrics");

    let (bound, server) =
        warp::serve(routes).try_bind_with_graceful_shutdown(addr, async {
            signal::ctrl_c().await.expect("failed to listen for ctrl+c");
            info!("🛑 Received shutdown signal, gracefully shutting down...");
        })?;
    info!("✅ Server is accepting connections on {}", bound);

    server.await;

    // final persistence pass before exit
    if let Err(e) = queue.flush_dirty() {
        error!("final queue flush failed: {}", e);
    }
    info!("✅ Server shutdown complete");
    Ok(())
}
