use std::sync::Arc;

use axum::{middleware as axum_middleware, routing::get, routing::post, routing::put, Router};
use serde_json::{json, Value};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use chat_gateway::chat::ChatService;
use chat_gateway::data::DataService;
use chat_gateway::database::manager::DatabaseManager;
use chat_gateway::database::postgres::PgEngine;
use chat_gateway::handlers;
use chat_gateway::middleware::jwt_auth_middleware;
use chat_gateway::provider::ProviderClient;
use chat_gateway::AppState;

#[tokio::main]
async fn main() {
    // Load .env if present so cargo run picks up DATABASE_URL, PROVIDER_*, etc.
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt::init();

    let config = chat_gateway::config::config();
    tracing::info!("Starting chat gateway in {:?} mode", config.environment);

    let pool = match DatabaseManager::pool().await {
        Ok(pool) => pool,
        Err(e) => {
            tracing::error!("Failed to connect to database: {}", e);
            std::process::exit(1);
        }
    };

    let data = DataService::new(Arc::new(PgEngine::new(pool)));
    let chat = ChatService::new(data.clone(), ProviderClient::from_config());
    let state = AppState { data, chat };

    let app = app(state);

    let port = std::env::var("PORT").ok().and_then(|s| s.parse::<u16>().ok()).unwrap_or(3000);

    let bind_addr = format!("0.0.0.0:{}", port);
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .unwrap_or_else(|e| panic!("failed to bind {}: {}", bind_addr, e));

    tracing::info!("Chat gateway listening on http://{}", bind_addr);

    axum::serve(listener, app).await.expect("server");
}

fn app(state: AppState) -> Router {
    let mut router = Router::new()
        // Public
        .route("/", get(root))
        .route("/health", get(health))
        .route("/auth/login", post(handlers::auth::login))
        // Protected API
        .merge(api_routes());

    if chat_gateway::config::config().security.enable_cors {
        router = router.layer(CorsLayer::permissive());
    }
    router.layer(TraceLayer::new_for_http()).with_state(state)
}

fn api_routes() -> Router<AppState> {
    use handlers::{auth, chat, conversations};

    Router::new()
        .route("/api/auth/whoami", get(auth::whoami))
        .route("/api/chat", post(chat::chat))
        .route("/api/chat/stream", post(chat::chat_stream))
        .route("/api/chat/stop", post(chat::stop))
        .route("/api/conversations", get(conversations::history))
        .route("/api/conversations/:id", get(conversations::detail).delete(conversations::remove))
        .route("/api/conversations/:id/messages", get(conversations::messages))
        .route("/api/conversations/:id/name", put(conversations::rename))
        .route("/api/conversations/:id/archive", post(conversations::archive))
        .layer(axum_middleware::from_fn(jwt_auth_middleware))
}

async fn root() -> axum::response::Json<Value> {
    let version = env!("CARGO_PKG_VERSION");

    axum::response::Json(json!({
        "success": true,
        "data": {
            "name": "Chat Gateway",
            "version": version,
            "description": "API gateway proxying a conversational AI provider with persisted history",
            "endpoints": {
                "home": "/ (public)",
                "login": "/auth/login (public - token acquisition)",
                "auth": "/api/auth/whoami (protected)",
                "chat": "/api/chat, /api/chat/stream, /api/chat/stop (protected)",
                "conversations": "/api/conversations[/:id[/messages|/name|/archive]] (protected)",
            }
        }
    }))
}

async fn health() -> impl axum::response::IntoResponse {
    let now = chrono::Utc::now();

    match DatabaseManager::health_check().await {
        Ok(_) => (
            axum::http::StatusCode::OK,
            axum::response::Json(json!({
                "success": true,
                "data": {
                    "status": "ok",
                    "timestamp": now,
                    "database": "ok"
                }
            })),
        ),
        Err(e) => (
            axum::http::StatusCode::SERVICE_UNAVAILABLE,
            axum::response::Json(json!({
                "success": false,
                "error": "database unavailable",
                "data": {
                    "status": "degraded",
                    "timestamp": now,
                    "database_error": e.to_string()
                }
            })),
        ),
    }
}
