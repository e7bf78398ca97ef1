//! 路由配置

use axum::routing::{get, patch};
use axum::{Router, middleware};
use fulfillment_shared::observability::middleware as obs_middleware;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::handlers;
use crate::state::AppState;

/// 构建配送服务路由
pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/orders/{order_number}", get(handlers::get_order))
        .route(
            "/orders/{order_number}/status",
            patch(handlers::update_status),
        )
        .route("/health", get(handlers::health))
        .route("/ready", get(handlers::ready))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .layer(middleware::from_fn(obs_middleware::http_tracing))
        .layer(middleware::from_fn(obs_middleware::request_id))
        .with_state(state)
}
