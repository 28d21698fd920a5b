//! Application setup and server configuration.

use std::sync::Arc;
use std::time::Duration;

use axum::http::Method;
use axum::routing::{get, post};
use axum::Router;
use tower_governor::{governor::GovernorConfigBuilder, GovernorLayer};
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::kernel::ServerKernel;
use crate::server::middleware::propagate_request_id;
use crate::server::routes;

pub type AppState = Arc<ServerKernel>;

/// Builds the Axum router: routes, CORS driven by configuration, a
/// per-client sliding-window rate limiter, request tracing, and the
/// request-id propagation middleware.
pub fn build_app(kernel: Arc<ServerKernel>) -> Router {
    let cors = if kernel.config.cors_origins.is_empty() {
        CorsLayer::new().allow_origin(AllowOrigin::any())
    } else {
        let origins: Vec<_> = kernel
            .config
            .cors_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        CorsLayer::new().allow_origin(origins)
    }
    .allow_methods([Method::GET, Method::POST])
    .allow_headers(tower_http::cors::Any);

    let per_second = (kernel.config.rate_limit_per_min.max(1) as u64 / 60).max(1);
    let governor_config = Arc::new(
        GovernorConfigBuilder::default()
            .per_second(per_second)
            .burst_size(kernel.config.rate_limit_per_min.max(1))
            .finish()
            .expect("rate limiter configuration is valid"),
    );

    Router::new()
        .route("/observability/health", get(routes::health::health_handler))
        .route("/observability/metrics", get(routes::observability::metrics_handler))
        .route("/observability/traces", get(routes::observability::traces_handler))
        .route("/observability/runs/:id", get(routes::observability::run_snapshot_handler))
        .route("/observability/usage", get(routes::observability::usage_handler))
        .route(
            "/projects/",
            post(routes::projects::create_project).get(routes::projects::list_projects),
        )
        .route("/projects/:id/quota", post(routes::projects::update_quota))
        .route("/work-items/", post(routes::work_items::create_work_item))
        .route("/work-items/:id/tool-recipe", post(routes::work_items::set_tool_recipe))
        .route("/work-items/:id/policy", post(routes::work_items::set_policy))
        .route("/work-items/:id/approvals", post(routes::work_items::request_approval))
        .route("/work-items/approvals/:id/approve", post(routes::work_items::decide_approval))
        .route("/work-items/:id/start", post(routes::work_items::start_work_item))
        .route("/work-items/:id/runs", get(routes::work_items::list_runs))
        .route("/work-items/runs/:id/claim", post(routes::runs::claim_run))
        .route("/work-items/runs/:id/heartbeat", post(routes::runs::heartbeat_run))
        .route("/work-items/runs/:id/complete", post(routes::runs::complete_run))
        .route(
            "/work-items/runs/:id/logs",
            get(routes::runs::list_logs).post(routes::runs::append_log),
        )
        .route("/work-items/runs/:id/logs/ws", get(routes::ws::stream_logs))
        .route(
            "/work-items/runs/:id/steps",
            post(routes::runs::create_step).get(routes::runs::list_steps),
        )
        .route("/work-items/runs/steps/:id", post(routes::runs::update_step))
        .route(
            "/work-items/runs/:id/info-requests",
            get(routes::info_requests::list_info_requests),
        )
        .route(
            "/work-items/runs/info-requests/:id/respond",
            post(routes::info_requests::respond_info_request),
        )
        .route("/scheduler/enqueue", post(routes::scheduler::enqueue))
        .route("/scheduler/tick", post(routes::scheduler::tick))
        .route("/scheduler/queue", get(routes::scheduler::list_queue))
        .route("/scheduler/requeue/work-item", post(routes::scheduler::requeue_work_item))
        .route("/scheduler/requeue/run/:id", post(routes::scheduler::requeue_run))
        .layer(axum::middleware::from_fn(propagate_request_id))
        .layer(GovernorLayer { config: governor_config })
        .layer(TimeoutLayer::new(Duration::from_secs(30)))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(kernel)
}
