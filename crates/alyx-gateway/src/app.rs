use std::sync::Arc;

use alyx_bus::EventBus;
use alyx_core::config::AlyxConfig;
use alyx_executor::{Executor, FunctionIndex};
use alyx_hooks::HookRegistry;
use alyx_scheduler::Scheduler;
use alyx_store::Store;
use axum::routing::{any, get, post};
use axum::Router;

/// Central shared state; passed as Arc<AppState> to all Axum handlers.
pub struct AppState {
    pub config: AlyxConfig,
    pub store: Arc<Store>,
    pub registry: Arc<HookRegistry>,
    pub bus: Arc<EventBus>,
    pub scheduler: Arc<Scheduler>,
    pub executor: Arc<Executor>,
    pub functions: Arc<FunctionIndex>,
}

/// Assemble the full Axum router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(crate::http::health::health))
        .route(
            "/api/hooks",
            get(crate::http::hooks::list).post(crate::http::hooks::create),
        )
        .route(
            "/api/hooks/{id}",
            get(crate::http::hooks::get_one)
                .patch(crate::http::hooks::update)
                .delete(crate::http::hooks::delete),
        )
        .route("/api/functions", get(crate::http::functions::list))
        .route(
            "/api/functions/{name}/hooks",
            get(crate::http::hooks::list_for_function),
        )
        .route(
            "/api/webhooks",
            get(crate::http::webhooks_api::list).post(crate::http::webhooks_api::create),
        )
        .route(
            "/api/webhooks/{id}",
            get(crate::http::webhooks_api::get_one)
                .patch(crate::http::webhooks_api::update)
                .delete(crate::http::webhooks_api::delete),
        )
        .route(
            "/api/schedules",
            get(crate::http::schedules::list).post(crate::http::schedules::create),
        )
        .route(
            "/api/schedules/{id}",
            get(crate::http::schedules::get_one)
                .patch(crate::http::schedules::update)
                .delete(crate::http::schedules::delete),
        )
        .route(
            "/api/schedules/{id}/trigger",
            post(crate::http::schedules::trigger),
        )
        .route("/api/executions", get(crate::http::executions::list))
        .route("/api/executions/{id}", get(crate::http::executions::get_one))
        .route("/webhooks/{*path}", any(crate::http::ingress::receive))
        .with_state(state)
        .layer(tower_http::trace::TraceLayer::new_for_http())
}
