mod auth;
mod backups;
mod browse;
mod locations;
mod logs;
mod schedules;
mod sse;

use axum::routing::{delete, get, post};
use axum::{Json, Router, middleware};
use restic_core::constants::server::BROWSE_ROUTE;
use restic_core::engine::JobEngine;
use restic_core::restored::RestoredBrowser;
use restic_core::scheduler::Scheduler;
use serde_json::{Value, json};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

/// 各路由共享的状态
#[derive(Debug, Clone)]
pub struct AppState {
    pub engine: JobEngine,
    pub scheduler: Scheduler,
    pub browser: RestoredBrowser,
    /// 共享密钥，None 表示不校验
    pub api_token: Option<Arc<str>>,
}

impl AppState {
    pub fn new(
        engine: JobEngine,
        scheduler: Scheduler,
        browser: RestoredBrowser,
        api_token: Option<&str>,
    ) -> Self {
        Self {
            engine,
            scheduler,
            browser,
            api_token: api_token.map(Arc::from),
        }
    }
}

/// 构建完整路由
pub fn router(state: AppState) -> Router {
    let protected = Router::new()
        .route(
            "/locations",
            get(locations::list_locations).post(locations::init_location),
        )
        .route(
            "/locations/{location_id}/backups",
            get(backups::list_backups).post(backups::create_backup),
        )
        .route(
            "/locations/{location_id}/backups/{snapshot_id}",
            get(backups::list_backup_contents),
        )
        .route(
            "/locations/{location_id}/backups/{snapshot_id}/restore",
            post(backups::restore_backup),
        )
        .route(
            "/locations/{location_id}/schedule",
            get(schedules::list_schedules).post(schedules::create_schedule),
        )
        .route(
            "/locations/{location_id}/schedule/{schedule_id}",
            delete(schedules::delete_schedule),
        )
        .route(
            "/locations/{location_id}/schedule/{schedule_id}/execute-backup",
            post(schedules::execute_backup),
        )
        .route("/logs/{log_id}", get(logs::get_log))
        .route(BROWSE_ROUTE, get(browse::list_restored))
        .route(&format!("{BROWSE_ROUTE}/{{*path}}"), get(browse::browse_dir))
        .route("/view/{*path}", get(browse::view_file))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_token,
        ));

    Router::new()
        .route("/health", get(health))
        .merge(protected)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
