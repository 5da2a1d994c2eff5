//! Axum JSON surface over the order store, the reconciler and sync progress.

use std::sync::Arc;

use axum::{
    extract::{Path as AxumPath, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::net::TcpListener;
use tracing::{error, info};
use wotrack_core::{summarize, CivilCalendar, CivilDate, Reconciler, StatusLabel};
use wotrack_ingest::{JsonFileSource, RowSource};
use wotrack_storage::{OrderStore, PgStore, StoreError};
use wotrack_sync::{maybe_build_scheduler, pipeline_from_config, ProgressTracker, SyncConfig, SyncPipeline};

pub const CRATE_NAME: &str = "wotrack-web";

#[derive(Clone)]
struct SyncRunner {
    pipeline: Arc<SyncPipeline>,
    source: Arc<dyn RowSource>,
}

#[derive(Clone)]
pub struct AppState {
    store: Arc<dyn OrderStore>,
    progress: ProgressTracker,
    reconciler: Reconciler,
    runner: Option<SyncRunner>,
    fixed_now: Option<DateTime<Utc>>,
}

impl AppState {
    pub fn new(store: Arc<dyn OrderStore>, progress: ProgressTracker, reconciler: Reconciler) -> Self {
        Self {
            store,
            progress,
            reconciler,
            runner: None,
            fixed_now: None,
        }
    }

    /// Enable `POST /api/sync/run`. Progress is read from the pipeline's tracker.
    pub fn with_sync_runner(mut self, pipeline: Arc<SyncPipeline>, source: Arc<dyn RowSource>) -> Self {
        self.progress = pipeline.progress().clone();
        self.runner = Some(SyncRunner { pipeline, source });
        self
    }

    /// Pin "now" so today's civil date is stable.
    pub fn with_fixed_now(mut self, now: DateTime<Utc>) -> Self {
        self.fixed_now = Some(now);
        self
    }

    fn today(&self) -> CivilDate {
        self.reconciler.today(self.fixed_now.unwrap_or_else(Utc::now))
    }
}

#[derive(Debug, Deserialize, Default)]
struct OrdersQuery {
    label: Option<String>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/api/sync/progress", get(progress_handler))
        .route("/api/sync/progress/reset", post(reset_progress_handler))
        .route("/api/sync/run", post(run_sync_handler))
        .route("/api/orders", get(orders_handler))
        .route("/api/orders/{code}", get(order_detail_handler))
        .route("/api/summary/today", get(summary_today_handler))
        .with_state(Arc::new(state))
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let port: u16 = std::env::var("WOTRACK_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000);
    let config = SyncConfig::from_env();
    let store: Arc<dyn OrderStore> = Arc::new(PgStore::connect(&config.database_url).await?);
    let pipeline = Arc::new(pipeline_from_config(
        &config,
        store.clone(),
        ProgressTracker::global().clone(),
    ));
    let source: Arc<dyn RowSource> = Arc::new(JsonFileSource::new(config.snapshot_path.clone()));

    let scheduler = maybe_build_scheduler(&config, pipeline.clone(), source.clone()).await?;
    if let Some(scheduler) = &scheduler {
        scheduler.start().await?;
        info!(cron = %config.sync_cron, "sync scheduler started");
    }

    let state = AppState::new(
        store,
        ProgressTracker::global().clone(),
        Reconciler::new(CivilCalendar::from_env()),
    )
    .with_sync_runner(pipeline, source);
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn progress_handler(State(state): State<Arc<AppState>>) -> Response {
    Json(state.progress.snapshot()).into_response()
}

async fn reset_progress_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.progress.reset() {
        Ok(progress) => Json(progress).into_response(),
        Err(err) => error_body(StatusCode::CONFLICT, err.to_string()),
    }
}

async fn run_sync_handler(State(state): State<Arc<AppState>>) -> Response {
    let Some(runner) = state.runner.clone() else {
        return error_body(StatusCode::NOT_FOUND, "sync runs are not enabled on this server");
    };
    if runner.pipeline.claim_run(runner.source.as_ref()).is_err() {
        return error_body(StatusCode::CONFLICT, "a sync run is already in progress");
    }
    let accepted = state.progress.snapshot();
    tokio::spawn(async move {
        if let Err(err) = runner.pipeline.run_claimed(runner.source.as_ref()).await {
            error!(error = %err, "triggered sync failed");
        }
    });
    (StatusCode::ACCEPTED, Json(accepted)).into_response()
}

async fn orders_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<OrdersQuery>,
) -> Response {
    let label = match query.label.as_deref().filter(|l| !l.trim().is_empty()) {
        None => None,
        Some(raw) => match StatusLabel::parse(raw) {
            Some(label) => Some(label),
            None => return error_body(StatusCode::BAD_REQUEST, format!("unknown label {raw:?}")),
        },
    };
    match state.store.list_bundles().await {
        Ok(bundles) => {
            let mut orders = state.reconciler.enrich_all(&bundles, &state.today());
            if let Some(label) = label {
                orders.retain(|o| o.label == label);
            }
            Json(orders).into_response()
        }
        Err(err) => store_error(err),
    }
}

async fn order_detail_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(code): AxumPath<String>,
) -> Response {
    let order = match state.store.get_order_by_code(&code).await {
        Ok(Some(order)) => order,
        Ok(None) => return error_body(StatusCode::NOT_FOUND, format!("order {code} not found")),
        Err(err) => return store_error(err),
    };
    match state.store.load_bundle(order.id).await {
        Ok(Some(bundle)) => Json(state.reconciler.enrich(&bundle, &state.today())).into_response(),
        Ok(None) => error_body(StatusCode::NOT_FOUND, format!("order {code} not found")),
        Err(err) => store_error(err),
    }
}

async fn summary_today_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.store.list_bundles().await {
        Ok(bundles) => {
            let today = state.today();
            let orders = state.reconciler.enrich_all(&bundles, &today);
            Json(summarize(&today, &orders)).into_response()
        }
        Err(err) => store_error(err),
    }
}

fn error_body(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(serde_json::json!({ "error": message.into() }))).into_response()
}

fn store_error(err: StoreError) -> Response {
    error!(error = %err, "store request failed");
    let status = if err.is_systemic() {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };
    error_body(status, err.to_string())
}
