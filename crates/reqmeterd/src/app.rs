//! The instrumented demo service.
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/ok` | Liveness |
//! | GET | `/users/{id}` | Timed user lookup (404 for id 0) |
//! | POST | `/orders/{kind}` | Counts an order by kind |
//! | GET | `/metrics` | Prometheus exposition |

use std::sync::Arc;

use axum::Json;
use axum::Router;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use reqmeter_core::{
    Fault, MetricHandle, MetricKind, MetricsConfig, MetricsContext, MetricsError, MetricsResult,
    observe_metrics,
};
use serde_json::{Value, json};
use tracing::warn;

/// Application metrics on top of the built-in request metrics.
pub struct AppMetrics {
    pub lookup_seconds: MetricHandle,
    pub lookups_in_progress: MetricHandle,
    pub orders: MetricHandle,
}

impl AppMetrics {
    pub fn register(ctx: &MetricsContext) -> MetricsResult<Self> {
        Ok(Self {
            lookup_seconds: ctx
                .register_method_observe_histogram("lookup_seconds", "Time spent in lookups.")?,
            lookups_in_progress: ctx
                .register_method_observe_gauge("lookups_in_progress", "Lookups currently running.")?,
            orders: ctx.register(
                MetricKind::Counter,
                "orders_total",
                "Orders received by kind.",
                &["kind"],
            )?,
        })
    }
}

#[derive(Clone)]
struct AppState {
    ctx: MetricsContext,
    metrics: Arc<AppMetrics>,
}

/// Build the router with request metrics installed.
pub fn build_router(ctx: &MetricsContext, config: &MetricsConfig) -> MetricsResult<Router> {
    let state = AppState {
        ctx: ctx.clone(),
        metrics: Arc::new(AppMetrics::register(ctx)?),
    };

    let router = Router::new()
        .route("/ok", get(ok))
        .route("/users/{id}", get(get_user))
        .route("/orders/{kind}", post(create_order))
        .with_state(state)
        .route(
            "/metrics",
            get(reqmeter_axum::metrics_handler).with_state(ctx.clone()),
        );

    reqmeter_axum::add_middleware(
        router,
        ctx,
        config.include_routes.clone(),
        config.exclude_routes.clone(),
    )
}

async fn ok() -> &'static str {
    "ok"
}

async fn get_user(State(state): State<AppState>, Path(id): Path<u64>) -> Response {
    let user = observe_metrics(
        &state.ctx,
        "lookup_user",
        &state.metrics.lookup_seconds,
        Some(&state.metrics.lookups_in_progress),
        lookup_user(id),
    )
    .await;

    match user {
        Some(user) => Json(user).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn lookup_user(id: u64) -> Option<Value> {
    tokio::task::yield_now().await;
    (id != 0).then(|| json!({ "id": id, "name": format!("user-{id}") }))
}

async fn create_order(
    State(state): State<AppState>,
    Path(kind): Path<String>,
) -> Result<StatusCode, AppError> {
    state
        .ctx
        .apply_labels(&state.metrics.orders, &[("kind", kind.as_str())])?
        .inc();
    Ok(StatusCode::CREATED)
}

/// Handler failure, reported as a counted fault.
struct AppError(MetricsError);

impl From<MetricsError> for AppError {
    fn from(e: MetricsError) -> Self {
        Self(e)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        warn!(error = %self.0, "request failed");
        let mut response = (StatusCode::INTERNAL_SERVER_ERROR, self.0.to_string()).into_response();
        response.extensions_mut().insert(Fault::of::<MetricsError>());
        response
    }
}
