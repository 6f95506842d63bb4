//! reqmeter-axum — request metrics for axum routers.
//!
//! ```no_run
//! use axum::{Router, routing::get};
//! use reqmeter_core::{MetricsContext, StartOptions};
//!
//! # fn demo() -> reqmeter_core::MetricsResult<Router> {
//! let ctx = MetricsContext::global();
//! ctx.start(StartOptions::new("checkout", ""))?;
//!
//! let app = Router::new()
//!     .route("/orders/{id}", get(|| async { "order" }))
//!     .route("/metrics", get(reqmeter_axum::metrics_handler).with_state(ctx.clone()));
//! reqmeter_axum::add_middleware(app, ctx, None, Some(vec!["/metrics".into()]))
//! # }
//! ```
//!
//! Requests are labelled by the route they matched (`/orders/{id}`), so
//! unmatched requests (the fallback, or a known path with the wrong
//! method) are never recorded.

use std::panic::AssertUnwindSafe;

use axum::Router;
use axum::extract::{MatchedPath, Request, State};
use axum::http::{StatusCode, header};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use futures_util::FutureExt;
use reqmeter_core::{
    Fault, MetricsContext, MetricsError, MetricsResult, PathTemplate, RequestAdapter,
    RequestObservation, RouteFilter, classify_panic,
};
use tracing::{debug, warn};

/// Resolves the path template from axum's [`MatchedPath`].
#[derive(Debug, Clone, Copy, Default)]
pub struct MatchedPathAdapter;

impl<B> RequestAdapter<B> for MatchedPathAdapter {
    fn resolve_path_template(&self, request: &axum::http::Request<B>) -> PathTemplate {
        match request.extensions().get::<MatchedPath>() {
            Some(matched) => PathTemplate::handled(matched.as_str()),
            None => PathTemplate::unhandled(request.uri().path()),
        }
    }
}

/// Layer request metrics onto every route of `router`.
///
/// Only requests matching both a route's path and one of its methods are
/// observed; 404s and 405s pass through unrecorded. Add the routes first.
///
/// The include/exclude lists are stored on `ctx` and apply to all
/// adapters sharing it. Fails if the built-in request metrics cannot be
/// registered (e.g. a user metric already took one of their names), or if
/// `router` has no routes yet.
pub fn add_middleware<S>(
    router: Router<S>,
    ctx: &MetricsContext,
    include_routes: Option<Vec<String>>,
    exclude_routes: Option<Vec<String>>,
) -> MetricsResult<Router<S>>
where
    S: Clone + Send + Sync + 'static,
{
    ctx.http_metrics()?;
    if !router.has_routes() {
        return Err(MetricsError::Configuration(
            "request metrics must be added after the routes".to_string(),
        ));
    }
    ctx.set_route_filter(RouteFilter::from_lists(include_routes, exclude_routes));
    debug!("axum request metrics middleware installed");

    Ok(router.route_layer(middleware::from_fn_with_state(ctx.clone(), track_request)))
}

async fn track_request(State(ctx): State<MetricsContext>, request: Request, next: Next) -> Response {
    let template = MatchedPathAdapter.resolve_path_template(&request);
    let method = request.method().as_str().to_owned();
    let Some(mut observation) = RequestObservation::begin(&ctx, &method, &template) else {
        return next.run(request).await;
    };

    match AssertUnwindSafe(next.run(request)).catch_unwind().await {
        Ok(response) => {
            if let Some(fault) = response.extensions().get::<Fault>() {
                observation.fault(fault.exception_type());
            }
            observation.response_started(response.status().as_u16());
            observation.response_completed();
            observation.finish();
            response
        }
        Err(payload) => {
            observation.fault(&classify_panic(payload.as_ref()));
            observation.finish();
            std::panic::resume_unwind(payload)
        }
    }
}

/// Scrape response for `ctx`: the exposition body with its content type,
/// or a 500 with the error message.
pub fn get_http_response_metrics(ctx: &MetricsContext) -> Response {
    match ctx.export() {
        Ok((body, content_type)) => ([(header::CONTENT_TYPE, content_type)], body).into_response(),
        Err(e) => {
            warn!(error = %e, "failed to export metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

/// `GET /metrics` handler.
pub async fn metrics_handler(State(ctx): State<MetricsContext>) -> Response {
    get_http_response_metrics(&ctx)
}
