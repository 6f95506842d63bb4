//! reqmeter-tower — request metrics as a tower layer.
//!
//! For servers built directly on tower services (hyper, tonic-style
//! stacks) where the response body is streamed. A request counts as
//! completed only when its body has been fully sent.
//!
//! ```text
//! MetricsLayer<R>
//!   └── MetricsService<S, R>
//!         ├── R: RequestAdapter   ← RouteTable / ExtensionResolver / custom
//!         ├── S::call()           → response head: status recorded
//!         └── ObservedBody<B>     → end of stream: duration recorded
//! ```

pub mod body;
pub mod resolver;

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures_util::FutureExt;
use http::{Request, Response, StatusCode, header};
use http_body::Body;
use http_body_util::Full;
use reqmeter_core::{
    Fault, MetricsContext, MetricsResult, RequestAdapter, RequestObservation, RouteFilter,
    classify_panic, type_name_of,
};
use tower::{Layer, Service};
use tracing::{debug, warn};

pub use body::ObservedBody;
pub use resolver::{ExtensionResolver, RouteTable};

/// Build the metrics layer.
///
/// The include/exclude lists are stored on `ctx` and apply to all
/// adapters sharing it.
pub fn get_middleware<R>(
    ctx: &MetricsContext,
    resolver: R,
    include_routes: Option<Vec<String>>,
    exclude_routes: Option<Vec<String>>,
) -> MetricsResult<MetricsLayer<R>> {
    ctx.http_metrics()?;
    ctx.set_route_filter(RouteFilter::from_lists(include_routes, exclude_routes));
    debug!("tower request metrics layer created");

    Ok(MetricsLayer {
        ctx: ctx.clone(),
        resolver: Arc::new(resolver),
    })
}

/// Layer wrapping services in [`MetricsService`].
pub struct MetricsLayer<R> {
    ctx: MetricsContext,
    resolver: Arc<R>,
}

impl<R> Clone for MetricsLayer<R> {
    fn clone(&self) -> Self {
        Self {
            ctx: self.ctx.clone(),
            resolver: self.resolver.clone(),
        }
    }
}

impl<S, R> Layer<S> for MetricsLayer<R> {
    type Service = MetricsService<S, R>;

    fn layer(&self, inner: S) -> Self::Service {
        MetricsService {
            inner,
            ctx: self.ctx.clone(),
            resolver: self.resolver.clone(),
        }
    }
}

/// Service recording request metrics around an inner HTTP service.
pub struct MetricsService<S, R> {
    inner: S,
    ctx: MetricsContext,
    resolver: Arc<R>,
}

impl<S: Clone, R> Clone for MetricsService<S, R> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            ctx: self.ctx.clone(),
            resolver: self.resolver.clone(),
        }
    }
}

type ObservedFuture<B, E> =
    Pin<Box<dyn Future<Output = Result<Response<ObservedBody<B>>, E>> + Send>>;

impl<S, R, ReqBody, ResBody> Service<Request<ReqBody>> for MetricsService<S, R>
where
    S: Service<Request<ReqBody>, Response = Response<ResBody>>,
    S::Future: Send + 'static,
    S::Error: Send + 'static,
    R: RequestAdapter<ReqBody>,
    ResBody: Body + Send + 'static,
{
    type Response = Response<ObservedBody<ResBody>>;
    type Error = S::Error;
    type Future = ObservedFuture<ResBody, S::Error>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: Request<ReqBody>) -> Self::Future {
        let template = self.resolver.resolve_path_template(&request);
        let observation = RequestObservation::begin(&self.ctx, request.method().as_str(), &template);
        let future = self.inner.call(request);
        let error_type = type_name_of::<S::Error>();

        let Some(mut observation) = observation else {
            return Box::pin(async move {
                future
                    .await
                    .map(|response| response.map(ObservedBody::unobserved))
            });
        };

        Box::pin(async move {
            match AssertUnwindSafe(future).catch_unwind().await {
                Ok(Ok(response)) => {
                    if let Some(fault) = response.extensions().get::<Fault>() {
                        observation.fault(fault.exception_type());
                    }
                    observation.response_started(response.status().as_u16());
                    Ok(response.map(|body| ObservedBody::new(body, observation)))
                }
                Ok(Err(e)) => {
                    observation.fault(error_type);
                    observation.finish();
                    Err(e)
                }
                Err(payload) => {
                    observation.fault(&classify_panic(payload.as_ref()));
                    observation.finish();
                    std::panic::resume_unwind(payload)
                }
            }
        })
    }
}

/// Scrape response for `ctx`: the exposition body with its content type,
/// or a 500 with the error message.
pub fn get_http_response_metrics(ctx: &MetricsContext) -> Response<Full<Bytes>> {
    let (status, content_type, body) = match ctx.export() {
        Ok((body, content_type)) => (StatusCode::OK, content_type, body),
        Err(e) => {
            warn!(error = %e, "failed to export metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "text/plain; charset=utf-8",
                e.to_string().into_bytes(),
            )
        }
    };
    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(header::CONTENT_TYPE, header::HeaderValue::from_static(content_type));
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scrape_before_start_is_server_error() {
        let response = get_http_response_metrics(&MetricsContext::new());
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn scrape_after_start_carries_content_type() {
        let ctx = MetricsContext::new();
        ctx.start(reqmeter_core::StartOptions::new("svc", "pod")).unwrap();
        let response = get_http_response_metrics(&ctx);
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            reqmeter_core::CONTENT_TYPE_LATEST
        );
    }
}
