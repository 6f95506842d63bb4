//! Streaming request observation through the tower layer.

use std::convert::Infallible;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use http::{Request, Response, StatusCode};
use http_body::{Body, Frame};
use http_body_util::{BodyExt, Full};
use reqmeter_core::{Fault, MetricsContext, StartOptions};
use reqmeter_tower::{ExtensionResolver, RouteTable, get_middleware};
use tokio::sync::mpsc;
use tower::{Layer, ServiceExt, service_fn};

#[derive(Debug)]
struct ValueError;

#[derive(Debug)]
struct BodyError;

/// Body fed frame by frame from the test.
struct ChannelBody {
    rx: mpsc::Receiver<Result<Bytes, BodyError>>,
}

impl Body for ChannelBody {
    type Data = Bytes;
    type Error = BodyError;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>, BodyError>>> {
        self.rx
            .poll_recv(cx)
            .map(|item| item.map(|chunk| chunk.map(Frame::data)))
    }
}

fn started() -> MetricsContext {
    let ctx = MetricsContext::new();
    ctx.start(StartOptions::new("svc", "pod-1")).unwrap();
    ctx
}

fn routes() -> RouteTable {
    RouteTable::new().route("/ok").route("/stream").route("/users/{id}")
}

fn get_req(uri: &str) -> Request<()> {
    Request::builder().uri(uri).body(()).unwrap()
}

fn labels<'a>(path: &'a str, extra: &[(&'a str, &'a str)]) -> Vec<(&'a str, &'a str)> {
    let mut l = vec![
        ("service", "svc"),
        ("pod", "pod-1"),
        ("method", "GET"),
        ("path_template", path),
    ];
    l.extend_from_slice(extra);
    l
}

#[tokio::test]
async fn full_body_is_recorded_on_completion() {
    let ctx = started();
    let layer = get_middleware(&ctx, routes(), None, None).unwrap();
    let svc = layer.layer(service_fn(|_req: Request<()>| async {
        Ok::<_, Infallible>(Response::new(Full::new(Bytes::from_static(b"hello"))))
    }));

    let resp = svc.oneshot(get_req("/users/7")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body = resp.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&body[..], b"hello");

    let path = "/users/{id}";
    assert_eq!(ctx.sample_value("requests_total", &labels(path, &[])), Some(1.0));
    assert_eq!(
        ctx.sample_value("responses_total", &labels(path, &[("status_code", "200")])),
        Some(1.0)
    );
    assert_eq!(
        ctx.sample_value("requests_processing_time_seconds_count", &labels(path, &[])),
        Some(1.0)
    );
    assert_eq!(ctx.sample_value("requests_in_progress", &labels(path, &[])), Some(0.0));
}

#[tokio::test]
async fn streaming_body_is_recorded_only_when_sent() {
    let ctx = started();
    let (tx, rx) = mpsc::channel(4);
    let body = std::sync::Mutex::new(Some(ChannelBody { rx }));
    let layer = get_middleware(&ctx, routes(), None, None).unwrap();
    let svc = layer.layer(service_fn(move |_req: Request<()>| {
        let body = body.lock().unwrap().take().unwrap();
        async move {
            let mut resp = Response::new(body);
            *resp.status_mut() = StatusCode::ACCEPTED;
            Ok::<_, Infallible>(resp)
        }
    }));

    let resp = svc.oneshot(get_req("/stream")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::ACCEPTED);
    assert!(resp.body().is_observing());

    // Head sent, body still open.
    let path = "/stream";
    let accepted = labels(path, &[("status_code", "202")]);
    assert_eq!(ctx.sample_value("requests_in_progress", &labels(path, &[])), Some(1.0));
    assert_eq!(ctx.sample_value("responses_total", &accepted), None);

    tx.send(Ok(Bytes::from_static(b"part one "))).await.unwrap();
    tx.send(Ok(Bytes::from_static(b"part two"))).await.unwrap();
    drop(tx);

    let body = resp.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&body[..], b"part one part two");

    assert_eq!(ctx.sample_value("responses_total", &accepted), Some(1.0));
    assert_eq!(
        ctx.sample_value("requests_processing_time_seconds_count", &labels(path, &[])),
        Some(1.0)
    );
    assert_eq!(ctx.sample_value("requests_in_progress", &labels(path, &[])), Some(0.0));
}

#[tokio::test]
async fn dropped_body_records_without_duration() {
    let ctx = started();
    let (tx, rx) = mpsc::channel(1);
    let body = std::sync::Mutex::new(Some(ChannelBody { rx }));
    let layer = get_middleware(&ctx, routes(), None, None).unwrap();
    let svc = layer.layer(service_fn(move |_req: Request<()>| {
        let body = body.lock().unwrap().take().unwrap();
        async move { Ok::<_, Infallible>(Response::new(body)) }
    }));

    let resp = svc.oneshot(get_req("/stream")).await.unwrap();
    drop(resp);
    drop(tx);

    let path = "/stream";
    assert_eq!(
        ctx.sample_value("responses_total", &labels(path, &[("status_code", "200")])),
        Some(1.0)
    );
    assert_eq!(
        ctx.sample_value("requests_processing_time_seconds_count", &labels(path, &[])),
        None
    );
    assert_eq!(ctx.sample_value("requests_in_progress", &labels(path, &[])), Some(0.0));
}

#[tokio::test]
async fn body_error_counts_exception() {
    let ctx = started();
    let (tx, rx) = mpsc::channel(2);
    let body = std::sync::Mutex::new(Some(ChannelBody { rx }));
    let layer = get_middleware(&ctx, routes(), None, None).unwrap();
    let svc = layer.layer(service_fn(move |_req: Request<()>| {
        let body = body.lock().unwrap().take().unwrap();
        async move { Ok::<_, Infallible>(Response::new(body)) }
    }));

    let resp = svc.oneshot(get_req("/stream")).await.unwrap();
    tx.send(Ok(Bytes::from_static(b"partial"))).await.unwrap();
    tx.send(Err(BodyError)).await.unwrap();
    assert!(resp.into_body().collect().await.is_err());

    let path = "/stream";
    assert_eq!(
        ctx.sample_value("exceptions_total", &labels(path, &[("exception_type", "BodyError")])),
        Some(1.0)
    );
    assert_eq!(
        ctx.sample_value("responses_total", &labels(path, &[("status_code", "500")])),
        Some(1.0)
    );
    assert_eq!(ctx.sample_value("requests_in_progress", &labels(path, &[])), Some(0.0));
}

#[tokio::test]
async fn service_error_is_counted_and_returned() {
    let ctx = started();
    let layer = get_middleware(&ctx, routes(), None, None).unwrap();
    let svc = layer.layer(service_fn(|_req: Request<()>| async {
        Err::<Response<Full<Bytes>>, _>(ValueError)
    }));

    let err = svc.oneshot(get_req("/ok")).await.unwrap_err();
    assert!(matches!(err, ValueError));

    assert_eq!(
        ctx.sample_value("exceptions_total", &labels("/ok", &[("exception_type", "ValueError")])),
        Some(1.0)
    );
    assert_eq!(
        ctx.sample_value("responses_total", &labels("/ok", &[("status_code", "500")])),
        Some(1.0)
    );
    assert_eq!(
        ctx.sample_value("requests_processing_time_seconds_count", &labels("/ok", &[])),
        None
    );
}

#[tokio::test]
async fn fault_extension_keeps_response_status() {
    let ctx = started();
    let layer = get_middleware(&ctx, routes(), None, None).unwrap();
    let svc = layer.layer(service_fn(|_req: Request<()>| async {
        let mut resp = Response::new(Full::new(Bytes::from_static(b"bad input")));
        *resp.status_mut() = StatusCode::UNPROCESSABLE_ENTITY;
        resp.extensions_mut().insert(Fault::of::<ValueError>());
        Ok::<_, Infallible>(resp)
    }));

    let resp = svc.oneshot(get_req("/ok")).await.unwrap();
    resp.into_body().collect().await.unwrap();

    assert_eq!(
        ctx.sample_value("exceptions_total", &labels("/ok", &[("exception_type", "ValueError")])),
        Some(1.0)
    );
    assert_eq!(
        ctx.sample_value("responses_total", &labels("/ok", &[("status_code", "422")])),
        Some(1.0)
    );
}

#[tokio::test]
async fn unmatched_and_excluded_paths_pass_through() {
    let ctx = started();
    let layer = get_middleware(&ctx, routes(), None, Some(vec!["/ok".into()])).unwrap();
    let svc = layer.layer(service_fn(|_req: Request<()>| async {
        Ok::<_, Infallible>(Response::new(Full::new(Bytes::from_static(b"x"))))
    }));

    for uri in ["/ok", "/missing"] {
        let resp = svc.clone().oneshot(get_req(uri)).await.unwrap();
        assert!(!resp.body().is_observing());
        resp.into_body().collect().await.unwrap();
    }
    assert_eq!(ctx.sample_value("requests_total", &labels("/ok", &[])), None);
    assert_eq!(ctx.sample_value("requests_total", &labels("/missing", &[])), None);
}

#[tokio::test]
async fn extension_resolver_uses_upstream_template() {
    let ctx = started();
    let layer = get_middleware(&ctx, ExtensionResolver, None, None).unwrap();
    let svc = layer.layer(service_fn(|_req: Request<()>| async {
        Ok::<_, Infallible>(Response::new(Full::new(Bytes::new())))
    }));

    let mut req = get_req("/orders/55");
    req.extensions_mut()
        .insert(reqmeter_core::PathTemplate::handled("/orders/{id}"));
    let resp = svc.oneshot(req).await.unwrap();
    // Empty bodies complete as soon as the head is ready.
    assert!(!resp.body().is_observing());

    assert_eq!(
        ctx.sample_value("requests_processing_time_seconds_count", &labels("/orders/{id}", &[])),
        Some(1.0)
    );
    assert_eq!(
        ctx.sample_value("responses_total", &labels("/orders/{id}", &[("status_code", "200")])),
        Some(1.0)
    );
}
