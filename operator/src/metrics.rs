use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use kube::api::{Api, ApiResource, DynamicObject, ListParams};
use kube::client::Client;
use owo_colors::OwoColorize;
use prometheus::{Encoder, TextEncoder};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Probe state shared with the controller: the resolved GVK for the
/// bounded-list health check, and the cache-sync readiness flag.
#[derive(Clone)]
pub struct HealthState {
    pub client: Client,
    pub resource: ApiResource,
    pub ready: Arc<AtomicBool>,
}

/// Serves `/metrics`, `/healthz` and `/readyz` until the process shuts
/// down.
pub async fn run_server(port: u16, state: HealthState) {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let make_svc = make_service_fn(move |_conn| {
        let state = state.clone();
        async move { Ok::<_, Infallible>(service_fn(move |req| handle(req, state.clone()))) }
    });
    println!(
        "{}{}",
        "📈 Starting metrics server • port=".green(),
        format!("{port}").green().dimmed(),
    );
    Server::bind(&addr)
        .serve(make_svc)
        .with_graceful_shutdown(lapse_common::shutdown::shutdown_signal())
        .await
        .expect("Failed to serve metrics");
}

async fn handle(req: Request<Body>, state: HealthState) -> Result<Response<Body>, Infallible> {
    let response = match (req.method(), req.uri().path()) {
        (&Method::GET, "/metrics") => render_metrics(),
        (&Method::GET, "/healthz") => healthz(&state).await,
        (&Method::GET, "/readyz") => readyz(&state),
        _ => status_response(StatusCode::NOT_FOUND, "not found".to_string()),
    };
    Ok(response)
}

fn render_metrics() -> Response<Body> {
    let metric_families = prometheus::gather();
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if encoder.encode(&metric_families, &mut buffer).is_err() {
        return status_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "failed to encode metrics".to_string(),
        );
    }
    Response::builder()
        .header(hyper::header::CONTENT_TYPE, encoder.format_type())
        .body(Body::from(buffer))
        .expect("static response")
}

/// Liveness: the managed GVK must still be served and listable. A bounded
/// list keeps the probe cheap on high-cardinality kinds.
async fn healthz(state: &HealthState) -> Response<Body> {
    let api: Api<DynamicObject> = Api::all_with(state.client.clone(), &state.resource);
    match api.list(&ListParams::default().limit(1)).await {
        Ok(_) => status_response(StatusCode::OK, "ok".to_string()),
        Err(e) => status_response(StatusCode::INTERNAL_SERVER_ERROR, format!("list failed: {e}")),
    }
}

/// Readiness: the watch cache must have completed its initial sync.
fn readyz(state: &HealthState) -> Response<Body> {
    if state.ready.load(Ordering::Acquire) {
        status_response(StatusCode::OK, "ok".to_string())
    } else {
        status_response(StatusCode::SERVICE_UNAVAILABLE, "cache not synced".to_string())
    }
}

fn status_response(status: StatusCode, body: String) -> Response<Body> {
    Response::builder()
        .status(status)
        .body(Body::from(body))
        .expect("static response")
}
