//! Prometheus metrics definitions and HTTP server

use std::net::SocketAddr;

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use prometheus::{
    register_counter_vec, register_histogram_vec, register_int_counter, CounterVec, Encoder,
    HistogramVec, IntCounter, TextEncoder,
};
use tokio::net::TcpListener;
use tracing::{error, info};

lazy_static::lazy_static! {
    /// Total number of reconciliations
    pub static ref RECONCILIATIONS: CounterVec = register_counter_vec!(
        "pvc_clone_controller_reconciliations_total",
        "Total number of reconciliations",
        &["kind"]
    ).unwrap();

    /// Total number of reconciliation errors
    pub static ref RECONCILIATION_ERRORS: CounterVec = register_counter_vec!(
        "pvc_clone_controller_reconciliation_errors_total",
        "Total number of reconciliation errors by error class",
        &["kind", "class"]
    ).unwrap();

    /// Reconciliation duration histogram
    pub static ref RECONCILE_DURATION: HistogramVec = register_histogram_vec!(
        "pvc_clone_controller_reconcile_duration_seconds",
        "Duration of reconciliations in seconds",
        &["kind"],
        vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]
    ).unwrap();

    /// Clone pods created, by role
    pub static ref CLONE_PODS_CREATED: CounterVec = register_counter_vec!(
        "pvc_clone_controller_clone_pods_created_total",
        "Total number of clone pods created",
        &["role"]
    ).unwrap();

    /// Clone pods deleted after completion, by role and outcome
    pub static ref CLONE_PODS_DELETED: CounterVec = register_counter_vec!(
        "pvc_clone_controller_clone_pods_deleted_total",
        "Total number of clone pod deletions by outcome",
        &["role", "outcome"]
    ).unwrap();

    /// Clones marked complete
    pub static ref CLONES_COMPLETED: IntCounter = register_int_counter!(
        "pvc_clone_controller_clones_completed_total",
        "Total number of completed clones"
    ).unwrap();

    /// Clone requests rejected by authorization or compatibility checks
    pub static ref CLONE_REJECTIONS: CounterVec = register_counter_vec!(
        "pvc_clone_controller_clone_rejections_total",
        "Total number of rejected clone requests by reason",
        &["reason"]
    ).unwrap();

    /// Controller health (1 = healthy, 0 = unhealthy)
    pub static ref CONTROLLER_HEALTH: prometheus::Gauge = prometheus::register_gauge!(
        "pvc_clone_controller_health",
        "Controller health status (1 = healthy, 0 = unhealthy)"
    ).unwrap();
}

/// Start the metrics HTTP server
pub async fn serve(port: u16) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    info!("Metrics server listening on {}", addr);

    loop {
        let (stream, _) = listener.accept().await?;
        let io = TokioIo::new(stream);

        tokio::spawn(async move {
            if let Err(e) = http1::Builder::new()
                .serve_connection(io, service_fn(handle_request))
                .await
            {
                error!("Error serving connection: {}", e);
            }
        });
    }
}

async fn handle_request(
    req: Request<hyper::body::Incoming>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    Ok(route(req.uri().path()))
}

fn route(path: &str) -> Response<Full<Bytes>> {
    match path {
        "/metrics" => metrics_response(),
        "/healthz" => text_response(StatusCode::OK, "ok"),
        "/readyz" if CONTROLLER_HEALTH.get() >= 1.0 => text_response(StatusCode::OK, "ok"),
        "/readyz" => text_response(StatusCode::SERVICE_UNAVAILABLE, "not ready"),
        _ => text_response(StatusCode::NOT_FOUND, "Not Found"),
    }
}

fn metrics_response() -> Response<Full<Bytes>> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        error!("Failed to encode metrics: {}", e);
        return text_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to encode metrics");
    }

    let mut response = Response::new(Full::new(Bytes::from(buffer)));
    if let Ok(content_type) = HeaderValue::from_str(encoder.format_type()) {
        response.headers_mut().insert(CONTENT_TYPE, content_type);
    }
    response
}

fn text_response(status: StatusCode, body: &'static str) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from_static(body.as_bytes())));
    *response.status_mut() = status;
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routes_health_checks_and_unknown_paths() {
        assert_eq!(route("/healthz").status(), StatusCode::OK);
        assert_eq!(route("/nope").status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn metrics_endpoint_exposes_controller_families() {
        CLONES_COMPLETED.inc();
        let response = route("/metrics");
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers()[CONTENT_TYPE]
            .to_str()
            .unwrap()
            .starts_with("text/plain"));
    }
}
