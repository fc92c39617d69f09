//! Prometheus metrics definitions and HTTP server

use std::net::SocketAddr;

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use prometheus::{
    register_counter_vec, register_gauge, register_histogram_vec, register_int_counter,
    CounterVec, Encoder, Gauge, HistogramVec, IntCounter, TextEncoder,
};
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tracing::{debug, error, info};

use crate::shutdown::Shutdown;

lazy_static::lazy_static! {
    /// Total number of reconciliations
    pub static ref RECONCILIATIONS: CounterVec = register_counter_vec!(
        "devops_controller_manager_reconciliations_total",
        "Total number of reconciliations",
        &["controller"]
    ).unwrap();

    /// Total number of reconciliation errors
    pub static ref RECONCILIATION_ERRORS: CounterVec = register_counter_vec!(
        "devops_controller_manager_reconciliation_errors_total",
        "Total number of reconciliation errors",
        &["controller"]
    ).unwrap();

    /// Reconciliation duration histogram
    pub static ref RECONCILE_DURATION: HistogramVec = register_histogram_vec!(
        "devops_controller_manager_reconcile_duration_seconds",
        "Duration of reconciliations in seconds",
        &["controller"],
        vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]
    ).unwrap();

    /// Whether this replica currently holds leadership (1 = leader)
    pub static ref IS_LEADER: Gauge = register_gauge!(
        "devops_controller_manager_is_leader",
        "Whether this replica is the elected leader (1 = leader, 0 = follower)"
    ).unwrap();

    /// Number of times this replica became leader
    pub static ref LEADER_TRANSITIONS: IntCounter = register_int_counter!(
        "devops_controller_manager_leader_transitions_total",
        "Number of times this replica acquired leadership"
    ).unwrap();

    /// Whether every informer finished its initial listing (1 = synced)
    pub static ref CACHE_SYNCED: Gauge = register_gauge!(
        "devops_controller_manager_cache_synced",
        "Whether the informer caches completed their initial sync"
    ).unwrap();

    /// Admission requests served by the webhook
    pub static ref WEBHOOK_REQUESTS: CounterVec = register_counter_vec!(
        "devops_controller_manager_webhook_requests_total",
        "Admission requests by webhook path and outcome",
        &["path", "outcome"]
    ).unwrap();

    /// Operator health (1 = healthy, 0 = unhealthy)
    pub static ref OPERATOR_HEALTH: Gauge = register_gauge!(
        "devops_controller_manager_health",
        "Controller manager health status (1 = healthy, 0 = unhealthy)"
    ).unwrap();
}

/// Serve metrics and health checks until `shutdown` is raised.
///
/// Open connections are closed gracefully before this returns.
pub async fn serve(port: u16, shutdown: Shutdown) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    info!("Metrics server listening on {}", addr);

    OPERATOR_HEALTH.set(1.0);

    let mut connections = JoinSet::new();
    loop {
        let (stream, _) = tokio::select! {
            _ = shutdown.cancelled() => break,
            Some(_) = connections.join_next() => continue,
            accepted = listener.accept() => accepted?,
        };

        let term = shutdown.child();
        connections.spawn(async move {
            let conn = http1::Builder::new()
                .serve_connection(TokioIo::new(stream), service_fn(handle_request));
            tokio::pin!(conn);

            let mut closing = false;
            loop {
                tokio::select! {
                    result = conn.as_mut() => {
                        if let Err(e) = result {
                            error!("Error serving connection: {}", e);
                        }
                        return;
                    }
                    _ = term.cancelled(), if !closing => {
                        closing = true;
                        conn.as_mut().graceful_shutdown();
                    }
                }
            }
        });
    }

    debug!(open = connections.len(), "Metrics server stopping");
    OPERATOR_HEALTH.set(0.0);
    while connections.join_next().await.is_some() {}
    Ok(())
}

/// Handle HTTP requests
async fn handle_request(
    req: Request<hyper::body::Incoming>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let response = match req.uri().path() {
        "/metrics" => metrics_response(),
        "/healthz" | "/health" => health_response(),
        "/readyz" | "/ready" => ready_response(),
        _ => text_response(StatusCode::NOT_FOUND, "Not Found"),
    };

    Ok(response)
}

fn metrics_response() -> Response<Full<Bytes>> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        error!("Failed to encode metrics: {}", e);
        return text_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to encode metrics");
    }

    Response::builder()
        .status(StatusCode::OK)
        .header("Content-Type", encoder.format_type())
        .body(Full::new(Bytes::from(buffer)))
        .unwrap_or_else(|_| Response::new(Full::new(Bytes::new())))
}

fn health_response() -> Response<Full<Bytes>> {
    if OPERATOR_HEALTH.get() >= 1.0 {
        text_response(StatusCode::OK, "ok")
    } else {
        text_response(StatusCode::SERVICE_UNAVAILABLE, "unhealthy")
    }
}

/// Ready once the informer caches have synced
fn ready_response() -> Response<Full<Bytes>> {
    if CACHE_SYNCED.get() >= 1.0 {
        text_response(StatusCode::OK, "ok")
    } else {
        text_response(StatusCode::SERVICE_UNAVAILABLE, "caches not synced")
    }
}

fn text_response(status: StatusCode, body: &'static str) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_readiness_follows_cache_sync() {
        CACHE_SYNCED.set(0.0);
        assert_eq!(ready_response().status(), StatusCode::SERVICE_UNAVAILABLE);

        CACHE_SYNCED.set(1.0);
        assert_eq!(ready_response().status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_bind_failure_is_reported() {
        let taken = std::net::TcpListener::bind("0.0.0.0:0").unwrap();
        let port = taken.local_addr().unwrap().port();

        assert!(serve(port, Shutdown::new()).await.is_err());
    }

    #[tokio::test]
    async fn test_open_scrape_connection_closes_on_shutdown() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let port = {
            let free = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            free.local_addr().unwrap().port()
        };
        let shutdown = Shutdown::new();
        let server = tokio::spawn(serve(port, shutdown.clone()));

        let mut client = loop {
            match tokio::net::TcpStream::connect(("127.0.0.1", port)).await {
                Ok(client) => break client,
                Err(_) => tokio::time::sleep(std::time::Duration::from_millis(10)).await,
            }
        };
        client
            .write_all(b"GET /metrics HTTP/1.1\r\nhost: metrics\r\n\r\n")
            .await
            .unwrap();
        let mut head = [0u8; 12];
        client.read_exact(&mut head).await.unwrap();
        assert_eq!(&head, b"HTTP/1.1 200");

        shutdown.raise("test");
        tokio::time::timeout(std::time::Duration::from_secs(5), server)
            .await
            .expect("metrics server outlived shutdown")
            .unwrap()
            .unwrap();
        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
    }

    #[test]
    fn test_metrics_are_exposed_with_prefix() {
        LEADER_TRANSITIONS.inc();
        let response = metrics_response();
        assert_eq!(response.status(), StatusCode::OK);

        let names: Vec<String> = prometheus::gather()
            .iter()
            .map(|family| family.get_name().to_string())
            .collect();
        assert!(names
            .iter()
            .any(|n| n == "devops_controller_manager_leader_transitions_total"));
    }
}
