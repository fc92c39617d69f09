//! Admission webhook server
//!
//! HTTPS endpoint the API server calls for validating and mutating
//! admission. Serves only while this replica leads.

use std::collections::BTreeMap;
use std::fmt::Display;
use std::io::BufReader;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use http_body_util::{BodyExt, Full};
use hyper::body::{Body, Bytes};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use kube::core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview};
use kube::core::DynamicObject;
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio_rustls::rustls::{self, ServerConfig};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::metrics;

/// Certificate file inside the certificate directory
pub const TLS_CERT_FILE: &str = "tls.crt";

/// Private key file inside the certificate directory
pub const TLS_KEY_FILE: &str = "tls.key";

/// Decides on a single admission request
#[async_trait]
pub trait AdmissionHandler: Send + Sync {
    async fn handle(&self, request: &AdmissionRequest<DynamicObject>) -> AdmissionResponse;
}

/// Admission handlers keyed by URL path
pub type Handlers = BTreeMap<String, Arc<dyn AdmissionHandler>>;

/// Load the serving certificate and key from `cert_dir`
pub fn load_tls_config(cert_dir: &Path) -> Result<Arc<ServerConfig>> {
    use rustls_pemfile::{certs, private_key};

    let cert_path = cert_dir.join(TLS_CERT_FILE);
    let key_path = cert_dir.join(TLS_KEY_FILE);

    let cert_data = std::fs::read(&cert_path).map_err(|e| {
        Error::webhook(format!("failed to read certificate {}: {}", cert_path.display(), e))
    })?;
    let cert_chain = certs(&mut BufReader::new(cert_data.as_slice()))
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| {
            Error::webhook(format!("invalid certificate {}: {}", cert_path.display(), e))
        })?;
    if cert_chain.is_empty() {
        return Err(Error::webhook(format!(
            "no certificates found in {}",
            cert_path.display()
        )));
    }

    let key_data = std::fs::read(&key_path).map_err(|e| {
        Error::webhook(format!("failed to read private key {}: {}", key_path.display(), e))
    })?;
    let key = private_key(&mut BufReader::new(key_data.as_slice()))
        .map_err(|e| Error::webhook(format!("invalid private key {}: {}", key_path.display(), e)))?
        .ok_or_else(|| {
            Error::webhook(format!("no private key found in {}", key_path.display()))
        })?;

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let mut config = ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| Error::webhook(format!("unsupported TLS protocol versions: {}", e)))?
        .with_no_client_auth()
        .with_single_cert(cert_chain, key)
        .map_err(|e| Error::webhook(format!("certificate and key do not match: {}", e)))?;
    config.alpn_protocols = vec![b"http/1.1".to_vec()];

    Ok(Arc::new(config))
}

/// A bound, TLS-ready webhook listener
pub struct WebhookServer {
    listener: TcpListener,
    acceptor: TlsAcceptor,
    handlers: Arc<Handlers>,
}

impl WebhookServer {
    /// Load TLS material and bind `port`. Both failures are fatal to the manager.
    pub async fn bind(port: u16, cert_dir: &Path, handlers: Handlers) -> Result<Self> {
        let tls = load_tls_config(cert_dir)?;
        let addr = SocketAddr::from(([0, 0, 0, 0], port));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| Error::webhook(format!("failed to bind {}: {}", addr, e)))?;

        info!(
            addr = %addr,
            cert_dir = %cert_dir.display(),
            paths = ?handlers.keys().collect::<Vec<_>>(),
            "Webhook server listening"
        );

        Ok(Self {
            listener,
            acceptor: TlsAcceptor::from(tls),
            handlers: Arc::new(handlers),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until `term` is cancelled.
    ///
    /// Open connections observe `term` too: each finishes its in-flight
    /// request and closes, and `serve` returns once all of them are gone.
    pub async fn serve(self, term: CancellationToken) {
        let mut connections = JoinSet::new();
        loop {
            let (stream, peer) = tokio::select! {
                _ = term.cancelled() => break,
                Some(_) = connections.join_next() => continue,
                accepted = self.listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!(error = %e, "Failed to accept webhook connection");
                        continue;
                    }
                },
            };

            let acceptor = self.acceptor.clone();
            let handlers = self.handlers.clone();
            let term = term.clone();
            connections.spawn(async move {
                let tls = tokio::select! {
                    _ = term.cancelled() => return,
                    tls = acceptor.accept(stream) => match tls {
                        Ok(tls) => tls,
                        Err(e) => {
                            debug!(peer = %peer, error = %e, "TLS handshake failed");
                            return;
                        }
                    },
                };
                serve_connection(TokioIo::new(tls), handlers, term).await;
            });
        }

        info!(open = connections.len(), "Webhook server stopping");
        while connections.join_next().await.is_some() {}
        debug!("Webhook connections closed");
    }
}

/// Serve HTTP/1.1 on one connection until the peer leaves or `term` is
/// cancelled
async fn serve_connection<I>(io: I, handlers: Arc<Handlers>, term: CancellationToken)
where
    I: hyper::rt::Read + hyper::rt::Write + Unpin + Send + 'static,
{
    let service = service_fn(move |req| handle(handlers.clone(), req));
    let conn = http1::Builder::new().serve_connection(io, service);
    tokio::pin!(conn);

    let mut closing = false;
    loop {
        tokio::select! {
            result = conn.as_mut() => {
                if let Err(e) = result {
                    error!("Error serving webhook connection: {}", e);
                }
                return;
            }
            _ = term.cancelled(), if !closing => {
                closing = true;
                conn.as_mut().graceful_shutdown();
            }
        }
    }
}

async fn handle<B>(
    handlers: Arc<Handlers>,
    req: Request<B>,
) -> std::result::Result<Response<Full<Bytes>>, hyper::Error>
where
    B: Body,
    B::Error: Display,
{
    let path = req.uri().path().to_string();
    let Some(handler) = handlers.get(&path).cloned() else {
        return Ok(text(StatusCode::NOT_FOUND, "Not Found"));
    };
    if req.method() != Method::POST {
        return Ok(text(StatusCode::METHOD_NOT_ALLOWED, "Method Not Allowed"));
    }

    let body = match req.into_body().collect().await {
        Ok(body) => body.to_bytes(),
        Err(e) => {
            warn!(path = %path, error = %e, "Failed to read admission request body");
            return Ok(text(StatusCode::BAD_REQUEST, "unreadable body"));
        }
    };

    let review: AdmissionReview<DynamicObject> = match serde_json::from_slice(&body) {
        Ok(review) => review,
        Err(e) => {
            metrics::WEBHOOK_REQUESTS
                .with_label_values(&[path.as_str(), "malformed"])
                .inc();
            warn!(path = %path, error = %e, "Malformed admission review");
            return Ok(text(StatusCode::BAD_REQUEST, "malformed admission review"));
        }
    };

    let request: std::result::Result<AdmissionRequest<DynamicObject>, _> = review.try_into();
    let response = match request {
        Ok(request) => handler.handle(&request).await,
        Err(e) => AdmissionResponse::invalid(e.to_string()),
    };
    let outcome = if response.allowed { "allowed" } else { "denied" };
    metrics::WEBHOOK_REQUESTS
        .with_label_values(&[path.as_str(), outcome])
        .inc();

    match serde_json::to_vec(&response.into_review()) {
        Ok(json) => {
            let mut resp = Response::new(Full::new(Bytes::from(json)));
            resp.headers_mut().insert(
                hyper::header::CONTENT_TYPE,
                hyper::header::HeaderValue::from_static("application/json"),
            );
            Ok(resp)
        }
        Err(e) => {
            error!(error = %e, "Failed to encode admission review");
            Ok(text(StatusCode::INTERNAL_SERVER_ERROR, "encoding failed"))
        }
    }
}

fn text(status: StatusCode, body: &'static str) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    response
}
