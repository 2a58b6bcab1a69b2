//! Admission webhook server
//!
//! Serves the ValidatingAdmissionWebhook endpoint over axum. For
//! in-cluster use the API server requires TLS, so the server usually
//! runs with a mounted certificate; without one it serves plain HTTP and
//! expects TLS to be terminated upstream.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    routing::{get, post},
    Json, Router,
};
use axum_server::tls_rustls::RustlsConfig;
use kube::core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview, Operation};
use kube::core::DynamicObject;
use kube::ResourceExt;
use rustls_pki_types::pem::PemObject;
use rustls_pki_types::{CertificateDer, PrivateKeyDer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::crd::NodeCIDRAllocation;
use crate::error::{Error, Result};

/// Certificate/key pair for serving the webhook over TLS
#[derive(Clone, Debug)]
pub struct WebhookTls {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

/// Admission webhook server for NodeCIDRAllocation validation
pub struct WebhookServer {
    addr: SocketAddr,
    tls: Option<WebhookTls>,
    enable_http2: bool,
}

impl WebhookServer {
    pub fn new(addr: SocketAddr, tls: Option<WebhookTls>, enable_http2: bool) -> Self {
        Self {
            addr,
            tls,
            enable_http2,
        }
    }

    fn router() -> Router {
        Router::new()
            .route("/validate", post(validate_handler))
            .route("/healthz", get(|| async { "ok" }))
            .layer(TraceLayer::new_for_http())
    }

    /// Serve until the process shuts down.
    pub async fn run(self) -> Result<()> {
        let app = Self::router();
        let Self {
            addr,
            tls,
            enable_http2,
        } = self;

        match tls {
            Some(tls) => {
                let config = build_rustls_config(&tls, enable_http2).await?;
                info!(%addr, "admission webhook listening (TLS)");
                axum_server::bind_rustls(addr, RustlsConfig::from_config(config))
                    .serve(app.into_make_service())
                    .await
                    .map_err(|e| Error::config(format!("webhook server error: {e}")))
            }
            None => {
                info!(%addr, "admission webhook listening (plain HTTP, TLS terminated upstream)");
                let listener = tokio::net::TcpListener::bind(addr)
                    .await
                    .map_err(|e| Error::config(format!("webhook bind {addr}: {e}")))?;
                axum::serve(listener, app)
                    .await
                    .map_err(|e| Error::config(format!("webhook server error: {e}")))
            }
        }
    }
}

async fn build_rustls_config(
    tls: &WebhookTls,
    enable_http2: bool,
) -> Result<Arc<rustls::ServerConfig>> {
    let cert_pem = tokio::fs::read(&tls.cert_path)
        .await
        .map_err(|e| Error::config(format!("read {}: {e}", tls.cert_path.display())))?;
    let key_pem = tokio::fs::read(&tls.key_path)
        .await
        .map_err(|e| Error::config(format!("read {}: {e}", tls.key_path.display())))?;

    let certs = CertificateDer::pem_slice_iter(&cert_pem)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::config(format!("parse webhook certificate: {e}")))?;
    let key = PrivateKeyDer::from_pem_slice(&key_pem)
        .map_err(|e| Error::config(format!("parse webhook private key: {e}")))?;

    let mut config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| Error::config(format!("webhook TLS config: {e}")))?;

    // HTTP/2 stays off unless explicitly enabled (rapid-reset CVEs).
    config.alpn_protocols = if enable_http2 {
        vec![b"h2".to_vec(), b"http/1.1".to_vec()]
    } else {
        vec![b"http/1.1".to_vec()]
    };

    Ok(Arc::new(config))
}

/// Handle one AdmissionReview: decode, validate, allow or deny with a
/// structured field report.
async fn validate_handler(
    Json(review): Json<AdmissionReview<NodeCIDRAllocation>>,
) -> Json<AdmissionReview<DynamicObject>> {
    let req: AdmissionRequest<NodeCIDRAllocation> = match review.try_into() {
        Ok(req) => req,
        Err(err) => {
            warn!(error = %err, "invalid admission request");
            return Json(AdmissionResponse::invalid(err.to_string()).into_review());
        }
    };

    let mut res = AdmissionResponse::from(&req);

    // Deletion is always accepted; the finalizer handles teardown.
    if matches!(req.operation, Operation::Delete) {
        return Json(res.into_review());
    }

    if let Some(alloc) = &req.object {
        info!(
            name = %alloc.name_any(),
            operation = ?req.operation,
            "validating NodeCIDRAllocation"
        );

        if let Err(errors) = alloc.validate() {
            let report = errors
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join("; ");
            res = res.deny(report);
        }
    }

    Json(res.into_review())
}
