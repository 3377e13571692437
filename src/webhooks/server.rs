//! Admission webhook server.
//!
//! Provides HTTP endpoints for Kubernetes admission webhooks:
//! - `POST /validate` - ValidatingWebhookConfiguration target
//! - `POST /mutate` - MutatingWebhookConfiguration target
//!
//! To enable webhooks:
//! 1. Deploy cert-manager for TLS certificates
//! 2. Create the webhook configurations pointing at this service
//! 3. Mount the TLS certificate secret to the pod at /etc/webhook/certs/

use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::post,
};
use kube::core::DynamicObject;
use kube::core::admission::{
    AdmissionRequest, AdmissionResponse, AdmissionReview, ConvertAdmissionReviewError,
};
use serde_json::Value;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, error, info};

use super::coordinator::{AdmissionCoordinator, RequestEnvelope};
use super::review::review_json;
use crate::error::AdmissionError;
use crate::health::HealthState;

/// Which endpoint handled a review
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    Validate,
    Mutate,
}

impl Endpoint {
    pub fn as_str(&self) -> &'static str {
        match self {
            Endpoint::Validate => "validate",
            Endpoint::Mutate => "mutate",
        }
    }
}

/// Shared state for webhook handlers
pub struct WebhookState {
    pub coordinator: AdmissionCoordinator,
    pub health: Arc<HealthState>,
    /// Budget for policy lookups, measured from request receipt
    pub lookup_timeout: Duration,
}

impl WebhookState {
    pub fn new(
        coordinator: AdmissionCoordinator,
        health: Arc<HealthState>,
        lookup_timeout: Duration,
    ) -> Self {
        Self {
            coordinator,
            health,
            lookup_timeout,
        }
    }
}

/// Errors that can occur when serving the webhook
#[derive(Error, Debug)]
pub enum WebhookError {
    /// TLS configuration error
    #[error("TLS configuration error: {0}")]
    TlsConfig(String),

    /// Server error
    #[error("Webhook server error: {0}")]
    Server(String),

    /// The admission review could not be encoded for the response
    #[error("failed to encode admission review: {0}")]
    Encode(#[from] serde_json::Error),

    /// The coordinator could not evaluate the request
    #[error(transparent)]
    Admission(#[from] AdmissionError),

    /// The computed patch could not be attached to the response
    #[error("failed to build admission response: {0}")]
    Response(String),
}

impl IntoResponse for WebhookError {
    fn into_response(self) -> Response {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({ "error": self.to_string() })),
        )
            .into_response()
    }
}

/// Create the webhook router
pub fn create_webhook_router(state: Arc<WebhookState>) -> Router {
    Router::new()
        .route("/validate", post(validate_workload))
        .route("/mutate", post(mutate_workload))
        .with_state(state)
}

async fn validate_workload(
    State(state): State<Arc<WebhookState>>,
    Json(body): Json<Value>,
) -> Response {
    handle_review(&state, Endpoint::Validate, body).await
}

async fn mutate_workload(
    State(state): State<Arc<WebhookState>>,
    Json(body): Json<Value>,
) -> Response {
    handle_review(&state, Endpoint::Mutate, body).await
}

async fn handle_review(state: &WebhookState, endpoint: Endpoint, body: Value) -> Response {
    let started = Instant::now();
    let deadline = started + state.lookup_timeout;
    let metrics = &state.health.metrics;
    let elapsed = || started.elapsed().as_secs_f64();

    let (request, object) = match split_review(body) {
        Ok(split) => split,
        Err(e) => {
            error!(error = %e, "Failed to extract admission request");
            metrics.record_review(endpoint.as_str(), "invalid", elapsed());
            return (
                StatusCode::BAD_REQUEST,
                Json(
                    AdmissionResponse::invalid(format!("Invalid AdmissionReview: {}", e))
                        .into_review(),
                ),
            )
                .into_response();
        }
    };

    debug!(
        uid = %request.uid,
        operation = ?request.operation,
        kind = %request.kind.kind,
        namespace = ?request.namespace,
        name = %request.name,
        "Processing admission request"
    );

    let result = review_request(state, endpoint, &request, object, deadline)
        .await
        .and_then(|(outcome, response)| Ok((outcome, review_json(response)?)));

    match result {
        Ok((outcome, review)) => {
            metrics.record_review(endpoint.as_str(), outcome, elapsed());
            (StatusCode::OK, Json(review)).into_response()
        }
        Err(e) => {
            if matches!(e, WebhookError::Admission(AdmissionError::Lookup { .. })) {
                metrics.record_lookup_error();
            }
            error!(uid = %request.uid, error = %e, "Admission request failed");
            metrics.record_review(endpoint.as_str(), "error", elapsed());
            e.into_response()
        }
    }
}

/// Split a raw review into the kube request and the submitted object's JSON.
///
/// The objects are removed before the typed decode so that a malformed object
/// reaches the workload extractor instead of failing the whole review.
fn split_review(
    mut body: Value,
) -> Result<(AdmissionRequest<DynamicObject>, Option<Vec<u8>>), String> {
    let object = body
        .pointer_mut("/request/object")
        .map(Value::take)
        .filter(|object| !object.is_null());
    if let Some(old_object) = body.pointer_mut("/request/oldObject") {
        old_object.take();
    }

    let review: AdmissionReview<DynamicObject> =
        serde_json::from_value(body).map_err(|e| e.to_string())?;
    let request: AdmissionRequest<DynamicObject> =
        review.try_into().map_err(|e: ConvertAdmissionReviewError| e.to_string())?;
    let object = object
        .map(|object| serde_json::to_vec(&object))
        .transpose()
        .map_err(|e| e.to_string())?;
    Ok((request, object))
}

async fn review_request(
    state: &WebhookState,
    endpoint: Endpoint,
    request: &AdmissionRequest<DynamicObject>,
    object: Option<Vec<u8>>,
    deadline: Instant,
) -> Result<(&'static str, AdmissionResponse), WebhookError> {
    // Nothing to evaluate (e.g. DELETE)
    let Some(envelope) = envelope_from(request, object) else {
        info!(
            uid = %request.uid,
            operation = ?request.operation,
            "Admission request allowed (no object)"
        );
        return Ok(("allowed", AdmissionResponse::from(request)));
    };

    let review = match endpoint {
        Endpoint::Validate => state.coordinator.validate_review(&envelope, deadline).await?,
        Endpoint::Mutate => state.coordinator.mutate_review(&envelope, deadline).await?,
    };

    let outcome = review.outcome();
    let response = review
        .into_admission_response(AdmissionResponse::from(request))
        .map_err(|e| WebhookError::Response(e.to_string()))?;
    Ok((outcome, response))
}

/// Build the coordinator's view of a request; `None` when there is no object
pub fn envelope_from(
    request: &AdmissionRequest<DynamicObject>,
    object: Option<Vec<u8>>,
) -> Option<RequestEnvelope> {
    let envelope = RequestEnvelope::new(request.uid.clone(), request.kind.kind.clone(), object?)
        .with_user(request.user_info.username.clone().unwrap_or_default())
        .with_namespace(request.namespace.clone().unwrap_or_default());
    Some(envelope)
}

/// Run the webhook server with TLS
///
/// Binds to `0.0.0.0:<port>` and serves `/validate` and `/mutate`.
/// TLS certificates are loaded from the given PEM files.
pub async fn run_webhook_server(
    state: Arc<WebhookState>,
    cert_path: &str,
    key_path: &str,
    port: u16,
) -> Result<(), WebhookError> {
    use axum_server::tls_rustls::RustlsConfig;
    use std::net::SocketAddr;
    use std::path::PathBuf;

    let app = create_webhook_router(state);

    let config = RustlsConfig::from_pem_file(PathBuf::from(cert_path), PathBuf::from(key_path))
        .await
        .map_err(|e| WebhookError::TlsConfig(e.to_string()))?;

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!(port, "Webhook server listening with TLS");

    axum_server::bind_rustls(addr, config)
        .serve(app.into_make_service())
        .await
        .map_err(|e| WebhookError::Server(e.to_string()))?;

    Ok(())
}
