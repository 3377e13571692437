//! Admission webhooks for workload objects.
//!
//! Requests flow through three layers:
//! - `server`: HTTP transport and kube `AdmissionReview` decoding
//! - `coordinator`: extraction, rule chains, and error classification
//! - `review`: construction of the verdict or patch returned to the API server

pub mod coordinator;
pub mod policies;
pub mod review;
mod server;

pub use coordinator::{AdmissionCoordinator, RequestEnvelope};
pub use policies::{
    MutationChain, MutationRule, PatchOp, ValidationChain, ValidationResult, ValidationRule,
};
pub use review::{ReviewResponse, build_patch, build_verdict};
pub use server::{
    Endpoint, WebhookError, WebhookState, create_webhook_router, envelope_from,
    run_webhook_server,
};

// Re-export kube-rs admission types for contract testing
pub use kube::core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview, Operation};
