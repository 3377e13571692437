//! workload-admission library crate
//!
//! Admission policy engine for Kubernetes workloads: extracts the pod template
//! from any workload kind, runs validation and mutation rule chains against it,
//! and answers admission reviews.

pub mod config;
pub mod error;
pub mod health;
pub mod policy_store;
pub mod webhooks;
pub mod workload;

pub use config::{ConfigError, WebhookConfig};
pub use error::{AdmissionError, DecodeError, LookupError, RuleError};
pub use health::HealthState;
pub use policy_store::{
    CachingPolicyStore, ConfigMapPolicyStore, PolicyKey, PolicySnapshot, PolicyStore,
    StaticPolicyStore,
};
pub use webhooks::{AdmissionCoordinator, RequestEnvelope, WebhookError, run_webhook_server};
pub use workload::{PodTemplate, WorkloadKind, extract};
