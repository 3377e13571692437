//! Admission coordinator.
//!
//! Ties extraction, the rule chains and response building together for one
//! request. Decode failures and policy violations become denied verdicts;
//! only a failed policy lookup escapes as an error, so the transport can fail
//! the request instead of answering it.

use axum::http::StatusCode;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::policies::{
    MutationChain, MutationInput, VALID_REASON, ValidationChain, ValidationInput,
};
use super::review::{ReviewResponse, build_patch, build_verdict};
use crate::error::{AdmissionError, ChainError, DecodeError, RuleError};
use crate::workload::{self, PodTemplate, WorkloadKind};

/// The parts of an admission request the coordinator needs
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestEnvelope {
    pub uid: String,
    /// Kind tag of the submitted object, e.g. "Deployment"
    pub kind: String,
    /// Raw JSON of the submitted object
    pub object: Vec<u8>,
    /// Username of the caller
    pub user: String,
    /// Namespace the request targets; used when the object carries none
    pub namespace: String,
}

impl RequestEnvelope {
    pub fn new(uid: impl Into<String>, kind: impl Into<String>, object: Vec<u8>) -> Self {
        Self {
            uid: uid.into(),
            kind: kind.into(),
            object,
            ..Default::default()
        }
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = user.into();
        self
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }
}

/// Runs the validation and mutation chains for admission requests
#[derive(Default)]
pub struct AdmissionCoordinator {
    validation: ValidationChain,
    mutation: MutationChain,
}

impl AdmissionCoordinator {
    pub fn new(validation: ValidationChain, mutation: MutationChain) -> Self {
        Self {
            validation,
            mutation,
        }
    }

    pub fn validation(&self) -> &ValidationChain {
        &self.validation
    }

    pub fn mutation(&self) -> &MutationChain {
        &self.mutation
    }

    /// Decide whether the workload in `request` may be admitted.
    ///
    /// - undecodable object: denied, 400
    /// - rule violation: denied, 403, with the rule's reason
    /// - rule failure other than lookup: denied, 400
    /// - everything passes: allowed, 202 "valid"
    pub async fn validate_review(
        &self,
        request: &RequestEnvelope,
        deadline: Instant,
    ) -> Result<ReviewResponse, AdmissionError> {
        let uid = request.uid.as_str();

        let extracted = match WorkloadKind::from_tag(&request.kind) {
            Some(kind) => workload::extract_kind(kind, &request.object),
            None => {
                debug!(uid, kind = %request.kind, "Kind has no pod template, validating empty spec");
                Ok((PodTemplate::default(), String::new()))
            }
        };
        let (template, namespace) = match extracted {
            Ok(extracted) => extracted,
            Err(e) => return Ok(decode_failure(request, e)),
        };

        let namespace = if namespace.is_empty() {
            request.namespace.clone()
        } else {
            namespace
        };

        let input = ValidationInput {
            template: &template,
            namespace: &namespace,
            user: &request.user,
            deadline,
        };

        match self.validation.validate_all(&input).await {
            Ok(result) if result.valid => {
                info!(uid, kind = %request.kind, namespace = %namespace, "Admission request allowed");
                Ok(build_verdict(uid, true, StatusCode::ACCEPTED, VALID_REASON))
            }
            Ok(result) => {
                warn!(
                    uid,
                    kind = %request.kind,
                    namespace = %namespace,
                    user = %request.user,
                    reason = %result.reason,
                    "Admission request denied"
                );
                Ok(build_verdict(uid, false, StatusCode::FORBIDDEN, result.reason))
            }
            Err(e) => self.rule_failure(uid, "validate", e),
        }
    }

    /// Compute the patch for the object in `request`.
    ///
    /// Only pods are mutated; other supported kinds are decoded and get an
    /// empty patch, and an undecodable object of any supported kind is denied
    /// with 400.
    pub async fn mutate_review(
        &self,
        request: &RequestEnvelope,
        deadline: Instant,
    ) -> Result<ReviewResponse, AdmissionError> {
        let uid = request.uid.as_str();

        let decoded = match WorkloadKind::from_tag(&request.kind) {
            Some(WorkloadKind::Pod) => workload::decode_pod(&request.object),
            Some(kind) => {
                // Not mutated, but a malformed object is still refused
                if let Err(e) = workload::extract_kind(kind, &request.object) {
                    return Ok(decode_failure(request, e));
                }
                debug!(uid, kind = %request.kind, "Kind is not mutated");
                return Ok(build_patch(uid, Vec::new()));
            }
            None => {
                debug!(uid, kind = %request.kind, "Kind is not mutated");
                return Ok(build_patch(uid, Vec::new()));
            }
        };
        let pod = match decoded {
            Ok(pod) => pod,
            Err(e) => return Ok(decode_failure(request, e)),
        };

        let input = MutationInput {
            pod: &pod,
            deadline,
        };

        match self.mutation.mutate_all(&input).await {
            Ok(operations) => {
                info!(uid, operations = operations.len(), "Admission request patched");
                Ok(build_patch(uid, operations))
            }
            Err(e) => self.rule_failure(uid, "mutate", e),
        }
    }

    fn rule_failure(
        &self,
        uid: &str,
        action: &str,
        error: ChainError,
    ) -> Result<ReviewResponse, AdmissionError> {
        let ChainError { rule, source } = error;
        match source {
            RuleError::Lookup(source) => {
                warn!(uid, rule = %rule, error = %source, "Policy lookup failed");
                Err(AdmissionError::Lookup { rule, source })
            }
            other => {
                warn!(uid, rule = %rule, error = %other, "Rule failed");
                Ok(build_verdict(
                    uid,
                    false,
                    StatusCode::BAD_REQUEST,
                    format!("could not {} object: rule {} failed: {}", action, rule, other),
                ))
            }
        }
    }
}

/// Deny a request whose object does not decode as its kind
fn decode_failure(request: &RequestEnvelope, error: DecodeError) -> ReviewResponse {
    warn!(uid = %request.uid, kind = %request.kind, error = %error, "Could not decode workload");
    build_verdict(
        &request.uid,
        false,
        StatusCode::BAD_REQUEST,
        format!("could not parse {} in admission review request: {}", request.kind, error),
    )
}
