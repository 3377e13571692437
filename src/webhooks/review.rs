//! Admission response construction.
//!
//! A review ends in exactly one of two shapes: a verdict (allowed or denied,
//! with a status code and message) or a JSON patch. Both are plain values here
//! and only become kube `AdmissionResponse`s at the transport boundary.

use axum::http::StatusCode;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use kube::core::admission::{AdmissionResponse, SerializePatchError};
use serde_json::Value;

use super::policies::PatchOp;

/// Final answer for one admission request
#[derive(Debug, Clone, PartialEq)]
pub enum ReviewResponse {
    Verdict(Verdict),
    Patch(PatchResponse),
}

/// Allow/deny decision with an audit status code
#[derive(Debug, Clone, PartialEq)]
pub struct Verdict {
    pub uid: String,
    pub allowed: bool,
    /// Carried for audit; the HTTP response itself is always 200
    pub status: StatusCode,
    pub message: String,
}

/// Mutation result; always allowed
#[derive(Debug, Clone, PartialEq)]
pub struct PatchResponse {
    pub uid: String,
    pub operations: Vec<PatchOp>,
}

impl PatchResponse {
    /// The operations as a `json_patch::Patch`
    pub fn to_patch(&self) -> json_patch::Patch {
        json_patch::Patch(
            self.operations
                .iter()
                .cloned()
                .map(PatchOp::into_operation)
                .collect(),
        )
    }

    /// Serialized JSON patch document (an array, possibly empty)
    pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(&self.to_patch())
    }
}

/// Build a verdict response
pub fn build_verdict(
    uid: &str,
    allowed: bool,
    status: StatusCode,
    message: impl Into<String>,
) -> ReviewResponse {
    ReviewResponse::Verdict(Verdict {
        uid: uid.to_string(),
        allowed,
        status,
        message: message.into(),
    })
}

/// Build a patch response. An empty operation list is a valid no-op patch.
pub fn build_patch(uid: &str, operations: Vec<PatchOp>) -> ReviewResponse {
    ReviewResponse::Patch(PatchResponse {
        uid: uid.to_string(),
        operations,
    })
}

impl ReviewResponse {
    /// Identifier of the request this answers
    pub fn uid(&self) -> &str {
        match self {
            ReviewResponse::Verdict(v) => &v.uid,
            ReviewResponse::Patch(p) => &p.uid,
        }
    }

    pub fn allowed(&self) -> bool {
        match self {
            ReviewResponse::Verdict(v) => v.allowed,
            ReviewResponse::Patch(_) => true,
        }
    }

    /// Short label for logs and metrics
    pub fn outcome(&self) -> &'static str {
        match self {
            ReviewResponse::Verdict(v) if v.allowed => "allowed",
            ReviewResponse::Verdict(_) => "denied",
            ReviewResponse::Patch(_) => "patched",
        }
    }

    /// Fill a kube response (already correlated to the request) with this result
    pub fn into_admission_response(
        self,
        base: AdmissionResponse,
    ) -> Result<AdmissionResponse, SerializePatchError> {
        match self {
            ReviewResponse::Verdict(verdict) => {
                let mut response = if verdict.allowed {
                    base
                } else {
                    base.deny(&verdict.message)
                };
                response.result.code = verdict.status.as_u16();
                response.result.message = verdict.message;
                Ok(response)
            }
            ReviewResponse::Patch(patch) => base.with_patch(patch.to_patch()),
        }
    }
}

/// Serialize `response` as the `AdmissionReview` sent back to the API server.
///
/// The API server expects `response.patch` as a base64 string, while kube
/// serializes the raw bytes as an array of numbers.
pub fn review_json(response: AdmissionResponse) -> Result<Value, serde_json::Error> {
    let patch = response.patch.as_deref().map(|bytes| STANDARD.encode(bytes));
    let mut review = serde_json::to_value(response.into_review())?;
    if let (Some(patch), Some(slot)) = (patch, review.pointer_mut("/response/patch")) {
        *slot = Value::String(patch);
    }
    Ok(review)
}
