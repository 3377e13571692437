//! Error types for admission evaluation.
//!
//! The taxonomy keeps three outcomes apart all the way to the response:
//! - [`DecodeError`]: the submitted object does not have the shape its kind promises
//! - [`LookupError`]: the policy store could not answer
//! - a policy violation, which is not an error at all but a `valid: false` result

use std::time::Duration;
use thiserror::Error;

use crate::policy_store::PolicyKey;
use crate::workload::WorkloadKind;

/// The submitted object could not be decoded into the shape expected for its kind
#[derive(Error, Debug)]
pub enum DecodeError {
    /// Bytes are not valid JSON, or a field has the wrong type
    #[error("could not decode {kind} object: {source}")]
    Malformed {
        kind: WorkloadKind,
        #[source]
        source: serde_json::Error,
    },

    /// A structural field on the path to the pod template is absent or null
    #[error("{kind} object is missing required field {path}")]
    MissingField { kind: WorkloadKind, path: String },
}

/// The policy store could not produce a snapshot
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LookupError {
    /// The caller's deadline passed before the store answered
    #[error("policy lookup for {key} timed out after {elapsed:?}")]
    Timeout { key: PolicyKey, elapsed: Duration },

    /// The policy source does not exist
    #[error("policy source {key} not found")]
    NotFound { key: PolicyKey },

    /// The store answered with an error; only the status code is kept
    #[error("policy store unavailable for {key} (status {code:?})")]
    Unavailable { key: PolicyKey, code: Option<u16> },
}

/// Failure raised by a single rule
#[derive(Error, Debug)]
pub enum RuleError {
    /// Policy store lookup failed
    #[error(transparent)]
    Lookup(#[from] LookupError),

    /// A mutation rule could not express its change as a patch
    #[error("invalid patch: {0}")]
    InvalidPatch(String),
}

impl RuleError {
    /// Create an invalid patch error with the given message
    pub fn invalid_patch(msg: impl Into<String>) -> Self {
        Self::InvalidPatch(msg.into())
    }
}

/// A rule failure annotated with the rule that raised it
#[derive(Error, Debug)]
#[error("rule {rule} failed: {source}")]
pub struct ChainError {
    pub rule: String,
    #[source]
    pub source: RuleError,
}

impl ChainError {
    /// Return the lookup failure behind this error, if that is what it is
    pub fn as_lookup(&self) -> Option<&LookupError> {
        match &self.source {
            RuleError::Lookup(e) => Some(e),
            RuleError::InvalidPatch(_) => None,
        }
    }
}

/// Request-level failure returned by the admission coordinator.
///
/// Everything else the coordinator encounters becomes a verdict.
#[derive(Error, Debug)]
pub enum AdmissionError {
    /// The policy engine could not evaluate the request
    #[error("policy evaluation failed in rule {rule}: {source}")]
    Lookup {
        rule: String,
        #[source]
        source: LookupError,
    },
}
