//! Admission policies for workload objects.
//!
//! Policies come in two flavors:
//! - Validation rules inspect a pod template and return a verdict
//! - Mutation rules inspect a pod and return JSON patch operations
//!
//! Rules are registered into a [`ValidationChain`] or [`MutationChain`] at
//! startup. Chains run their rules in registration order.

pub mod cpu_ceiling;
pub mod metadata_injection;

use async_trait::async_trait;
use json_patch::{AddOperation, PatchOperation, RemoveOperation, ReplaceOperation};
use jsonptr::{Pointer, PointerBuf};
use k8s_openapi::api::core::v1::Pod;
use serde_json::Value;
use tokio::time::Instant;
use tracing::debug;

use crate::error::{ChainError, RuleError};
use crate::workload::PodTemplate;

pub use cpu_ceiling::{CpuCeilingRule, DEFAULT_CPU_CEILING_MILLIS, PRIVILEGED_CPU_CEILING_MILLIS};
pub use metadata_injection::{MetadataField, MetadataInjectionRule};

/// Reason reported when every rule accepts
pub const VALID_REASON: &str = "valid";

/// Result of a validation check
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationResult {
    /// Whether the validation passed
    pub valid: bool,
    /// Human-readable reason, shown to the user on denial
    pub reason: String,
}

impl ValidationResult {
    /// Create a passing result
    pub fn valid() -> Self {
        Self {
            valid: true,
            reason: VALID_REASON.to_string(),
        }
    }

    /// Create a failing result
    pub fn invalid(reason: impl Into<String>) -> Self {
        Self {
            valid: false,
            reason: reason.into(),
        }
    }
}

/// Input to a validation rule
#[derive(Debug, Clone, Copy)]
pub struct ValidationInput<'a> {
    /// The normalized pod template being admitted
    pub template: &'a PodTemplate,
    /// Namespace the workload lives in
    pub namespace: &'a str,
    /// Username of the caller
    pub user: &'a str,
    /// Point after which policy lookups must give up
    pub deadline: Instant,
}

/// Input to a mutation rule
#[derive(Debug, Clone, Copy)]
pub struct MutationInput<'a> {
    /// The pod as submitted
    pub pod: &'a Pod,
    /// Point after which policy lookups must give up
    pub deadline: Instant,
}

/// A rule that accepts or rejects a pod template
#[async_trait]
pub trait ValidationRule: Send + Sync {
    /// Stable identifier used in logs and errors
    fn name(&self) -> &str;

    async fn validate(&self, input: &ValidationInput<'_>) -> Result<ValidationResult, RuleError>;
}

/// A rule that proposes changes to a pod.
///
/// Operations are relative to the pod as submitted, not to the output of
/// earlier rules. An empty list is a valid no-op.
#[async_trait]
pub trait MutationRule: Send + Sync {
    /// Stable identifier used in logs and errors
    fn name(&self) -> &str;

    async fn mutate(&self, input: &MutationInput<'_>) -> Result<Vec<PatchOp>, RuleError>;
}

/// A single JSON patch operation a mutation rule may emit
#[derive(Debug, Clone, PartialEq)]
pub enum PatchOp {
    Add { path: PointerBuf, value: Value },
    Replace { path: PointerBuf, value: Value },
    Remove { path: PointerBuf },
}

impl PatchOp {
    pub fn add(path: PointerBuf, value: impl Into<Value>) -> Self {
        PatchOp::Add {
            path,
            value: value.into(),
        }
    }

    pub fn replace(path: PointerBuf, value: impl Into<Value>) -> Self {
        PatchOp::Replace {
            path,
            value: value.into(),
        }
    }

    pub fn remove(path: PointerBuf) -> Self {
        PatchOp::Remove { path }
    }

    /// JSON patch `op` name
    pub fn op(&self) -> &'static str {
        match self {
            PatchOp::Add { .. } => "add",
            PatchOp::Replace { .. } => "replace",
            PatchOp::Remove { .. } => "remove",
        }
    }

    pub fn path(&self) -> &Pointer {
        match self {
            PatchOp::Add { path, .. } | PatchOp::Replace { path, .. } | PatchOp::Remove { path } => {
                path
            }
        }
    }

    /// Convert into a `json_patch` operation
    pub fn into_operation(self) -> PatchOperation {
        match self {
            PatchOp::Add { path, value } => PatchOperation::Add(AddOperation { path, value }),
            PatchOp::Replace { path, value } => {
                PatchOperation::Replace(ReplaceOperation { path, value })
            }
            PatchOp::Remove { path } => PatchOperation::Remove(RemoveOperation { path }),
        }
    }
}

/// Ordered validation rules; stops at the first rejection
#[derive(Default)]
pub struct ValidationChain {
    rules: Vec<Box<dyn ValidationRule>>,
}

impl ValidationChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a rule after the ones already present
    pub fn with_rule(mut self, rule: impl ValidationRule + 'static) -> Self {
        self.rules.push(Box::new(rule));
        self
    }

    pub fn rule_names(&self) -> Vec<&str> {
        self.rules.iter().map(|r| r.name()).collect()
    }

    /// Run all rules in order.
    ///
    /// Returns the first invalid result without running later rules. A rule
    /// error aborts the chain and is returned as an error, never as a verdict.
    pub async fn validate_all(
        &self,
        input: &ValidationInput<'_>,
    ) -> Result<ValidationResult, ChainError> {
        for rule in &self.rules {
            let result = rule.validate(input).await.map_err(|source| ChainError {
                rule: rule.name().to_string(),
                source,
            })?;
            debug!(
                rule = rule.name(),
                valid = result.valid,
                namespace = input.namespace,
                "Validation rule evaluated"
            );
            if !result.valid {
                return Ok(result);
            }
        }
        Ok(ValidationResult::valid())
    }
}

/// Ordered mutation rules; concatenates every rule's operations
#[derive(Default)]
pub struct MutationChain {
    rules: Vec<Box<dyn MutationRule>>,
}

impl MutationChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a rule after the ones already present
    pub fn with_rule(mut self, rule: impl MutationRule + 'static) -> Self {
        self.rules.push(Box::new(rule));
        self
    }

    pub fn rule_names(&self) -> Vec<&str> {
        self.rules.iter().map(|r| r.name()).collect()
    }

    /// Run all rules in order and collect their operations
    pub async fn mutate_all(&self, input: &MutationInput<'_>) -> Result<Vec<PatchOp>, ChainError> {
        let mut operations = Vec::new();
        for rule in &self.rules {
            let ops = rule.mutate(input).await.map_err(|source| ChainError {
                rule: rule.name().to_string(),
                source,
            })?;
            debug!(rule = rule.name(), operations = ops.len(), "Mutation rule evaluated");
            operations.extend(ops);
        }
        Ok(operations)
    }
}
