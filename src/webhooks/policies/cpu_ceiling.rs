//! CPU request ceiling policy.
//!
//! Validates:
//! - No container or init container requests more CPU than the ceiling
//! - Privileged callers get a higher ceiling
//!
//! Only namespaces listed in the policy store snapshot are regulated. The
//! snapshot is fetched once per evaluation; a failed lookup fails the request
//! rather than letting the workload through.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use super::{ValidationInput, ValidationResult, ValidationRule};
use crate::error::RuleError;
use crate::policy_store::{PolicyKey, PolicyStore};
use crate::workload::quantity::cpu_millis;

/// Ceiling applied to ordinary callers, in millicores
pub const DEFAULT_CPU_CEILING_MILLIS: i64 = 2000;

/// Ceiling applied to privileged callers, in millicores
pub const PRIVILEGED_CPU_CEILING_MILLIS: i64 = 3000;

/// Caller granted the privileged ceiling unless configured otherwise
pub const DEFAULT_PRIVILEGED_USER: &str = "kubernetes-admin";

/// Rejects containers whose CPU request exceeds the applicable ceiling
pub struct CpuCeilingRule {
    store: Arc<dyn PolicyStore>,
    key: PolicyKey,
    ceiling_millis: i64,
    privileged_ceiling_millis: i64,
    privileged_users: BTreeSet<String>,
}

impl CpuCeilingRule {
    pub const NAME: &'static str = "cpu_request_ceiling";

    /// Create the rule with the default ceilings and privileged user
    pub fn new(store: Arc<dyn PolicyStore>, key: PolicyKey) -> Self {
        Self {
            store,
            key,
            ceiling_millis: DEFAULT_CPU_CEILING_MILLIS,
            privileged_ceiling_millis: PRIVILEGED_CPU_CEILING_MILLIS,
            privileged_users: BTreeSet::from([DEFAULT_PRIVILEGED_USER.to_string()]),
        }
    }

    /// Override both ceilings
    pub fn with_ceilings(mut self, ceiling_millis: i64, privileged_ceiling_millis: i64) -> Self {
        self.ceiling_millis = ceiling_millis;
        self.privileged_ceiling_millis = privileged_ceiling_millis;
        self
    }

    /// Replace the set of privileged callers
    pub fn with_privileged_users<I, S>(mut self, users: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.privileged_users = users.into_iter().map(Into::into).collect();
        self
    }

    /// Ceiling that applies to `user`, in millicores
    pub fn ceiling_for(&self, user: &str) -> i64 {
        if self.privileged_users.contains(user) {
            self.privileged_ceiling_millis
        } else {
            self.ceiling_millis
        }
    }
}

#[async_trait]
impl ValidationRule for CpuCeilingRule {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn validate(&self, input: &ValidationInput<'_>) -> Result<ValidationResult, RuleError> {
        let snapshot = self.store.get(&self.key, input.deadline).await?;

        if !snapshot.contains(input.namespace) {
            debug!(namespace = input.namespace, "Namespace not regulated by CPU ceiling");
            return Ok(ValidationResult::valid());
        }

        let ceiling = self.ceiling_for(input.user);
        for (kind, container) in input.template.all_containers() {
            // Containers without a CPU request are exempt
            let Some(request) = container.cpu_request() else {
                continue;
            };

            match cpu_millis(request) {
                Ok(millis) if millis <= ceiling => {}
                Ok(millis) => {
                    return Ok(ValidationResult::invalid(format!(
                        "{} {} has cpu request {}m > {}m in {} namespace. Validated namespaces: {}",
                        kind, container.name, millis, ceiling, input.namespace, snapshot
                    )));
                }
                Err(e) => {
                    return Ok(ValidationResult::invalid(format!(
                        "{} {} has cpu request that cannot be checked in {} namespace: {}",
                        kind, container.name, input.namespace, e
                    )));
                }
            }
        }

        Ok(ValidationResult::valid())
    }
}
