//! Pod metadata injection.
//!
//! Ensures a fixed set of labels or annotations is present on every admitted
//! pod. Keys already carrying the desired value are left alone.

use std::collections::BTreeMap;

use async_trait::async_trait;
use jsonptr::PointerBuf;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use super::{MutationInput, MutationRule, PatchOp};
use crate::error::RuleError;

/// Which metadata map a rule writes to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetadataField {
    Labels,
    Annotations,
}

impl MetadataField {
    fn key(&self) -> &'static str {
        match self {
            MetadataField::Labels => "labels",
            MetadataField::Annotations => "annotations",
        }
    }

    fn read<'a>(&self, metadata: &'a ObjectMeta) -> Option<&'a BTreeMap<String, String>> {
        match self {
            MetadataField::Labels => metadata.labels.as_ref(),
            MetadataField::Annotations => metadata.annotations.as_ref(),
        }
    }
}

/// Adds or overwrites pod labels or annotations
pub struct MetadataInjectionRule {
    name: &'static str,
    field: MetadataField,
    entries: BTreeMap<String, String>,
}

impl MetadataInjectionRule {
    /// Inject the given labels
    pub fn labels(entries: BTreeMap<String, String>) -> Self {
        Self {
            name: "inject_labels",
            field: MetadataField::Labels,
            entries,
        }
    }

    /// Inject the given annotations
    pub fn annotations(entries: BTreeMap<String, String>) -> Self {
        Self {
            name: "inject_annotations",
            field: MetadataField::Annotations,
            entries,
        }
    }

    fn entry_path(&self, key: &str) -> PointerBuf {
        PointerBuf::from_tokens(["metadata", self.field.key(), key])
    }
}

#[async_trait]
impl MutationRule for MetadataInjectionRule {
    fn name(&self) -> &str {
        self.name
    }

    async fn mutate(&self, input: &MutationInput<'_>) -> Result<Vec<PatchOp>, RuleError> {
        if self.entries.is_empty() {
            return Ok(Vec::new());
        }

        // Adding a key under a map that does not exist fails, so create the map whole
        let Some(existing) = self.field.read(&input.pod.metadata) else {
            let value = serde_json::to_value(&self.entries)
                .map_err(|e| RuleError::invalid_patch(e.to_string()))?;
            let path = PointerBuf::from_tokens(["metadata", self.field.key()]);
            return Ok(vec![PatchOp::add(path, value)]);
        };

        let ops = self
            .entries
            .iter()
            .filter_map(|(key, value)| match existing.get(key) {
                None => Some(PatchOp::add(self.entry_path(key), value.clone())),
                Some(current) if current != value => {
                    Some(PatchOp::replace(self.entry_path(key), value.clone()))
                }
                Some(_) => None,
            })
            .collect();

        Ok(ops)
    }
}
