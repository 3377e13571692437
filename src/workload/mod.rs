//! Workload classification and pod template extraction.
//!
//! Every supported workload kind embeds a `PodTemplateSpec` at a fixed JSON
//! path. Extraction walks that path once, decodes the template, and reduces it
//! to a [`PodTemplate`]: the containers and init containers with their
//! resource requests and limits, in declaration order.

pub mod quantity;

use std::collections::BTreeMap;
use std::fmt;

use k8s_openapi::api::core::v1::{Pod, PodTemplateSpec};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde::Deserialize;
use serde_json::Value;

use crate::error::DecodeError;

/// Workload kinds that carry a pod template
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkloadKind {
    Pod,
    ReplicaSet,
    Deployment,
    DaemonSet,
    Job,
    CronJob,
    StatefulSet,
}

impl WorkloadKind {
    /// All supported kinds
    pub const ALL: [WorkloadKind; 7] = [
        WorkloadKind::Pod,
        WorkloadKind::ReplicaSet,
        WorkloadKind::Deployment,
        WorkloadKind::DaemonSet,
        WorkloadKind::Job,
        WorkloadKind::CronJob,
        WorkloadKind::StatefulSet,
    ];

    /// Resolve an admission `kind.kind` tag. Unknown tags return `None`.
    pub fn from_tag(tag: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.as_str() == tag)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkloadKind::Pod => "Pod",
            WorkloadKind::ReplicaSet => "ReplicaSet",
            WorkloadKind::Deployment => "Deployment",
            WorkloadKind::DaemonSet => "DaemonSet",
            WorkloadKind::Job => "Job",
            WorkloadKind::CronJob => "CronJob",
            WorkloadKind::StatefulSet => "StatefulSet",
        }
    }

    /// Path from the object root to its embedded pod template.
    ///
    /// A Pod is its own template (it has `metadata` and `spec` at the root).
    pub fn template_path(&self) -> &'static [&'static str] {
        match self {
            WorkloadKind::Pod => &[],
            WorkloadKind::ReplicaSet
            | WorkloadKind::Deployment
            | WorkloadKind::DaemonSet
            | WorkloadKind::Job
            | WorkloadKind::StatefulSet => &["spec", "template"],
            WorkloadKind::CronJob => &["spec", "jobTemplate", "spec", "template"],
        }
    }
}

impl fmt::Display for WorkloadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether a container runs as part of the main set or before it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerKind {
    Container,
    InitContainer,
}

impl fmt::Display for ContainerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContainerKind::Container => write!(f, "Container"),
            ContainerKind::InitContainer => write!(f, "Init container"),
        }
    }
}

/// A container reduced to what policy rules inspect
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Container {
    pub name: String,
    /// Resource requests keyed by resource name ("cpu", "memory", ...)
    pub requests: BTreeMap<String, Quantity>,
    /// Resource limits keyed by resource name
    pub limits: BTreeMap<String, Quantity>,
}

impl Container {
    /// Create a container with no resource settings
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Add a resource request
    pub fn with_request(mut self, resource: &str, quantity: &str) -> Self {
        self.requests
            .insert(resource.to_string(), Quantity(quantity.to_string()));
        self
    }

    /// Add a resource limit
    pub fn with_limit(mut self, resource: &str, quantity: &str) -> Self {
        self.limits
            .insert(resource.to_string(), Quantity(quantity.to_string()));
        self
    }

    /// The CPU request, if one is set
    pub fn cpu_request(&self) -> Option<&Quantity> {
        self.requests.get("cpu")
    }

    fn from_k8s(container: &k8s_openapi::api::core::v1::Container) -> Self {
        let resources = container.resources.as_ref();
        Self {
            name: container.name.clone(),
            requests: resources
                .and_then(|r| r.requests.clone())
                .unwrap_or_default(),
            limits: resources.and_then(|r| r.limits.clone()).unwrap_or_default(),
        }
    }
}

/// Normalized pod template shared by every workload kind.
///
/// Container names are not required to be unique.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PodTemplate {
    pub containers: Vec<Container>,
    pub init_containers: Vec<Container>,
}

impl PodTemplate {
    /// True when the template has no containers of either kind
    pub fn is_empty(&self) -> bool {
        self.containers.is_empty() && self.init_containers.is_empty()
    }

    /// Containers followed by init containers, in declaration order
    pub fn all_containers(&self) -> impl Iterator<Item = (ContainerKind, &Container)> {
        self.containers
            .iter()
            .map(|c| (ContainerKind::Container, c))
            .chain(
                self.init_containers
                    .iter()
                    .map(|c| (ContainerKind::InitContainer, c)),
            )
    }

    fn from_k8s(template: &k8s_openapi::api::core::v1::PodSpec) -> Self {
        Self {
            containers: template.containers.iter().map(Container::from_k8s).collect(),
            init_containers: template
                .init_containers
                .iter()
                .flatten()
                .map(Container::from_k8s)
                .collect(),
        }
    }
}

/// Root fields shared by every workload object
#[derive(Deserialize)]
struct ObjectHeader {
    #[serde(default)]
    metadata: ObjectMeta,
}

/// Extract the pod template and namespace of a serialized workload.
///
/// Unknown kind tags are not regulated here: they yield an empty template and
/// an empty namespace rather than an error.
pub fn extract(kind: &str, raw: &[u8]) -> Result<(PodTemplate, String), DecodeError> {
    match WorkloadKind::from_tag(kind) {
        Some(kind) => extract_kind(kind, raw),
        None => Ok((PodTemplate::default(), String::new())),
    }
}

/// Extract the pod template of a workload whose kind is already resolved
pub fn extract_kind(kind: WorkloadKind, raw: &[u8]) -> Result<(PodTemplate, String), DecodeError> {
    let malformed = |source| DecodeError::Malformed { kind, source };

    let root: Value = serde_json::from_slice(raw).map_err(malformed)?;
    let template_value = walk(kind, &root)?;

    let template = PodTemplateSpec::deserialize(template_value).map_err(malformed)?;
    let spec = template.spec.as_ref().ok_or_else(|| DecodeError::MissingField {
        kind,
        path: join_path(kind.template_path(), "spec"),
    })?;

    let header = ObjectHeader::deserialize(&root).map_err(malformed)?;
    let namespace = header.metadata.namespace.unwrap_or_default();

    Ok((PodTemplate::from_k8s(spec), namespace))
}

/// Decode a serialized Pod
pub fn decode_pod(raw: &[u8]) -> Result<Pod, DecodeError> {
    serde_json::from_slice(raw).map_err(|source| DecodeError::Malformed {
        kind: WorkloadKind::Pod,
        source,
    })
}

/// Follow the kind's template path; a missing or null step is a decode error
fn walk<'v>(kind: WorkloadKind, root: &'v Value) -> Result<&'v Value, DecodeError> {
    let path = kind.template_path();
    let mut node = root;
    for (depth, segment) in path.iter().enumerate() {
        node = match node.get(segment) {
            Some(next) if !next.is_null() => next,
            _ => {
                return Err(DecodeError::MissingField {
                    kind,
                    path: path[..=depth].join("."),
                });
            }
        };
    }
    Ok(node)
}

fn join_path(prefix: &[&str], leaf: &str) -> String {
    prefix
        .iter()
        .copied()
        .chain(std::iter::once(leaf))
        .collect::<Vec<_>>()
        .join(".")
}
