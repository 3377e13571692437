// Test code is allowed to panic on failure
#![allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]

//! Unit tests for workload-admission.
//!
//! These tests run without a Kubernetes cluster and drive the admission
//! coordinator end to end with in-memory policy stores.

#[path = "../common/mod.rs"]
mod common;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use axum::http::StatusCode;
use tokio::time::Instant;

use common::fixtures::{WorkloadBuilder, workload};
use workload_admission::error::{AdmissionError, LookupError};
use workload_admission::policy_store::{
    CachingPolicyStore, PolicyKey, PolicySnapshot, PolicyStore, StaticPolicyStore,
};
use workload_admission::webhooks::policies::{
    CpuCeilingRule, MetadataInjectionRule, MutationChain, ValidationChain,
};
use workload_admission::webhooks::review::{PatchResponse, Verdict};
use workload_admission::webhooks::{AdmissionCoordinator, RequestEnvelope, ReviewResponse};
use workload_admission::workload::WorkloadKind;

const REGULATED: &str = "team-a";
const UNREGULATED: &str = "sandbox";

fn policy_key() -> PolicyKey {
    PolicyKey::new("default", "validator-config")
}

fn snapshot() -> PolicySnapshot {
    [(REGULATED, "cpu=2000m")].into_iter().collect()
}

fn coordinator_with(store: Arc<dyn PolicyStore>) -> AdmissionCoordinator {
    let labels = BTreeMap::from([("team".to_string(), "payments".to_string())]);
    AdmissionCoordinator::new(
        ValidationChain::new().with_rule(CpuCeilingRule::new(store, policy_key())),
        MutationChain::new().with_rule(MetadataInjectionRule::labels(labels)),
    )
}

fn coordinator() -> AdmissionCoordinator {
    coordinator_with(Arc::new(StaticPolicyStore::new(snapshot())))
}

fn deadline() -> Instant {
    Instant::now() + Duration::from_secs(2)
}

fn request(kind: WorkloadKind, object: Vec<u8>, user: &str) -> RequestEnvelope {
    RequestEnvelope::new("b3c5a7f0-uid", kind.as_str(), object).with_user(user)
}

fn verdict(response: ReviewResponse) -> Verdict {
    match response {
        ReviewResponse::Verdict(v) => v,
        ReviewResponse::Patch(p) => panic!("expected a verdict, got patch {:?}", p),
    }
}

fn patch(response: ReviewResponse) -> PatchResponse {
    match response {
        ReviewResponse::Patch(p) => p,
        ReviewResponse::Verdict(v) => panic!("expected a patch, got verdict {:?}", v),
    }
}

async fn validate(request: &RequestEnvelope) -> Verdict {
    verdict(coordinator().validate_review(request, deadline()).await.unwrap())
}

mod validate_review_tests {
    use super::*;

    #[tokio::test]
    async fn test_deployment_over_ceiling_denied() {
        let object = workload(WorkloadKind::Deployment, REGULATED, "2500m");
        let v = validate(&request(WorkloadKind::Deployment, object, "alice")).await;

        assert_eq!(v.uid, "b3c5a7f0-uid");
        assert!(!v.allowed);
        assert_eq!(v.status, StatusCode::FORBIDDEN);
        assert!(v.message.contains("web"));
        assert!(v.message.contains("2500m"));
        assert!(v.message.contains(REGULATED));
        assert!(v.message.contains("map[team-a:cpu=2000m]"));
    }

    #[tokio::test]
    async fn test_compliant_cronjob_accepted() {
        let object = WorkloadBuilder::new(WorkloadKind::CronJob, "report")
            .namespace(REGULATED)
            .container("report", Some("250m"))
            .init_container("fetch", Some("100m"))
            .build();
        let v = validate(&request(WorkloadKind::CronJob, object, "alice")).await;

        assert!(v.allowed);
        assert_eq!(v.status, StatusCode::ACCEPTED);
        assert_eq!(v.message, "valid");
    }

    #[tokio::test]
    async fn test_every_kind_is_checked() {
        for kind in WorkloadKind::ALL {
            let over = workload(kind, REGULATED, "2001m");
            let v = validate(&request(kind, over, "alice")).await;
            assert!(!v.allowed, "{} over the ceiling was admitted", kind);

            let at = workload(kind, REGULATED, "2000m");
            let v = validate(&request(kind, at, "alice")).await;
            assert!(v.allowed, "{} at the ceiling was rejected: {}", kind, v.message);
        }
    }

    #[tokio::test]
    async fn test_privileged_caller_gets_higher_ceiling() {
        let object = workload(WorkloadKind::Deployment, REGULATED, "2500m");
        let v = validate(&request(WorkloadKind::Deployment, object, "kubernetes-admin")).await;
        assert!(v.allowed);

        let object = workload(WorkloadKind::Deployment, REGULATED, "3001m");
        let v = validate(&request(WorkloadKind::Deployment, object, "kubernetes-admin")).await;
        assert!(!v.allowed);
        assert!(v.message.contains("3000m"));
    }

    #[tokio::test]
    async fn test_init_container_violation_named() {
        let object = WorkloadBuilder::new(WorkloadKind::StatefulSet, "db")
            .namespace(REGULATED)
            .container("db", Some("1"))
            .init_container("migrate", Some("4"))
            .build();
        let v = validate(&request(WorkloadKind::StatefulSet, object, "alice")).await;

        assert!(!v.allowed);
        assert!(v.message.starts_with("Init container migrate"));
    }

    #[tokio::test]
    async fn test_unregulated_namespace_admits_anything() {
        let object = workload(WorkloadKind::Job, UNREGULATED, "64");
        let v = validate(&request(WorkloadKind::Job, object, "alice")).await;
        assert!(v.allowed);
    }

    #[tokio::test]
    async fn test_containers_without_requests_admitted() {
        let object = WorkloadBuilder::new(WorkloadKind::DaemonSet, "agent")
            .namespace(REGULATED)
            .container("agent", None)
            .build();
        let v = validate(&request(WorkloadKind::DaemonSet, object, "alice")).await;
        assert!(v.allowed);
    }

    #[tokio::test]
    async fn test_request_namespace_applies_when_object_has_none() {
        let object = WorkloadBuilder::new(WorkloadKind::ReplicaSet, "web")
            .container("web", Some("3"))
            .build();
        let request = request(WorkloadKind::ReplicaSet, object, "alice").with_namespace(REGULATED);
        let v = validate(&request).await;
        assert!(!v.allowed);
    }

    #[tokio::test]
    async fn test_unsupported_kind_admitted() {
        let request = RequestEnvelope::new("uid", "ConfigMap", br#"{"data":{"a":"b"}}"#.to_vec())
            .with_namespace(REGULATED);
        let v = validate(&request).await;
        assert!(v.allowed);
    }

    #[tokio::test]
    async fn test_cronjob_without_job_template_is_bad_request() {
        let object = br#"{"metadata":{"name":"report","namespace":"team-a"},"spec":{"schedule":"@daily","jobTemplate":null}}"#;
        let v = validate(&request(WorkloadKind::CronJob, object.to_vec(), "alice")).await;

        assert!(!v.allowed);
        assert_eq!(v.status, StatusCode::BAD_REQUEST);
        assert!(v.message.contains("CronJob"));
        assert!(v.message.contains("spec.jobTemplate"));
    }
}

mod mutate_review_tests {
    use super::*;

    #[tokio::test]
    async fn test_pod_gets_label_patch_that_applies() {
        let object = WorkloadBuilder::new(WorkloadKind::Pod, "web")
            .namespace(REGULATED)
            .label("tier", "gold")
            .container("web", Some("100m"))
            .build();
        let response = coordinator()
            .mutate_review(&request(WorkloadKind::Pod, object.clone(), "alice"), deadline())
            .await
            .unwrap();
        let patch = patch(response);

        let mut doc: serde_json::Value = serde_json::from_slice(&object).unwrap();
        json_patch::patch(&mut doc, &patch.to_patch().0).unwrap();
        assert_eq!(doc["metadata"]["labels"]["team"], "payments");
        assert_eq!(doc["metadata"]["labels"]["tier"], "gold");
    }

    #[tokio::test]
    async fn test_non_pod_gets_empty_patch() {
        let object = workload(WorkloadKind::Deployment, REGULATED, "1");
        let response = coordinator()
            .mutate_review(&request(WorkloadKind::Deployment, object, "alice"), deadline())
            .await
            .unwrap();
        let patch = patch(response);

        assert!(patch.operations.is_empty());
        assert_eq!(patch.to_json().unwrap(), b"[]");
    }

    #[tokio::test]
    async fn test_undecodable_pod_is_bad_request() {
        let response = coordinator()
            .mutate_review(&request(WorkloadKind::Pod, b"[1, 2]".to_vec(), "alice"), deadline())
            .await
            .unwrap();
        let v = verdict(response);
        assert!(!v.allowed);
        assert_eq!(v.status, StatusCode::BAD_REQUEST);
    }
}

mod policy_store_tests {
    use super::*;

    /// Store that always fails and counts how often it was asked
    struct FailingStore {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl PolicyStore for FailingStore {
        async fn get(
            &self,
            key: &PolicyKey,
            _deadline: Instant,
        ) -> Result<PolicySnapshot, LookupError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(LookupError::Unavailable {
                key: key.clone(),
                code: Some(503),
            })
        }
    }

    /// Store that answers with a fixed snapshot and counts lookups
    struct CountingStore {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl PolicyStore for CountingStore {
        async fn get(
            &self,
            _key: &PolicyKey,
            _deadline: Instant,
        ) -> Result<PolicySnapshot, LookupError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(snapshot())
        }
    }

    /// Store that never answers before the deadline
    struct SlowStore;

    #[async_trait]
    impl PolicyStore for SlowStore {
        async fn get(
            &self,
            key: &PolicyKey,
            deadline: Instant,
        ) -> Result<PolicySnapshot, LookupError> {
            let started = Instant::now();
            tokio::time::sleep_until(deadline).await;
            Err(LookupError::Timeout {
                key: key.clone(),
                elapsed: started.elapsed(),
            })
        }
    }

    #[tokio::test]
    async fn test_lookup_failure_is_not_a_verdict() {
        let calls = Arc::new(AtomicUsize::new(0));
        let coordinator = coordinator_with(Arc::new(FailingStore {
            calls: calls.clone(),
        }));

        let object = workload(WorkloadKind::Deployment, REGULATED, "100m");
        let err = coordinator
            .validate_review(&request(WorkloadKind::Deployment, object, "alice"), deadline())
            .await
            .unwrap_err();

        let AdmissionError::Lookup { rule, source } = err;
        assert_eq!(rule, CpuCeilingRule::NAME);
        assert_eq!(
            source,
            LookupError::Unavailable {
                key: policy_key(),
                code: Some(503)
            }
        );
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_lookup_timeout_surfaces_as_error() {
        let coordinator = coordinator_with(Arc::new(SlowStore));
        let object = workload(WorkloadKind::Pod, REGULATED, "100m");
        let deadline = Instant::now() + Duration::from_millis(50);

        let err = coordinator
            .validate_review(&request(WorkloadKind::Pod, object, "alice"), deadline)
            .await
            .unwrap_err();
        let AdmissionError::Lookup { source, .. } = err;
        assert!(matches!(source, LookupError::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_cached_snapshot_shared_across_reviews() {
        let calls = Arc::new(AtomicUsize::new(0));
        let store = CachingPolicyStore::new(
            CountingStore {
                calls: calls.clone(),
            },
            Duration::from_secs(60),
        );
        let coordinator = coordinator_with(Arc::new(store));

        for cpu in ["100m", "2500m", "1"] {
            let object = workload(WorkloadKind::Deployment, REGULATED, cpu);
            coordinator
                .validate_review(&request(WorkloadKind::Deployment, object, "alice"), deadline())
                .await
                .unwrap();
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
