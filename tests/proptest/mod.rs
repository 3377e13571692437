// Test code is allowed to panic on failure
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic
)]

//! Property-based tests for workload-admission.
//!
//! Uses proptest to generate random inputs and verify invariants.

#[path = "../common/mod.rs"]
mod common;

use std::sync::Arc;

use proptest::prelude::*;
use tokio::time::Instant;

use common::fixtures::WorkloadBuilder;
use workload_admission::policy_store::{PolicyKey, PolicySnapshot, StaticPolicyStore};
use workload_admission::webhooks::policies::{
    CpuCeilingRule, DEFAULT_CPU_CEILING_MILLIS, PRIVILEGED_CPU_CEILING_MILLIS, ValidationInput,
    ValidationResult, ValidationRule,
};
use workload_admission::workload::quantity::parse_millis;
use workload_admission::workload::{Container, PodTemplate, WorkloadKind, extract};

/// Strategy for generating supported workload kinds.
fn any_kind() -> impl Strategy<Value = WorkloadKind> {
    prop::sample::select(WorkloadKind::ALL.to_vec())
}

/// Strategy for generating kind tags that carry no pod template.
fn unsupported_kind() -> impl Strategy<Value = String> {
    "[A-Z][a-zA-Z]{0,20}".prop_filter("supported kind", |tag| WorkloadKind::from_tag(tag).is_none())
}

/// Strategy for generating DNS-label container names.
fn container_name() -> impl Strategy<Value = String> {
    "[a-z][a-z0-9-]{0,14}[a-z0-9]"
}

/// Strategy for generating optional CPU requests in millicores.
fn cpu_request() -> impl Strategy<Value = Option<u32>> {
    prop::option::of(1..=8000u32)
}

fn evaluate(template: &PodTemplate, namespace: &str, user: &str) -> ValidationResult {
    let snapshot: PolicySnapshot = [("team-a", "enabled")].into_iter().collect();
    let rule = CpuCeilingRule::new(
        Arc::new(StaticPolicyStore::new(snapshot)),
        PolicyKey::new("default", "validator-config"),
    );

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .unwrap();
    runtime
        .block_on(rule.validate(&ValidationInput {
            template,
            namespace,
            user,
            deadline: Instant::now(),
        }))
        .unwrap()
}

fn single(millis: u32) -> PodTemplate {
    PodTemplate {
        containers: vec![Container::new("web").with_request("cpu", &format!("{}m", millis))],
        init_containers: vec![],
    }
}

proptest! {
    /// Property: Extraction keeps every container, in declaration order, for every kind.
    #[test]
    fn extraction_preserves_container_order(
        kind in any_kind(),
        containers in prop::collection::vec((container_name(), cpu_request()), 1..8),
        init_containers in prop::collection::vec((container_name(), cpu_request()), 0..4),
    ) {
        let mut builder = WorkloadBuilder::new(kind, "subject").namespace("team-a");
        for (name, cpu) in &containers {
            builder = builder.container(name, cpu.map(|m| format!("{}m", m)).as_deref());
        }
        for (name, cpu) in &init_containers {
            builder = builder.init_container(name, cpu.map(|m| format!("{}m", m)).as_deref());
        }

        let (template, namespace) = extract(kind.as_str(), &builder.build()).unwrap();

        prop_assert_eq!(namespace, "team-a");
        let names: Vec<_> = template.containers.iter().map(|c| c.name.clone()).collect();
        let expected: Vec<_> = containers.iter().map(|(n, _)| n.clone()).collect();
        prop_assert_eq!(names, expected);
        let names: Vec<_> = template.init_containers.iter().map(|c| c.name.clone()).collect();
        let expected: Vec<_> = init_containers.iter().map(|(n, _)| n.clone()).collect();
        prop_assert_eq!(names, expected);
    }

    /// Property: Unsupported kinds yield an empty template and never a decode error.
    #[test]
    fn unsupported_kinds_yield_empty_template(
        tag in unsupported_kind(),
        body in prop::sample::select(vec!["{}", "null", "[]", "not json", r#"{"spec":{"containers":[]}}"#]),
    ) {
        let (template, namespace) = extract(&tag, body.as_bytes()).unwrap();
        prop_assert!(template.is_empty());
        prop_assert!(namespace.is_empty());
    }

    /// Property: Ordinary callers are admitted exactly up to the default ceiling.
    #[test]
    fn default_ceiling_boundary(millis in 1..=8000u32) {
        let result = evaluate(&single(millis), "team-a", "alice");
        prop_assert_eq!(result.valid, i64::from(millis) <= DEFAULT_CPU_CEILING_MILLIS);
    }

    /// Property: The privileged caller is admitted exactly up to the privileged ceiling.
    #[test]
    fn privileged_ceiling_boundary(millis in 1..=8000u32) {
        let result = evaluate(&single(millis), "team-a", "kubernetes-admin");
        prop_assert_eq!(result.valid, i64::from(millis) <= PRIVILEGED_CPU_CEILING_MILLIS);
    }

    /// Property: Namespaces outside the snapshot are never regulated.
    #[test]
    fn unregulated_namespace_always_valid(millis in 1..=1_000_000u32, namespace in "[a-z]{1,10}") {
        prop_assume!(namespace != "team-a");
        prop_assert!(evaluate(&single(millis), &namespace, "alice").valid);
    }

    /// Property: Millicore, whole-core and decimal forms agree.
    #[test]
    fn quantity_forms_agree(cores in 0..1000i64, fraction in 0..1000i64) {
        let millis = cores * 1000 + fraction;
        prop_assert_eq!(parse_millis(&format!("{}m", millis)).unwrap(), millis);
        prop_assert_eq!(parse_millis(&format!("{}", cores)).unwrap(), cores * 1000);
        prop_assert_eq!(parse_millis(&format!("{}.{:03}", cores, fraction)).unwrap(), millis);
        prop_assert_eq!(parse_millis(&format!("{}k", cores)).unwrap(), cores * 1_000_000);
    }

    /// Property: Sub-millicore amounts round up to the next whole millicore.
    #[test]
    fn quantity_rounds_up(micros in 1..10_000_000i64) {
        let expected = (micros + 999) / 1000;
        prop_assert_eq!(parse_millis(&format!("{}u", micros)).unwrap(), expected);
    }
}
