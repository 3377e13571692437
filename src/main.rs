//! workload-admission - admission webhook enforcing workload policies.
//!
//! This is the main entry point that:
//! - Initializes structured logging
//! - Loads configuration and creates the Kubernetes client
//! - Assembles the validation and mutation chains
//! - Starts the health server and the TLS webhook server

use std::sync::Arc;
use std::time::Duration;

use kube::Client;
use tokio::signal;
use tracing::{error, info};

use workload_admission::config::WebhookConfig;
use workload_admission::health::{HealthState, run_health_server};
use workload_admission::policy_store::{CachingPolicyStore, ConfigMapPolicyStore, PolicyStore};
use workload_admission::webhooks::policies::{
    CpuCeilingRule, MetadataInjectionRule, MutationChain, ValidationChain,
};
use workload_admission::webhooks::{AdmissionCoordinator, WebhookState, run_webhook_server};

/// Grace period for in-flight reviews to complete during shutdown
const SHUTDOWN_GRACE_PERIOD_SECS: u64 = 5;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("workload_admission=info".parse()?)
                .add_directive("kube=info".parse()?),
        )
        .json()
        .init();

    info!("Starting workload-admission");

    let config = WebhookConfig::from_env()?;
    info!(
        policy = %config.policy_key,
        cache_ttl_secs = config.policy_cache_ttl.as_secs(),
        lookup_timeout_ms = config.policy_lookup_timeout.as_millis() as u64,
        "Loaded configuration"
    );

    let client = Client::try_default().await?;
    info!("Connected to Kubernetes cluster");

    let health_state = Arc::new(HealthState::new());

    // Probes should answer before the webhook is serving
    let health_handle = {
        let health_state = health_state.clone();
        let port = config.health_port;
        tokio::spawn(async move {
            if let Err(e) = run_health_server(health_state, port).await {
                error!("Health server error: {}", e);
            }
        })
    };

    let coordinator = build_coordinator(&config, client);
    info!(
        validation_rules = ?coordinator.validation().rule_names(),
        mutation_rules = ?coordinator.mutation().rule_names(),
        "Admission chains assembled"
    );

    let webhook_state = Arc::new(WebhookState::new(
        coordinator,
        health_state.clone(),
        config.policy_lookup_timeout,
    ));

    let webhook_handle = {
        let cert_path = config.cert_path.clone();
        let key_path = config.key_path.clone();
        let port = config.webhook_port;
        tokio::spawn(async move {
            if let Err(e) = run_webhook_server(webhook_state, &cert_path, &key_path, port).await {
                error!("Webhook server error: {}", e);
            }
        })
    };

    health_state.set_ready(true).await;

    // Wait for any task to complete (or fail), or shutdown signal
    tokio::select! {
        result = webhook_handle => {
            if let Err(e) = result {
                error!("Webhook server task panicked: {}", e);
            }
        }
        result = health_handle => {
            if let Err(e) = result {
                error!("Health server task panicked: {}", e);
            }
        }
        // Handle graceful shutdown on SIGTERM or SIGINT
        _ = shutdown_signal() => {
            info!("Received shutdown signal, initiating graceful shutdown...");

            // Fail readiness so the Service stops routing reviews here
            health_state.set_ready(false).await;

            info!(
                "Waiting {}s for in-flight reviews to complete...",
                SHUTDOWN_GRACE_PERIOD_SECS
            );
            tokio::time::sleep(Duration::from_secs(SHUTDOWN_GRACE_PERIOD_SECS)).await;
        }
    }

    info!("workload-admission stopped");
    Ok(())
}

/// Wire the policy store and rules described by `config`
fn build_coordinator(config: &WebhookConfig, client: Client) -> AdmissionCoordinator {
    let configmaps = ConfigMapPolicyStore::new(client);
    let store: Arc<dyn PolicyStore> = if config.caching_enabled() {
        Arc::new(CachingPolicyStore::new(configmaps, config.policy_cache_ttl))
    } else {
        Arc::new(configmaps)
    };

    let ceiling = CpuCeilingRule::new(store, config.policy_key.clone())
        .with_ceilings(config.cpu_ceiling_millis, config.privileged_cpu_ceiling_millis)
        .with_privileged_users(config.privileged_users.iter().cloned());
    let validation = ValidationChain::new().with_rule(ceiling);

    let mut mutation = MutationChain::new();
    if !config.inject_labels.is_empty() {
        mutation = mutation.with_rule(MetadataInjectionRule::labels(config.inject_labels.clone()));
    }
    if !config.inject_annotations.is_empty() {
        mutation = mutation.with_rule(MetadataInjectionRule::annotations(
            config.inject_annotations.clone(),
        ));
    }

    AdmissionCoordinator::new(validation, mutation)
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
///
/// Signal handler setup failures are fatal; without them there is no graceful shutdown.
#[allow(clippy::expect_used)]
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
