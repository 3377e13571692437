//! Environment-driven configuration.
//!
//! Every setting is optional. Parsing works over a lookup function so tests
//! can supply variables without touching the process environment.

use std::collections::{BTreeMap, BTreeSet};
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::policy_store::PolicyKey;
use crate::webhooks::policies::cpu_ceiling::DEFAULT_PRIVILEGED_USER;
use crate::webhooks::policies::{DEFAULT_CPU_CEILING_MILLIS, PRIVILEGED_CPU_CEILING_MILLIS};

/// Default path to webhook TLS certificate
pub const WEBHOOK_CERT_PATH: &str = "/etc/webhook/certs/tls.crt";
/// Default path to webhook TLS private key
pub const WEBHOOK_KEY_PATH: &str = "/etc/webhook/certs/tls.key";
/// Default webhook server port
pub const WEBHOOK_PORT: u16 = 9443;
/// Default health server port
pub const HEALTH_PORT: u16 = 8080;
/// Default policy ConfigMap name
pub const POLICY_CONFIGMAP_NAME: &str = "validator-config";
/// Default policy ConfigMap namespace
pub const POLICY_CONFIGMAP_NAMESPACE: &str = "default";

const DEFAULT_CACHE_TTL_SECS: u64 = 30;
const DEFAULT_LOOKUP_TIMEOUT_MS: u64 = 2000;

/// Invalid configuration value
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{var} has invalid value {value:?}: {reason}")]
    InvalidValue {
        var: &'static str,
        value: String,
        reason: String,
    },

    #[error("{var} entry {entry:?} is not of the form key=value")]
    InvalidPair { var: &'static str, entry: String },

    #[error(
        "PRIVILEGED_CPU_CEILING_MILLIS ({privileged}) must not be below CPU_CEILING_MILLIS ({default})"
    )]
    CeilingOrder { default: i64, privileged: i64 },
}

/// Runtime settings for the webhook binary
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebhookConfig {
    pub webhook_port: u16,
    pub cert_path: String,
    pub key_path: String,
    pub health_port: u16,
    /// ConfigMap holding the regulated namespaces
    pub policy_key: PolicyKey,
    /// Zero disables snapshot caching
    pub policy_cache_ttl: Duration,
    pub policy_lookup_timeout: Duration,
    pub cpu_ceiling_millis: i64,
    pub privileged_cpu_ceiling_millis: i64,
    pub privileged_users: BTreeSet<String>,
    pub inject_labels: BTreeMap<String, String>,
    pub inject_annotations: BTreeMap<String, String>,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            webhook_port: WEBHOOK_PORT,
            cert_path: WEBHOOK_CERT_PATH.to_string(),
            key_path: WEBHOOK_KEY_PATH.to_string(),
            health_port: HEALTH_PORT,
            policy_key: PolicyKey::new(POLICY_CONFIGMAP_NAMESPACE, POLICY_CONFIGMAP_NAME),
            policy_cache_ttl: Duration::from_secs(DEFAULT_CACHE_TTL_SECS),
            policy_lookup_timeout: Duration::from_millis(DEFAULT_LOOKUP_TIMEOUT_MS),
            cpu_ceiling_millis: DEFAULT_CPU_CEILING_MILLIS,
            privileged_cpu_ceiling_millis: PRIVILEGED_CPU_CEILING_MILLIS,
            privileged_users: BTreeSet::from([DEFAULT_PRIVILEGED_USER.to_string()]),
            inject_labels: BTreeMap::new(),
            inject_annotations: BTreeMap::new(),
        }
    }
}

impl WebhookConfig {
    /// Read the configuration from the process environment
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Read the configuration through `lookup`; unset or blank variables keep their defaults
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |var: &str| lookup(var).filter(|v| !v.trim().is_empty());
        let defaults = Self::default();

        let namespace = get("POLICY_CONFIGMAP_NAMESPACE").unwrap_or(defaults.policy_key.namespace);
        let name = get("POLICY_CONFIGMAP_NAME").unwrap_or(defaults.policy_key.name);

        let config = Self {
            webhook_port: parse_or("WEBHOOK_PORT", get("WEBHOOK_PORT"), defaults.webhook_port)?,
            cert_path: get("WEBHOOK_CERT_PATH").unwrap_or(defaults.cert_path),
            key_path: get("WEBHOOK_KEY_PATH").unwrap_or(defaults.key_path),
            health_port: parse_or("HEALTH_PORT", get("HEALTH_PORT"), defaults.health_port)?,
            policy_key: PolicyKey::new(namespace, name),
            policy_cache_ttl: Duration::from_secs(parse_or(
                "POLICY_CACHE_TTL_SECS",
                get("POLICY_CACHE_TTL_SECS"),
                DEFAULT_CACHE_TTL_SECS,
            )?),
            policy_lookup_timeout: Duration::from_millis(parse_or(
                "POLICY_LOOKUP_TIMEOUT_MS",
                get("POLICY_LOOKUP_TIMEOUT_MS"),
                DEFAULT_LOOKUP_TIMEOUT_MS,
            )?),
            cpu_ceiling_millis: parse_millis(
                "CPU_CEILING_MILLIS",
                get("CPU_CEILING_MILLIS"),
                defaults.cpu_ceiling_millis,
            )?,
            privileged_cpu_ceiling_millis: parse_millis(
                "PRIVILEGED_CPU_CEILING_MILLIS",
                get("PRIVILEGED_CPU_CEILING_MILLIS"),
                defaults.privileged_cpu_ceiling_millis,
            )?,
            privileged_users: match get("PRIVILEGED_USERS") {
                Some(raw) => split_list(&raw).map(str::to_string).collect(),
                None => defaults.privileged_users,
            },
            inject_labels: parse_pairs("INJECT_LABELS", get("INJECT_LABELS").as_deref())?,
            inject_annotations: parse_pairs(
                "INJECT_ANNOTATIONS",
                get("INJECT_ANNOTATIONS").as_deref(),
            )?,
        };

        if config.privileged_cpu_ceiling_millis < config.cpu_ceiling_millis {
            return Err(ConfigError::CeilingOrder {
                default: config.cpu_ceiling_millis,
                privileged: config.privileged_cpu_ceiling_millis,
            });
        }

        Ok(config)
    }

    /// Whether snapshots should be cached between requests
    pub fn caching_enabled(&self) -> bool {
        !self.policy_cache_ttl.is_zero()
    }
}

fn parse_or<T>(var: &'static str, raw: Option<String>, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match raw {
        None => Ok(default),
        Some(value) => value.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            var,
            reason: e.to_string(),
            value,
        }),
    }
}

fn parse_millis(var: &'static str, raw: Option<String>, default: i64) -> Result<i64, ConfigError> {
    let millis = parse_or(var, raw, default)?;
    if millis <= 0 {
        return Err(ConfigError::InvalidValue {
            var,
            value: millis.to_string(),
            reason: "must be positive".to_string(),
        });
    }
    Ok(millis)
}

fn split_list(raw: &str) -> impl Iterator<Item = &str> {
    raw.split(',').map(str::trim).filter(|s| !s.is_empty())
}

/// Parse a `k1=v1,k2=v2` list. Values may be empty; keys may not.
pub fn parse_pairs(
    var: &'static str,
    raw: Option<&str>,
) -> Result<BTreeMap<String, String>, ConfigError> {
    let Some(raw) = raw else {
        return Ok(BTreeMap::new());
    };

    split_list(raw)
        .map(|entry| match entry.split_once('=') {
            Some((key, value)) if !key.trim().is_empty() => {
                Ok((key.trim().to_string(), value.trim().to_string()))
            }
            _ => Err(ConfigError::InvalidPair {
                var,
                entry: entry.to_string(),
            }),
        })
        .collect()
}
