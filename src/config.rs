//! Operator configuration read from the environment

use std::time::Duration;

use crate::controller::error::{Error, Result};

const DEFAULT_POSTGRES_IMAGE: &str = "ghcr.io/zalando/spilo-16:3.2-p3";
const DEFAULT_PGBOUNCER_IMAGE: &str = "docker.io/bitnami/pgbouncer:1.23.1";
const DEFAULT_PGBACKREST_IMAGE: &str = "docker.io/pgbackrest/pgbackrest:2.53";
const DEFAULT_RECONCILE_TIMEOUT_SECS: u64 = 120;
const DEFAULT_HEALTH_PORT: u16 = 8080;

/// Settings shared by every reconcile
#[derive(Clone, Debug, PartialEq)]
pub struct OperatorConfig {
    /// Namespace to watch; `None` watches the whole cluster
    pub watch_namespace: Option<String>,
    /// Image used when a cluster does not name one
    pub postgres_image: String,
    pub pgbouncer_image: String,
    pub pgbackrest_image: String,
    /// Deadline for a single reconcile attempt
    pub reconcile_timeout: Duration,
    pub health_port: u16,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            watch_namespace: None,
            postgres_image: DEFAULT_POSTGRES_IMAGE.to_string(),
            pgbouncer_image: DEFAULT_PGBOUNCER_IMAGE.to_string(),
            pgbackrest_image: DEFAULT_PGBACKREST_IMAGE.to_string(),
            reconcile_timeout: Duration::from_secs(DEFAULT_RECONCILE_TIMEOUT_SECS),
            health_port: DEFAULT_HEALTH_PORT,
        }
    }
}

impl OperatorConfig {
    /// Read the configuration from process environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the configuration from any key lookup; unset or empty keys use
    /// the defaults
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let defaults = Self::default();

        let reconcile_timeout = match get("RECONCILE_TIMEOUT_SECS") {
            Some(v) => Duration::from_secs(v.trim().parse::<u64>().map_err(|e| {
                Error::InvalidConfig(format!("RECONCILE_TIMEOUT_SECS={}: {}", v, e))
            })?),
            None => defaults.reconcile_timeout,
        };
        if reconcile_timeout.is_zero() {
            return Err(Error::InvalidConfig(
                "RECONCILE_TIMEOUT_SECS must be greater than zero".to_string(),
            ));
        }

        let health_port = match get("HEALTH_PORT") {
            Some(v) => v
                .trim()
                .parse::<u16>()
                .map_err(|e| Error::InvalidConfig(format!("HEALTH_PORT={}: {}", v, e)))?,
            None => defaults.health_port,
        };

        Ok(Self {
            watch_namespace: get("WATCH_NAMESPACE"),
            postgres_image: get("RELATED_IMAGE_POSTGRES").unwrap_or(defaults.postgres_image),
            pgbouncer_image: get("RELATED_IMAGE_PGBOUNCER").unwrap_or(defaults.pgbouncer_image),
            pgbackrest_image: get("RELATED_IMAGE_PGBACKREST").unwrap_or(defaults.pgbackrest_image),
            reconcile_timeout,
            health_port,
        })
    }
}
