//! Controller configuration from environment variables.

use crate::error::ControllerError;
use subnet_ipam::{parse_cluster_subnets, PoolDescriptor};

/// Environment variable listing the cluster subnet pools
pub const CLUSTER_SUBNETS_ENV: &str = "CLUSTER_SUBNETS";

/// Startup configuration
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Validated pools in allocation precedence order
    pub pools: Vec<PoolDescriptor>,
}

impl ControllerConfig {
    /// Loads configuration from the process environment.
    pub fn from_env() -> Result<Self, ControllerError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Loads configuration through `lookup`, which returns a variable's value if set.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ControllerError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let cluster_subnets = lookup(CLUSTER_SUBNETS_ENV)
            .filter(|value| !value.trim().is_empty())
            .ok_or_else(|| {
                ControllerError::InvalidConfig(format!(
                    "{CLUSTER_SUBNETS_ENV} environment variable is required (e.g. 10.128.0.0/14/23)"
                ))
            })?;

        let pools = parse_cluster_subnets(&cluster_subnets)?;
        Ok(Self { pools })
    }
}
