//! Subnet IPAM errors

use ipnet::Ipv4Net;
use thiserror::Error;

/// Errors that can occur while configuring pools or allocating subnets
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IpamError {
    /// Malformed or out-of-range pool configuration
    #[error("Invalid pool: {0}")]
    InvalidPool(String),

    /// A single pool has no free subnet left
    #[error("No subnets available in pool {pool}")]
    PoolExhausted {
        /// Network of the exhausted pool
        pool: Ipv4Net,
    },

    /// Every configured pool is exhausted
    #[error("No subnets available in any configured pool")]
    AllPoolsExhausted,

    /// Released subnet lies outside the allocator's network
    #[error("Subnet {subnet} doesn't belong to the network {pool}")]
    NotInPool {
        /// Subnet that was released
        subnet: Ipv4Net,
        /// Network of the allocator it was released to
        pool: Ipv4Net,
    },

    /// Released subnet is not currently allocated
    #[error("Subnet {subnet} is already available")]
    AlreadyFree {
        /// Subnet that was released
        subnet: Ipv4Net,
    },

    /// No configured pool contains the subnet
    #[error("Subnet {subnet} doesn't belong to any configured pool")]
    NoOwningPool {
        /// Subnet that was released
        subnet: Ipv4Net,
    },

    /// Subnet metadata recorded on a resource could not be parsed
    #[error("Invalid subnet binding metadata: {0}")]
    InvalidBindingMetadata(String),
}
