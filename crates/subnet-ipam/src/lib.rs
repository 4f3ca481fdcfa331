//! Subnet IPAM
//!
//! Hands out non-overlapping IPv4 subnets from one or more configured pools.
//!
//! # Example
//!
//! ```
//! use subnet_ipam::{parse_cluster_subnets, AllocatorPoolSet};
//!
//! # fn example() -> Result<(), subnet_ipam::IpamError> {
//! // Two pools: /26 subnets out of 10.1.0.0/16, then /24s out of 10.2.0.0/16
//! let pools = parse_cluster_subnets("10.1.0.0/16/26,10.2.0.0/16")?;
//!
//! // Subnets already recorded on existing resources are marked in use
//! let in_use = vec!["10.1.0.0/26".to_string()];
//! let pool_set = AllocatorPoolSet::new(&pools, &in_use)?;
//!
//! let subnet = pool_set.allocate_any()?;
//! assert_eq!(subnet.to_string(), "10.1.1.0/26");
//! pool_set.release_from(subnet)?;
//! # Ok(())
//! # }
//! # example().unwrap();
//! ```
//!
//! # Features
//!
//! - **Octet-friendly ordering**: when the subnet number straddles an octet
//!   boundary, subnets sharing the outer octet pattern are handed out first
//! - **Round-robin**: a released subnet is not reused until the cursor wraps
//! - **Pool precedence**: earlier pools are exhausted before later ones are used
//! - **Reseeding**: allocators start from the subnets already bound in the cluster

pub mod allocator;
pub mod config;
pub mod error;
pub mod pool_set;

pub use allocator::{gateway_for, SubnetAllocator};
pub use config::{parse_cluster_subnets, parse_pool_entries, validate_pools, PoolDescriptor, PoolEntry};
pub use error::IpamError;
pub use pool_set::AllocatorPoolSet;
