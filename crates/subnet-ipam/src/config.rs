//! Pool configuration
//!
//! Turns the configured list of cluster networks into validated,
//! non-overlapping [`PoolDescriptor`]s.
//!
//! The textual form is a comma separated list of `a.b.c.d/prefix[/hostSubnetLength]`
//! entries, e.g. `10.1.0.0/16/26,10.2.0.0/16`. When `hostSubnetLength` is
//! omitted every subnet is a /24.

use crate::error::IpamError;
use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::str::FromStr;

/// Subnet prefix length used when an entry doesn't specify one
pub const DEFAULT_HOST_SUBNET_LENGTH: u8 = 24;

/// One configured pool, as written by the operator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolEntry {
    /// Pool network in CIDR notation
    pub cidr: String,

    /// Prefix length of every subnet carved from the pool
    #[serde(default = "default_host_subnet_length")]
    pub host_subnet_length: u8,
}

fn default_host_subnet_length() -> u8 {
    DEFAULT_HOST_SUBNET_LENGTH
}

/// A validated pool: network plus the number of host bits per subnet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolDescriptor {
    /// Pool network, truncated to its base address
    pub network: Ipv4Net,
    /// Low-order bits left to hosts inside each allocated subnet
    pub host_bits: u32,
}

impl PoolDescriptor {
    /// Builds a descriptor from a network and host-bit count, checking
    /// `0 < host_bits <= 32 - prefix_len`.
    pub fn new(network: Ipv4Net, host_bits: u32) -> Result<Self, IpamError> {
        let network = network.trunc();
        let available = 32 - u32::from(network.prefix_len());
        if host_bits == 0 {
            return Err(IpamError::InvalidPool(format!(
                "{network}: host capacity cannot be zero"
            )));
        }
        if host_bits > available {
            return Err(IpamError::InvalidPool(format!(
                "{network}: subnet capacity of {host_bits} host bits is larger than the {available} bits available"
            )));
        }
        Ok(Self { network, host_bits })
    }

    /// Parses and validates a single configured entry.
    pub fn from_entry(entry: &PoolEntry) -> Result<Self, IpamError> {
        let network = Ipv4Net::from_str(entry.cidr.trim()).map_err(|e| {
            IpamError::InvalidPool(format!("failed to parse network address {:?}: {}", entry.cidr, e))
        })?;
        if entry.host_subnet_length > 32 {
            return Err(IpamError::InvalidPool(format!(
                "{}: host subnet length {} is longer than 32",
                entry.cidr, entry.host_subnet_length
            )));
        }
        Self::new(network, 32 - u32::from(entry.host_subnet_length))
    }

    /// Number of subnet-number bits between the pool prefix and the host bits
    pub fn subnet_bits(&self) -> u32 {
        32 - u32::from(self.network.prefix_len()) - self.host_bits
    }

    /// Prefix length of every subnet carved from this pool
    pub fn subnet_prefix_len(&self) -> u8 {
        // host_bits >= 1, so this always fits
        (32 - self.host_bits) as u8
    }

    /// Number of allocatable subnets
    pub fn capacity(&self) -> u64 {
        1u64 << self.subnet_bits()
    }

    /// Whether the two pools share any address
    pub fn overlaps(&self, other: &PoolDescriptor) -> bool {
        self.network.contains(&other.network.network()) || other.network.contains(&self.network.network())
    }

    /// Whether the address belongs to this pool
    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        self.network.contains(&addr)
    }
}

/// Parses the comma separated `cidr[/hostSubnetLength]` list.
///
/// Only the shape of each entry is checked here; use [`validate_pools`] to
/// turn the entries into descriptors.
pub fn parse_pool_entries(text: &str) -> Result<Vec<PoolEntry>, IpamError> {
    let mut entries = Vec::new();

    for raw in text.split(',') {
        let raw = raw.trim();
        let parts: Vec<&str> = raw.split('/').collect();

        let host_subnet_length = match parts.len() {
            3 => parts[2].trim().parse::<u8>().map_err(|e| {
                IpamError::InvalidPool(format!("invalid host subnet length in {raw:?}: {e}"))
            })?,
            2 => DEFAULT_HOST_SUBNET_LENGTH,
            _ => {
                return Err(IpamError::InvalidPool(format!(
                    "cluster subnet entry {raw:?} not formatted properly"
                )));
            }
        };

        entries.push(PoolEntry {
            cidr: format!("{}/{}", parts[0].trim(), parts[1].trim()),
            host_subnet_length,
        });
    }

    Ok(entries)
}

/// Validates entries in order, rejecting any pool that overlaps an earlier one.
pub fn validate_pools(entries: &[PoolEntry]) -> Result<Vec<PoolDescriptor>, IpamError> {
    if entries.is_empty() {
        return Err(IpamError::InvalidPool("no cluster subnets configured".to_string()));
    }

    let mut pools: Vec<PoolDescriptor> = Vec::with_capacity(entries.len());
    for entry in entries {
        let pool = PoolDescriptor::from_entry(entry)?;
        if let Some(existing) = pools.iter().find(|p| p.overlaps(&pool)) {
            return Err(IpamError::InvalidPool(format!(
                "CIDR {} overlaps with another cluster network CIDR {}",
                pool.network, existing.network
            )));
        }
        pools.push(pool);
    }

    Ok(pools)
}

/// Parses and validates the textual pool list in one step.
pub fn parse_cluster_subnets(text: &str) -> Result<Vec<PoolDescriptor>, IpamError> {
    validate_pools(&parse_pool_entries(text)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_entries_with_and_without_host_length() {
        let entries = parse_pool_entries("10.1.0.0/16/26, 10.2.0.0/16").unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].cidr, "10.1.0.0/16");
        assert_eq!(entries[0].host_subnet_length, 26);
        assert_eq!(entries[1].cidr, "10.2.0.0/16");
        assert_eq!(entries[1].host_subnet_length, DEFAULT_HOST_SUBNET_LENGTH);
    }

    #[test]
    fn test_parse_entries_rejects_bad_shape() {
        assert!(matches!(parse_pool_entries("10.1.0.0"), Err(IpamError::InvalidPool(_))));
        assert!(matches!(parse_pool_entries("10.1.0.0/16/24/8"), Err(IpamError::InvalidPool(_))));
        assert!(matches!(parse_pool_entries("10.1.0.0/16/abc"), Err(IpamError::InvalidPool(_))));
    }

    #[test]
    fn test_descriptor_truncates_network() {
        let pool = PoolDescriptor::from_entry(&PoolEntry {
            cidr: "10.1.2.3/16".to_string(),
            host_subnet_length: 24,
        })
        .unwrap();
        assert_eq!(pool.network.to_string(), "10.1.0.0/16");
        assert_eq!(pool.host_bits, 8);
        assert_eq!(pool.subnet_bits(), 8);
        assert_eq!(pool.subnet_prefix_len(), 24);
        assert_eq!(pool.capacity(), 256);
    }

    #[test]
    fn test_descriptor_rejects_invalid_host_length() {
        // /32 subnets leave no host bits
        let zero_hosts = PoolEntry { cidr: "10.1.0.0/16".to_string(), host_subnet_length: 32 };
        assert!(matches!(PoolDescriptor::from_entry(&zero_hosts), Err(IpamError::InvalidPool(_))));

        // Subnets larger than the pool itself
        let too_large = PoolEntry { cidr: "10.1.0.0/16".to_string(), host_subnet_length: 8 };
        assert!(matches!(PoolDescriptor::from_entry(&too_large), Err(IpamError::InvalidPool(_))));

        let too_long = PoolEntry { cidr: "10.1.0.0/16".to_string(), host_subnet_length: 40 };
        assert!(matches!(PoolDescriptor::from_entry(&too_long), Err(IpamError::InvalidPool(_))));

        let garbage = PoolEntry { cidr: "not-a-network".to_string(), host_subnet_length: 24 };
        assert!(matches!(PoolDescriptor::from_entry(&garbage), Err(IpamError::InvalidPool(_))));
    }

    #[test]
    fn test_whole_pool_as_single_subnet() {
        let pool = PoolDescriptor::from_entry(&PoolEntry {
            cidr: "10.9.0.0/24".to_string(),
            host_subnet_length: 24,
        })
        .unwrap();
        assert_eq!(pool.capacity(), 1);
    }

    #[test]
    fn test_validate_rejects_overlap() {
        let result = parse_cluster_subnets("10.0.0.0/8/24,10.1.0.0/16/24");
        match result {
            Err(IpamError::InvalidPool(msg)) => assert!(msg.contains("10.1.0.0/16"), "unexpected message: {msg}"),
            other => panic!("expected overlap error, got {other:?}"),
        }

        // Order doesn't matter
        assert!(parse_cluster_subnets("10.1.0.0/16/24,10.0.0.0/8/24").is_err());
    }

    #[test]
    fn test_validate_keeps_order() {
        let pools = parse_cluster_subnets("10.2.0.0/16/24,10.1.0.0/16/26").unwrap();
        assert_eq!(pools[0].network.to_string(), "10.2.0.0/16");
        assert_eq!(pools[1].network.to_string(), "10.1.0.0/16");
        assert_eq!(pools[1].host_bits, 6);
    }

    #[test]
    fn test_validate_rejects_empty_list() {
        assert!(matches!(validate_pools(&[]), Err(IpamError::InvalidPool(_))));
    }

    #[test]
    fn test_pool_entry_deserializes_with_default() {
        let entry: PoolEntry = serde_json::from_str(r#"{"cidr": "10.3.0.0/16"}"#).unwrap();
        assert_eq!(entry.host_subnet_length, DEFAULT_HOST_SUBNET_LENGTH);
    }
}
