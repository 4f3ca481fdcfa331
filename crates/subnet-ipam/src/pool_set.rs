//! Ordered set of subnet allocators, one per configured pool.

use crate::allocator::SubnetAllocator;
use crate::config::PoolDescriptor;
use crate::error::IpamError;
use ipnet::Ipv4Net;
use std::str::FromStr;
use tracing::{debug, warn};

/// Allocators in configured order; earlier pools take precedence.
#[derive(Debug)]
pub struct AllocatorPoolSet {
    allocators: Vec<SubnetAllocator>,
}

impl AllocatorPoolSet {
    /// Builds one allocator per pool, each seeded with the entries of
    /// `in_use` that fall inside its network.
    ///
    /// Entries that can't be parsed or that belong to no pool are skipped
    /// with a warning.
    pub fn new(pools: &[PoolDescriptor], in_use: &[String]) -> Result<Self, IpamError> {
        if pools.is_empty() {
            return Err(IpamError::InvalidPool("no cluster subnets configured".to_string()));
        }

        let mut per_pool: Vec<Vec<String>> = vec![Vec::new(); pools.len()];
        for entry in in_use {
            let subnet = match Ipv4Net::from_str(entry.trim()) {
                Ok(subnet) => subnet.trunc(),
                Err(_) => {
                    warn!("Failed to parse preallocated subnet {:?}, skipping", entry);
                    continue;
                }
            };
            match pools.iter().position(|pool| pool.contains(subnet.network())) {
                Some(index) => per_pool[index].push(subnet.to_string()),
                None => warn!("Preallocated subnet {} doesn't belong to any configured pool, skipping", subnet),
            }
        }

        let allocators = pools
            .iter()
            .zip(&per_pool)
            .map(|(pool, seeded)| SubnetAllocator::from_descriptor(pool, seeded))
            .collect();
        Ok(Self { allocators })
    }

    /// Wraps already constructed allocators, keeping their order.
    pub fn from_allocators(allocators: Vec<SubnetAllocator>) -> Self {
        Self { allocators }
    }

    /// Allocates from the first pool that still has capacity.
    pub fn allocate_any(&self) -> Result<Ipv4Net, IpamError> {
        for allocator in &self.allocators {
            match allocator.allocate() {
                Ok(subnet) => return Ok(subnet),
                Err(IpamError::PoolExhausted { pool }) => {
                    debug!("Pool {} exhausted, trying next pool", pool);
                }
                Err(e) => return Err(e),
            }
        }
        Err(IpamError::AllPoolsExhausted)
    }

    /// Returns a subnet to the pool whose network contains it.
    pub fn release_from(&self, subnet: Ipv4Net) -> Result<(), IpamError> {
        let owner = self
            .allocators
            .iter()
            .find(|allocator| allocator.contains(subnet.network()))
            .ok_or(IpamError::NoOwningPool { subnet: subnet.trunc() })?;
        owner.release(subnet)
    }

    /// Marks an existing binding as in use in the pool that owns it.
    ///
    /// Returns `true` if the subnet was free until now.
    pub fn reserve(&self, subnet: Ipv4Net) -> Result<bool, IpamError> {
        let owner = self
            .allocators
            .iter()
            .find(|allocator| allocator.contains(subnet.network()))
            .ok_or(IpamError::NoOwningPool { subnet: subnet.trunc() })?;
        owner.reserve(subnet)
    }

    /// Network of the pool owning `subnet`, if any
    pub fn owning_pool(&self, subnet: Ipv4Net) -> Option<Ipv4Net> {
        self.allocators
            .iter()
            .find(|allocator| allocator.contains(subnet.network()))
            .map(SubnetAllocator::network)
    }

    /// Allocators in precedence order
    pub fn pools(&self) -> impl Iterator<Item = &SubnetAllocator> {
        self.allocators.iter()
    }

    /// Number of configured pools
    pub fn len(&self) -> usize {
        self.allocators.len()
    }

    /// Whether no pool is configured
    pub fn is_empty(&self) -> bool {
        self.allocators.is_empty()
    }
}
