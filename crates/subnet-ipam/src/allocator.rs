//! Subnet allocator
//!
//! Carves one pool network into fixed-size subnets and tracks which of them
//! are in use.
//!
//! In the simple case the subnet part of an address is just the subnet number
//! shifted `host_bits` to the left. When `host_bits` isn't a multiple of 8 that
//! makes subnet and host parts hard to tell apart: with `10.1.0.0/16` and
//! `host_bits = 6`, `10.1.0.50` and `10.1.0.70` are on different subnets.
//!
//! If the subnet number extends into the next higher octet, its bits are
//! rotated so the subnets with all zeros in the shared octet come first. For
//! `10.1.0.0/16` with `host_bits = 6` that hands out `10.1.0.0/26`,
//! `10.1.1.0/26`, ... `10.1.255.0/26` (exactly like /24s would be), and only
//! then `10.1.0.64/26`, `10.1.1.64/26`, and so on.

use crate::config::PoolDescriptor;
use crate::error::IpamError;
use ipnet::Ipv4Net;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::warn;

/// Round-robin cursor and allocation map, always updated together
#[derive(Debug)]
struct AllocationState {
    /// Next candidate subnet number
    next: u64,
    /// Every subnet ever seen, keyed by its truncated network; `true` while in use
    allocated: HashMap<Ipv4Net, bool>,
}

/// Allocates subnets out of a single pool network.
#[derive(Debug)]
pub struct SubnetAllocator {
    network: Ipv4Net,
    host_bits: u32,
    subnet_prefix_len: u8,
    left_shift: u32,
    left_mask: u32,
    right_shift: u32,
    right_mask: u32,
    state: Mutex<AllocationState>,
}

impl SubnetAllocator {
    /// Creates an allocator for `network` handing out subnets with `host_bits`
    /// host bits.
    ///
    /// Entries of `in_use` are marked allocated. Entries that can't be parsed
    /// or that lie outside `network` are skipped with a warning.
    pub fn new(network: &str, host_bits: u32, in_use: &[String]) -> Result<Self, IpamError> {
        let parsed = Ipv4Net::from_str(network).map_err(|_| {
            IpamError::InvalidPool(format!("failed to parse network address: {network:?}"))
        })?;
        let pool = PoolDescriptor::new(parsed, host_bits)?;
        Ok(Self::from_descriptor(&pool, in_use))
    }

    /// Creates an allocator for an already validated pool.
    pub fn from_descriptor(pool: &PoolDescriptor, in_use: &[String]) -> Self {
        let network = pool.network;
        let host_bits = pool.host_bits;
        let pool_bits = 32 - u32::from(network.prefix_len());
        let subnet_bits = pool.subnet_bits();

        let (left_shift, left_mask, right_shift, right_mask) =
            if host_bits % 8 != 0 && (host_bits - 1) / 8 != (host_bits + subnet_bits - 1) / 8 {
                let left_shift = 8 - (host_bits % 8);
                // The field crosses an octet boundary, so subnet_bits > left_shift
                (
                    left_shift,
                    ((1u64 << pool_bits) - 1) as u32,
                    subnet_bits - left_shift,
                    ((1u32 << left_shift) - 1) << host_bits,
                )
            } else {
                (0, u32::MAX, 0, 0)
            };

        let mut allocated = HashMap::new();
        for entry in in_use {
            let subnet = match Ipv4Net::from_str(entry.trim()) {
                Ok(subnet) => subnet.trunc(),
                Err(_) => {
                    warn!("Failed to parse preallocated subnet {:?} for pool {}, skipping", entry, network);
                    continue;
                }
            };
            if !network.contains(&subnet.network()) {
                warn!("Preallocated subnet {} doesn't belong to pool {}, skipping", subnet, network);
                continue;
            }
            allocated.insert(subnet, true);
        }

        Self {
            network,
            host_bits,
            subnet_prefix_len: pool.subnet_prefix_len(),
            left_shift,
            left_mask,
            right_shift,
            right_mask,
            state: Mutex::new(AllocationState { next: 0, allocated }),
        }
    }

    /// The pool network this allocator carves up
    pub fn network(&self) -> Ipv4Net {
        self.network
    }

    /// Host bits in every allocated subnet
    pub fn host_bits(&self) -> u32 {
        self.host_bits
    }

    fn subnet_bits(&self) -> u32 {
        32 - u32::from(self.network.prefix_len()) - self.host_bits
    }

    /// Number of subnets in the pool
    pub fn capacity(&self) -> u64 {
        1u64 << self.subnet_bits()
    }

    /// Number of subnets currently marked in use
    pub fn in_use_count(&self) -> usize {
        self.lock().allocated.values().filter(|in_use| **in_use).count()
    }

    /// Whether the address falls inside this pool
    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        self.network.contains(&addr)
    }

    /// Hands out the next free subnet, scanning round-robin from the cursor.
    pub fn allocate(&self) -> Result<Ipv4Net, IpamError> {
        let mut state = self.lock();
        let num_subnets = self.capacity();

        for i in 0..num_subnets {
            let n = (i + state.next) % num_subnets;
            let subnet = self.candidate(n)?;
            let in_use = state.allocated.entry(subnet).or_insert(false);
            if !*in_use {
                *in_use = true;
                state.next = n + 1;
                return Ok(subnet);
            }
        }

        state.next = 0;
        Err(IpamError::PoolExhausted { pool: self.network })
    }

    /// Marks a subnet that is already bound elsewhere as in use.
    ///
    /// Idempotent: returns `true` if the subnet was free until now.
    pub fn reserve(&self, subnet: Ipv4Net) -> Result<bool, IpamError> {
        let subnet = subnet.trunc();
        if !self.network.contains(&subnet.network()) {
            return Err(IpamError::NotInPool { subnet, pool: self.network });
        }

        let mut state = self.lock();
        let in_use = state.allocated.entry(subnet).or_insert(false);
        let newly_reserved = !*in_use;
        *in_use = true;
        Ok(newly_reserved)
    }

    /// Returns a subnet to the pool.
    ///
    /// Releasing a subnet that isn't allocated is an error, so a duplicate
    /// delete is reported rather than silently accepted.
    pub fn release(&self, subnet: Ipv4Net) -> Result<(), IpamError> {
        let subnet = subnet.trunc();
        if !self.network.contains(&subnet.network()) {
            return Err(IpamError::NotInPool { subnet, pool: self.network });
        }

        let mut state = self.lock();
        match state.allocated.get_mut(&subnet) {
            Some(in_use) if *in_use => {
                *in_use = false;
                Ok(())
            }
            _ => Err(IpamError::AlreadyFree { subnet }),
        }
    }

    /// Network of the `n`th subnet in allocation order
    fn candidate(&self, n: u64) -> Result<Ipv4Net, IpamError> {
        // n < 2^subnet_bits and subnet_bits + host_bits <= 32
        let shifted = (n << self.host_bits) as u32;
        let rotated = ((shifted << self.left_shift) & self.left_mask)
            | ((shifted >> self.right_shift) & self.right_mask);
        let base = u32::from(self.network.network());
        Ipv4Net::new(Ipv4Addr::from(base | rotated), self.subnet_prefix_len).map_err(|e| {
            IpamError::InvalidPool(format!("{}: subnet prefix /{}: {}", self.network, self.subnet_prefix_len, e))
        })
    }

    fn lock(&self) -> MutexGuard<'_, AllocationState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Gateway address handed to node-side plumbing: the first usable address.
pub fn gateway_for(subnet: Ipv4Net) -> Ipv4Addr {
    let network = u32::from(subnet.network());
    Ipv4Addr::from(network.wrapping_add(1))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn net(s: &str) -> Ipv4Net {
        s.parse().unwrap()
    }

    #[test]
    fn test_new_rejects_invalid_pool() {
        assert!(matches!(SubnetAllocator::new("10.1.0.0", 8, &[]), Err(IpamError::InvalidPool(_))));
        assert!(matches!(SubnetAllocator::new("10.1.0.0/16", 0, &[]), Err(IpamError::InvalidPool(_))));
        assert!(matches!(SubnetAllocator::new("10.1.0.0/16", 17, &[]), Err(IpamError::InvalidPool(_))));
    }

    #[test]
    fn test_rotation_parameters() {
        // Subnet number straddles the third/fourth octet boundary
        let rotated = SubnetAllocator::new("10.1.0.0/16", 6, &[]).unwrap();
        assert_eq!(rotated.left_shift, 2);
        assert_eq!(rotated.left_mask, 0xFFFF);
        assert_eq!(rotated.right_shift, 8);
        assert_eq!(rotated.right_mask, 0xC0);

        // Byte aligned host bits: no rotation
        let aligned = SubnetAllocator::new("10.1.0.0/16", 8, &[]).unwrap();
        assert_eq!(aligned.left_shift, 0);
        assert_eq!(aligned.left_mask, u32::MAX);
        assert_eq!(aligned.right_shift, 0);
        assert_eq!(aligned.right_mask, 0);

        // Subnet number within a single octet: no rotation
        let same_octet = SubnetAllocator::new("10.1.0.0/24", 6, &[]).unwrap();
        assert_eq!(same_octet.left_shift, 0);
        assert_eq!(same_octet.right_mask, 0);
    }

    #[test]
    fn test_allocate_aligned_subnets_in_order() {
        let allocator = SubnetAllocator::new("10.1.0.0/16", 8, &[]).unwrap();
        assert_eq!(allocator.allocate().unwrap(), net("10.1.0.0/24"));
        assert_eq!(allocator.allocate().unwrap(), net("10.1.1.0/24"));
        assert_eq!(allocator.allocate().unwrap(), net("10.1.2.0/24"));
    }

    #[test]
    fn test_allocate_rotated_order() {
        let allocator = SubnetAllocator::new("10.1.0.0/16", 6, &[]).unwrap();
        for i in 0..256u32 {
            let subnet = allocator.allocate().unwrap();
            assert_eq!(subnet, net(&format!("10.1.{i}.0/26")));
        }
        assert_eq!(allocator.allocate().unwrap(), net("10.1.0.64/26"));
        assert_eq!(allocator.allocate().unwrap(), net("10.1.1.64/26"));
    }

    #[test]
    fn test_seeded_subnets_are_skipped() {
        let in_use = vec!["10.1.0.0/26".to_string(), "10.1.1.0/26".to_string()];
        let allocator = SubnetAllocator::new("10.1.0.0/16", 6, &in_use).unwrap();
        assert_eq!(allocator.in_use_count(), 2);
        assert_eq!(allocator.allocate().unwrap(), net("10.1.2.0/26"));
    }

    #[test]
    fn test_seed_skips_invalid_entries() {
        let in_use = vec![
            "garbage".to_string(),
            "10.2.0.0/24".to_string(),
            "10.1.3.7/24".to_string(),
        ];
        let allocator = SubnetAllocator::new("10.1.0.0/16", 8, &in_use).unwrap();
        // Only the in-pool entry survives, truncated to its network
        assert_eq!(allocator.in_use_count(), 1);
        assert!(matches!(allocator.release(net("10.1.3.0/24")), Ok(())));
    }

    #[test]
    fn test_release_errors() {
        let allocator = SubnetAllocator::new("10.1.0.0/16", 8, &[]).unwrap();
        let subnet = allocator.allocate().unwrap();

        assert_eq!(
            allocator.release(net("10.2.0.0/24")),
            Err(IpamError::NotInPool { subnet: net("10.2.0.0/24"), pool: net("10.1.0.0/16") })
        );
        // Never allocated
        assert_eq!(
            allocator.release(net("10.1.7.0/24")),
            Err(IpamError::AlreadyFree { subnet: net("10.1.7.0/24") })
        );

        assert_eq!(allocator.release(subnet), Ok(()));
        assert_eq!(allocator.release(subnet), Err(IpamError::AlreadyFree { subnet }));
    }

    #[test]
    fn test_exhaustion_resets_cursor() {
        // Four /26s in a /24
        let allocator = SubnetAllocator::new("192.168.5.0/24", 6, &[]).unwrap();
        assert_eq!(allocator.capacity(), 4);
        let subnets: Vec<_> = (0..4).map(|_| allocator.allocate().unwrap()).collect();
        assert_eq!(subnets[3], net("192.168.5.192/26"));
        assert_eq!(
            allocator.allocate(),
            Err(IpamError::PoolExhausted { pool: net("192.168.5.0/24") })
        );

        allocator.release(subnets[2]).unwrap();
        assert_eq!(allocator.allocate().unwrap(), subnets[2]);
    }

    #[test]
    fn test_round_robin_does_not_reuse_immediately() {
        let allocator = SubnetAllocator::new("10.1.0.0/16", 8, &[]).unwrap();
        let first = allocator.allocate().unwrap();
        allocator.release(first).unwrap();
        assert_eq!(allocator.allocate().unwrap(), net("10.1.1.0/24"));
    }

    #[test]
    fn test_reserve_marks_bound_subnet_in_use() {
        let allocator = SubnetAllocator::new("10.0.0.0/16", 8, &[]).unwrap();

        assert_eq!(allocator.reserve(net("10.0.0.0/24")), Ok(true));
        // Idempotent
        assert_eq!(allocator.reserve(net("10.0.0.0/24")), Ok(false));
        assert_eq!(allocator.in_use_count(), 1);
        assert_eq!(allocator.allocate().unwrap(), net("10.0.1.0/24"));

        // A reserved subnet releases like an allocated one
        assert_eq!(allocator.release(net("10.0.0.0/24")), Ok(()));
        assert_eq!(
            allocator.reserve(net("10.1.0.0/24")),
            Err(IpamError::NotInPool { subnet: net("10.1.0.0/24"), pool: net("10.0.0.0/16") })
        );
    }

    #[test]
    fn test_candidates_use_pool_subnet_prefix() {
        let allocator = SubnetAllocator::new("10.1.0.0/16", 6, &[]).unwrap();
        for n in [0, 1, 255, 256, 1023] {
            assert_eq!(allocator.candidate(n).unwrap().prefix_len(), 26);
        }
        assert_eq!(allocator.candidate(1023).unwrap(), net("10.1.255.192/26"));
    }

    #[test]
    fn test_gateway_is_first_usable_address() {
        assert_eq!(gateway_for(net("10.1.4.0/24")), Ipv4Addr::new(10, 1, 4, 1));
        assert_eq!(gateway_for(net("10.1.0.64/26")), Ipv4Addr::new(10, 1, 0, 65));
    }
}
