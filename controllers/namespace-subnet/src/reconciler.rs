//! Reconciliation logic for namespace subnets.
//!
//! This module binds namespace lifecycle events to the subnet pools:
//! a created namespace gets a subnet, a deleted namespace gives it back.
//!
//! A namespace's subnet never changes once assigned, so updates are no-ops
//! apart from making sure the subnet is marked in use. Failures are logged and
//! contained to the namespace that triggered them; nothing is retried here. A
//! namespace left unbound is picked up again the next time the watcher
//! relists, and a namespace that disappeared while the watch was down is
//! released once the relist completes.

use crate::binding::{NamespaceRef, SubnetBinding};
use crate::error::ControllerError;
use crate::store::NamespaceStore;
use ipnet::Ipv4Net;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard, PoisonError};
use subnet_ipam::{AllocatorPoolSet, PoolDescriptor};
use tracing::{debug, error, info, warn};

/// Lifecycle notification for a namespace
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NamespaceEvent {
    /// Namespace created, or seen again while listing
    Created(NamespaceRef),
    /// Namespace deleted; carries its last known state
    Deleted(NamespaceRef),
}

/// What handling an event did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventOutcome {
    /// A new subnet was allocated and recorded
    Allocated(Ipv4Net),
    /// The namespace already had a subnet
    AlreadyBound(Ipv4Net),
    /// The namespace's subnet was returned to its pool
    Released(Ipv4Net),
    /// Nothing to do
    Skipped,
    /// The event could not be handled; the error has been logged
    Failed(String),
}

/// Reconciles namespaces against the subnet pools.
pub struct Reconciler {
    store: Box<dyn NamespaceStore + Send + Sync>,
    pools: AllocatorPoolSet,
    /// Namespaces holding a subnet from one of the pools
    bound: Mutex<BTreeMap<String, Ipv4Net>>,
}

impl Reconciler {
    /// Recovers existing bindings and builds the pool set.
    ///
    /// Every namespace is listed once before any event is handled so that
    /// subnets assigned before a restart are never handed out again.
    /// Namespaces with a missing or malformed binding are treated as unbound.
    pub async fn start(
        pools: &[PoolDescriptor],
        store: impl NamespaceStore + Send + Sync + 'static,
    ) -> Result<Self, ControllerError> {
        info!("Recovering subnet bindings from existing namespaces...");

        let namespaces = store.list_namespaces().await?;
        let mut in_use = BTreeMap::new();
        for namespace in &namespaces {
            match namespace.binding() {
                Ok(Some(subnet)) => {
                    debug!("Namespace {} is bound to {}", namespace.name, subnet);
                    in_use.insert(namespace.name.clone(), subnet);
                }
                Ok(None) => debug!("Namespace {} has no subnet yet", namespace.name),
                Err(e) => warn!("Skipping namespace {}: {}", namespace.name, e),
            }
        }

        let recovered: Vec<String> = in_use.values().map(ToString::to_string).collect();
        let pool_set = AllocatorPoolSet::new(pools, &recovered)?;

        // Bindings outside every pool have been warned about by the pool set
        in_use.retain(|_, subnet| pool_set.owning_pool(*subnet).is_some());

        for pool in pool_set.pools() {
            info!(
                "Pool {}: {} of {} /{} subnets in use",
                pool.network(),
                pool.in_use_count(),
                pool.capacity(),
                32 - pool.host_bits()
            );
        }
        info!(
            "Recovered {} bindings from {} namespaces",
            in_use.len(),
            namespaces.len()
        );

        Ok(Self {
            store: Box::new(store),
            pools: pool_set,
            bound: Mutex::new(in_use),
        })
    }

    /// The pools backing this reconciler
    #[cfg(test)]
    pub fn pools(&self) -> &AllocatorPoolSet {
        &self.pools
    }

    /// Releases the subnets of bound namespaces missing from a full relist.
    ///
    /// The watch delivers no delete for a namespace removed while it was
    /// down; the relist is the only evidence that it is gone.
    pub async fn release_missing(&self, present: &BTreeSet<String>) -> Vec<(String, EventOutcome)> {
        let missing: Vec<(String, Ipv4Net)> = self
            .bound_namespaces()
            .iter()
            .filter(|(name, _)| !present.contains(*name))
            .map(|(name, subnet)| (name.clone(), *subnet))
            .collect();

        let mut outcomes = Vec::with_capacity(missing.len());
        for (name, subnet) in missing {
            info!("Namespace {} disappeared while the watch was down", name);
            let last_known = NamespaceRef::new(name.clone()).with_subnet(subnet.to_string());
            let outcome = self.on_delete(&last_known).await;
            outcomes.push((name, outcome));
        }
        outcomes
    }

    /// Handles one lifecycle event. Errors are logged, never returned.
    pub async fn handle_event(&self, event: NamespaceEvent) -> EventOutcome {
        let outcome = match &event {
            NamespaceEvent::Created(namespace) => self.on_create(namespace).await,
            NamespaceEvent::Deleted(namespace) => self.on_delete(namespace).await,
        };
        debug!("Handled {:?}: {:?}", event, outcome);
        outcome
    }

    async fn on_create(&self, namespace: &NamespaceRef) -> EventOutcome {
        let name = &namespace.name;

        if namespace.terminating {
            debug!("Namespace {} is terminating, not allocating", name);
            return EventOutcome::Skipped;
        }

        match namespace.binding() {
            Ok(Some(subnet)) => {
                debug!("Namespace {} already bound to {}", name, subnet);
                self.keep_binding(name, subnet);
                return EventOutcome::AlreadyBound(subnet);
            }
            Ok(None) => {}
            Err(e) => warn!("{}; treating namespace {} as unbound", e, name),
        }

        // The event may be stale: re-read before allocating
        let current = match self.store.get_namespace(name).await {
            Ok(Some(current)) => current,
            Ok(None) => {
                debug!("Namespace {} no longer exists, not allocating", name);
                return EventOutcome::Skipped;
            }
            Err(e) => {
                error!("Failed to read namespace {}: {}", name, e);
                return EventOutcome::Failed(e.to_string());
            }
        };
        if current.terminating {
            return EventOutcome::Skipped;
        }
        if let Ok(Some(subnet)) = current.binding() {
            debug!("Namespace {} was bound to {} meanwhile", name, subnet);
            self.keep_binding(name, subnet);
            return EventOutcome::AlreadyBound(subnet);
        }

        let subnet = match self.pools.allocate_any() {
            Ok(subnet) => subnet,
            Err(e) => {
                error!("Error creating subnet for namespace {}: {}", name, e);
                return EventOutcome::Failed(e.to_string());
            }
        };

        let binding = SubnetBinding::for_subnet(subnet);
        if let Err(e) = self.store.set_binding(name, &binding).await {
            error!("{}", e);
            // Leave the namespace unbound without leaking the subnet
            if let Err(release_err) = self.pools.release_from(subnet) {
                error!(
                    "Failed to return subnet {} after binding namespace {} failed: {}",
                    subnet, name, release_err
                );
            }
            return EventOutcome::Failed(e.to_string());
        }
        self.bound_namespaces().insert(name.clone(), subnet);

        info!(
            "Allocated subnet {} (gateway {}) from pool {} for namespace {}",
            subnet,
            binding.gateway,
            self.pools
                .owning_pool(subnet)
                .map_or_else(|| "<unknown>".to_string(), |pool| pool.to_string()),
            name
        );
        EventOutcome::Allocated(subnet)
    }

    async fn on_delete(&self, namespace: &NamespaceRef) -> EventOutcome {
        let name = &namespace.name;
        self.bound_namespaces().remove(name);

        let subnet = match namespace.binding() {
            Ok(Some(subnet)) => subnet,
            Ok(None) => {
                debug!("Namespace {} had no subnet, nothing to release", name);
                return EventOutcome::Skipped;
            }
            Err(e) => {
                warn!("Cannot release subnet of deleted namespace {}: {}", name, e);
                return EventOutcome::Failed(e.to_string());
            }
        };

        match self.pools.release_from(subnet) {
            Ok(()) => {
                info!("Released subnet {} of deleted namespace {}", subnet, name);
                EventOutcome::Released(subnet)
            }
            Err(e) => {
                error!(
                    "Failed to release subnet {} of deleted namespace {} (pool {}): {}",
                    subnet,
                    name,
                    self.pools
                        .owning_pool(subnet)
                        .map_or_else(|| "<none>".to_string(), |pool| pool.to_string()),
                    e
                );
                EventOutcome::Failed(e.to_string())
            }
        }
    }

    /// Marks an existing binding in use so it is never handed out again.
    fn keep_binding(&self, name: &str, subnet: Ipv4Net) {
        match self.pools.reserve(subnet) {
            Ok(newly_reserved) => {
                if newly_reserved {
                    info!("Recorded existing subnet {} of namespace {}", subnet, name);
                }
                self.bound_namespaces().insert(name.to_string(), subnet);
            }
            Err(e) => warn!("Cannot reserve subnet of namespace {}: {}", name, e),
        }
    }

    fn bound_namespaces(&self) -> MutexGuard<'_, BTreeMap<String, Ipv4Net>> {
        self.bound.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
