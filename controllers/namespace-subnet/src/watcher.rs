//! Kubernetes namespace watcher.
//!
//! Turns the raw namespace watch stream into typed [`NamespaceEvent`]s and
//! feeds them to the reconciler one at a time.
//!
//! Objects replayed by the initial list (and by every relist after a
//! reconnect) are handled as `Created` events. That is how namespaces whose
//! allocation failed earlier get another chance. A relist carries no delete
//! for namespaces removed while the watch was down, so once it completes
//! every bound namespace it did not mention is released.

use crate::backoff::FibonacciBackoff;
use crate::binding::NamespaceRef;
use crate::error::ControllerError;
use crate::reconciler::{NamespaceEvent, Reconciler};
use futures::TryStreamExt;
use k8s_openapi::api::core::v1::Namespace;
use kube::Api;
use kube_runtime::watcher;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Translates a watch event into a namespace lifecycle event.
///
/// `Init` and `InitDone` only mark list boundaries and map to `None`.
pub fn namespace_event(event: watcher::Event<Namespace>) -> Option<NamespaceEvent> {
    match event {
        watcher::Event::Apply(namespace) | watcher::Event::InitApply(namespace) => {
            Some(NamespaceEvent::Created(NamespaceRef::from(&namespace)))
        }
        watcher::Event::Delete(namespace) => {
            Some(NamespaceEvent::Deleted(NamespaceRef::from(&namespace)))
        }
        watcher::Event::Init | watcher::Event::InitDone => None,
    }
}

/// Collects the namespace names seen during one relist.
#[derive(Debug, Default)]
pub struct RelistTracker {
    seen: Option<BTreeSet<String>>,
}

impl RelistTracker {
    /// Records `event`; returns every name the relist contained once it completes.
    pub fn observe(&mut self, event: &watcher::Event<Namespace>) -> Option<BTreeSet<String>> {
        match event {
            watcher::Event::Init => {
                self.seen = Some(BTreeSet::new());
                None
            }
            watcher::Event::InitApply(ns) => {
                if let (Some(seen), Some(name)) = (self.seen.as_mut(), ns.metadata.name.as_ref()) {
                    seen.insert(name.clone());
                }
                None
            }
            watcher::Event::InitDone => self.seen.take(),
            watcher::Event::Apply(_) | watcher::Event::Delete(_) => None,
        }
    }
}

/// Watches namespaces for changes.
pub struct Watcher {
    reconciler: Arc<Reconciler>,
    namespace_api: Api<Namespace>,
}

impl Watcher {
    /// Creates a new watcher instance.
    pub fn new(reconciler: Arc<Reconciler>, namespace_api: Api<Namespace>) -> Self {
        Self {
            reconciler,
            namespace_api,
        }
    }

    /// Starts watching Namespace resources.
    ///
    /// Runs until the task is aborted. A failed or ended stream is restarted
    /// after a backoff; the restart relists every namespace.
    pub async fn watch_namespaces(&self) -> Result<(), ControllerError> {
        info!("Starting Namespace watcher");

        let mut backoff = FibonacciBackoff::new(1, 30);
        loop {
            let mut stream = Box::pin(watcher(self.namespace_api.clone(), watcher::Config::default()));
            let mut relist = RelistTracker::default();

            loop {
                match stream.try_next().await {
                    Ok(Some(event)) => {
                        backoff.reset();
                        self.dispatch(event, &mut relist).await;
                    }
                    Ok(None) => {
                        warn!("Namespace watch stream ended");
                        break;
                    }
                    Err(e) => {
                        warn!("Namespace watch stream error: {}", e);
                        break;
                    }
                }
            }

            let delay = backoff.next_backoff();
            warn!("Restarting Namespace watcher in {}s", delay.as_secs());
            tokio::time::sleep(delay).await;
        }
    }

    async fn dispatch(&self, event: watcher::Event<Namespace>, relist: &mut RelistTracker) {
        match &event {
            watcher::Event::Init => debug!("Namespace watcher initialized"),
            watcher::Event::InitDone => info!("Namespace watcher initialization complete"),
            watcher::Event::Apply(ns) => {
                debug!("Namespace applied: {}", ns.metadata.name.as_deref().unwrap_or("<unknown>"));
            }
            watcher::Event::InitApply(ns) => {
                debug!("Namespace init apply: {}", ns.metadata.name.as_deref().unwrap_or("<unknown>"));
            }
            watcher::Event::Delete(ns) => {
                info!("Namespace deleted: {}", ns.metadata.name.as_deref().unwrap_or("<unknown>"));
            }
        }

        let completed = relist.observe(&event);
        if let Some(namespace_event) = namespace_event(event) {
            self.reconciler.handle_event(namespace_event).await;
        }
        if let Some(present) = completed {
            let released = self.reconciler.release_missing(&present).await;
            if !released.is_empty() {
                info!("Released subnets of {} namespaces missing from the relist", released.len());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binding::SUBNET_ANNOTATION;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use std::collections::BTreeMap;

    fn namespace(name: &str, subnet: Option<&str>) -> Namespace {
        let annotations = subnet.map(|s| BTreeMap::from([(SUBNET_ANNOTATION.to_string(), s.to_string())]));
        Namespace {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                annotations,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_apply_and_init_apply_map_to_created() {
        let expected = NamespaceEvent::Created(NamespaceRef::new("ns1"));
        assert_eq!(namespace_event(watcher::Event::Apply(namespace("ns1", None))), Some(expected.clone()));
        assert_eq!(namespace_event(watcher::Event::InitApply(namespace("ns1", None))), Some(expected));
    }

    #[test]
    fn test_delete_carries_binding() {
        let event = namespace_event(watcher::Event::Delete(namespace("ns1", Some("10.1.0.0/26"))));
        assert_eq!(
            event,
            Some(NamespaceEvent::Deleted(NamespaceRef::new("ns1").with_subnet("10.1.0.0/26")))
        );
    }

    #[test]
    fn test_relist_tracker_collects_listed_names() {
        let mut relist = RelistTracker::default();

        assert_eq!(relist.observe(&watcher::Event::Init), None);
        assert_eq!(relist.observe(&watcher::Event::InitApply(namespace("a", None))), None);
        assert_eq!(relist.observe(&watcher::Event::InitApply(namespace("b", Some("10.0.1.0/24")))), None);
        let present = relist.observe(&watcher::Event::InitDone).unwrap();
        assert_eq!(present, BTreeSet::from(["a".to_string(), "b".to_string()]));

        // Live events outside a relist never complete one
        assert_eq!(relist.observe(&watcher::Event::Apply(namespace("c", None))), None);
        assert_eq!(relist.observe(&watcher::Event::InitDone), None);
    }

    #[test]
    fn test_list_markers_are_ignored() {
        assert_eq!(namespace_event(watcher::Event::Init), None);
        assert_eq!(namespace_event(watcher::Event::InitDone), None);
    }
}
