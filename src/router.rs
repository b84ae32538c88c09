//! Event routing from informer notifications to reconcile keys
//!
//! Two notification streams feed one queue:
//!
//! - owner objects enqueue their own key
//! - derived objects enqueue the key of the owner named by their controller
//!   owner reference, but only if that owner is still in the cache
//!
//! Orphans (owner gone or never existed) are dropped and left to the
//! garbage collector. Updates whose resourceVersion did not change are
//! resync re-deliveries and are dropped too.

use std::marker::PhantomData;
use std::sync::Arc;

use kube::{Resource, ResourceExt};
use tracing::{debug, warn};

use crate::crd::KindInfo;
use crate::informer::{DeletedObject, EventHandler, Store};
use crate::queue::WorkQueue;
use crate::ReconcileKey;

/// Translates notifications for an owner kind and its derived kind into
/// owner keys on the work queue
pub struct EventRouter<O> {
    queue: WorkQueue<ReconcileKey>,
    owners: Store<O>,
    owner_kind: KindInfo,
}

impl<O> EventRouter<O>
where
    O: Resource + Send + Sync + 'static,
{
    /// Create a router feeding `queue`, resolving owners through `owners`
    pub fn new(queue: WorkQueue<ReconcileKey>, owners: Store<O>, owner_kind: KindInfo) -> Self {
        Self {
            queue,
            owners,
            owner_kind,
        }
    }

    /// Enqueue the key of an owner object
    pub fn enqueue_owner(&self, owner: &O) {
        match ReconcileKey::from_resource(owner) {
            Ok(key) => {
                debug!(key = %key, "Enqueueing owner");
                self.queue.add(key);
            }
            Err(e) => warn!(error = %e, kind = %self.owner_kind.kind, "Cannot enqueue owner"),
        }
    }

    /// Enqueue the owner of a derived object, if it has a live one
    pub fn handle_object<D: Resource>(&self, obj: &D) {
        let name = obj.name_any();
        let namespace = obj.namespace();
        debug!(object = %name, namespace = ?namespace, "Processing object");

        let Some(owner_ref) = obj.meta().owner_references.as_ref().and_then(|refs| {
            refs.iter().find(|r| r.controller == Some(true))
        }) else {
            return;
        };

        if !self.owner_kind.matches(owner_ref) {
            return;
        }

        let key = match namespace {
            Some(ns) => ReconcileKey::new(ns, owner_ref.name.clone()),
            None => ReconcileKey::cluster_scoped(owner_ref.name.clone()),
        };

        match self.owners.get(&key) {
            Some(owner) => self.enqueue_owner(&owner),
            None => {
                debug!(object = %name, owner = %key, "Ignoring orphaned object");
            }
        }
    }

    /// Unwrap a delete notification and route it like any other change
    pub fn handle_deleted<D: Resource>(&self, obj: DeletedObject<D>) {
        let recovered = matches!(obj, DeletedObject::Tombstone(_));
        match obj.into_object() {
            Ok(obj) => {
                if recovered {
                    debug!(object = %obj.name_any(), "Recovered deleted object");
                }
                self.handle_object(obj.as_ref());
            }
            Err(e) => warn!(error = %e, "Dropping delete notification"),
        }
    }

    /// Handler to register on the owner informer
    pub fn owner_handler(self: &Arc<Self>) -> Arc<dyn EventHandler<O>> {
        Arc::new(OwnerEvents {
            router: Arc::clone(self),
        })
    }

    /// Handler to register on the derived informer
    pub fn derived_handler<D>(self: &Arc<Self>) -> Arc<dyn EventHandler<D>>
    where
        D: Resource + Send + Sync + 'static,
    {
        Arc::new(DerivedEvents {
            router: Arc::clone(self),
            _kind: PhantomData,
        })
    }
}

/// True if an update carries a real change
///
/// Two versions of the same object always have different resourceVersions;
/// periodic resync re-delivers the cached copy unchanged.
fn changed<K: Resource>(old: &K, new: &K) -> bool {
    old.meta().resource_version != new.meta().resource_version
}

struct OwnerEvents<O> {
    router: Arc<EventRouter<O>>,
}

impl<O> EventHandler<O> for OwnerEvents<O>
where
    O: Resource + Send + Sync + 'static,
{
    fn on_add(&self, obj: &Arc<O>) {
        self.router.enqueue_owner(obj);
    }

    fn on_update(&self, old: &Arc<O>, new: &Arc<O>) {
        if changed(old.as_ref(), new.as_ref()) {
            self.router.enqueue_owner(new);
        }
    }
}

struct DerivedEvents<O, D> {
    router: Arc<EventRouter<O>>,
    _kind: PhantomData<fn(D)>,
}

impl<O, D> EventHandler<D> for DerivedEvents<O, D>
where
    O: Resource + Send + Sync + 'static,
    D: Resource + Send + Sync + 'static,
{
    fn on_add(&self, obj: &Arc<D>) {
        self.router.handle_object(obj.as_ref());
    }

    fn on_update(&self, old: &Arc<D>, new: &Arc<D>) {
        if changed(old.as_ref(), new.as_ref()) {
            self.router.handle_object(new.as_ref());
        }
    }

    fn on_delete(&self, obj: DeletedObject<D>) {
        self.router.handle_deleted(obj);
    }
}
