//! Change notifications and local caches
//!
//! An informer watches one resource kind, mirrors it into a [`Store`] and
//! tells registered [`EventHandler`]s about every add, update and delete.
//! Handlers run on the informer's task, one notification at a time per
//! kind, so they must only compute keys and enqueue.

mod shared;
mod store;

use std::fmt::Debug;
use std::sync::Arc;

use futures::Stream;
use kube::runtime::watcher::{self, watcher};
use kube::runtime::WatchStreamExt;
use kube::{Api, Resource};
use serde::de::DeserializeOwned;

pub use shared::{SharedInformer, DEFAULT_RESYNC_PERIOD};
pub use store::Store;

use crate::Error;

/// Last known state of an object whose deletion was not observed directly
///
/// Produced when an object disappears between two list snapshots. The
/// informer may not have a copy of the object, in which case only the key
/// survives.
#[derive(Debug)]
pub struct Tombstone<K> {
    /// `namespace/name` of the deleted object
    pub key: String,
    /// Object as last seen in the cache, if any
    pub last_known: Option<Arc<K>>,
}

/// Payload of a delete notification
#[derive(Debug)]
pub enum DeletedObject<K> {
    /// The watch delivered the deleted object itself
    Live(Arc<K>),
    /// The deletion was inferred after a relist
    Tombstone(Tombstone<K>),
}

// Manual impls: only the Arc is cloned, so K itself need not be Clone.
impl<K> Clone for Tombstone<K> {
    fn clone(&self) -> Self {
        Self {
            key: self.key.clone(),
            last_known: self.last_known.clone(),
        }
    }
}

impl<K> Clone for DeletedObject<K> {
    fn clone(&self) -> Self {
        match self {
            Self::Live(obj) => Self::Live(Arc::clone(obj)),
            Self::Tombstone(tombstone) => Self::Tombstone(tombstone.clone()),
        }
    }
}

impl<K> DeletedObject<K> {
    /// Recover the deleted object
    ///
    /// Fails with a decode error when a tombstone carries no object.
    pub fn into_object(self) -> Result<Arc<K>, Error> {
        match self {
            Self::Live(obj) => Ok(obj),
            Self::Tombstone(Tombstone {
                last_known: Some(obj),
                ..
            }) => Ok(obj),
            Self::Tombstone(Tombstone {
                key,
                last_known: None,
            }) => Err(Error::decode(format!(
                "error decoding object tombstone for {key}: no last known state"
            ))),
        }
    }
}

/// Receives notifications for one resource kind
///
/// All methods default to doing nothing so handlers only implement the
/// notifications they care about.
pub trait EventHandler<K>: Send + Sync {
    /// Object appeared in the cache
    fn on_add(&self, _obj: &Arc<K>) {}

    /// Object changed, or a resync re-delivered it unchanged
    fn on_update(&self, _old: &Arc<K>, _new: &Arc<K>) {}

    /// Object left the cache
    fn on_delete(&self, _obj: DeletedObject<K>) {}
}

/// Readiness signal of an informer cache
pub trait CacheSynced: Send + Sync {
    /// True once the initial list has been fully loaded
    fn has_synced(&self) -> bool;

    /// Kind name, used in logs
    fn kind(&self) -> &str;
}

/// Watch stream for `api` with the default reconnect backoff
///
/// This is the stream [`SharedInformer::run`] consumes in production.
pub fn watch_stream<K>(
    api: Api<K>,
    config: watcher::Config,
) -> impl Stream<Item = Result<watcher::Event<K>, watcher::Error>> + Send
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + 'static,
{
    watcher(api, config).default_backoff()
}
