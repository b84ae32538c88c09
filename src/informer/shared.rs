//! Informer driving a [`Store`] and its handlers from a watch stream

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::{Stream, StreamExt};
use kube::runtime::watcher;
use kube::Resource;
use parking_lot::{Mutex, RwLock};
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{CacheSynced, DeletedObject, EventHandler, Store, Tombstone};
use crate::ReconcileKey;

/// How often cached objects are re-delivered as updates
pub const DEFAULT_RESYNC_PERIOD: Duration = Duration::from_secs(30);

/// Watches one kind, keeps its [`Store`] current and fans out notifications
pub struct SharedInformer<K> {
    kind: String,
    store: Store<K>,
    handlers: RwLock<Vec<Arc<dyn EventHandler<K>>>>,
    synced: AtomicBool,
    resync_period: Option<Duration>,
    /// Objects seen since the last `Init`, applied at `InitDone`
    relist: Mutex<Option<HashMap<ReconcileKey, Arc<K>>>>,
}

impl<K> SharedInformer<K>
where
    K: Resource + Send + Sync + 'static,
{
    /// Create an informer; `resync_period` of `None` disables resync
    pub fn new(kind: impl Into<String>, resync_period: Option<Duration>) -> Self {
        Self {
            kind: kind.into(),
            store: Store::new(),
            handlers: RwLock::new(Vec::new()),
            synced: AtomicBool::new(false),
            resync_period,
            relist: Mutex::new(None),
        }
    }

    /// Read handle on the cache
    pub fn store(&self) -> Store<K> {
        self.store.clone()
    }

    /// Register a handler for all future notifications
    pub fn add_event_handler(&self, handler: Arc<dyn EventHandler<K>>) {
        self.handlers.write().push(handler);
    }

    /// Consume `events` until cancelled or the stream ends
    ///
    /// Watch errors are logged; the stream is expected to reconnect on its
    /// own (see [`super::watch_stream`]).
    pub async fn run<S>(&self, events: S, cancel: CancellationToken)
    where
        S: Stream<Item = Result<watcher::Event<K>, watcher::Error>>,
    {
        info!(kind = %self.kind, "Starting informer");
        tokio::pin!(events);

        let mut resync = self.resync_period.map(|period| {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                next = events.next() => match next {
                    Some(Ok(event)) => self.handle_event(event),
                    Some(Err(e)) => {
                        warn!(
                            kind = %self.kind,
                            error = %e,
                            "Watch error, waiting for stream to recover"
                        );
                    }
                    None => {
                        warn!(kind = %self.kind, "Watch stream ended");
                        break;
                    }
                },
                _ = tick(&mut resync) => self.resync(),
            }
        }

        info!(kind = %self.kind, "Informer stopped");
    }

    /// Apply one watch event to the store and notify handlers
    pub fn handle_event(&self, event: watcher::Event<K>) {
        match event {
            watcher::Event::Init => {
                debug!(kind = %self.kind, "Relist started");
                *self.relist.lock() = Some(HashMap::new());
            }
            watcher::Event::InitApply(obj) => {
                if let Some((key, obj)) = self.keyed(obj) {
                    self.relist
                        .lock()
                        .get_or_insert_with(HashMap::new)
                        .insert(key, obj);
                }
            }
            watcher::Event::InitDone => {
                let fresh = self.relist.lock().take().unwrap_or_default();
                self.replace(fresh);
                if !self.synced.swap(true, Ordering::SeqCst) {
                    info!(kind = %self.kind, objects = self.store.len(), "Cache synced");
                }
            }
            watcher::Event::Apply(obj) => {
                if let Some((key, obj)) = self.keyed(obj) {
                    self.upsert(key, obj);
                }
            }
            watcher::Event::Delete(obj) => {
                if let Some((key, obj)) = self.keyed(obj) {
                    self.store.remove(&key);
                    self.notify_delete(DeletedObject::Live(obj));
                }
            }
        }
    }

    /// Re-deliver every cached object as an unchanged update
    pub fn resync(&self) {
        if !self.has_synced() {
            return;
        }
        let objects = self.store.list();
        debug!(kind = %self.kind, objects = objects.len(), "Resync");
        for obj in objects {
            self.notify_update(&obj, &obj);
        }
    }

    fn keyed(&self, obj: K) -> Option<(ReconcileKey, Arc<K>)> {
        match ReconcileKey::from_resource(&obj) {
            Ok(key) => Some((key, Arc::new(obj))),
            Err(e) => {
                warn!(kind = %self.kind, error = %e, "Dropping watch event");
                None
            }
        }
    }

    fn upsert(&self, key: ReconcileKey, obj: Arc<K>) {
        match self.store.insert(key, Arc::clone(&obj)) {
            Some(old) => self.notify_update(&old, &obj),
            None => self.notify_add(&obj),
        }
    }

    /// Swap the store contents for a fresh list
    ///
    /// Objects missing from the list were deleted while we were not
    /// watching; handlers get a tombstone with the last cached copy.
    fn replace(&self, fresh: HashMap<ReconcileKey, Arc<K>>) {
        let vanished: Vec<ReconcileKey> = self
            .store
            .keys()
            .into_iter()
            .filter(|key| !fresh.contains_key(key))
            .collect();

        for key in vanished {
            let last_known = self.store.remove(&key);
            self.notify_delete(DeletedObject::Tombstone(Tombstone {
                key: key.to_string(),
                last_known,
            }));
        }

        for (key, obj) in fresh {
            self.upsert(key, obj);
        }
    }

    fn snapshot(&self) -> Vec<Arc<dyn EventHandler<K>>> {
        self.handlers.read().clone()
    }

    fn notify_add(&self, obj: &Arc<K>) {
        for handler in self.snapshot() {
            handler.on_add(obj);
        }
    }

    fn notify_update(&self, old: &Arc<K>, new: &Arc<K>) {
        for handler in self.snapshot() {
            handler.on_update(old, new);
        }
    }

    fn notify_delete(&self, obj: DeletedObject<K>) {
        for handler in self.snapshot() {
            handler.on_delete(obj.clone());
        }
    }
}

impl<K> CacheSynced for SharedInformer<K>
where
    K: Send + Sync,
{
    fn has_synced(&self) -> bool {
        self.synced.load(Ordering::SeqCst)
    }

    fn kind(&self) -> &str {
        &self.kind
    }
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::apps::v1::Deployment;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<String>>,
    }

    impl Recorder {
        fn take(&self) -> Vec<String> {
            std::mem::take(&mut *self.seen.lock())
        }
    }

    impl EventHandler<Deployment> for Recorder {
        fn on_add(&self, obj: &Arc<Deployment>) {
            self.seen.lock().push(format!("add {}", name(obj)));
        }

        fn on_update(&self, old: &Arc<Deployment>, new: &Arc<Deployment>) {
            self.seen.lock().push(format!(
                "update {} {}->{}",
                name(new),
                rv(old),
                rv(new)
            ));
        }

        fn on_delete(&self, obj: DeletedObject<Deployment>) {
            let entry = match obj {
                DeletedObject::Live(obj) => format!("delete {}", name(&obj)),
                DeletedObject::Tombstone(t) => format!("tombstone {}", t.key),
            };
            self.seen.lock().push(entry);
        }
    }

    fn name(obj: &Deployment) -> String {
        obj.metadata.name.clone().unwrap_or_default()
    }

    fn rv(obj: &Deployment) -> String {
        obj.metadata.resource_version.clone().unwrap_or_default()
    }

    fn deployment(name: &str, rv: &str) -> Deployment {
        Deployment {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("default".to_string()),
                resource_version: Some(rv.to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn informer() -> (SharedInformer<Deployment>, Arc<Recorder>) {
        let informer = SharedInformer::new("Deployment", None);
        let recorder = Arc::new(Recorder::default());
        informer.add_event_handler(recorder.clone());
        (informer, recorder)
    }

    #[test]
    fn initial_list_marks_synced_and_adds() {
        let (informer, recorder) = informer();
        assert!(!informer.has_synced());

        informer.handle_event(watcher::Event::Init);
        informer.handle_event(watcher::Event::InitApply(deployment("a", "1")));
        assert!(!informer.has_synced());
        assert!(informer.store().is_empty(), "relist is applied atomically");

        informer.handle_event(watcher::Event::InitDone);
        assert!(informer.has_synced());
        assert_eq!(informer.store().len(), 1);
        assert_eq!(recorder.take(), vec!["add a"]);
    }

    #[test]
    fn watch_events_update_store_and_notify() {
        let (informer, recorder) = informer();
        informer.handle_event(watcher::Event::Apply(deployment("a", "1")));
        informer.handle_event(watcher::Event::Apply(deployment("a", "2")));
        informer.handle_event(watcher::Event::Delete(deployment("a", "3")));

        assert!(informer.store().is_empty());
        assert_eq!(
            recorder.take(),
            vec!["add a", "update a 1->2", "delete a"]
        );
    }

    #[test]
    fn relist_emits_tombstones_for_vanished_objects() {
        let (informer, recorder) = informer();
        informer.handle_event(watcher::Event::Apply(deployment("gone", "1")));
        informer.handle_event(watcher::Event::Apply(deployment("kept", "1")));
        recorder.take();

        informer.handle_event(watcher::Event::Init);
        informer.handle_event(watcher::Event::InitApply(deployment("kept", "2")));
        informer.handle_event(watcher::Event::InitDone);

        assert_eq!(
            recorder.take(),
            vec!["tombstone default/gone", "update kept 1->2"]
        );
        assert!(informer.store().get_namespaced("default", "gone").is_none());
    }

    #[test]
    fn nameless_objects_are_dropped() {
        let (informer, recorder) = informer();
        informer.handle_event(watcher::Event::Apply(Deployment::default()));
        assert!(informer.store().is_empty());
        assert!(recorder.take().is_empty());
    }

    #[test]
    fn resync_before_sync_is_ignored() {
        let (informer, recorder) = informer();
        informer.handle_event(watcher::Event::Apply(deployment("a", "1")));
        recorder.take();

        informer.resync();
        assert!(recorder.take().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn run_resyncs_periodically_with_same_version() {
        let informer = Arc::new(SharedInformer::new(
            "Deployment",
            Some(Duration::from_secs(30)),
        ));
        let recorder = Arc::new(Recorder::default());
        informer.add_event_handler(recorder.clone());

        let events = futures::stream::iter(vec![
            Ok(watcher::Event::Init),
            Ok(watcher::Event::InitApply(deployment("a", "7"))),
            Ok(watcher::Event::InitDone),
        ])
        .chain(futures::stream::pending());

        let cancel = CancellationToken::new();
        let task = {
            let informer = informer.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { informer.run(events, cancel).await })
        };

        tokio::time::sleep(Duration::from_secs(31)).await;
        cancel.cancel();
        task.await.unwrap();

        assert_eq!(recorder.take(), vec!["add a", "update a 7->7"]);
    }
}
