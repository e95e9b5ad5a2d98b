//! # Informer pool module
//!
//! This module provides the informer pool (component C): one list/watch
//! backed local cache per (group, version, resource) in active use, fanning
//! out add/update/delete events to subscribers and resyncing on a periodic
//! *cache flush interval*. Built on `kube::runtime::{watcher, reflector}`,
//! the same sub-dependency the reconciliation engine already pulls in for
//! its controller loop.

use std::{collections::HashMap, sync::Arc, time::Duration};

use futures::StreamExt;
use kube::{
    core::DynamicObject,
    discovery::ApiResource,
    runtime::{reflector, watcher, watcher::Config, WatchStreamExt},
    Api, Client,
};
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info, warn};

// -----------------------------------------------------------------------------
// Error enum

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("timed out waiting for informer cache to sync for resource '{0}'")]
    SyncTimeout(String),
}

// -----------------------------------------------------------------------------
// Event

/// a fan-out event published to every subscriber of a given resource.
#[derive(Clone, Debug)]
pub enum Event {
    Applied(Arc<DynamicObject>),
    Deleted(Arc<DynamicObject>),
}

// -----------------------------------------------------------------------------
// Key

#[derive(PartialEq, Eq, Hash, Clone, Debug)]
struct Key {
    group: String,
    version: String,
    resource: String,
    namespace: Option<String>,
}

// -----------------------------------------------------------------------------
// Handle

/// a running informer for one (group, version, resource[, namespace]), owning
/// the background watch task and a reference count of attached consumers.
struct Handle {
    store: reflector::Store<DynamicObject>,
    events: broadcast::Sender<Event>,
    task: tokio::task::JoinHandle<()>,
    refs: usize,
}

// -----------------------------------------------------------------------------
// Pool

/// single-writer per resource (its own watch loop owns the cache); readers
/// (reconcilers) get event-time snapshots by reference and a read-only view
/// of the store.
pub struct Pool {
    client: Client,
    cache_flush_interval: Duration,
    handles: RwLock<HashMap<Key, Handle>>,
}

impl Pool {
    pub fn new(client: Client, cache_flush_interval: Duration) -> Arc<Self> {
        Arc::new(Self {
            client,
            cache_flush_interval,
            handles: RwLock::new(HashMap::new()),
        })
    }

    /// ensures an informer exists for the given resource, incrementing its
    /// reference count, and returns a read-only store plus a fresh event
    /// subscription.
    pub async fn attach(
        &self,
        api_resource: &ApiResource,
        namespace: Option<&str>,
    ) -> (reflector::Store<DynamicObject>, broadcast::Receiver<Event>) {
        let key = Key {
            group: api_resource.group.clone(),
            version: api_resource.version.clone(),
            resource: api_resource.plural.clone(),
            namespace: namespace.map(str::to_string),
        };

        let mut handles = self.handles.write().await;
        if let Some(handle) = handles.get_mut(&key) {
            handle.refs += 1;
            return (handle.store.clone(), handle.events.subscribe());
        }

        let api = match namespace {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, api_resource),
            None => Api::all_with(self.client.clone(), api_resource),
        };

        let (reader, writer) = reflector::store();
        let (tx, rx) = broadcast::channel(1024);
        let resync = self.cache_flush_interval;
        let label = format!("{}/{}/{}", api_resource.group, api_resource.version, api_resource.plural);

        let task_tx = tx.clone();
        let task_label = label.clone();
        let task = tokio::spawn(async move {
            let mut stream =
                reflector::reflector(writer, watcher(api, Config::default()).default_backoff())
                    .boxed();

            let mut last_resync = tokio::time::Instant::now();
            loop {
                tokio::select! {
                    next = stream.next() => {
                        match next {
                            Some(Ok(watcher::Event::Applied(obj))) => {
                                let _ = task_tx.send(Event::Applied(Arc::new(obj)));
                            }
                            Some(Ok(watcher::Event::Deleted(obj))) => {
                                let _ = task_tx.send(Event::Deleted(Arc::new(obj)));
                            }
                            Some(Ok(watcher::Event::Restarted(objs))) => {
                                for obj in objs {
                                    let _ = task_tx.send(Event::Applied(Arc::new(obj)));
                                }
                            }
                            Some(Err(err)) => {
                                warn!(resource = %task_label, error = %err, "informer watch stream error");
                            }
                            None => {
                                debug!(resource = %task_label, "informer watch stream ended");
                                return;
                            }
                        }
                    }
                    _ = tokio::time::sleep_until(last_resync + resync) => {
                        debug!(resource = %task_label, "informer periodic resync tick");
                        last_resync = tokio::time::Instant::now();
                    }
                }
            }
        });

        info!(resource = %label, "started informer");
        handles.insert(
            key,
            Handle {
                store: reader.clone(),
                events: tx,
                task,
                refs: 1,
            },
        );

        (reader, rx)
    }

    /// decrements the reference count of an informer, stopping it when the
    /// last consumer detaches.
    pub async fn detach(&self, api_resource: &ApiResource, namespace: Option<&str>) {
        let key = Key {
            group: api_resource.group.clone(),
            version: api_resource.version.clone(),
            resource: api_resource.plural.clone(),
            namespace: namespace.map(str::to_string),
        };

        let mut handles = self.handles.write().await;
        if let Some(handle) = handles.get_mut(&key) {
            handle.refs = handle.refs.saturating_sub(1);
            if handle.refs == 0 {
                handle.task.abort();
                handles.remove(&key);
            }
        }
    }

    /// reads the cached objects for an already-`attach`ed resource straight
    /// out of its reflector store, optionally narrowed to `namespace`. Used
    /// by the reconciler to collect observed attachments without issuing a
    /// live LIST call on every tick. Returns an empty vec if nothing is
    /// attached for the resource yet.
    pub async fn get(&self, api_resource: &ApiResource, namespace: Option<&str>) -> Vec<DynamicObject> {
        let key = Key {
            group: api_resource.group.clone(),
            version: api_resource.version.clone(),
            resource: api_resource.plural.clone(),
            namespace: None,
        };

        let handles = self.handles.read().await;
        let Some(handle) = handles.get(&key) else {
            return Vec::new();
        };

        let items = handle.store.state().into_iter().map(|arc| (*arc).clone());
        match namespace {
            Some(ns) if !ns.is_empty() => items
                .filter(|obj| obj.metadata.namespace.as_deref() == Some(ns))
                .collect(),
            _ => items.collect(),
        }
    }

    /// blocks until every resource in `resources` (already `attach`ed) has
    /// reported an initial list, bounded by `timeout`; a missing sync is
    /// fatal for that controller's start attempt but recoverable on retry.
    pub async fn wait_for_cache_sync(&self, resources: &[ApiResource], timeout: Duration) -> Result<(), Error> {
        let deadline = tokio::time::Instant::now() + timeout;
        for api_resource in resources {
            let key = Key {
                group: api_resource.group.clone(),
                version: api_resource.version.clone(),
                resource: api_resource.plural.clone(),
                namespace: None,
            };
            loop {
                let ready = {
                    let handles = self.handles.read().await;
                    handles.get(&key).map(|handle| handle.store.is_ready()).unwrap_or(false)
                };
                if ready {
                    break;
                }
                if tokio::time::Instant::now() >= deadline {
                    return Err(Error::SyncTimeout(format!(
                        "{}/{}/{}",
                        api_resource.group, api_resource.version, api_resource.plural
                    )));
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        }
        Ok(())
    }
}
