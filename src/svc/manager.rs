//! # Controller manager module
//!
//! This module provides the controller manager (component J): the process
//! that discovers controller definitions, either by watching
//! `GenericController` custom resources (CRD mode) or by loading YAML files
//! from a directory (config mode), and starts/stops one [`Reconciler`] per
//! definition. Generalizes the teacher's `daemon()` (which spawned four
//! fixed Clever Cloud reconcilers by hand in `cmd/mod.rs`) into a dynamic
//! registry driven by whatever definitions are currently observed.

use std::{collections::HashMap, path::Path, sync::Arc, time::Duration};

use futures::StreamExt;
use kube::{
    discovery::ApiResource,
    runtime::{watcher, watcher::Config as WatcherConfig, WatchStreamExt},
    Api, Client, ResourceExt,
};
use tokio::sync::RwLock;
use tracing::{error, info, warn};

use crate::svc::{
    client::DynamicClient,
    discovery,
    informer,
    model::{ControllerDefinition, GenericController},
    reconcile::Reconciler,
};

/// how long a freshly (re)started reconciler waits for its informers'
/// initial list before giving up on this start attempt (§4.C).
const INFORMER_SYNC_TIMEOUT: Duration = Duration::from_secs(30);

// -----------------------------------------------------------------------------
// Error enum

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to read controller definitions directory '{0}', {1}")]
    ReadDir(String, std::io::Error),
    #[error("failed to read controller definition file '{0}', {1}")]
    ReadFile(String, std::io::Error),
    #[error("failed to parse controller definition file '{0}', {1}")]
    Parse(String, serde_yaml::Error),
}

// -----------------------------------------------------------------------------
// ManagerConfig

#[derive(Clone, Debug)]
pub struct ManagerConfig {
    pub finalizer_domain: String,
    pub discovery_interval: Duration,
    pub cache_flush_interval: Duration,
    pub workers_count: Option<usize>,
}

// -----------------------------------------------------------------------------
// Running

struct Running {
    reconciler: Arc<Reconciler>,
    workers: Vec<tokio::task::JoinHandle<()>>,
    watch: tokio::task::JoinHandle<()>,
    resync: tokio::task::JoinHandle<()>,
    /// resources attached by `Reconciler::start_informers` (watch + every
    /// attachment rule), detached on stop.
    attached: Vec<ApiResource>,
    /// the extra attach `spawn_parent_watch` holds on the watch resource for
    /// its own event subscription, detached separately on stop.
    watch_resource: ApiResource,
}

// -----------------------------------------------------------------------------
// ControllerManager

/// owns every running [`Reconciler`] keyed by controller name, and the shared
/// discovery cache / informer pool / dynamic client they all lean on.
pub struct ControllerManager {
    client: Client,
    dynamic: DynamicClient,
    discovery: Arc<discovery::Cache>,
    informers: Arc<informer::Pool>,
    config: ManagerConfig,
    running: RwLock<HashMap<String, Running>>,
}

impl ControllerManager {
    pub fn new(client: Client, config: ManagerConfig) -> Arc<Self> {
        let discovery = discovery::Cache::new(client.clone(), config.discovery_interval);
        let informers = informer::Pool::new(client.clone(), config.cache_flush_interval);
        let dynamic = DynamicClient::new(client.clone(), discovery.clone());

        Arc::new(Self {
            client,
            dynamic,
            discovery,
            informers,
            config,
            running: RwLock::new(HashMap::new()),
        })
    }

    /// spawns the discovery cache's background refresh loop; call once at
    /// startup before `run_crd_mode`/`run_config_mode`.
    pub fn spawn_discovery(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let discovery = self.discovery.clone();
        tokio::spawn(async move { discovery.run().await })
    }

    /// watches `GenericController` objects cluster-wide, starting, updating,
    /// or stopping a [`Reconciler`] as definitions are applied or deleted.
    /// Runs until the watch stream ends (normally: never, until aborted).
    pub async fn run_crd_mode(self: Arc<Self>) -> Result<(), Error> {
        let api: Api<GenericController> = Api::all(self.client.clone());
        let mut stream = watcher(api, WatcherConfig::default())
            .default_backoff()
            .applied_objects()
            .boxed();

        info!("watching GenericController definitions");
        while let Some(next) = stream.next().await {
            match next {
                Ok(gctl) => self.sync_generic_controller(gctl).await,
                Err(err) => warn!(error = %err, "GenericController watch stream error"),
            }
        }

        Ok(())
    }

    async fn sync_generic_controller(&self, gctl: GenericController) {
        let name = gctl.name_any();
        if gctl.meta().deletion_timestamp.is_some() {
            self.stop(&name).await;
            return;
        }

        let def = ControllerDefinition::from_generic_controller(&gctl, &self.config.finalizer_domain);
        self.restart(def).await;
    }

    /// loads every `*.yaml`/`*.yml` file in `dir` as a [`ControllerDefinition`]
    /// once at startup; config mode has no live reload, matching a directory
    /// of static manifests rather than a watched api object.
    pub async fn run_config_mode(self: &Arc<Self>, dir: &Path) -> Result<(), Error> {
        for path in collect_definition_files(dir).await? {
            let contents = tokio::fs::read_to_string(&path)
                .await
                .map_err(|err| Error::ReadFile(path.display().to_string(), err))?;
            let gctl: GenericController = serde_yaml::from_str(&contents)
                .map_err(|err| Error::Parse(path.display().to_string(), err))?;

            let def = ControllerDefinition::from_generic_controller(&gctl, &self.config.finalizer_domain);
            info!(controller = def.name, path = %path.display(), "loaded controller definition from disk");
            self.restart(def).await;
        }

        Ok(())
    }

    /// (re)starts the reconciler for `def`, stopping any previous instance
    /// under the same name first so a definition update takes effect cleanly.
    /// A failed informer cache sync aborts this start attempt entirely: it is
    /// recoverable on the next definition event or resync, per §4.C.
    async fn restart(self: &Arc<Self>, def: ControllerDefinition) {
        self.stop(&def.name).await;

        let name = def.name.clone();
        let reconciler = Arc::new(Reconciler::new(
            def.clone(),
            self.dynamic.clone(),
            self.discovery.clone(),
            self.informers.clone(),
            self.config.workers_count,
        ));

        let attached = match reconciler.start_informers(INFORMER_SYNC_TIMEOUT).await {
            Ok(attached) => attached,
            Err(err) => {
                error!(controller = name, error = %err, "failed to sync informer caches, not starting reconciler");
                return;
            }
        };
        let watch_resource = attached[0].clone();

        let workers = reconciler.spawn_workers();
        let watch = self.spawn_parent_watch(reconciler.clone(), watch_resource.clone());
        let resync = self.spawn_resync_loop(reconciler.clone());
        self.enqueue_existing_parents(reconciler.clone()).await;

        info!(controller = name, "started reconciler");
        self.running.write().await.insert(
            name,
            Running {
                reconciler,
                workers,
                watch,
                resync,
                attached,
                watch_resource,
            },
        );
    }

    /// periodically re-enqueues every tracked parent on the controller
    /// definition's own `resyncPeriodSeconds`, independent of the informer
    /// pool's global cache flush interval.
    fn spawn_resync_loop(self: &Arc<Self>, reconciler: Arc<Reconciler>) -> tokio::task::JoinHandle<()> {
        let manager = self.clone();
        let period = Duration::from_secs(reconciler.definition().resync_period_seconds.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                manager.enqueue_existing_parents(reconciler.clone()).await;
            }
        })
    }

    /// lists every object currently matching the watch rule and enqueues it,
    /// so a freshly (re)started reconciler catches up on parents that
    /// already existed before this process came up, instead of waiting for
    /// the next watch event or resync tick.
    async fn enqueue_existing_parents(self: &Arc<Self>, reconciler: Arc<Reconciler>) {
        let def = reconciler.definition().clone();
        let (group, version) = def.watch.group_version();

        match self
            .dynamic
            .list(&group, &version, &def.watch.resource, "", None)
            .await
        {
            Ok(parents) => {
                info!(controller = def.name, count = parents.len(), "pre-enqueuing existing parents");
                for parent in parents {
                    let namespace = parent.namespace().unwrap_or_default();
                    reconciler.enqueue(&namespace, &parent.name_any());
                }
            }
            Err(err) => {
                warn!(controller = def.name, error = %err, "failed to list existing parents for pre-enqueue");
            }
        }
    }

    /// stops the named reconciler gracefully: closes its queue so no further
    /// key is handed to a worker, waits for in-flight workers to drain, then
    /// tears down the watch/resync tasks and decrements every informer
    /// reference count this reconciler held (§4.J).
    async fn stop(&self, name: &str) {
        let Some(running) = self.running.write().await.remove(name) else {
            return;
        };

        info!(controller = name, "stopping reconciler");
        running.reconciler.shutdown().await;
        for worker in running.workers {
            let _ = worker.await;
        }

        running.watch.abort();
        running.resync.abort();

        for resource in &running.attached {
            self.informers.detach(resource, None).await;
        }
        self.informers.detach(&running.watch_resource, None).await;
    }

    /// subscribes to the watched resource's informer and enqueues the parent
    /// key on every `Applied`/`Deleted` event, so the reconciler's workers
    /// react to changes instead of only resyncing on a timer. `watch_resource`
    /// is already resolved and attached by `start_informers`; this call holds
    /// its own additional reference for the event subscription.
    fn spawn_parent_watch(
        self: &Arc<Self>,
        reconciler: Arc<Reconciler>,
        watch_resource: ApiResource,
    ) -> tokio::task::JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            let def = reconciler.definition().clone();
            let (_, mut events) = manager.informers.attach(&watch_resource, None).await;
            loop {
                match events.recv().await {
                    Ok(informer::Event::Applied(obj)) | Ok(informer::Event::Deleted(obj)) => {
                        let namespace = obj.namespace().unwrap_or_default();
                        reconciler.enqueue(&namespace, &obj.name_any());
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(controller = def.name, skipped, "parent watch lagged, some events dropped");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                        error!(controller = def.name, "parent informer channel closed");
                        return;
                    }
                }
            }
        })
    }
}

/// lists `dir` non-recursively and returns every entry whose extension is
/// `yaml` or `yml`, sorted for deterministic load order. Split out of
/// [`ControllerManager::run_config_mode`] so the file-discovery rule is
/// testable without a live `Client`.
async fn collect_definition_files(dir: &Path) -> Result<Vec<std::path::PathBuf>, Error> {
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .map_err(|err| Error::ReadDir(dir.display().to_string(), err))?;

    let mut files = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|err| Error::ReadDir(dir.display().to_string(), err))?
    {
        let path = entry.path();
        let is_yaml = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext == "yaml" || ext == "yml")
            .unwrap_or(false);
        let is_file = entry
            .file_type()
            .await
            .map(|ft| ft.is_file())
            .unwrap_or(false);
        if is_yaml && is_file {
            files.push(path);
        }
    }

    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn collects_only_yaml_and_yml_files_sorted() {
        let dir = tempfile::tempdir().expect("tempdir");
        for name in ["b.yaml", "a.yml", "notes.txt", "c.YAML"] {
            tokio::fs::write(dir.path().join(name), "").await.expect("write fixture file");
        }
        tokio::fs::create_dir(dir.path().join("nested.yaml")).await.expect("create subdir");

        let files = collect_definition_files(dir.path()).await.expect("collect");
        let names: Vec<_> = files
            .iter()
            .map(|p| p.file_name().unwrap().to_str().unwrap().to_string())
            .collect();

        assert_eq!(names, vec!["a.yml".to_string(), "b.yaml".to_string()]);
    }

    #[tokio::test]
    async fn missing_directory_surfaces_read_dir_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let missing = dir.path().join("does-not-exist");

        let err = collect_definition_files(&missing).await.unwrap_err();
        assert!(matches!(err, Error::ReadDir(_, _)));
    }
}
