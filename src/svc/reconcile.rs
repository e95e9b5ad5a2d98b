//! # Reconciler module
//!
//! This module provides the per-controller reconciler (component I): it
//! glues the discovery cache, dynamic client, informer pool, work queue,
//! claim manager, diff-and-apply engine, hook invoker and finalizer
//! lifecycle into the sync/finalize worker loop of §4.I. Generalizes the
//! teacher's `k8s::Reconciler<T>`/`k8s::Watcher<T>` trait pair (one
//! reconciler per concrete CRD type) into a single reconciler parameterized
//! by a [`ControllerDefinition`] and operating over `DynamicObject`.

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use kube::{api::DynamicObject, ResourceExt};
use serde_json::Value;
use tracing::{error, info, instrument, warn};

use crate::svc::{
    claim::{self, Decision, ParentFacts},
    client::DynamicClient,
    diff,
    discovery,
    finalize,
    hook::{Error as HookError, Invoker},
    informer,
    model::{
        AttachmentsByKind, ControllerDefinition, CustomizeRequest, CustomizeResponse, ResourceRule,
        SyncRequest, SyncResponse, UpdateStrategy,
    },
    queue::Queue,
    revision,
};

// -----------------------------------------------------------------------------
// constants

const DEFAULT_WORKER_COUNT: usize = 5;
const DEFAULT_BACKOFF: Duration = Duration::from_millis(500);

// -----------------------------------------------------------------------------
// Error enum

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to resolve resource, {0}")]
    Discovery(#[from] discovery::Error),
    #[error("failed to call kubernetes api, {0}")]
    Client(#[from] crate::svc::client::Error),
    #[error("hook invocation failed, {0}")]
    Hook(#[from] HookError),
    #[error("failed to decode hook response envelope, {0}")]
    Malformed(serde_json::Error),
    #[error("{0}")]
    Apply(#[from] diff::Error),
    #[error("failed to sync informer cache, {0}")]
    Informer(#[from] informer::Error),
}

// -----------------------------------------------------------------------------
// ParentKey

pub type ParentKey = (String, String);

// -----------------------------------------------------------------------------
// Reconciler

/// owns the workqueue worker pool for one controller definition.
pub struct Reconciler {
    def: ControllerDefinition,
    dynamic: DynamicClient,
    discovery: Arc<discovery::Cache>,
    informers: Arc<informer::Pool>,
    invoker: Invoker,
    revisions: revision::Store,
    queue: Arc<Queue<ParentKey>>,
    workers: usize,
}

impl Reconciler {
    pub fn new(
        def: ControllerDefinition,
        dynamic: DynamicClient,
        discovery: Arc<discovery::Cache>,
        informers: Arc<informer::Pool>,
        workers: Option<usize>,
    ) -> Self {
        Self {
            revisions: revision::Store::new(dynamic.clone()),
            def,
            dynamic,
            discovery,
            informers,
            invoker: Invoker::new(),
            queue: Arc::new(Queue::new()),
            workers: workers.unwrap_or(DEFAULT_WORKER_COUNT),
        }
    }

    pub fn definition(&self) -> &ControllerDefinition {
        &self.def
    }

    pub fn enqueue(&self, namespace: &str, name: &str) {
        let queue = self.queue.clone();
        let key = (namespace.to_string(), name.to_string());
        tokio::spawn(async move { queue.add(key).await });
    }

    /// resolves the watch resource and every attachment resource, attaches an
    /// informer for each so the reconcile loop reads cached state instead of
    /// issuing a live LIST every tick, and blocks until their initial cache
    /// sync completes. Returns the resolved resources so the caller can
    /// `detach` them again on teardown. A resolve or sync failure here is
    /// fatal for this start attempt but recoverable on retry (§4.C).
    pub async fn start_informers(
        &self,
        sync_timeout: Duration,
    ) -> Result<Vec<kube::discovery::ApiResource>, Error> {
        let mut resources = Vec::new();

        let (group, version) = self.def.watch.group_version();
        let watch = self.discovery.resolve(&group, &version, &self.def.watch.resource).await?;
        self.informers.attach(&watch.api_resource, None).await;
        resources.push(watch.api_resource);

        for rule in &self.def.attachments {
            let (group, version) = rule.rule.group_version();
            let resolved = self.discovery.resolve(&group, &version, &rule.rule.resource).await?;
            self.informers.attach(&resolved.api_resource, None).await;
            resources.push(resolved.api_resource);
        }

        self.informers.wait_for_cache_sync(&resources, sync_timeout).await?;
        Ok(resources)
    }

    /// closes the work queue so no further key is handed to a worker once
    /// pending work drains; pairs with awaiting the worker join handles.
    pub async fn shutdown(&self) {
        self.queue.close().await;
    }

    /// spawns `workers` worker loops, returning their join handles so the
    /// controller manager can `abort()` them on teardown.
    pub fn spawn_workers(self: &Arc<Self>) -> Vec<tokio::task::JoinHandle<()>> {
        (0..self.workers)
            .map(|id| {
                let reconciler = self.clone();
                tokio::spawn(async move { reconciler.worker_loop(id).await })
            })
            .collect()
    }

    async fn worker_loop(self: Arc<Self>, worker_id: usize) {
        info!(controller = self.def.name, worker_id, "worker started");
        while let Some(key) = self.queue.get().await {
            let (namespace, name) = key.clone();
            match self.reconcile_one(&namespace, &name).await {
                Ok(None) => self.queue.done(&key).await,
                Ok(Some(after)) => {
                    self.queue.done(&key).await;
                    let queue = self.queue.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(after).await;
                        queue.add(key).await;
                    });
                }
                Err(err) => {
                    error!(controller = self.def.name, namespace, name, error = %err, "reconcile failed, requeuing");
                    self.queue.done(&key).await;
                    let queue = self.queue.clone();
                    tokio::spawn(async move { queue.add_rate_limited(key).await });
                }
            }
        }
        info!(controller = self.def.name, worker_id, "worker stopped");
    }

    /// runs one worker-loop iteration for `(namespace, name)`; returns
    /// `Some(duration)` when the hook asked for an explicit resync.
    #[instrument(skip(self), fields(controller = %self.def.name, namespace, name))]
    async fn reconcile_one(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Duration>, Error> {
        let (group, version) = self.def.watch.group_version();
        let Some(parent) = self
            .dynamic
            .get(&group, &version, &self.def.watch.resource, namespace, name)
            .await?
        else {
            return Ok(None);
        };

        if finalize::is_finalizing(&self.def, &parent) {
            let observed = self.collect_observed_attachments(&parent, None).await?;
            return self.reconcile_finalize(parent, observed).await;
        }

        let overrides = self.invoke_customize(&parent).await?;
        let observed = self.collect_observed_attachments(&parent, overrides.as_ref()).await?;

        self.reconcile_sync(parent, observed).await
    }

    /// invokes the `customize` hook, if the controller declares one, so a
    /// controller can narrow (or differently select) its attachment rules per
    /// parent instead of being stuck with one static selector for every
    /// instance. Returns `None` when there is no customize hook, or when the
    /// hook did not override a given rule's resource.
    async fn invoke_customize(
        &self,
        parent: &DynamicObject,
    ) -> Result<Option<BTreeMap<usize, ResourceRule>>, Error> {
        let Some(customize_hook) = &self.def.hooks.customize else {
            return Ok(None);
        };

        let request = CustomizeRequest {
            watch: serde_json::to_value(parent).unwrap_or(Value::Null),
        };
        let response_value = self
            .invoker
            .invoke(customize_hook, serde_json::to_value(&request).map_err(Error::Malformed)?)
            .await?;
        let response: CustomizeResponse = serde_json::from_value(response_value).map_err(Error::Malformed)?;

        let mut overrides = BTreeMap::new();
        for rule in response.resource_rules {
            if let Some(idx) = self
                .def
                .attachments
                .iter()
                .position(|attachment| attachment.rule.resource == rule.resource)
            {
                overrides.insert(idx, rule);
            }
        }

        Ok(Some(overrides))
    }

    /// reads each attachment rule's candidates from the informer pool's
    /// cached store rather than issuing a live LIST, per §4.I step 3. The
    /// informer for every rule's resource is guaranteed attached by
    /// `start_informers` before any worker is started.
    async fn collect_observed_attachments(
        &self,
        parent: &DynamicObject,
        overrides: Option<&BTreeMap<usize, ResourceRule>>,
    ) -> Result<BTreeMap<usize, Vec<DynamicObject>>, Error> {
        let mut by_rule = BTreeMap::new();
        let namespace = parent.namespace().unwrap_or_default();
        for (idx, rule) in self.def.attachments.iter().enumerate() {
            let effective = overrides.and_then(|o| o.get(&idx)).unwrap_or(&rule.rule);
            let (group, version) = effective.group_version();
            let resolved = self.discovery.resolve(&group, &version, &effective.resource).await?;
            let objs = self.informers.get(&resolved.api_resource, Some(&namespace)).await;
            by_rule.insert(idx, objs);
        }
        Ok(by_rule)
    }

    async fn reconcile_sync(
        &self,
        parent: DynamicObject,
        observed: BTreeMap<usize, Vec<DynamicObject>>,
    ) -> Result<Option<Duration>, Error> {
        let tick = finalize::tick(&self.def, &parent);
        let parent = if tick != finalize::Tick::Noop {
            self.patch_finalizer(&parent, &tick).await?
        } else {
            parent
        };

        let Some(sync_hook) = &self.def.hooks.sync else {
            return Ok(None);
        };

        let request = self.build_sync_request(&parent, &observed, false);
        let response_value = self.invoker.invoke(sync_hook, serde_json::to_value(&request).map_err(Error::Malformed)?).await?;
        let response: SyncResponse = serde_json::from_value(response_value).map_err(Error::Malformed)?;

        if response.skip_reconcile {
            return Ok(response.resync_after_seconds.map(Duration::from_secs_f64));
        }

        self.apply_response(&parent, observed, &response).await?;
        self.write_status(&parent, response.status).await;

        Ok(response.resync_after_seconds.map(Duration::from_secs_f64))
    }

    async fn reconcile_finalize(
        &self,
        parent: DynamicObject,
        observed: BTreeMap<usize, Vec<DynamicObject>>,
    ) -> Result<Option<Duration>, Error> {
        let Some(finalize_hook) = &self.def.hooks.finalize else {
            // no finalize hook: nothing blocks deletion, remove the
            // bookkeeping finalizer defensively and stop.
            self.patch_finalizer(&parent, &finalize::Tick::Remove).await?;
            return Ok(None);
        };

        let request = self.build_sync_request(&parent, &observed, true);
        let response_value = self
            .invoker
            .invoke(finalize_hook, serde_json::to_value(&request).map_err(Error::Malformed)?)
            .await?;
        let response: SyncResponse = serde_json::from_value(response_value).map_err(Error::Malformed)?;

        self.apply_response(&parent, observed, &response).await?;

        if finalize::should_release(response.finalized) {
            self.patch_finalizer(&parent, &finalize::Tick::Remove).await?;
            Ok(None)
        } else {
            Ok(Some(
                response
                    .resync_after_seconds
                    .map(Duration::from_secs_f64)
                    .unwrap_or(DEFAULT_BACKOFF),
            ))
        }
    }

    fn build_sync_request(
        &self,
        parent: &DynamicObject,
        observed: &BTreeMap<usize, Vec<DynamicObject>>,
        finalizing: bool,
    ) -> SyncRequest {
        let mut attachments: AttachmentsByKind = BTreeMap::new();
        for (idx, objs) in observed {
            let Some(rule) = self.def.attachments.get(*idx) else {
                continue;
            };
            let kind = rule.rule.resource.clone();
            let by_name = attachments.entry(kind).or_default();
            for obj in objs {
                if let Ok(value) = serde_json::to_value(obj) {
                    by_name.insert(obj.name_any(), value);
                }
            }
        }

        SyncRequest {
            watch: serde_json::to_value(parent).unwrap_or(Value::Null),
            attachments,
            finalizing,
        }
    }

    async fn apply_response(
        &self,
        parent: &DynamicObject,
        observed: BTreeMap<usize, Vec<DynamicObject>>,
        response: &SyncResponse,
    ) -> Result<(), Error> {
        let owner = controller_owner_reference(parent);
        let parent_uid = parent.uid().unwrap_or_default();
        let parent_deleting = parent.meta().deletion_timestamp.is_some();
        let (selector, name_selector) = synthesize_or_read_selector(&self.def, parent);

        let desired_by_rule = self.group_desired_by_rule(&response.attachments).await;

        for (idx, rule) in self.def.attachments.iter().enumerate() {
            let (group, version) = rule.rule.group_version();
            let observed_objs = observed.get(&idx).cloned().unwrap_or_default();
            let desired_objs = desired_by_rule.get(&idx).cloned().unwrap_or_default();

            let mut kept_observed = Vec::new();
            for candidate in &observed_objs {
                let facts = ParentFacts {
                    uid: &parent_uid,
                    deleting: parent_deleting,
                    selector: selector.as_ref(),
                    name_selector: name_selector.as_deref(),
                };
                match claim::decide(&facts, candidate) {
                    Decision::Keep => kept_observed.push(candidate.clone()),
                    Decision::Release => {
                        if let Err(err) = self
                            .release(&group, &version, &rule.rule.resource, candidate, &parent_uid)
                            .await
                        {
                            warn!(error = %err, "failed to release attachment");
                        }
                    }
                    Decision::Adopt => {
                        if let Err(err) = self.adopt(&group, &version, &rule.rule.resource, candidate, &owner).await {
                            warn!(error = %err, "failed to adopt attachment");
                        } else {
                            kept_observed.push(candidate.clone());
                        }
                    }
                    Decision::Ignore => {}
                }
            }

            if rule.update_strategy == UpdateStrategy::RollingInPlace {
                self.record_revision(&parent, &owner, &desired_objs).await;
            }

            let plan = diff::plan(
                &kept_observed,
                &desired_objs,
                rule,
                &owner,
                &self.def.last_applied_annotation(),
            );

            diff::apply(
                &self.dynamic,
                &group,
                &version,
                &rule.rule.resource,
                plan,
                rule.batch_size(),
            )
            .await?;
        }

        for explicit in &response.explicit_updates {
            if !self.def.update_any {
                continue;
            }
            if let Err(err) = self.apply_explicit_update(explicit).await {
                warn!(error = %err, "failed to apply explicit update");
            }
        }

        for explicit in &response.explicit_deletes {
            if !self.def.delete_any {
                continue;
            }
            if let Err(err) = self.apply_explicit_delete(explicit).await {
                warn!(error = %err, "failed to apply explicit delete");
            }
        }

        Ok(())
    }

    /// matches each hook-returned attachment back to the declared rule it
    /// belongs to by resolving its `apiVersion`+`kind` through the discovery
    /// cache, instead of guessing the rule's resource plural from the kind
    /// with a "+s" heuristic (which breaks on irregular plurals like
    /// `Policy`→`policies` or `Ingress`→`ingresses`).
    async fn group_desired_by_rule(&self, attachments: &[Value]) -> BTreeMap<usize, Vec<DynamicObject>> {
        let mut by_rule = BTreeMap::new();
        for value in attachments {
            let api_version = value.get("apiVersion").and_then(Value::as_str).unwrap_or_default();
            let kind = value.get("kind").and_then(Value::as_str).unwrap_or_default();
            if api_version.is_empty() || kind.is_empty() {
                warn!(value = %value, "hook-returned attachment missing apiVersion/kind, dropping");
                continue;
            }

            let (group, version) = split_api_version(api_version);
            let resolved = match self.discovery.resolve_kind(&group, &version, kind).await {
                Ok(resolved) => resolved,
                Err(err) => {
                    warn!(api_version, kind, error = %err, "could not resolve hook-returned attachment kind, dropping");
                    continue;
                }
            };

            let Some(idx) = self.def.attachments.iter().position(|rule| {
                let (rule_group, rule_version) = rule.rule.group_version();
                rule_group == group && rule_version == version && rule.rule.resource == resolved.api_resource.plural
            }) else {
                warn!(api_version, kind, "hook-returned attachment kind matches no declared attachment rule, dropping");
                continue;
            };

            match crate::svc::client::dynamic_object_from_value(api_version, kind, value.clone()) {
                Ok(obj) => by_rule.entry(idx).or_insert_with(Vec::new).push(obj),
                Err(err) => warn!(api_version, kind, error = %err, "failed to parse hook-returned attachment"),
            }
        }
        by_rule
    }

    /// removes only the controller owner reference matching `parent_uid`
    /// from `obj`, preserving every other owner reference it may carry.
    async fn release(
        &self,
        group: &str,
        version: &str,
        resource: &str,
        obj: &DynamicObject,
        parent_uid: &str,
    ) -> Result<(), Error> {
        self.dynamic
            .atomic_update(group, version, resource, obj, |latest| {
                let original_len = latest.owner_references().len();
                let filtered: Vec<_> = latest
                    .owner_references()
                    .iter()
                    .filter(|owner| !(owner.controller.unwrap_or(false) && owner.uid == parent_uid))
                    .cloned()
                    .collect();
                let changed = filtered.len() != original_len;
                latest.meta_mut().owner_references = if filtered.is_empty() { None } else { Some(filtered) };
                changed
            })
            .await?;
        Ok(())
    }

    /// merges `owner` into `obj`'s existing owner references, stripping any
    /// stale entry with the same uid first, instead of replacing the whole
    /// array and dropping unrelated owner references.
    async fn adopt(
        &self,
        group: &str,
        version: &str,
        resource: &str,
        obj: &DynamicObject,
        owner: &k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference,
    ) -> Result<(), Error> {
        self.dynamic
            .atomic_update(group, version, resource, obj, |latest| {
                let mut refs: Vec<_> = latest
                    .owner_references()
                    .iter()
                    .filter(|existing| existing.uid != owner.uid)
                    .cloned()
                    .collect();
                refs.push(owner.clone());
                latest.meta_mut().owner_references = Some(refs);
                true
            })
            .await?;
        Ok(())
    }

    async fn apply_explicit_update(&self, value: &Value) -> Result<(), Error> {
        let api_version = value.get("apiVersion").and_then(Value::as_str).unwrap_or_default();
        let kind = value.get("kind").and_then(Value::as_str).unwrap_or_default();
        let obj = crate::svc::client::dynamic_object_from_value(api_version, kind, value.clone())
            .map_err(Error::Malformed)?;
        let (group, version) = split_api_version(api_version);
        let resource = kind.to_lowercase();
        let namespace = obj.namespace().unwrap_or_default();
        self.dynamic
            .atomic_update(&group, &version, &format!("{resource}s"), &obj, |latest| {
                latest.meta_mut().labels = obj.meta().labels.clone();
                latest.meta_mut().annotations = obj.meta().annotations.clone();
                true
            })
            .await?;
        let _ = namespace;
        Ok(())
    }

    async fn apply_explicit_delete(&self, value: &Value) -> Result<(), Error> {
        let api_version = value.get("apiVersion").and_then(Value::as_str).unwrap_or_default();
        let kind = value.get("kind").and_then(Value::as_str).unwrap_or_default();
        let (group, version) = split_api_version(api_version);
        let resource = format!("{}s", kind.to_lowercase());
        let namespace = value
            .get("metadata")
            .and_then(|m| m.get("namespace"))
            .and_then(Value::as_str)
            .unwrap_or_default();
        let name = value
            .get("metadata")
            .and_then(|m| m.get("name"))
            .and_then(Value::as_str)
            .unwrap_or_default();
        self.dynamic.delete(&group, &version, &resource, namespace, name).await?;
        Ok(())
    }

    async fn patch_finalizer(
        &self,
        parent: &DynamicObject,
        decision: &finalize::Tick,
    ) -> Result<DynamicObject, Error> {
        let (group, version) = self.def.watch.group_version();
        let def = self.def.clone();
        let updated = self
            .dynamic
            .atomic_update(&group, &version, &self.def.watch.resource, parent, move |latest| {
                let before = latest.meta().finalizers.clone();
                *latest = finalize::apply_tick(&def, latest.clone(), decision);
                before != latest.meta().finalizers
            })
            .await?;
        Ok(updated)
    }

    /// snapshots `desired_objs` into a content-hashed `ControllerRevision` and
    /// prunes history beyond [`revision::DEFAULT_HISTORY_LIMIT`]. Best-effort:
    /// a failure here never blocks the rollout itself, only its audit trail.
    async fn record_revision(
        &self,
        parent: &DynamicObject,
        owner: &k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference,
        desired_objs: &[DynamicObject],
    ) {
        let namespace = parent.namespace().unwrap_or_default();
        let parent_name = parent.name_any();
        let bundle: Vec<Value> = desired_objs
            .iter()
            .filter_map(|obj| serde_json::to_value(&obj.data).ok())
            .collect();
        if bundle.is_empty() {
            return;
        }

        let existing = match self.revisions.list_owned(&namespace, &parent_name, &self.def).await {
            Ok(existing) => existing,
            Err(err) => {
                warn!(error = %err, "failed to list controller revisions");
                return;
            }
        };

        if let Err(err) = self
            .revisions
            .create(&namespace, &parent_name, owner.clone(), &self.def, bundle, &existing)
            .await
        {
            warn!(error = %err, "failed to record controller revision");
        }

        if let Err(err) = self.revisions.garbage_collect(&namespace, &existing).await {
            warn!(error = %err, "failed to garbage collect controller revisions");
        }
    }

    async fn write_status(&self, parent: &DynamicObject, status: Option<Value>) {
        let Some(status) = status else {
            return;
        };
        let (group, version) = self.def.watch.group_version();
        let namespace = parent.namespace().unwrap_or_default();
        let patch = json_patch::Patch(vec![json_patch::PatchOperation::Replace(
            json_patch::ReplaceOperation {
                path: jsonptr::Pointer::from_str("/status").unwrap_or_default(),
                value: status,
            },
        )]);

        // best-effort: status updates are never fatal to the reconcile tick.
        if let Err(err) = self
            .dynamic
            .patch(&group, &version, &self.def.watch.resource, &namespace, &parent.name_any(), patch)
            .await
        {
            warn!(error = %err, "failed to write status subresource");
        }
    }
}

/// builds a controller owner reference pointing at `parent`, over a
/// `DynamicObject` (whose `apiVersion`/`kind` live on `obj.types` rather than
/// being derivable from a static `CustomResourceExt::api_resource()`).
fn controller_owner_reference(parent: &DynamicObject) -> k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference {
    let types = parent.types.clone().unwrap_or_default();
    k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference {
        api_version: types.api_version,
        block_owner_deletion: Some(true),
        controller: Some(true),
        kind: types.kind,
        name: parent.name_any(),
        uid: parent.uid().unwrap_or_default(),
    }
}

fn split_api_version(api_version: &str) -> (String, String) {
    match api_version.split_once('/') {
        Some((group, version)) => (group.to_string(), version.to_string()),
        None => (String::new(), api_version.to_string()),
    }
}

/// resolves the selector the claim manager matches attachments against: a
/// synthesized per-parent label selector when `generateSelector` is set, the
/// watch rule's own label selector when one is declared, or its name
/// selector as a last resort (§3 SUPPLEMENT: "used when generateSelector is
/// false and no label selector was supplied").
fn synthesize_or_read_selector(
    def: &ControllerDefinition,
    parent: &DynamicObject,
) -> (
    Option<k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector>,
    Option<Vec<String>>,
) {
    if def.generate_selector {
        let mut labels = BTreeMap::new();
        labels.insert(
            format!("metac.{}/parent-name", def.domain),
            parent.name_any(),
        );
        return (
            Some(k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector {
                match_labels: Some(labels),
                match_expressions: None,
            }),
            None,
        );
    }

    if def.watch.label_selector.is_some() {
        return (def.watch.label_selector.clone(), None);
    }

    (None, def.watch.name_selector.clone())
}

use std::str::FromStr;

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
    use kube::api::{ObjectMeta, TypeMeta};

    fn def(generate_selector: bool, selector: Option<LabelSelector>) -> ControllerDefinition {
        ControllerDefinition {
            name: "widgets".into(),
            domain: "metacontroller.io".into(),
            watch: crate::svc::model::ResourceRule {
                api_version: "v1".into(),
                resource: "widgets".into(),
                label_selector: selector,
                name_selector: None,
            },
            attachments: vec![],
            hooks: crate::svc::model::HookSet::default(),
            update_any: false,
            delete_any: false,
            generate_selector,
            resync_period_seconds: 1800,
        }
    }

    fn parent(name: &str) -> DynamicObject {
        let mut obj = DynamicObject::new(
            name,
            &kube::discovery::ApiResource {
                group: "apps".into(),
                version: "v1".into(),
                kind: "Widget".into(),
                api_version: "apps/v1".into(),
                plural: "widgets".into(),
            },
        );
        obj.types = Some(TypeMeta {
            api_version: "apps/v1".into(),
            kind: "Widget".into(),
        });
        obj.metadata = ObjectMeta {
            uid: Some("uid-1".into()),
            ..Default::default()
        };
        obj
    }

    #[test]
    fn splits_core_group_api_version() {
        assert_eq!(split_api_version("v1"), (String::new(), "v1".to_string()));
    }

    #[test]
    fn splits_grouped_api_version() {
        assert_eq!(
            split_api_version("batch/v1"),
            ("batch".to_string(), "v1".to_string())
        );
    }

    #[test]
    fn owner_reference_points_at_parent_with_block_owner_deletion() {
        let p = parent("x");
        let owner = controller_owner_reference(&p);
        assert_eq!(owner.name, "x");
        assert_eq!(owner.uid, "uid-1");
        assert_eq!(owner.api_version, "apps/v1");
        assert_eq!(owner.kind, "Widget");
        assert_eq!(owner.controller, Some(true));
        assert_eq!(owner.block_owner_deletion, Some(true));
    }

    #[test]
    fn synthesizes_selector_keyed_by_parent_name_when_enabled() {
        let d = def(true, None);
        let p = parent("x");
        let (selector, name_selector) = synthesize_or_read_selector(&d, &p);
        let selector = selector.expect("selector to be synthesized");
        assert_eq!(
            selector.match_labels.unwrap().get("metac.metacontroller.io/parent-name"),
            Some(&"x".to_string())
        );
        assert_eq!(name_selector, None);
    }

    #[test]
    fn reads_watch_selector_when_not_generating() {
        let sel = LabelSelector {
            match_labels: Some(BTreeMap::from([("app".to_string(), "demo".to_string())])),
            match_expressions: None,
        };
        let d = def(false, Some(sel.clone()));
        let p = parent("x");
        assert_eq!(synthesize_or_read_selector(&d, &p), (Some(sel), None));
    }

    #[test]
    fn falls_back_to_name_selector_when_no_label_selector_is_set() {
        let mut d = def(false, None);
        d.watch.name_selector = Some(vec!["x".to_string()]);
        let p = parent("x");
        assert_eq!(synthesize_or_read_selector(&d, &p), (None, Some(vec!["x".to_string()])));
    }
}
