//! # Dynamic resource client module
//!
//! This module provides typeless CRUD plus atomic read-modify-write
//! (component B) against any resource the discovery cache (component A) has
//! resolved. `update`/`patch`/`delete` all tolerate `NotFound` by mapping it
//! to `Ok`/a no-op, since the goal of a release or delete is that the object
//! be gone, not that the call itself succeed.

use std::{sync::Arc, time::Duration};

use kube::{
    api::{DeleteParams, ListParams, Patch, PatchParams, PostParams},
    core::DynamicObject,
    Api, Client, ResourceExt,
};
use serde_json::Value;
use tracing::{debug, trace};

use crate::svc::discovery;

// -----------------------------------------------------------------------------
// constants

/// bound on `atomicUpdate`'s optimistic-concurrency retry loop.
const ATOMIC_UPDATE_MAX_ATTEMPTS: u32 = 10;

// -----------------------------------------------------------------------------
// Error enum

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to resolve resource, {0}")]
    Discovery(discovery::Error),
    #[error("failed to call kubernetes api, {0}")]
    Api(kube::Error),
    #[error("object '{0}' was deleted concurrently with the atomic update")]
    ConcurrentlyDeleted(String),
    #[error("exhausted {0} attempts retrying atomic update on conflict")]
    AtomicUpdateExhausted(u32),
}

impl From<discovery::Error> for Error {
    fn from(err: discovery::Error) -> Self {
        Self::Discovery(err)
    }
}

// -----------------------------------------------------------------------------
// DynamicClient

/// stateless over the discovery cache: every call resolves `(group, version,
/// resource)` into an `ApiResource` before building a scoped `Api<DynamicObject>`.
#[derive(Clone)]
pub struct DynamicClient {
    client: Client,
    discovery: Arc<discovery::Cache>,
}

impl DynamicClient {
    pub fn new(client: Client, discovery: Arc<discovery::Cache>) -> Self {
        Self { client, discovery }
    }

    async fn api(
        &self,
        group: &str,
        version: &str,
        resource: &str,
        namespace: &str,
    ) -> Result<Api<DynamicObject>, Error> {
        let resolved = self.discovery.resolve(group, version, resource).await?;
        Ok(if resolved.namespaced {
            Api::namespaced_with(self.client.clone(), namespace, &resolved.api_resource)
        } else {
            Api::all_with(self.client.clone(), &resolved.api_resource)
        })
    }

    pub async fn get(
        &self,
        group: &str,
        version: &str,
        resource: &str,
        namespace: &str,
        name: &str,
    ) -> Result<Option<DynamicObject>, Error> {
        let api = self.api(group, version, resource, namespace).await?;

        trace!(namespace, name, resource, "get resource");
        match api.get(name).await {
            Ok(obj) => Ok(Some(obj)),
            Err(kube::Error::Api(err)) if err.code == 404 => Ok(None),
            Err(err) => Err(Error::Api(err)),
        }
    }

    pub async fn list(
        &self,
        group: &str,
        version: &str,
        resource: &str,
        namespace: &str,
        label_selector: Option<&str>,
    ) -> Result<Vec<DynamicObject>, Error> {
        let api = self.api(group, version, resource, namespace).await?;
        let mut params = ListParams::default();
        if let Some(selector) = label_selector {
            params = params.labels(selector);
        }

        trace!(namespace, resource, "list resources");
        Ok(api.list(&params).await.map_err(Error::Api)?.items)
    }

    pub async fn create(
        &self,
        group: &str,
        version: &str,
        resource: &str,
        obj: &DynamicObject,
    ) -> Result<DynamicObject, Error> {
        let namespace = obj.namespace().unwrap_or_default();
        let api = self.api(group, version, resource, &namespace).await?;

        debug!(
            namespace,
            name = obj.name_any(),
            resource,
            "create resource"
        );
        api.create(&PostParams::default(), obj)
            .await
            .map_err(Error::Api)
    }

    pub async fn update(
        &self,
        group: &str,
        version: &str,
        resource: &str,
        obj: &DynamicObject,
    ) -> Result<DynamicObject, Error> {
        let namespace = obj.namespace().unwrap_or_default();
        let api = self.api(group, version, resource, &namespace).await?;

        debug!(
            namespace,
            name = obj.name_any(),
            resource,
            "update resource"
        );
        match api
            .replace(&obj.name_any(), &PostParams::default(), obj)
            .await
        {
            Ok(obj) => Ok(obj),
            Err(kube::Error::Api(err)) if err.code == 404 => Ok(obj.clone()),
            Err(err) => Err(Error::Api(err)),
        }
    }

    pub async fn patch(
        &self,
        group: &str,
        version: &str,
        resource: &str,
        namespace: &str,
        name: &str,
        patch: json_patch::Patch,
    ) -> Result<Option<DynamicObject>, Error> {
        if patch.0.is_empty() {
            debug!(namespace, name, "skip patch, no operation to apply");
            return self.get(group, version, resource, namespace, name).await;
        }

        let api = self.api(group, version, resource, namespace).await?;
        debug!(namespace, name, "patch resource");
        match api
            .patch(
                name,
                &PatchParams::default(),
                &Patch::Json::<DynamicObject>(patch),
            )
            .await
        {
            Ok(obj) => Ok(Some(obj)),
            Err(kube::Error::Api(err)) if err.code == 404 => Ok(None),
            Err(err) => Err(Error::Api(err)),
        }
    }

    /// deletes with foreground cascading propagation; `NotFound` is success.
    pub async fn delete(
        &self,
        group: &str,
        version: &str,
        resource: &str,
        namespace: &str,
        name: &str,
    ) -> Result<(), Error> {
        let api = self.api(group, version, resource, namespace).await?;
        let params = DeleteParams::foreground();

        debug!(namespace, name, "delete resource");
        match api.delete(name, &params).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(err)) if err.code == 404 => Ok(()),
            Err(err) => Err(Error::Api(err)),
        }
    }

    /// fetches the latest copy of `original`, verifies its uid still matches,
    /// invokes `mutator` on a clone, and if it reports a change, PUTs with
    /// the freshly observed resourceVersion; retries on conflict with
    /// exponential backoff bounded at `ATOMIC_UPDATE_MAX_ATTEMPTS`.
    pub async fn atomic_update<F>(
        &self,
        group: &str,
        version: &str,
        resource: &str,
        original: &DynamicObject,
        mut mutator: F,
    ) -> Result<DynamicObject, Error>
    where
        F: FnMut(&mut DynamicObject) -> bool,
    {
        let namespace = original.namespace().unwrap_or_default();
        let name = original.name_any();
        let original_uid = original.uid();

        let mut backoff = Duration::from_millis(100);
        for attempt in 1..=ATOMIC_UPDATE_MAX_ATTEMPTS {
            let Some(mut latest) = self.get(group, version, resource, &namespace, &name).await?
            else {
                return Err(Error::ConcurrentlyDeleted(name));
            };

            if latest.uid() != original_uid {
                return Err(Error::ConcurrentlyDeleted(name));
            }

            if !mutator(&mut latest) {
                return Ok(latest);
            }

            match self.update(group, version, resource, &latest).await {
                Ok(updated) => return Ok(updated),
                Err(Error::Api(kube::Error::Api(err))) if err.code == 409 => {
                    trace!(attempt, name, "atomic update conflict, retrying");
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                    continue;
                }
                Err(err) => return Err(err),
            }
        }

        Err(Error::AtomicUpdateExhausted(ATOMIC_UPDATE_MAX_ATTEMPTS))
    }
}

/// parses a hook-supplied, fully-shaped (apiVersion/kind/metadata/spec) JSON
/// value into a `DynamicObject`, stamping `apiVersion`/`kind` if the hook
/// omitted them.
pub fn dynamic_object_from_value(
    api_version: &str,
    kind: &str,
    mut value: Value,
) -> Result<DynamicObject, serde_json::Error> {
    if let Value::Object(map) = &mut value {
        map.entry("apiVersion")
            .or_insert_with(|| Value::String(api_version.to_string()));
        map.entry("kind")
            .or_insert_with(|| Value::String(kind.to_string()));
        map.entry("metadata")
            .or_insert_with(|| serde_json::json!({}));
    }

    serde_json::from_value(value)
}
