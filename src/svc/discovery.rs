//! # Discovery module
//!
//! This module provides the API discovery cache (component A): a
//! periodically refreshed snapshot of the cluster's group/version/resource
//! catalog, answering "what plural, kind, scope does `group/version+resource`
//! map to?" without blocking on a live round-trip per lookup.

use std::{collections::HashMap, sync::Arc, time::Duration};

use kube::{discovery::ApiResource, Client, Discovery};
use tokio::sync::RwLock;
use tracing::{debug, warn};

// -----------------------------------------------------------------------------
// Error enum

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to run api discovery, {0}")]
    Discover(kube::Error),
    #[error("no resource found for group '{0}', version '{1}', resource '{2}'")]
    NotFound(String, String, String),
}

// -----------------------------------------------------------------------------
// Key / Entry

#[derive(PartialEq, Eq, Hash, Clone, Debug)]
struct Key {
    group: String,
    version: String,
    resource: String,
}

/// resolved shape of a discovered resource.
#[derive(Clone, Debug)]
pub struct Resolved {
    pub api_resource: ApiResource,
    pub namespaced: bool,
}

// -----------------------------------------------------------------------------
// Cache

/// single-writer (the refresh loop), many-reader discovery snapshot. Readers
/// take a read lock; the refresh loop holds the write lock only for the
/// duration of swapping in a freshly built snapshot, never across the
/// network call itself.
pub struct Cache {
    client: Client,
    interval: Duration,
    snapshot: RwLock<HashMap<Key, Resolved>>,
}

impl Cache {
    pub fn new(client: Client, interval: Duration) -> Arc<Self> {
        Arc::new(Self {
            client,
            interval,
            snapshot: RwLock::new(HashMap::new()),
        })
    }

    /// runs an initial discovery pass, then refreshes forever on `interval`
    /// until the task is aborted. Failures are logged and the previous
    /// snapshot keeps serving reads.
    pub async fn run(self: Arc<Self>) {
        if let Err(err) = self.refresh().await {
            warn!(error = %err, "initial api discovery failed, cache starts empty");
        }

        let mut ticker = tokio::time::interval(self.interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if let Err(err) = self.refresh().await {
                warn!(error = %err, "api discovery refresh failed, serving previous snapshot");
            }
        }
    }

    async fn refresh(&self) -> Result<(), Error> {
        let discovery = Discovery::new(self.client.clone())
            .run()
            .await
            .map_err(Error::Discover)?;

        let mut next = HashMap::new();
        for group in discovery.groups() {
            for (api_resource, capabilities) in group.recommended_resources() {
                let key = Key {
                    group: api_resource.group.clone(),
                    version: api_resource.version.clone(),
                    resource: api_resource.plural.clone(),
                };
                next.insert(
                    key,
                    Resolved {
                        api_resource,
                        namespaced: capabilities.scope == kube::discovery::Scope::Namespaced,
                    },
                );
            }
        }

        debug!(resources = next.len(), "refreshed api discovery cache");
        *self.snapshot.write().await = next;
        Ok(())
    }

    /// resolves `(group, version, resource)` to its kind/plural/singular/scope.
    pub async fn resolve(
        &self,
        group: &str,
        version: &str,
        resource: &str,
    ) -> Result<Resolved, Error> {
        let key = Key {
            group: group.to_string(),
            version: version.to_string(),
            resource: resource.to_string(),
        };

        self.snapshot
            .read()
            .await
            .get(&key)
            .cloned()
            .ok_or_else(|| Error::NotFound(group.to_string(), version.to_string(), resource.to_string()))
    }

    /// resolves `(group, version, kind)` to its resource shape, scanning the
    /// snapshot since kinds are not indexed directly.
    pub async fn resolve_kind(
        &self,
        group: &str,
        version: &str,
        kind: &str,
    ) -> Result<Resolved, Error> {
        self.snapshot
            .read()
            .await
            .values()
            .find(|resolved| {
                resolved.api_resource.group == group
                    && resolved.api_resource.version == version
                    && resolved.api_resource.kind == kind
            })
            .cloned()
            .ok_or_else(|| Error::NotFound(group.to_string(), version.to_string(), kind.to_string()))
    }
}
