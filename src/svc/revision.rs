//! # Controller revision store module
//!
//! This module provides the controller-revision store (component K):
//! immutable, content-hashed snapshots of a rendered attachment bundle, used
//! by controllers that opt into `RollingInPlace` rollouts. Grounded in the
//! example pack's `stackabletech-operator-rs` `history.rs` (list/sort/next
//! revision, content hash via `DefaultHasher`, name truncated to 223 chars so
//! the hash suffix always fits within the 253-character name limit).

use std::hash::{Hash, Hasher};

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::ResourceExt;
use serde_json::Value;

use crate::svc::{
    client::DynamicClient,
    model::{ControllerDefinition, ControllerRevision, ControllerRevisionSpec},
};

// -----------------------------------------------------------------------------
// constants

pub const GROUP: &str = "metac.metacontroller.io";
pub const VERSION: &str = "v1alpha1";
pub const RESOURCE: &str = "controllerrevisions";

/// how many past revisions are kept for history per parent, beyond the
/// current one, before the oldest are garbage collected.
pub const DEFAULT_HISTORY_LIMIT: usize = 3;

// -----------------------------------------------------------------------------
// Error enum

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to interact with controller revisions, {0}")]
    Client(crate::svc::client::Error),
}

impl From<crate::svc::client::Error> for Error {
    fn from(err: crate::svc::client::Error) -> Self {
        Self::Client(err)
    }
}

// -----------------------------------------------------------------------------
// hashing / naming

/// content hash of a rendered attachment bundle, used both as the revision's
/// identity and to key `RollingInPlace` batches.
pub fn content_hash(bundle: &[Value]) -> String {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    for value in bundle {
        value.to_string().hash(&mut hasher);
    }
    format!("{:x}", hasher.finish())
}

/// a name can be at most 253 characters; the prefix is trimmed to 223 to
/// leave enough room for the hash suffix.
pub fn revision_name(parent_name: &str, hash: &str) -> String {
    format!("{:.223}-{}", parent_name, hash)
}

// -----------------------------------------------------------------------------
// Store

pub struct Store {
    client: DynamicClient,
}

impl Store {
    pub fn new(client: DynamicClient) -> Self {
        Self { client }
    }

    /// lists every `ControllerRevision` owned by `parent_name` in `namespace`,
    /// sorted by revision number, creation time, and name (reversed, newest
    /// first, matching the teacher's `sort_controller_revisions`).
    pub async fn list_owned(
        &self,
        namespace: &str,
        parent_name: &str,
        def: &ControllerDefinition,
    ) -> Result<Vec<ControllerRevision>, Error> {
        let label = format!("{}={}", def.revision_owner_label(), parent_name);
        let objs = self
            .client
            .list(GROUP, VERSION, RESOURCE, namespace, Some(&label))
            .await?;

        let mut revisions: Vec<ControllerRevision> = objs
            .into_iter()
            .filter_map(|obj| serde_json::to_value(&obj).ok().and_then(|v| serde_json::from_value(v).ok()))
            .collect();

        revisions.sort_by(|a, b| {
            a.spec
                .revision
                .cmp(&b.spec.revision)
                .then_with(|| a.meta().creation_timestamp.cmp(&b.meta().creation_timestamp))
                .then_with(|| a.meta().name.cmp(&b.meta().name))
        });
        revisions.reverse();

        Ok(revisions)
    }

    pub fn next_revision(revisions: &[ControllerRevision]) -> i64 {
        revisions.first().map(|r| r.spec.revision + 1).unwrap_or(1)
    }

    /// creates a new immutable revision owned by `parent`, skipping creation
    /// (returning the existing one) if the content hash already exists among
    /// `existing`.
    pub async fn create(
        &self,
        namespace: &str,
        parent_name: &str,
        parent_owner: OwnerReference,
        def: &ControllerDefinition,
        bundle: Vec<Value>,
        existing: &[ControllerRevision],
    ) -> Result<ControllerRevision, Error> {
        let hash = content_hash(&bundle);
        let name = revision_name(parent_name, &hash);

        if let Some(found) = existing.iter().find(|r| r.name_any() == name) {
            return Ok(found.clone());
        }

        let revision = Self::next_revision(existing);
        let mut obj = ControllerRevision::new(
            &name,
            ControllerRevisionSpec {
                revision,
                parent_name: parent_name.to_string(),
                data: bundle,
            },
        );
        obj.meta_mut().namespace = Some(namespace.to_string());
        obj.meta_mut().owner_references = Some(vec![parent_owner]);
        obj.meta_mut()
            .labels
            .get_or_insert_with(Default::default)
            .insert(def.revision_owner_label(), parent_name.to_string());
        obj.meta_mut()
            .annotations
            .get_or_insert_with(Default::default)
            .insert(
                format!("metac.{}/created-at", def.domain),
                chrono::Utc::now().to_rfc3339(),
            );

        let value = serde_json::to_value(&obj).expect("ControllerRevision always serializes");
        let dynamic = crate::svc::client::dynamic_object_from_value(
            &format!("{GROUP}/{VERSION}"),
            "ControllerRevision",
            value,
        )
        .expect("a just-serialized ControllerRevision always deserializes as DynamicObject");

        let created = self.client.create(GROUP, VERSION, RESOURCE, &dynamic).await?;

        let value = serde_json::to_value(&created).expect("DynamicObject always serializes");
        serde_json::from_value(value).map_err(|_err| {
            Error::Client(crate::svc::client::Error::ConcurrentlyDeleted(name))
        })
    }

    /// garbage collects revisions beyond `DEFAULT_HISTORY_LIMIT`, oldest
    /// first. `existing` must already be sorted newest-first (as returned by
    /// [`Self::list_owned`]); orphaned history is released the same way any
    /// other claimed attachment would be, just unconditionally since a
    /// revision's only consumer is the parent that created it.
    pub async fn garbage_collect(
        &self,
        namespace: &str,
        existing: &[ControllerRevision],
    ) -> Result<(), Error> {
        for stale in existing.iter().skip(DEFAULT_HISTORY_LIMIT) {
            self.client
                .delete(GROUP, VERSION, RESOURCE, namespace, &stale.name_any())
                .await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn hash_is_stable_for_identical_bundles() {
        let bundle = vec![json!({"a": 1})];
        assert_eq!(content_hash(&bundle), content_hash(&bundle));
    }

    #[test]
    fn hash_differs_for_different_bundles() {
        assert_ne!(
            content_hash(&[json!({"a": 1})]),
            content_hash(&[json!({"a": 2})])
        );
    }

    #[test]
    fn revision_name_truncates_long_prefix() {
        let prefix = "x".repeat(300);
        let name = revision_name(&prefix, "deadbeef");
        assert_eq!(name.len(), 223 + 1 + "deadbeef".len());
    }
}
