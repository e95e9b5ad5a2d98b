//! # Data model module
//!
//! This module defines the core data types shared across the reconciliation
//! engine: resource identity, controller definitions, hook targets and
//! envelopes, and the `GenericController`/`ControllerRevision` custom
//! resources that back config discovery and revisioned rollouts.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

// -----------------------------------------------------------------------------
// ObjectId

/// identifies an api object independently of whether it has been fetched yet.
#[derive(PartialEq, Eq, PartialOrd, Ord, Clone, Debug, Hash)]
pub struct ObjectId {
    pub group: String,
    pub version: String,
    pub kind: String,
    pub namespace: String,
    pub name: String,
}

impl ObjectId {
    pub fn new(group: &str, version: &str, kind: &str, namespace: &str, name: &str) -> Self {
        Self {
            group: group.to_string(),
            version: version.to_string(),
            kind: kind.to_string(),
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }
}

// -----------------------------------------------------------------------------
// ResourceRule

/// a (group, version, resource) tuple with an optional selector, shared by the
/// watch rule and every attachment rule of a controller definition.
#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Eq, Clone, Debug)]
pub struct ResourceRule {
    #[serde(rename = "apiVersion")]
    pub api_version: String,
    #[serde(rename = "resource")]
    pub resource: String,
    #[serde(rename = "labelSelector", skip_serializing_if = "Option::is_none")]
    pub label_selector: Option<LabelSelector>,
    #[serde(rename = "nameSelector", skip_serializing_if = "Option::is_none")]
    pub name_selector: Option<Vec<String>>,
}

impl ResourceRule {
    /// splits `apiVersion` into its group and version components, the empty
    /// group denoting the core api group.
    pub fn group_version(&self) -> (String, String) {
        match self.api_version.split_once('/') {
            Some((group, version)) => (group.to_string(), version.to_string()),
            None => (String::new(), self.api_version.to_string()),
        }
    }
}

// -----------------------------------------------------------------------------
// UpdateStrategy

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Eq, Clone, Copy, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub enum UpdateStrategy {
    /// never updates an existing attachment, only (re)creates it after an
    /// external deletion.
    OnDelete,
    /// deletes then recreates the attachment whenever the merged object
    /// differs from the observed one.
    Recreate,
    /// puts the merged object in place, emulating server-side apply.
    #[default]
    InPlace,
    /// like `InPlace` but bounds the number of concurrently updated
    /// attachments to a batch size keyed by revision hash.
    RollingInPlace,
}

/// per-attachment-rule update strategy plus the `RollingInPlace` batch size.
#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Eq, Clone, Debug)]
pub struct AttachmentRule {
    #[serde(flatten)]
    pub rule: ResourceRule,
    #[serde(rename = "updateStrategy", default)]
    pub update_strategy: UpdateStrategy,
    #[serde(
        rename = "rollingUpdateBatchSize",
        skip_serializing_if = "Option::is_none"
    )]
    pub rolling_update_batch_size: Option<u32>,
}

impl AttachmentRule {
    pub fn batch_size(&self) -> u32 {
        self.rolling_update_batch_size.unwrap_or(1).max(1)
    }
}

// -----------------------------------------------------------------------------
// HookTarget

/// a hook is either a webhook url or the name of a function registered in the
/// process-wide in-process hook registry.
#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Eq, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub enum HookTarget {
    Webhook { url: String, timeout_seconds: Option<u64> },
    InProcess { name: String },
}

/// the set of hooks a controller definition may declare.
#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Eq, Clone, Debug, Default)]
pub struct HookSet {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sync: Option<HookTarget>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finalize: Option<HookTarget>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub customize: Option<HookTarget>,
}

// -----------------------------------------------------------------------------
// GenericControllerSpec / GenericController

/// the declarative record a user authors: which parent to watch, which
/// attachments form its desired state, and which hooks compute that state.
#[derive(CustomResource, JsonSchema, Serialize, Deserialize, PartialEq, Clone, Debug)]
#[kube(
    group = "metac.metacontroller.io",
    version = "v1alpha1",
    kind = "GenericController",
    plural = "genericcontrollers",
    shortname = "gctl",
    namespaced,
    status = "GenericControllerStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct GenericControllerSpec {
    /// overrides the process-wide `--finalizer-domain`; defaults to
    /// `metacontroller.io` when neither is set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    pub watch: ResourceRule,
    #[serde(default)]
    pub attachments: Vec<AttachmentRule>,
    #[serde(default)]
    pub hooks: HookSet,
    #[serde(default)]
    pub update_any: bool,
    #[serde(default)]
    pub delete_any: bool,
    #[serde(default)]
    pub generate_selector: bool,
    #[serde(default = "default_resync_period_seconds")]
    pub resync_period_seconds: u64,
}

fn default_resync_period_seconds() -> u64 {
    30 * 60
}

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Eq, Clone, Debug, Default)]
pub struct GenericControllerStatus {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

/// the in-memory, group/version-agnostic view of a controller definition used
/// by the reconciler, independent of whether it came from a `GenericController`
/// custom resource or a static config file.
#[derive(Clone, Debug)]
pub struct ControllerDefinition {
    pub name: String,
    pub domain: String,
    pub watch: ResourceRule,
    pub attachments: Vec<AttachmentRule>,
    pub hooks: HookSet,
    pub update_any: bool,
    pub delete_any: bool,
    pub generate_selector: bool,
    pub resync_period_seconds: u64,
}

impl ControllerDefinition {
    /// builds a definition from a `GenericController` custom resource,
    /// taking the default finalizer domain when the resource does not
    /// override it.
    pub fn from_generic_controller(gctl: &GenericController, default_domain: &str) -> Self {
        let spec = &gctl.spec;
        Self {
            name: gctl.name_any(),
            domain: spec
                .domain
                .clone()
                .unwrap_or_else(|| default_domain.to_string()),
            watch: spec.watch.clone(),
            attachments: spec.attachments.clone(),
            hooks: spec.hooks.clone(),
            update_any: spec.update_any,
            delete_any: spec.delete_any,
            generate_selector: spec.generate_selector,
            resync_period_seconds: spec.resync_period_seconds,
        }
    }

    /// the deterministic finalizer string protecting the watched object,
    /// present iff `hooks.finalize` is set.
    pub fn finalizer(&self) -> String {
        format!(
            "protect.{}.metac.{}/{}",
            self.name, self.domain, self.name
        )
    }

    /// the annotation key holding the last-applied canonical JSON of an
    /// attachment's desired spec.
    pub fn last_applied_annotation(&self) -> String {
        format!("metac.{}/last-applied-configuration", self.domain)
    }

    /// the label applied to a controller revision tying it to this
    /// controller, used by the claim manager's garbage collection selector.
    pub fn revision_owner_label(&self) -> String {
        format!("metac.{}/controller-name", self.domain)
    }
}

// -----------------------------------------------------------------------------
// Hook envelopes

/// attachments are grouped by kind, then by name, in the wire envelopes.
pub type AttachmentsByKind = BTreeMap<String, BTreeMap<String, Value>>;

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct SyncRequest {
    pub watch: Value,
    pub attachments: AttachmentsByKind,
    pub finalizing: bool,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct SyncResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<Value>,
    #[serde(default)]
    pub attachments: Vec<Value>,
    #[serde(default, rename = "explicitUpdates")]
    pub explicit_updates: Vec<Value>,
    #[serde(default, rename = "explicitDeletes")]
    pub explicit_deletes: Vec<Value>,
    #[serde(default, rename = "skipReconcile")]
    pub skip_reconcile: bool,
    #[serde(rename = "resyncAfterSeconds", skip_serializing_if = "Option::is_none")]
    pub resync_after_seconds: Option<f64>,
    #[serde(default)]
    pub finalized: bool,
}

/// request envelope for the `customize` hook: the observed parent only, since
/// its whole point is deciding which attachment selectors to use *before*
/// any attachment is collected.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct CustomizeRequest {
    pub watch: Value,
}

/// response envelope for the `customize` hook: a narrowed selector per
/// attachment rule (matched back to a rule by `resource`), letting a
/// controller scope e.g. "only Pods with this extra label" without the
/// attachment rule itself being that specific for every parent.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct CustomizeResponse {
    #[serde(default, rename = "resourceRules")]
    pub resource_rules: Vec<ResourceRule>,
}

// -----------------------------------------------------------------------------
// ControllerRevision

/// an immutable, content-hashed snapshot of a rendered attachment bundle.
#[derive(CustomResource, JsonSchema, Serialize, Deserialize, PartialEq, Clone, Debug)]
#[kube(
    group = "metac.metacontroller.io",
    version = "v1alpha1",
    kind = "ControllerRevision",
    plural = "controllerrevisions",
    shortname = "metacrev",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct ControllerRevisionSpec {
    pub revision: i64,
    pub parent_name: String,
    pub data: Vec<Value>,
}
