//! # Finalizer lifecycle module
//!
//! This module provides the finalizer lifecycle state machine (component H):
//! whether the controller's deterministic finalizer string should be present
//! on the watched object, and the *Active → Finalizing → Terminal* rules
//! driving when it is added or removed. Generalizes
//! `svc::k8s::finalizer::{add,contains,remove}` (kept as-is, grounded in the
//! teacher) from hardcoded per-addon strings to the computed
//! `ControllerDefinition::finalizer()` string, and mirrors the Apply/Cleanup
//! split of `kube::runtime::finalizer`.

use kube::{api::DynamicObject, ResourceExt};

use crate::svc::{k8s::finalizer as kfinalizer, model::ControllerDefinition};

// -----------------------------------------------------------------------------
// Tick

/// what, if anything, should happen to the finalizer string on a non-deleting
/// sync tick.
#[derive(PartialEq, Eq, Clone, Debug)]
pub enum Tick {
    /// the controller has a finalize hook and the string is missing: add it.
    Add,
    /// the controller has no finalize hook but the string lingers: remove it.
    Remove,
    /// already in the correct state.
    Noop,
}

/// decides the sync-tick finalizer action for a non-deleting parent (§4.H,
/// rule 1).
pub fn tick(def: &ControllerDefinition, parent: &DynamicObject) -> Tick {
    let has_finalize_hook = def.hooks.finalize.is_some();
    let present = kfinalizer::contains(parent, &def.finalizer());

    match (has_finalize_hook, present) {
        (true, false) => Tick::Add,
        (false, true) => Tick::Remove,
        _ => Tick::Noop,
    }
}

/// applies a [`Tick`] decision to `parent`, returning the object with its
/// finalizer list mutated (the caller still has to PATCH it).
pub fn apply_tick(def: &ControllerDefinition, parent: DynamicObject, decision: &Tick) -> DynamicObject {
    match decision {
        Tick::Add => kfinalizer::add(parent, &def.finalizer()),
        Tick::Remove => kfinalizer::remove(parent, &def.finalizer()),
        Tick::Noop => parent,
    }
}

/// whether `parent` is in the *Finalizing* state (deletionTimestamp set and
/// the controller's finalizer is still present).
pub fn is_finalizing(def: &ControllerDefinition, parent: &DynamicObject) -> bool {
    parent.meta().deletion_timestamp.is_some() && kfinalizer::contains(parent, &def.finalizer())
}

/// given the finalize hook's `finalized` verdict (§4.H, rule 2), decides
/// whether the finalizer string should now be removed so that the api server
/// can garbage-collect the parent.
pub fn should_release(finalized: bool) -> bool {
    finalized
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::svc::model::{HookSet, HookTarget, ResourceRule};
    use kube::api::ObjectMeta;

    fn def(with_finalize_hook: bool) -> ControllerDefinition {
        ControllerDefinition {
            name: "widgets".into(),
            domain: "metacontroller.io".into(),
            watch: ResourceRule {
                api_version: "v1".into(),
                resource: "widgets".into(),
                label_selector: None,
                name_selector: None,
            },
            attachments: vec![],
            hooks: HookSet {
                sync: None,
                finalize: with_finalize_hook.then(|| HookTarget::InProcess { name: "f".into() }),
                customize: None,
            },
            update_any: false,
            delete_any: false,
            generate_selector: false,
            resync_period_seconds: 1800,
        }
    }

    fn parent(finalizers: Vec<String>) -> DynamicObject {
        let mut obj = DynamicObject::new("x", &kube::discovery::ApiResource {
            group: String::new(),
            version: "v1".into(),
            kind: "Widget".into(),
            api_version: "v1".into(),
            plural: "widgets".into(),
        });
        obj.metadata = ObjectMeta {
            finalizers: Some(finalizers),
            ..Default::default()
        };
        obj
    }

    #[test]
    fn adds_finalizer_when_hook_present_and_missing() {
        let d = def(true);
        let p = parent(vec![]);
        assert_eq!(tick(&d, &p), Tick::Add);
    }

    #[test]
    fn removes_finalizer_when_no_hook_but_present() {
        let d = def(false);
        let p = parent(vec![d.finalizer()]);
        assert_eq!(tick(&d, &p), Tick::Remove);
    }

    #[test]
    fn noop_when_already_consistent() {
        let d = def(true);
        let p = parent(vec![d.finalizer()]);
        assert_eq!(tick(&d, &p), Tick::Noop);
    }
}
