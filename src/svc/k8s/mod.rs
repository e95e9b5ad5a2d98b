//! # Kubernetes module
//!
//! Thin helpers for talking to a cluster that sit below the generic engine:
//! building a [`kube::Client`] from a kubeconfig path or in-cluster defaults,
//! and the finalizer add/remove primitive shared by [`crate::svc::finalize`].
//! The per-type `Reconciler<T>`/`Watcher<T>`/`Controller` machinery this
//! module used to hold has been generalized into [`crate::svc::reconcile`],
//! which operates over `DynamicObject` instead of one Rust type per custom
//! resource, and is driven by [`crate::svc::manager::ControllerManager`]
//! rather than one hand-spawned `tokio::spawn` per resource kind.

pub mod client;
pub mod finalizer;
