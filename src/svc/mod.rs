//! # Services module
//!
//! This module provides the engine driving a metac controller process:
//! discovery, the dynamic client, the informer pool, the work queue, the
//! claim manager, the diff/apply engine, the hook invoker, the finalizer
//! lifecycle, the controller revision store, the reconciler, and the
//! controller manager tying them together, plus the ambient configuration,
//! kubernetes helpers, and telemetry surface shared by the whole process.

pub mod cfg;
pub mod claim;
pub mod client;
pub mod diff;
pub mod discovery;
pub mod finalize;
pub mod hook;
pub mod informer;
pub mod k8s;
pub mod manager;
pub mod model;
pub mod queue;
pub mod reconcile;
pub mod revision;
pub mod telemetry;
