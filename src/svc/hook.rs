//! # Hook invoker module
//!
//! This module provides the uniform hook-calling convention (component G):
//! a webhook POSTs the JSON envelope with a per-call timeout (`reqwest`,
//! enriched from the wider example pack since the teacher itself makes no
//! outbound HTTP calls of this shape); an in-process hook is looked up by
//! name in a process-wide registry populated before reconcilers start (the
//! teacher's own `once_cell`/`LazyLock` pattern, reused here for a
//! `HashMap<String, HookFn>` instead of a metrics statistic).

use std::{collections::HashMap, time::Duration};

use once_cell::sync::OnceCell;
use serde_json::Value;

use crate::svc::model::HookTarget;

// -----------------------------------------------------------------------------
// constants

const DEFAULT_WEBHOOK_TIMEOUT: Duration = Duration::from_secs(10);

// -----------------------------------------------------------------------------
// Error enum

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("webhook request failed, {0}")]
    Request(reqwest::Error),
    #[error("webhook returned non-2xx status {0}")]
    Status(u16),
    #[error("failed to decode hook response as json, {0}")]
    Malformed(serde_json::Error),
    #[error("no in-process hook registered under name '{0}'")]
    NotRegistered(String),
    #[error("in-process hook '{0}' panicked")]
    Panicked(String),
}

// -----------------------------------------------------------------------------
// HookFn / Registry

/// signature of an in-process hook: given the request envelope, return the
/// response envelope synchronously.
pub trait HookFn: Fn(Value) -> Result<Value, String> + Send + Sync {}
impl<F> HookFn for F where F: Fn(Value) -> Result<Value, String> + Send + Sync {}

type Registry = HashMap<String, Box<dyn HookFn>>;

static REGISTRY: OnceCell<Registry> = OnceCell::new();

/// populated once, before any reconciler starts; later calls are a no-op so
/// that tests may call it defensively without double-initializing.
pub fn register_all(hooks: HashMap<String, Box<dyn HookFn>>) {
    let _ = REGISTRY.set(hooks);
}

// -----------------------------------------------------------------------------
// Invoker

/// uniform call over both hook transports.
#[derive(Clone)]
pub struct Invoker {
    http: reqwest::Client,
}

impl Invoker {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::new(),
        }
    }

    pub async fn invoke(&self, target: &HookTarget, request: Value) -> Result<Value, Error> {
        match target {
            HookTarget::Webhook { url, timeout_seconds } => {
                self.invoke_webhook(url, *timeout_seconds, request).await
            }
            HookTarget::InProcess { name } => invoke_in_process(name, request),
        }
    }

    async fn invoke_webhook(
        &self,
        url: &str,
        timeout_seconds: Option<u64>,
        request: Value,
    ) -> Result<Value, Error> {
        let timeout = timeout_seconds
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_WEBHOOK_TIMEOUT);

        let response = self
            .http
            .post(url)
            .timeout(timeout)
            .json(&request)
            .send()
            .await
            .map_err(Error::Request)?;

        if !response.status().is_success() {
            return Err(Error::Status(response.status().as_u16()));
        }

        response
            .json::<Value>()
            .await
            .map_err(Error::Request)
    }
}

impl Default for Invoker {
    fn default() -> Self {
        Self::new()
    }
}

fn invoke_in_process(name: &str, request: Value) -> Result<Value, Error> {
    let registry = REGISTRY.get().ok_or_else(|| Error::NotRegistered(name.to_string()))?;
    let hook = registry
        .get(name)
        .ok_or_else(|| Error::NotRegistered(name.to_string()))?;

    std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| hook(request)))
        .map_err(|_| Error::Panicked(name.to_string()))?
        .map_err(|_| Error::Status(500))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn invokes_registered_in_process_hook() {
        let mut hooks: HashMap<String, Box<dyn HookFn>> = HashMap::new();
        hooks.insert(
            "echo".to_string(),
            Box::new(|req: Value| Ok(req)),
        );
        register_all(hooks);

        let result = invoke_in_process("echo", json!({"a": 1}));
        assert_eq!(result.unwrap(), json!({"a": 1}));
    }

    #[test]
    fn reports_missing_hook() {
        // a name that was never registered in any test in this process.
        let result = invoke_in_process("definitely-not-registered", json!({}));
        assert!(result.is_err());
    }
}
