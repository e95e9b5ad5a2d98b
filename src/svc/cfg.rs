//! # Configuration module
//!
//! This module provides the process-wide [`Configuration`], layering the
//! resolved CLI/environment values from [`crate::cmd::Args`] on top of a
//! layered `config`-crate search path, so a local settings file can still
//! override a default in `run-as-local` / static config-mode operation
//! without requiring a flag on every invocation.

use std::{env, path::PathBuf, time::Duration};

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::cmd::Args;

// -----------------------------------------------------------------------------
// constants

pub const DEFAULT_DISCOVERY_INTERVAL_SECONDS: u64 = 30;
pub const DEFAULT_CACHE_FLUSH_INTERVAL_SECONDS: u64 = 30 * 60;
pub const DEFAULT_DEBUG_ADDR: &str = "0.0.0.0:9999";
pub const DEFAULT_WORKERS_COUNT: usize = 5;
pub const DEFAULT_CLIENT_GO_QPS: f32 = 5.0;
pub const DEFAULT_CLIENT_GO_BURST: u32 = 10;
pub const DEFAULT_METAC_CONFIG_PATH: &str = "/etc/config/metac/";
pub const DEFAULT_FINALIZER_DOMAIN: &str = "metacontroller.io";

// -----------------------------------------------------------------------------
// Error enum

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to load configuration, {0}")]
    Build(ConfigError),
    #[error("failed to deserialize configuration, {0}")]
    Deserialize(ConfigError),
    #[error("failed to set default for key '{0}', {1}")]
    Default(String, ConfigError),
}

// -----------------------------------------------------------------------------
// Configuration structure

/// the resolved process settings driving one `metac` run: discovery cadence,
/// informer resync cadence, the telemetry listen address, the kubernetes
/// client target, the worker pool size, the client-side rate limit, the
/// mounting mode, and the default finalizer domain (§6).
#[derive(Serialize, Deserialize, PartialEq, Clone, Debug)]
pub struct Configuration {
    pub discovery_interval_seconds: u64,
    pub cache_flush_interval_seconds: u64,
    pub debug_addr: String,
    pub kube_apiserver_url: Option<String>,
    pub client_config_path: Option<PathBuf>,
    pub workers_count: usize,
    pub client_go_qps: f32,
    pub client_go_burst: u32,
    pub run_as_local: bool,
    pub metac_config_path: PathBuf,
    pub finalizer_domain: String,
}

impl Configuration {
    pub fn discovery_interval(&self) -> Duration {
        Duration::from_secs(self.discovery_interval_seconds)
    }

    pub fn cache_flush_interval(&self) -> Duration {
        Duration::from_secs(self.cache_flush_interval_seconds)
    }

    /// builds the configuration from the resolved CLI/environment `Args`,
    /// layering a local settings file over them via a default search path,
    /// so `run-as-local` deployments can keep most settings in a file
    /// instead of re-passing every flag.
    pub fn try_from_args(args: &Args) -> Result<Self, Error> {
        let mut builder = Config::builder()
            .set_default("discovery_interval_seconds", args.discovery_interval_seconds)
            .map_err(|err| Error::Default("discovery_interval_seconds".into(), err))?
            .set_default(
                "cache_flush_interval_seconds",
                args.cache_flush_interval_seconds,
            )
            .map_err(|err| Error::Default("cache_flush_interval_seconds".into(), err))?
            .set_default("debug_addr", args.debug_addr.clone())
            .map_err(|err| Error::Default("debug_addr".into(), err))?
            .set_default("workers_count", args.workers_count as i64)
            .map_err(|err| Error::Default("workers_count".into(), err))?
            .set_default("client_go_qps", args.client_go_qps as f64)
            .map_err(|err| Error::Default("client_go_qps".into(), err))?
            .set_default("client_go_burst", args.client_go_burst as i64)
            .map_err(|err| Error::Default("client_go_burst".into(), err))?
            .set_default("run_as_local", args.run_as_local)
            .map_err(|err| Error::Default("run_as_local".into(), err))?
            .set_default(
                "metac_config_path",
                args.metac_config_path.display().to_string(),
            )
            .map_err(|err| Error::Default("metac_config_path".into(), err))?
            .set_default("finalizer_domain", args.finalizer_domain.clone())
            .map_err(|err| Error::Default("finalizer_domain".into(), err))?;

        if let Some(url) = &args.kube_apiserver_url {
            builder = builder
                .set_default("kube_apiserver_url", url.clone())
                .map_err(|err| Error::Default("kube_apiserver_url".into(), err))?;
        }
        if let Some(path) = &args.client_config_path {
            builder = builder
                .set_default("client_config_path", path.display().to_string())
                .map_err(|err| Error::Default("client_config_path".into(), err))?;
        }

        builder
            .add_source(Environment::with_prefix("METAC"))
            .add_source(File::from(PathBuf::from("/usr/share/metac/config")).required(false))
            .add_source(File::from(PathBuf::from("/etc/metac/config")).required(false))
            .add_source(
                File::from(PathBuf::from(format!(
                    "{}/.config/metac/config",
                    env::var("HOME").unwrap_or_default()
                )))
                .required(false),
            )
            .add_source(
                File::from(PathBuf::from(format!(
                    "{}/.local/share/metac/config",
                    env::var("HOME").unwrap_or_default()
                )))
                .required(false),
            )
            .add_source(File::from(PathBuf::from("config")).required(false))
            .build()
            .map_err(Error::Build)?
            .try_deserialize()
            .map_err(Error::Deserialize)
    }

    /// logs non-fatal but noteworthy configuration facts at startup.
    pub fn help(&self) {
        info!(
            discovery_interval = self.discovery_interval_seconds,
            cache_flush_interval = self.cache_flush_interval_seconds,
            workers_count = self.workers_count,
            run_as_local = self.run_as_local,
            "resolved configuration"
        );

        if self.kube_apiserver_url.is_none() && self.client_config_path.is_none() {
            info!("no 'kube-apiserver-url' or 'client-config-path' given, using in-cluster credentials");
        }

        if self.client_go_qps <= 0.0 {
            warn!(
                qps = self.client_go_qps,
                "client-go-qps is not positive, the kubernetes client will not be rate limited"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cmd::Args;
    use clap::Parser;

    #[test]
    fn builds_from_default_args() {
        let args = Args::parse_from(["metac"]);
        let config = Configuration::try_from_args(&args).expect("configuration to build");
        assert_eq!(config.discovery_interval_seconds, DEFAULT_DISCOVERY_INTERVAL_SECONDS);
        assert_eq!(config.workers_count, DEFAULT_WORKERS_COUNT);
        assert_eq!(config.finalizer_domain, DEFAULT_FINALIZER_DOMAIN);
    }

    #[test]
    fn carries_explicit_kube_apiserver_url() {
        let args = Args::parse_from(["metac", "--kube-apiserver-url", "https://127.0.0.1:6443"]);
        let config = Configuration::try_from_args(&args).expect("configuration to build");
        assert_eq!(
            config.kube_apiserver_url.as_deref(),
            Some("https://127.0.0.1:6443")
        );
    }
}
