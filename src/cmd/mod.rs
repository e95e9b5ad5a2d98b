//! # Command module
//!
//! This module provides the command line interface surface (component L)
//! and the `daemon` entrypoint that wires discovery, the controller
//! manager, and the telemetry server together for one process lifetime.

use std::{io, net::AddrParseError, path::PathBuf, sync::Arc};

use clap::{Parser, Subcommand};
use hyper::{
    service::{make_service_fn, service_fn},
    Server,
};
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info};

use crate::svc::{
    cfg::Configuration,
    k8s::client,
    manager::{ControllerManager, ManagerConfig},
    telemetry::router,
};

pub mod crd;

// -----------------------------------------------------------------------------
// CommandError enum

#[derive(thiserror::Error, Debug)]
pub enum CommandError {
    #[error("failed to execute command '{0}', {1}")]
    Execution(String, Box<CommandError>),
    #[error("failed to print custom resource definitions, {0}")]
    CustomResourceDefinition(crd::Error),
    #[error("{0}")]
    Daemon(#[from] DaemonError),
}

// -----------------------------------------------------------------------------
// Command enum

#[derive(Subcommand, Clone, Debug)]
pub enum Command {
    /// print the GenericController and ControllerRevision custom resource
    /// definitions as yaml
    #[clap(name = "custom-resource-definition", visible_alias = "crd")]
    CustomResourceDefinition,
}

impl Command {
    pub async fn execute(&self, _config: Arc<Configuration>) -> Result<(), CommandError> {
        match self {
            Self::CustomResourceDefinition => crd::view()
                .map_err(CommandError::CustomResourceDefinition)
                .map_err(|err| {
                    CommandError::Execution("custom-resource-definition".into(), Box::new(err))
                }),
        }
    }
}

// -----------------------------------------------------------------------------
// Args struct

#[derive(Parser, Clone, Debug)]
#[command(about = env!("CARGO_PKG_DESCRIPTION"), version)]
pub struct Args {
    /// increase log verbosity, may be repeated (-vvv)
    #[arg(short = 'v', long = "verbose", global = true, action = clap::ArgAction::Count)]
    pub verbosity: u8,
    /// check if the resolved configuration is healthy and exit
    #[arg(short = 't', long = "check", global = true)]
    pub check: bool,

    /// how often the api server discovery cache is refreshed
    #[arg(long, env = "METAC_DISCOVERY_INTERVAL_SECONDS", default_value_t = crate::svc::cfg::DEFAULT_DISCOVERY_INTERVAL_SECONDS)]
    pub discovery_interval_seconds: u64,
    /// how often an informer's local cache is flushed and resynced
    #[arg(long, env = "METAC_CACHE_FLUSH_INTERVAL_SECONDS", default_value_t = crate::svc::cfg::DEFAULT_CACHE_FLUSH_INTERVAL_SECONDS)]
    pub cache_flush_interval_seconds: u64,
    /// address the telemetry http server (/healthz, /metrics) listens on
    #[arg(long, env = "METAC_DEBUG_ADDR", default_value = crate::svc::cfg::DEFAULT_DEBUG_ADDR)]
    pub debug_addr: String,
    /// kubernetes api server url; mutually exclusive with client-config-path,
    /// empty means in-cluster credentials
    #[arg(long, env = "METAC_KUBE_APISERVER_URL")]
    pub kube_apiserver_url: Option<String>,
    /// path to a kubeconfig file; mutually exclusive with kube-apiserver-url
    #[arg(long, env = "METAC_CLIENT_CONFIG_PATH")]
    pub client_config_path: Option<PathBuf>,
    /// number of worker goroutines per reconciler
    #[arg(long, env = "METAC_WORKERS_COUNT", default_value_t = crate::svc::cfg::DEFAULT_WORKERS_COUNT)]
    pub workers_count: usize,
    /// sustained kubernetes client requests per second
    #[arg(long, env = "METAC_CLIENT_GO_QPS", default_value_t = crate::svc::cfg::DEFAULT_CLIENT_GO_QPS)]
    pub client_go_qps: f32,
    /// kubernetes client burst capacity above the sustained qps
    #[arg(long, env = "METAC_CLIENT_GO_BURST", default_value_t = crate::svc::cfg::DEFAULT_CLIENT_GO_BURST)]
    pub client_go_burst: u32,
    /// run in config mode, loading controller definitions from
    /// metac-config-path instead of watching GenericController objects
    #[arg(long, env = "METAC_RUN_AS_LOCAL")]
    pub run_as_local: bool,
    /// directory of static controller definitions read in run-as-local mode
    #[arg(long, env = "METAC_CONFIG_PATH", default_value = crate::svc::cfg::DEFAULT_METAC_CONFIG_PATH)]
    pub metac_config_path: PathBuf,
    /// default domain used to build finalizer strings and annotation keys
    /// when a GenericController does not override it
    #[arg(long, env = "METAC_FINALIZER_DOMAIN", default_value = crate::svc::cfg::DEFAULT_FINALIZER_DOMAIN)]
    pub finalizer_domain: String,

    #[command(subcommand)]
    pub command: Option<Command>,
}

// -----------------------------------------------------------------------------
// DaemonError enum

#[derive(thiserror::Error, Debug)]
pub enum DaemonError {
    #[error("failed to parse listen address '{0}', {1}")]
    Listen(String, AddrParseError),
    #[error("failed to handle termination signal, {0}")]
    Signal(io::Error),
    #[error("failed to create kubernetes client, {0}")]
    Client(client::Error),
}

// -----------------------------------------------------------------------------
// daemon function

/// starts discovery, the controller manager (in CRD or config mode
/// depending on `config.run_as_local`), and the telemetry http server, then
/// blocks until SIGINT or SIGTERM, tearing everything down gracefully.
#[tracing::instrument(skip(config))]
pub async fn daemon(config: Arc<Configuration>) -> Result<(), DaemonError> {
    let kube_client = client::try_new(
        config.client_config_path.clone(),
        config.kube_apiserver_url.as_deref(),
        client::RateLimit {
            qps: config.client_go_qps,
            burst: config.client_go_burst,
        },
    )
    .await
    .map_err(DaemonError::Client)?;

    let manager = ControllerManager::new(
        kube_client,
        ManagerConfig {
            finalizer_domain: config.finalizer_domain.clone(),
            discovery_interval: config.discovery_interval(),
            cache_flush_interval: config.cache_flush_interval(),
            workers_count: Some(config.workers_count),
        },
    );

    let discovery = manager.spawn_discovery();

    let manager_task = if config.run_as_local {
        let manager = manager.clone();
        let dir = config.metac_config_path.clone();
        tokio::spawn(async move {
            if let Err(err) = manager.run_config_mode(&dir).await {
                error!(error = %err, "config-mode controller loading failed");
            }
        })
    } else {
        let manager = manager.clone();
        tokio::spawn(async move {
            if let Err(err) = manager.run_crd_mode().await {
                error!(error = %err, "GenericController watch failed");
            }
        })
    };

    let addr = config
        .debug_addr
        .parse()
        .map_err(|err| DaemonError::Listen(config.debug_addr.clone(), err))?;

    let server = tokio::spawn(async move {
        let builder = match Server::try_bind(&addr) {
            Ok(builder) => builder,
            Err(err) => {
                error!(error = %err, "could not bind telemetry http server");
                return;
            }
        };

        let server = builder.serve(make_service_fn(|_| async {
            Ok::<_, std::convert::Infallible>(service_fn(router))
        }));

        info!(addr = %addr, "telemetry http server listening");
        if let Err(err) = server.await {
            error!(error = %err, "telemetry http server failed");
        }
    });

    wait_for_shutdown_signal().await.map_err(DaemonError::Signal)?;
    info!("received shutdown signal, stopping");

    discovery.abort();
    manager_task.abort();
    server.abort();

    Ok(())
}

/// resolves once either SIGINT or SIGTERM is received.
async fn wait_for_shutdown_signal() -> Result<(), io::Error> {
    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => Ok(()),
        _ = terminate.recv() => Ok(()),
    }
}
