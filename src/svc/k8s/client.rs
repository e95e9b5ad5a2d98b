//! # Client module
//!
//! This module provide an helper to create a kubernetes client

use std::{path::PathBuf, time::Duration};

use kube::{
    client::ConfigExt,
    config::{KubeConfigOptions, Kubeconfig, KubeconfigError},
    Config,
};
use tower::{buffer::BufferLayer, limit::RateLimitLayer, ServiceBuilder};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to read kubernetes configuration file, {0}")]
    Kubeconfig(KubeconfigError),
    #[error("failed to infer in-cluster configuration, {0}")]
    InCluster(kube::config::InClusterError),
    #[error("failed to parse apiserver url '{0}'")]
    InvalidUrl(String),
    #[error("failed to build https connector, {0}")]
    Connector(kube::Error),
    #[error("failed to create kubernetes client, {0}")]
    CreateClient(kube::Error),
}

/// the `client-go-qps`/`client-go-burst` pair this process was started with,
/// bounding the sustained request rate and the allowed burst above it.
#[derive(Clone, Copy, Debug)]
pub struct RateLimit {
    pub qps: f32,
    pub burst: u32,
}

#[cfg_attr(feature = "trace", tracing::instrument)]
/// returns a new kubernetes client from the given path if defined, or
/// falls back to in-cluster credentials / the default kubeconfig search
/// path. When `apiserver_url` is given it overrides the cluster url the
/// resolved configuration would otherwise point at, letting a process
/// reuse its ambient credentials against a different endpoint. Requests are
/// rate limited client-side per `rate_limit`, mirroring client-go's
/// QPS/burst pair, since `kube`'s own client applies no rate limiting of its
/// own.
pub async fn try_new(
    path: Option<PathBuf>,
    apiserver_url: Option<&str>,
    rate_limit: RateLimit,
) -> Result<kube::Client, Error> {
    let mut config = match path {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path).map_err(Error::Kubeconfig)?;
            Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .map_err(Error::Kubeconfig)?
        }
        None => match Kubeconfig::read() {
            Ok(kubeconfig) => Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .map_err(Error::Kubeconfig)?,
            Err(_) => Config::incluster().map_err(Error::InCluster)?,
        },
    };

    if let Some(url) = apiserver_url {
        config.cluster_url = url
            .parse()
            .map_err(|_| Error::InvalidUrl(url.to_string()))?;
    }

    let https = config.rustls_https_connector().map_err(Error::Connector)?;
    let default_namespace = config.default_namespace.clone();

    // a non-positive qps disables rate limiting entirely rather than
    // dividing by zero or blocking every request forever.
    let qps = rate_limit.qps.max(0.0);
    let burst = rate_limit.burst.max(1);

    let service = if qps > 0.0 {
        ServiceBuilder::new()
            .layer(config.base_uri_layer())
            .option_layer(config.auth_layer().map_err(Error::CreateClient)?)
            .layer(BufferLayer::new(1024))
            .layer(RateLimitLayer::new(burst as u64, Duration::from_secs_f32(burst as f32 / qps)))
            .service(hyper::Client::builder().build(https))
    } else {
        ServiceBuilder::new()
            .layer(config.base_uri_layer())
            .option_layer(config.auth_layer().map_err(Error::CreateClient)?)
            .layer(BufferLayer::new(1024))
            .layer(RateLimitLayer::new(u64::MAX, Duration::from_nanos(1)))
            .service(hyper::Client::builder().build(https))
    };

    Ok(kube::Client::new(service, default_namespace))
}
