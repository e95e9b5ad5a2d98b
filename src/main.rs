//! # metac
//!
//! A meta-controller runtime that turns declarative `GenericController`
//! custom resources (or static config-mode manifests) into running
//! controllers that watch a parent resource and reconcile a set of owned
//! attachments against it.

use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};

use crate::{
    cmd::{daemon, Args, CommandError},
    svc::cfg::Configuration,
};

pub mod cmd;
pub mod logging;
pub mod svc;

// -----------------------------------------------------------------------------
// Error enumeration

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to execute command, {0}")]
    Command(#[from] CommandError),
    #[error("failed to initialize logging system, {0}")]
    Logging(#[from] logging::Error),
    #[error("failed to load configuration, {0}")]
    Configuration(#[from] svc::cfg::Error),
}

// -----------------------------------------------------------------------------
// main entrypoint

#[tokio::main]
async fn main() -> Result<(), Error> {
    let args = Args::parse();

    logging::initialize(args.verbosity as usize)?;

    let config = Arc::new(Configuration::try_from_args(&args)?);
    config.help();

    if args.check {
        println!("{} configuration is healthy!", env!("CARGO_PKG_NAME"));
        return Ok(());
    }

    let result = match &args.command {
        Some(cmd) => cmd.execute(config).await.map_err(Error::Command),
        None => daemon(config).await.map_err(|err| Error::Command(err.into())),
    };

    if let Err(err) = &result {
        error!(error = %err, "could not execute {} properly", env!("CARGO_PKG_NAME"));
        return result;
    }

    info!("{} halted!", env!("CARGO_PKG_NAME"));
    Ok(())
}
