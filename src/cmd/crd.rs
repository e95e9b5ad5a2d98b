//! # Custom resource definition command module
//!
//! Prints the `GenericController` and `ControllerRevision` custom resource
//! definitions as YAML, the way cluster operators install the CRDs a
//! metac deployment depends on before the controller manager itself runs.

use kube::CustomResourceExt;

use crate::svc::model::{ControllerRevision, GenericController};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to serialize custom resource definition, {0}")]
    Serialize(serde_yaml::Error),
}

/// prints every custom resource definition metac owns, separated by the
/// yaml document marker so the output can be piped straight to `kubectl
/// apply -f -`.
pub fn view() -> Result<(), Error> {
    let crds = vec![
        serde_yaml::to_string(&GenericController::crd()).map_err(Error::Serialize)?,
        serde_yaml::to_string(&ControllerRevision::crd()).map_err(Error::Serialize)?,
    ];

    print!("{}", crds.join("---\n"));
    Ok(())
}
