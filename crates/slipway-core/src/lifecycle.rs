use crate::CoreError;
use slipway_store::DeploymentStatus;

/// Allowed status changes of a deployment record.
///
/// The forward path is `Pending -> Building -> Deploying -> Success`;
/// `Pending -> Success` completes a deployment with nothing to do. `Failed` is
/// reachable from every non-terminal state. Terminal states never change.
pub fn validate_transition(from: DeploymentStatus, to: DeploymentStatus) -> Result<(), CoreError> {
    use DeploymentStatus::{Building, Deploying, Failed, Pending, Success};

    let valid = matches!(
        (from, to),
        (Pending, Building | Success)
            | (Building, Deploying)
            | (Deploying, Success)
            | (Pending | Building | Deploying, Failed)
    );

    if valid {
        Ok(())
    } else {
        Err(CoreError::InvalidTransition {
            from: from.to_string(),
            to: to.to_string(),
        })
    }
}
