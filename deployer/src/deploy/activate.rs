//! Activation: point the profile at the new system, then switch to it

use tracing::{error, info};

use crate::errors::DeployError;
use crate::models::request::ActivationAction;
use crate::session::ssh::RemoteExec;

/// Set `profile` to `out_path` and run its `switch-to-configuration`.
///
/// If the second step fails the profile has already moved; this is reported
/// as [`DeployError::ActivationError`] and nothing is rolled back.
pub async fn activate(
    remote: &dyn RemoteExec,
    out_path: &str,
    profile: &str,
    action: ActivationAction,
) -> Result<(), DeployError> {
    info!("Setting profile {} to {}", profile, out_path);
    let argv = vec![
        "nix-env".to_string(),
        "--profile".to_string(),
        profile.to_string(),
        "--set".to_string(),
        out_path.to_string(),
    ];
    let output = remote.exec(&argv).await?;
    if !output.success() {
        return Err(DeployError::ProfileError(format!(
            "Setting {} to {} failed: {}",
            profile,
            out_path,
            output.describe_failure()
        )));
    }

    info!("Activating configuration ({})", action);
    let argv = vec![
        format!("{}/bin/switch-to-configuration", out_path),
        action.to_string(),
    ];
    let reason = match remote.exec(&argv).await {
        Ok(output) if output.success() => return Ok(()),
        Ok(output) => output.describe_failure(),
        Err(e) => e.to_string(),
    };

    error!(
        "Activation failed after {} was set to {}; manual intervention may be required",
        profile, out_path
    );
    Err(DeployError::ActivationError {
        profile: profile.to_string(),
        out_path: out_path.to_string(),
        reason,
    })
}
