//! Secret provisioning
//!
//! Ships the packed bundle with its unpack helper and runs the helper as
//! root. Must finish before activation: activation scripts may read keys.

use tracing::{debug, info, warn};

use crate::errors::DeployError;
use crate::models::secrets::SecretBundle;
use crate::session::ssh::{RemoteExec, Session};

pub const UNPACK_HELPER_NAME: &str = "unpack-keys.sh";
const UNPACK_HELPER_SCRIPT: &str = include_str!("../../scripts/unpack-keys.sh");

pub const BUNDLE_NAME: &str = "packed-keys.json";

/// Upload and unpack `bundle` on the target.
///
/// An empty bundle is still shipped so stale keys get removed.
pub async fn provision(session: &Session, bundle: &SecretBundle) -> Result<(), DeployError> {
    info!(
        "Uploading {} secret(s), digest {}",
        bundle.len(),
        bundle.digest()?
    );
    debug!("Secret names: {:?}", bundle.names().collect::<Vec<_>>());

    let helper = session.scratch().file(UNPACK_HELPER_NAME);
    helper
        .write_with_mode(UNPACK_HELPER_SCRIPT.as_bytes(), 0o755)
        .await?;

    let packed = session.scratch().file(BUNDLE_NAME);
    packed
        .write_with_mode(bundle.to_json()?.as_bytes(), 0o600)
        .await?;

    let uploaded = session.upload(&[helper, packed.clone()]).await;
    // The plaintext copy is not needed once it is on the wire
    if let Err(e) = packed.delete().await {
        warn!("Failed to remove local copy {:?}: {}", packed.path(), e);
    }
    let remote_paths = uploaded?;

    info!("Unpacking secrets");
    let output = session.exec(&remote_paths).await?;
    if !output.success() {
        return Err(DeployError::UnpackError(format!(
            "{} failed: {}",
            UNPACK_HELPER_NAME,
            output.describe_failure()
        )));
    }
    Ok(())
}
