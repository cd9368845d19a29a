//! Error types for nixdeploy

use thiserror::Error;

/// Main error type for a deploy run.
///
/// Every variant except [`DeployError::ActivationError`] is raised before the
/// profile on the target moves, so the running system is untouched.
#[derive(Error, Debug)]
pub enum DeployError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Transfer error: {0}")]
    TransferError(String),

    #[error("Build error: {0}")]
    BuildError(String),

    #[error("Unpack error: {0}")]
    UnpackError(String),

    #[error("Profile error: {0}")]
    ProfileError(String),

    #[error(
        "Activation partially applied: profile {profile} now points at {out_path}, \
         but activation failed: {reason}"
    )]
    ActivationError {
        profile: String,
        out_path: String,
        reason: String,
    },

    #[error("Evaluation error: {0}")]
    EvalError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Deploy interrupted during {0}")]
    Interrupted(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl DeployError {
    /// True when the target profile already points at the new system but the
    /// activation script failed. Needs manual remediation.
    pub fn is_partial_activation(&self) -> bool {
        matches!(self, DeployError::ActivationError { .. })
    }

    /// Process exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            DeployError::ActivationError { .. } => 2,
            DeployError::Interrupted(_) => 130,
            _ => 1,
        }
    }
}

impl From<anyhow::Error> for DeployError {
    fn from(err: anyhow::Error) -> Self {
        DeployError::Internal(err.to_string())
    }
}
