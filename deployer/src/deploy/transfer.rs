//! Artifact transfer: realise the system closure and get it onto the target

use std::fmt;

use tracing::info;

use crate::app::options::TransferOptions;
use crate::deploy::strategy::BuildStrategy;
use crate::errors::DeployError;
use crate::session::runner::{CommandOutput, CommandRunner, CommandSpec};
use crate::session::ssh::{RemoteExec, Session};

/// A store path on its way to the target
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Artifact {
    /// Derivation, before realisation
    BuildPlan(String),
    /// Realised output
    OutputPath(String),
}

impl Artifact {
    pub fn store_path(&self) -> &str {
        match self {
            Artifact::BuildPlan(path) | Artifact::OutputPath(path) => path,
        }
    }
}

impl fmt::Display for Artifact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Artifact::BuildPlan(path) => write!(f, "build plan {}", path),
            Artifact::OutputPath(path) => write!(f, "output {}", path),
        }
    }
}

/// Make the target hold the realised output of `build_plan` and return its
/// store path. Runs exactly one of the two strategies. Nothing here touches
/// the target's profile.
pub async fn transfer(
    session: &Session,
    local: &dyn CommandRunner,
    strategy: BuildStrategy,
    build_plan: &str,
    build_args: &[String],
    options: &TransferOptions,
) -> Result<String, DeployError> {
    let plan = Artifact::BuildPlan(build_plan.to_string());

    let out_path = match strategy {
        BuildStrategy::BuildOnTarget => {
            push(session, &plan, options).await?;
            info!("Building on target");
            realize_on_target(session, build_plan, build_args).await?
        }
        BuildStrategy::BuildOnDeployer => {
            info!("Building locally");
            let out_path = realize_locally(local, build_plan, build_args).await?;
            push(session, &Artifact::OutputPath(out_path.clone()), options).await?;
            out_path
        }
    };

    info!("Target holds {}", out_path);
    Ok(out_path)
}

async fn push(
    session: &Session,
    artifact: &Artifact,
    options: &TransferOptions,
) -> Result<(), DeployError> {
    info!("Uploading {}", artifact);
    session.copy_closure(artifact.store_path(), options).await
}

/// `nix-store --realize` on the deployer
pub async fn realize_locally(
    local: &dyn CommandRunner,
    build_plan: &str,
    build_args: &[String],
) -> Result<String, DeployError> {
    let cmd = CommandSpec::new("nix-store")
        .arg("--realize")
        .arg(build_plan)
        .args(build_args.iter().cloned());
    let output = local.run(&cmd).await.map_err(|e| {
        DeployError::BuildError(format!("Failed to run nix-store: {}", e))
    })?;
    out_path_from(build_plan, &output)
}

/// `nix-store --realize` on the target
pub async fn realize_on_target(
    remote: &dyn RemoteExec,
    build_plan: &str,
    build_args: &[String],
) -> Result<String, DeployError> {
    let mut argv = vec![
        "nix-store".to_string(),
        "--realize".to_string(),
        build_plan.to_string(),
    ];
    argv.extend(build_args.iter().cloned());
    let output = remote.exec(&argv).await?;
    out_path_from(build_plan, &output)
}

fn out_path_from(build_plan: &str, output: &CommandOutput) -> Result<String, DeployError> {
    if !output.success() {
        return Err(DeployError::BuildError(format!(
            "Realising {} failed: {}",
            build_plan,
            output.describe_failure()
        )));
    }
    match output.last_line() {
        Some(path) if path.starts_with('/') => Ok(path.to_string()),
        _ => Err(DeployError::BuildError(format!(
            "Realising {} printed no output path",
            build_plan
        ))),
    }
}
