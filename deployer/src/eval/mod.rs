//! NixOS configuration evaluation
//!
//! Turns a configuration into the inputs a deploy needs: derivation and
//! output paths, binary cache trust settings and the deployer's system.
//! The same inputs always give the same result, so callers may cache it.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::errors::DeployError;
use crate::session::runner::{CommandOutput, CommandRunner, CommandSpec};

const INSTANTIATE_EXPR: &str = include_str!("../../scripts/instantiate.nix");

/// Evaluation inputs
#[derive(Debug, Clone, Default)]
pub struct EvalRequest {
    /// `NIX_PATH` override
    pub nix_path: Option<String>,

    /// Path to a configuration file, or a Nix expression
    pub configuration: String,

    /// Directory relative paths in the configuration resolve against
    pub config_pwd: Option<PathBuf>,

    /// System to evaluate for, e.g. `aarch64-linux`
    pub target_system: String,

    /// Resolve nixpkgs through `<nixos>` instead of `<nixpkgs/nixos>`
    pub hermetic: bool,

    /// Extra `nix-instantiate` arguments
    pub extra_args: Vec<String>,
}

/// Evaluation output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvalResult {
    pub drv_path: String,
    pub out_path: String,

    /// Space-separated substituter URLs
    #[serde(default)]
    pub substituters: String,

    /// Space-separated signing keys
    #[serde(rename = "trusted-public-keys", default)]
    pub trusted_public_keys: String,

    /// System of the machine that evaluated
    #[serde(rename = "currentSystem")]
    pub current_system: String,
}

impl EvalResult {
    /// `--option` pairs that let the build use the configuration's caches
    pub fn cache_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if !self.substituters.trim().is_empty() {
            args.extend([
                "--option".to_string(),
                "extra-substituters".to_string(),
                self.substituters.trim().to_string(),
            ]);
        }
        if !self.trusted_public_keys.trim().is_empty() {
            args.extend([
                "--option".to_string(),
                "extra-trusted-public-keys".to_string(),
                self.trusted_public_keys.trim().to_string(),
            ]);
        }
        args
    }
}

/// Instantiate the configuration, then evaluate its deploy attributes
pub async fn evaluate(
    runner: &dyn CommandRunner,
    request: &EvalRequest,
) -> Result<EvalResult, DeployError> {
    let base = instantiate_command(request).await?;

    info!("Instantiating {}", request.configuration);
    let instantiate = base.clone().args(["-A", "out_path"]);
    check(runner.run(&instantiate).await, "instantiation")?;

    info!("Evaluating {}", request.configuration);
    let eval = base.args(["--eval", "--strict", "--json"]);
    let output = check(runner.run(&eval).await, "evaluation")?;

    serde_json::from_str(output.stdout.trim())
        .map_err(|e| DeployError::EvalError(format!("Unexpected evaluation output: {}", e)))
}

async fn instantiate_command(request: &EvalRequest) -> Result<CommandSpec, DeployError> {
    let mut cmd = CommandSpec::new("nix-instantiate")
        .args(["--show-trace", "--expr", INSTANTIATE_EXPR])
        .args(["--argstr", "system", request.target_system.as_str()]);

    let pwd = match &request.config_pwd {
        Some(dir) => tokio::fs::canonicalize(dir).await.map_err(|e| {
            DeployError::EvalError(format!("Invalid configuration directory {:?}: {}", dir, e))
        })?,
        None => std::env::current_dir()?,
    };

    // A file is passed by path, anything else as an expression
    let config_file = pwd.join(&request.configuration);
    cmd = if tokio::fs::metadata(&config_file).await.map(|m| m.is_file()).unwrap_or(false) {
        let config_file = tokio::fs::canonicalize(&config_file).await?;
        cmd.args(["--argstr", "configuration"])
            .arg(config_file.display().to_string())
    } else {
        cmd.args(["--arg", "configuration", request.configuration.as_str()])
    };

    if request.hermetic {
        cmd = cmd.args(["--arg", "hermetic", "true"]);
    }
    cmd = cmd.args(request.extra_args.iter().cloned());

    if let Some(nix_path) = request.nix_path.as_ref().filter(|p| !p.is_empty() && *p != "-") {
        cmd = cmd.env("NIX_PATH", nix_path.clone());
    }
    Ok(cmd.current_dir(pwd))
}

fn check(
    result: std::io::Result<CommandOutput>,
    step: &str,
) -> Result<CommandOutput, DeployError> {
    let output = result
        .map_err(|e| DeployError::EvalError(format!("Failed to run nix-instantiate: {}", e)))?;
    if !output.success() {
        return Err(DeployError::EvalError(format!(
            "Configuration {} failed: {}",
            step,
            output.describe_failure()
        )));
    }
    Ok(output)
}
