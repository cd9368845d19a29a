//! Deploy request and its parts

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::DeployError;
use crate::models::secrets::SecretBundle;
use crate::utils::host_system;

/// Number of fixed positional arguments before the pass-through build options
pub const POSITIONAL_ARGS: usize = 10;

/// SSH destination
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetAddress {
    pub user: String,
    pub host: String,
    pub port: u16,
}

impl TargetAddress {
    pub const DEFAULT_USER: &'static str = "root";
    pub const DEFAULT_PORT: u16 = 22;

    /// Parse `user@host` (or just `host`, which implies root)
    pub fn parse(destination: &str, port: u16) -> Result<Self, DeployError> {
        let (user, host) = match destination.rsplit_once('@') {
            Some((user, host)) => (user, host),
            None => (Self::DEFAULT_USER, destination),
        };
        let host = host.trim_start_matches('[').trim_end_matches(']');

        if user.is_empty() || host.is_empty() {
            return Err(DeployError::ValidationError(format!(
                "Invalid target {:?}: expected user@host",
                destination
            )));
        }
        if host.starts_with('-') || user.starts_with('-') {
            return Err(DeployError::ValidationError(format!(
                "Invalid target {:?}: must not start with '-'",
                destination
            )));
        }
        if destination.chars().any(char::is_whitespace) {
            return Err(DeployError::ValidationError(format!(
                "Invalid target {:?}: contains whitespace",
                destination
            )));
        }
        if port == 0 {
            return Err(DeployError::ValidationError("Port must be non-zero".to_string()));
        }

        Ok(Self {
            user: user.to_string(),
            host: host.to_string(),
            port,
        })
    }

    /// `user@host` as understood by `ssh` and `nix-copy-closure`
    pub fn destination(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }

    /// `user@host:path` for `scp`, bracketing IPv6 literals
    pub fn scp_destination(&self, remote_path: &str) -> String {
        if self.host.contains(':') {
            format!("{}@[{}]:{}", self.user, self.host, remote_path)
        } else {
            format!("{}@{}:{}", self.user, self.host, remote_path)
        }
    }
}

impl fmt::Display for TargetAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.destination(), self.port)
    }
}

/// Verb handed to `switch-to-configuration`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ActivationAction {
    /// Activate now and make it the boot default
    #[default]
    Switch,
    /// Make it the boot default only
    Boot,
    /// Activate now without touching the boot default
    Test,
    /// Print what would change
    DryActivate,
}

impl ActivationAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActivationAction::Switch => "switch",
            ActivationAction::Boot => "boot",
            ActivationAction::Test => "test",
            ActivationAction::DryActivate => "dry-activate",
        }
    }
}

impl FromStr for ActivationAction {
    type Err = DeployError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "switch" => Ok(ActivationAction::Switch),
            "boot" => Ok(ActivationAction::Boot),
            "test" => Ok(ActivationAction::Test),
            "dry-activate" => Ok(ActivationAction::DryActivate),
            _ => Err(DeployError::ValidationError(format!(
                "Invalid activation action {:?}: expected switch, boot, test or dry-activate",
                s
            ))),
        }
    }
}

impl fmt::Display for ActivationAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which old generations to delete after a successful activation.
///
/// Tokens are passed verbatim to `nix-env --delete-generations`; the remote
/// profile manager owns their meaning (`+5`, `old`, `30d`, `1 2 3`).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum RetentionPolicy {
    /// Delete nothing
    #[default]
    Keep,
    Delete(Vec<String>),
}

impl RetentionPolicy {
    pub fn parse(policy: &str) -> Result<Self, DeployError> {
        let tokens: Vec<String> = policy.split_whitespace().map(str::to_string).collect();
        if tokens.is_empty() || tokens == ["none"] {
            return Ok(RetentionPolicy::Keep);
        }
        if let Some(flag) = tokens.iter().find(|t| t.starts_with('-')) {
            return Err(DeployError::ValidationError(format!(
                "Invalid retention token {:?}: must not start with '-'",
                flag
            )));
        }
        Ok(RetentionPolicy::Delete(tokens))
    }
}

impl fmt::Display for RetentionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetentionPolicy::Keep => f.write_str("none"),
            RetentionPolicy::Delete(tokens) => f.write_str(&tokens.join(" ")),
        }
    }
}

/// Everything one deploy needs. Built once, never mutated.
#[derive(Debug, Clone)]
pub struct DeployRequest {
    /// Store path of the system derivation (`.drv`)
    pub build_plan: String,

    /// Output path the evaluator predicted, if known
    pub output_path: Option<String>,

    pub target: TargetAddress,

    /// Caller asks to build on the target even when systems match
    pub build_on_target: bool,

    pub secrets: SecretBundle,

    pub action: ActivationAction,

    pub retention: RetentionPolicy,

    /// Run `nix-store --gc` after pruning
    pub perform_gc: bool,

    /// Pass-through options for `nix-store --realize`
    pub extra_build_options: Vec<String>,

    pub verbose: bool,

    /// Nix system of the deployer (`currentSystem`)
    pub local_system: String,

    /// Nix system the configuration was evaluated for
    pub target_system: String,
}

impl DeployRequest {
    /// Request with defaults for everything but the plan and the target
    pub fn new(build_plan: impl Into<String>, target: TargetAddress) -> Self {
        let system = host_system();
        Self {
            build_plan: build_plan.into(),
            output_path: None,
            target,
            build_on_target: false,
            secrets: SecretBundle::new(),
            action: ActivationAction::default(),
            retention: RetentionPolicy::default(),
            perform_gc: false,
            extra_build_options: Vec::new(),
            verbose: false,
            local_system: system.clone(),
            target_system: system,
        }
    }

    /// Parse the positional invocation contract:
    ///
    /// `<drv> <out> <user@host> <port> <build-on-target> <secrets-json> <action>
    /// <retention> <gc> <verbose> [build options...]`
    ///
    /// The contract carries no system strings, so both default to the
    /// deployer's and the build-on-target flag decides the strategy.
    pub fn from_positional(args: &[String]) -> Result<Self, DeployError> {
        if args.len() < POSITIONAL_ARGS {
            return Err(DeployError::ValidationError(format!(
                "Expected at least {} positional arguments, got {}",
                POSITIONAL_ARGS,
                args.len()
            )));
        }

        let port = parse_port(&args[3])?;
        let target = TargetAddress::parse(&args[2], port)?;

        let mut request = Self::new(args[0].clone(), target);
        request.output_path = Some(args[1].clone()).filter(|p| !p.is_empty() && p != "-");
        request.build_on_target = parse_bool("build-on-target", &args[4])?;
        request.secrets = SecretBundle::from_json(&args[5])?;
        request.action = args[6].parse()?;
        request.retention = RetentionPolicy::parse(&args[7])?;
        request.perform_gc = parse_bool("gc", &args[8])?;
        request.verbose = parse_bool("verbose", &args[9])?;
        request.extra_build_options = args[POSITIONAL_ARGS..].to_vec();

        request.validate()?;
        Ok(request)
    }

    /// Check invariants that cannot be expressed in the field types
    pub fn validate(&self) -> Result<(), DeployError> {
        if !self.build_plan.starts_with('/') {
            return Err(DeployError::ValidationError(format!(
                "Build plan must be an absolute store path, got {:?}",
                self.build_plan
            )));
        }
        if let Some(out) = &self.output_path {
            if !out.starts_with('/') {
                return Err(DeployError::ValidationError(format!(
                    "Output path must be an absolute store path, got {:?}",
                    out
                )));
            }
        }
        if self.local_system.is_empty() || self.target_system.is_empty() {
            return Err(DeployError::ValidationError(
                "System strings must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Parse a boolean flag value
pub fn parse_bool(name: &str, value: &str) -> Result<bool, DeployError> {
    match value.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" | "" => Ok(false),
        _ => Err(DeployError::ValidationError(format!(
            "Invalid boolean for {}: {:?}",
            name, value
        ))),
    }
}

/// Parse an SSH port
pub fn parse_port(value: &str) -> Result<u16, DeployError> {
    match value.parse::<u16>() {
        Ok(port) if port > 0 => Ok(port),
        _ => Err(DeployError::ValidationError(format!("Invalid port: {:?}", value))),
    }
}
