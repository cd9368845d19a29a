//! Command line parsing
//!
//! Two front ends produce the same [`DeployRequest`]:
//! `nixdeploy run <positional...>` follows the fixed positional contract,
//! `nixdeploy deploy --key=value ... [-- build options]` uses named flags.

use std::collections::HashMap;
use std::path::PathBuf;

use crate::errors::DeployError;
use crate::eval::{EvalRequest, EvalResult};
use crate::models::request::{
    parse_bool, parse_port, DeployRequest, RetentionPolicy, TargetAddress,
};
use crate::models::secrets::SecretBundle;
use crate::utils::host_system;

/// Default for `--retention`: keep only the newest generation
pub const DEFAULT_RETENTION: &str = "+1";

pub const USAGE: &str = "\
Usage:
  nixdeploy run <drv> <out> <user@host> <port> <build-on-target> <secrets-json> \
<action> <retention> <gc> <verbose> [build options...]
  nixdeploy deploy --target=<user@host> (--drv=<path> | --nixos-config=<file|expr>) [flags] [-- build options...]
  nixdeploy --version

Deploy flags:
  --port=22 --out=<path> --build-on-target --secrets-file=<json> --action=switch
  --retention=+1 --gc=true --verbose --local-system=<sys> --target-system=<sys>
  --config=<settings.json> --log-level=info --ssh-key-file=<path>
Evaluation flags:
  --nixos-config=<file|expr> --nix-path=<NIX_PATH> --config-pwd=<dir> --hermetic
  --eval-args=\"<extra nix-instantiate args>\"
Environment:
  NIXDEPLOY_SSH_PRIVATE_KEY  inline SSH private key";

/// Top-level command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Version,
    Help,
    /// Positional contract, arguments after `run`
    Positional(Vec<String>),
    /// Named flags
    Deploy(CliArgs),
}

/// Parsed `--key=value` flags plus everything after a bare `--`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CliArgs {
    pub flags: HashMap<String, String>,
    pub passthrough: Vec<String>,
}

impl CliArgs {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.flags.get(key).map(String::as_str)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.flags.contains_key(key)
    }

    /// Boolean flag; a bare `--name` means true
    pub fn bool_flag(&self, key: &str, default: bool) -> Result<bool, DeployError> {
        match self.get(key) {
            Some(value) => parse_bool(key, value),
            None => Ok(default),
        }
    }
}

/// Classify the arguments (program name excluded)
pub fn parse_command(args: &[String]) -> Command {
    match args.first().map(String::as_str) {
        Some("run") => Command::Positional(args[1..].to_vec()),
        Some("deploy") => Command::Deploy(parse_flags(&args[1..])),
        Some("help") | Some("--help") | Some("-h") | None => Command::Help,
        Some(_) => {
            let cli = parse_flags(args);
            if cli.contains("version") {
                Command::Version
            } else if cli.contains("help") {
                Command::Help
            } else {
                Command::Deploy(cli)
            }
        }
    }
}

/// Parse `--key=value` and bare `--flag` arguments. Anything after `--` is
/// kept verbatim as pass-through build options.
pub fn parse_flags(args: &[String]) -> CliArgs {
    let mut cli = CliArgs::default();
    let mut iter = args.iter();

    while let Some(arg) = iter.next() {
        if arg == "--" {
            cli.passthrough = iter.cloned().collect();
            break;
        }
        if let Some((key, value)) = arg.split_once('=') {
            let clean_key = key.trim_start_matches('-');
            cli.flags.insert(clean_key.to_string(), value.to_string());
        } else if arg.starts_with("--") {
            let clean_key = arg.trim_start_matches('-');
            cli.flags.insert(clean_key.to_string(), "true".to_string());
        }
    }

    cli
}

/// Evaluation inputs, when `--nixos-config` is given
pub fn eval_request_from_flags(cli: &CliArgs) -> Result<Option<EvalRequest>, DeployError> {
    let Some(configuration) = cli.get("nixos-config") else {
        return Ok(None);
    };

    Ok(Some(EvalRequest {
        nix_path: cli.get("nix-path").map(str::to_string),
        configuration: configuration.to_string(),
        config_pwd: cli.get("config-pwd").map(PathBuf::from),
        target_system: cli
            .get("target-system")
            .map(str::to_string)
            .unwrap_or_else(host_system),
        hermetic: cli.bool_flag("hermetic", false)?,
        extra_args: cli
            .get("eval-args")
            .map(|args| args.split_whitespace().map(str::to_string).collect())
            .unwrap_or_default(),
    }))
}

/// Build a request from named flags, the optional evaluation result and
/// the already-loaded secrets
pub fn request_from_flags(
    cli: &CliArgs,
    eval: Option<&EvalResult>,
    secrets: SecretBundle,
) -> Result<DeployRequest, DeployError> {
    let destination = cli
        .get("target")
        .ok_or_else(|| DeployError::ValidationError("Missing --target=<user@host>".to_string()))?;
    let port = match cli.get("port") {
        Some(port) => parse_port(port)?,
        None => TargetAddress::DEFAULT_PORT,
    };
    let target = TargetAddress::parse(destination, port)?;

    let build_plan = match (cli.get("drv"), eval) {
        (Some(drv), _) => drv.to_string(),
        (None, Some(eval)) => eval.drv_path.clone(),
        (None, None) => {
            return Err(DeployError::ValidationError(
                "Missing --drv=<path> or --nixos-config=<file|expr>".to_string(),
            ))
        }
    };

    let mut request = DeployRequest::new(build_plan, target);
    request.output_path = cli
        .get("out")
        .map(str::to_string)
        .or_else(|| eval.map(|e| e.out_path.clone()));
    request.build_on_target = cli.bool_flag("build-on-target", false)?;
    request.secrets = secrets;
    if let Some(action) = cli.get("action") {
        request.action = action.parse()?;
    }
    request.retention = RetentionPolicy::parse(cli.get("retention").unwrap_or(DEFAULT_RETENTION))?;
    request.perform_gc = cli.bool_flag("gc", true)?;
    request.verbose = cli.bool_flag("verbose", false)?;

    if let Some(eval) = eval {
        request.local_system = eval.current_system.clone();
        request.extra_build_options = eval.cache_args();
    }
    if let Some(system) = cli.get("local-system") {
        request.local_system = system.to_string();
    }
    if let Some(system) = cli.get("target-system") {
        request.target_system = system.to_string();
    }
    request
        .extra_build_options
        .extend(cli.passthrough.iter().cloned());

    request.validate()?;
    Ok(request)
}
