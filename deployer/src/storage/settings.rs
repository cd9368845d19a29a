//! Settings file management

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::app::options::HostKeyPolicy;
use crate::errors::DeployError;
use crate::filesys::file::File;
use crate::logs::LogLevel;

/// Deployer settings, read from a JSON file given with `--config`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Log level
    #[serde(default)]
    pub log_level: LogLevel,

    /// Emit JSON logs on stderr
    #[serde(default)]
    pub log_json: bool,

    /// Directory for a plain-text log file
    #[serde(default)]
    pub log_dir: Option<PathBuf>,

    /// SSH configuration
    #[serde(default)]
    pub ssh: SshSettings,

    /// Profile the new system is installed into
    #[serde(default = "default_profile_path")]
    pub profile_path: String,

    /// Nix invocation configuration
    #[serde(default)]
    pub nix: NixSettings,
}

fn default_true() -> bool {
    true
}

fn default_profile_path() -> String {
    "/nix/var/nix/profiles/system".to_string()
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_level: LogLevel::Info,
            log_json: false,
            log_dir: None,
            ssh: SshSettings::default(),
            profile_path: default_profile_path(),
            nix: NixSettings::default(),
        }
    }
}

impl Settings {
    /// Load settings from `file`. A missing file is an error: defaults
    /// would silently relax the host key policy.
    pub async fn load(file: &File) -> Result<Self, DeployError> {
        if !file.exists().await {
            return Err(DeployError::ConfigError(format!(
                "Settings file {:?} does not exist",
                file.path()
            )));
        }
        debug!("Loading settings from {:?}", file.path());
        file.read_json::<Settings>().await.map_err(|e| {
            DeployError::ConfigError(format!("Unable to read {:?}: {}", file.path(), e))
        })
    }
}

/// SSH settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshSettings {
    /// How the target's host key is checked
    #[serde(default)]
    pub host_key_policy: HostKeyPolicy,

    /// Seconds the control master lingers after the last client exits
    #[serde(default = "default_control_persist")]
    pub control_persist_secs: u64,

    /// Private key file passed as `IdentityFile`
    #[serde(default)]
    pub identity_file: Option<PathBuf>,

    /// Allow keys from a running ssh-agent
    #[serde(default = "default_true")]
    pub use_agent: bool,

    /// Extra raw `ssh` arguments, e.g. `["-o", "ConnectTimeout=10"]`
    #[serde(default)]
    pub extra_options: Vec<String>,
}

fn default_control_persist() -> u64 {
    60
}

impl Default for SshSettings {
    fn default() -> Self {
        Self {
            host_key_policy: HostKeyPolicy::default(),
            control_persist_secs: default_control_persist(),
            identity_file: None,
            use_agent: true,
            extra_options: Vec::new(),
        }
    }
}

/// Nix settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NixSettings {
    /// Options always passed to `nix-store --realize`
    #[serde(default = "default_build_args")]
    pub build_args: Vec<String>,

    /// Compress closures in transit
    #[serde(default = "default_true")]
    pub gzip: bool,

    /// Let the target fetch paths from its substituters
    #[serde(default = "default_true")]
    pub use_substitutes: bool,
}

fn default_build_args() -> Vec<String> {
    vec![
        "--option".to_string(),
        "extra-binary-caches".to_string(),
        "https://cache.nixos.org/".to_string(),
    ]
}

impl Default for NixSettings {
    fn default() -> Self {
        Self {
            build_args: default_build_args(),
            gzip: true,
            use_substitutes: true,
        }
    }
}
