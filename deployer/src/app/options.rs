//! Deploy configuration options
//!
//! Built once from [`Settings`] and passed explicitly to each stage.

use std::path::PathBuf;
use std::time::Duration;

use secrecy::SecretString;
use serde::{Deserialize, Serialize};

use crate::storage::settings::Settings;

/// Main deploy options
#[derive(Debug, Clone)]
pub struct DeployOptions {
    /// SSH session configuration
    pub ssh: SshOptions,

    /// Profile the new system is installed into
    pub profile_path: String,

    /// Closure copy configuration
    pub transfer: TransferOptions,

    /// Options always passed to `nix-store --realize`, before request options
    pub build_args: Vec<String>,
}

impl Default for DeployOptions {
    fn default() -> Self {
        Self::from_settings(&Settings::default())
    }
}

impl DeployOptions {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            ssh: SshOptions {
                host_key_policy: settings.ssh.host_key_policy,
                control_persist: Duration::from_secs(settings.ssh.control_persist_secs),
                identity_file: settings.ssh.identity_file.clone(),
                identity_key: None,
                use_agent: settings.ssh.use_agent,
                extra_options: settings.ssh.extra_options.clone(),
                verbose: false,
            },
            profile_path: settings.profile_path.clone(),
            transfer: TransferOptions {
                gzip: settings.nix.gzip,
                use_substitutes: settings.nix.use_substitutes,
            },
            build_args: settings.nix.build_args.clone(),
        }
    }
}

/// How the target's host key is verified
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HostKeyPolicy {
    /// No verification and no known-hosts bookkeeping. Trust in the address
    /// comes from the caller. Suits freshly provisioned hosts whose IPs get
    /// reused.
    #[default]
    Disabled,
    /// Record unknown keys, refuse changed ones
    AcceptNew,
    /// Only connect to hosts already in known_hosts
    Strict,
}

impl HostKeyPolicy {
    /// `ssh -o` options implementing the policy
    pub fn ssh_options(&self) -> Vec<String> {
        match self {
            HostKeyPolicy::Disabled => vec![
                "StrictHostKeyChecking=no".to_string(),
                "UserKnownHostsFile=/dev/null".to_string(),
                "GlobalKnownHostsFile=/dev/null".to_string(),
            ],
            HostKeyPolicy::AcceptNew => vec!["StrictHostKeyChecking=accept-new".to_string()],
            HostKeyPolicy::Strict => vec!["StrictHostKeyChecking=yes".to_string()],
        }
    }
}

/// SSH session options
#[derive(Debug, Clone)]
pub struct SshOptions {
    pub host_key_policy: HostKeyPolicy,

    /// How long the control master outlives its last client
    pub control_persist: Duration,

    /// Private key file on disk
    pub identity_file: Option<PathBuf>,

    /// Inline private key, written to the session scratch dir
    pub identity_key: Option<SecretString>,

    /// Allow keys from a running ssh-agent
    pub use_agent: bool,

    /// Extra raw `ssh` arguments
    pub extra_options: Vec<String>,

    /// Pass `-v` to ssh
    pub verbose: bool,
}

impl Default for SshOptions {
    fn default() -> Self {
        DeployOptions::default().ssh
    }
}

/// `nix-copy-closure` options
#[derive(Debug, Clone, Copy)]
pub struct TransferOptions {
    pub gzip: bool,
    pub use_substitutes: bool,
}

impl Default for TransferOptions {
    fn default() -> Self {
        Self {
            gzip: true,
            use_substitutes: true,
        }
    }
}

impl TransferOptions {
    pub fn to_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if self.gzip {
            args.push("--gzip".to_string());
        }
        if self.use_substitutes {
            args.push("--use-substitutes".to_string());
        }
        args
    }
}
