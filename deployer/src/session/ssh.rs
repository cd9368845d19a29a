//! SSH session over one multiplexed connection
//!
//! The session opens an OpenSSH control master in a private scratch
//! directory, and every later `ssh`, `scp` and `nix-copy-closure` call
//! rides on it. Remote commands run through a small privilege shim
//! uploaded into a per-session remote work directory.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use secrecy::ExposeSecret;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::app::options::{HostKeyPolicy, SshOptions, TransferOptions};
use crate::errors::DeployError;
use crate::filesys::dir::Dir;
use crate::filesys::file::File;
use crate::models::request::TargetAddress;
use crate::session::quote::{quote, quote_argv};
use crate::session::runner::{CommandOutput, CommandRunner, CommandSpec};

/// Runs the given command as root, via sudo unless already root
pub const SHIM_NAME: &str = "maybe-sudo.sh";
const SHIM_SCRIPT: &str = include_str!("../../scripts/maybe-sudo.sh");

const SCRATCH_PREFIX: &str = "nixdeploy";
const CONTROL_SOCKET: &str = "ctl";
const IDENTITY_FILE: &str = "ssh_key";

/// Narrow interface for running privileged commands on the target
#[async_trait]
pub trait RemoteExec: Send + Sync {
    /// Run `argv` on the target through the privilege shim.
    ///
    /// Arguments reach the remote program unchanged, whatever they contain.
    /// A non-zero exit is returned in the output, not as an error.
    async fn exec(&self, argv: &[String]) -> Result<CommandOutput, DeployError>;
}

/// One deploy's connection to the target
pub struct Session {
    runner: Arc<dyn CommandRunner>,
    target: TargetAddress,
    ssh_args: Vec<String>,
    scratch: Dir,
    remote_dir: OnceCell<String>,
    /// Set once the probe was spawned; the control master may exist from then on
    master_started: AtomicBool,
    closed: bool,
}

impl Session {
    /// Prepare a session: scratch directory, identity file and ssh options.
    /// Nothing reaches the target until [`Session::connect`].
    pub async fn create(
        runner: Arc<dyn CommandRunner>,
        target: &TargetAddress,
        options: &SshOptions,
    ) -> Result<Self, DeployError> {
        if options.host_key_policy == HostKeyPolicy::Disabled {
            warn!("Host key verification is disabled for {}", target.host);
        }

        let scratch = Dir::create_temp_dir(SCRATCH_PREFIX).await?;
        let mut session = Self {
            runner,
            target: target.clone(),
            ssh_args: Vec::new(),
            scratch,
            remote_dir: OnceCell::new(),
            master_started: AtomicBool::new(false),
            closed: false,
        };
        match session.build_ssh_args(options).await {
            Ok(args) => session.ssh_args = args,
            Err(e) => {
                session.close().await;
                return Err(e);
            }
        }
        Ok(session)
    }

    async fn build_ssh_args(&self, options: &SshOptions) -> Result<Vec<String>, DeployError> {
        let identity = match &options.identity_key {
            Some(key) => {
                let file = self.scratch.file(IDENTITY_FILE);
                let mut contents = key.expose_secret().to_string();
                if !contents.ends_with('\n') {
                    contents.push('\n');
                }
                file.write_with_mode(contents.as_bytes(), 0o600).await?;
                Some(file.path().to_path_buf())
            }
            None => None,
        };

        let mut args = vec![
            "-o".to_string(),
            "ControlMaster=auto".to_string(),
            "-o".to_string(),
            format!(
                "ControlPath={}",
                self.scratch.path().join(CONTROL_SOCKET).display()
            ),
            "-o".to_string(),
            format!("ControlPersist={}", options.control_persist.as_secs()),
        ];
        for option in options.host_key_policy.ssh_options() {
            args.push("-o".to_string());
            args.push(option);
        }
        args.push("-o".to_string());
        args.push("BatchMode=yes".to_string());
        for path in identity.iter().chain(options.identity_file.iter()) {
            args.push("-o".to_string());
            args.push(format!("IdentityFile={}", path.display()));
        }
        if !options.use_agent {
            args.push("-o".to_string());
            args.push("IdentityAgent=none".to_string());
            args.push("-o".to_string());
            args.push("IdentitiesOnly=yes".to_string());
        }
        args.extend(options.extra_options.iter().cloned());
        if options.verbose {
            args.push("-v".to_string());
        }

        // NIX_SSHOPTS is split on whitespace by nix-copy-closure
        if let Some(arg) = args.iter().find(|arg| arg.contains(char::is_whitespace)) {
            return Err(DeployError::ConfigError(format!(
                "SSH option {:?} contains whitespace, which nix-copy-closure cannot pass through",
                arg
            )));
        }
        Ok(args)
    }

    /// Start the control master and check the target answers
    pub async fn connect(&self) -> Result<(), DeployError> {
        info!("Opening SSH session to {}", self.target);
        self.master_started.store(true, Ordering::SeqCst);

        let probe = self.exec_raw("true").await?;
        if !probe.success() {
            return Err(DeployError::ConnectionError(format!(
                "Unable to reach {}: {}",
                self.target,
                probe.describe_failure()
            )));
        }
        info!("Connected to {}", self.target);
        Ok(())
    }

    pub fn target(&self) -> &TargetAddress {
        &self.target
    }

    /// Local private directory for files staged for upload
    pub fn scratch(&self) -> &Dir {
        &self.scratch
    }

    /// Options understood by both `ssh` and `scp`, without the port
    pub fn ssh_args(&self) -> &[String] {
        &self.ssh_args
    }

    /// Remote work directory, created (with the shim inside) on first use
    pub async fn remote_dir(&self) -> Result<&str, DeployError> {
        self.remote_dir
            .get_or_try_init(|| self.init_remote_dir())
            .await
            .map(String::as_str)
    }

    async fn init_remote_dir(&self) -> Result<String, DeployError> {
        let output = self.exec_raw("mktemp -d -t nixdeploy.XXXXXXXX").await?;
        let dir = match output.last_line() {
            Some(dir) if output.success() && dir.starts_with('/') => dir.to_string(),
            _ => {
                return Err(DeployError::TransferError(format!(
                    "Unable to create remote work directory: {}",
                    output.describe_failure()
                )))
            }
        };
        debug!("Remote work directory: {}", dir);

        let shim = self.scratch.file(SHIM_NAME);
        shim.write_with_mode(SHIM_SCRIPT.as_bytes(), 0o755).await?;
        self.scp(&[shim], &dir).await?;

        Ok(dir)
    }

    /// Copy local files into the remote work directory, keeping their modes.
    /// Returns the remote paths in input order.
    pub async fn upload(&self, files: &[File]) -> Result<Vec<String>, DeployError> {
        let dir = self.remote_dir().await?;
        self.scp(files, dir).await?;
        Ok(files
            .iter()
            .map(|file| format!("{}/{}", dir, file.name()))
            .collect())
    }

    async fn scp(&self, files: &[File], remote_dir: &str) -> Result<(), DeployError> {
        let cmd = CommandSpec::new("scp")
            .arg("-p")
            .args(self.ssh_args.iter().cloned())
            .args(["-P".to_string(), self.target.port.to_string()])
            .args(files.iter().map(|f| f.path().display().to_string()))
            .arg(self.target.scp_destination(&format!("{}/", remote_dir)));

        let output = self.run(&cmd).await?;
        if !output.success() {
            return Err(DeployError::TransferError(format!(
                "Upload to {} failed: {}",
                self.target,
                output.describe_failure()
            )));
        }
        Ok(())
    }

    /// Copy `store_path` and whatever part of its closure the target lacks
    pub async fn copy_closure(
        &self,
        store_path: &str,
        options: &TransferOptions,
    ) -> Result<(), DeployError> {
        let mut sshopts = self.ssh_args.clone();
        sshopts.push("-p".to_string());
        sshopts.push(self.target.port.to_string());

        let cmd = CommandSpec::new("nix-copy-closure")
            .env("NIX_SSHOPTS", sshopts.join(" "))
            .arg("--to")
            .arg(self.target.destination())
            .args(options.to_args())
            .arg(store_path);

        let output = self.run(&cmd).await?;
        if !output.success() {
            return Err(DeployError::TransferError(format!(
                "Copying {} to {} failed: {}",
                store_path,
                self.target,
                output.describe_failure()
            )));
        }
        Ok(())
    }

    /// Run a shell command string on the target without the shim
    async fn exec_raw(&self, command: &str) -> Result<CommandOutput, DeployError> {
        let cmd = self
            .ssh_command()
            .arg(self.target.destination())
            .arg("--")
            .arg(command);
        self.run(&cmd).await
    }

    fn ssh_command(&self) -> CommandSpec {
        CommandSpec::new("ssh")
            .args(self.ssh_args.iter().cloned())
            .args(["-p".to_string(), self.target.port.to_string()])
    }

    async fn run(&self, cmd: &CommandSpec) -> Result<CommandOutput, DeployError> {
        debug!("{}", cmd);
        self.runner.run(cmd).await.map_err(|e| {
            DeployError::ConnectionError(format!("Failed to run {}: {}", cmd.program, e))
        })
    }

    /// Tear the session down: remote work dir, control master, local
    /// scratch. Every step is best effort.
    pub async fn close(mut self) {
        if let Some(dir) = self.remote_dir.get() {
            match self.exec_raw(&format!("rm -rf {}", quote(dir))).await {
                Ok(output) if output.success() => {}
                Ok(output) => warn!(
                    "Failed to remove remote work directory {}: {}",
                    dir,
                    output.describe_failure()
                ),
                Err(e) => warn!("Failed to remove remote work directory {}: {}", dir, e),
            }
        }

        if self.master_started.load(Ordering::SeqCst) {
            info!("Closing persistent SSH connection to {}", self.target);
            let cmd = self
                .ssh_command()
                .args(["-O", "exit"])
                .arg(self.target.destination());
            match self.run(&cmd).await {
                Ok(output) if output.success() => {}
                Ok(output) => warn!("Failed to stop SSH control master: {}", output.describe_failure()),
                Err(e) => warn!("Failed to stop SSH control master: {}", e),
            }
        }

        if let Err(e) = self.scratch.delete().await {
            warn!("Failed to remove scratch directory {:?}: {}", self.scratch.path(), e);
        }
        self.closed = true;
    }
}

#[async_trait]
impl RemoteExec for Session {
    async fn exec(&self, argv: &[String]) -> Result<CommandOutput, DeployError> {
        let dir = self.remote_dir().await?;
        let shim = format!("{}/{}", dir, SHIM_NAME);
        let command = format!("{} {}", quote(&shim), quote_argv(argv));
        self.exec_raw(&command).await
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if !self.closed {
            warn!("SSH session to {} dropped without close", self.target);
            if let Err(e) = self.scratch.delete_blocking() {
                warn!("Failed to remove scratch directory {:?}: {}", self.scratch.path(), e);
            }
        }
    }
}
