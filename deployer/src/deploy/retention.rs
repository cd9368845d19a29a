//! Generation pruning and garbage collection
//!
//! Runs after a successful activation, so nothing here may fail the deploy.
//! Problems are logged and recorded in the report.

use std::fmt;

use serde::Serialize;
use tracing::{info, warn};

use crate::models::request::RetentionPolicy;
use crate::session::ssh::RemoteExec;

/// A non-fatal retention problem
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "message", rename_all = "lowercase")]
pub enum RetentionWarning {
    Prune(String),
    Gc(String),
}

impl fmt::Display for RetentionWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetentionWarning::Prune(msg) => write!(f, "generation pruning failed: {}", msg),
            RetentionWarning::Gc(msg) => write!(f, "garbage collection failed: {}", msg),
        }
    }
}

/// What the retention stage did
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PruneReport {
    pub generations_deleted: bool,
    pub gc_ran: bool,
    pub warnings: Vec<RetentionWarning>,
}

/// Delete old generations of `profile` and optionally collect garbage
pub async fn prune(
    remote: &dyn RemoteExec,
    profile: &str,
    retention: &RetentionPolicy,
    perform_gc: bool,
) -> PruneReport {
    let mut report = PruneReport::default();

    match retention {
        RetentionPolicy::Keep => info!("Keeping all generations of {}", profile),
        RetentionPolicy::Delete(tokens) => {
            info!("Deleting generations of {} ({})", profile, retention);
            let mut argv = vec![
                "nix-env".to_string(),
                "--profile".to_string(),
                profile.to_string(),
                "--delete-generations".to_string(),
            ];
            argv.extend(tokens.iter().cloned());
            match run(remote, &argv).await {
                Ok(()) => report.generations_deleted = true,
                Err(msg) => report.warnings.push(RetentionWarning::Prune(msg)),
            }
        }
    }

    if perform_gc {
        info!("Collecting garbage");
        let argv = vec!["nix-store".to_string(), "--gc".to_string()];
        match run(remote, &argv).await {
            Ok(()) => report.gc_ran = true,
            Err(msg) => report.warnings.push(RetentionWarning::Gc(msg)),
        }
    }

    for warning in &report.warnings {
        warn!("{}", warning);
    }
    report
}

async fn run(remote: &dyn RemoteExec, argv: &[String]) -> Result<(), String> {
    match remote.exec(argv).await {
        Ok(output) if output.success() => Ok(()),
        Ok(output) => Err(output.describe_failure()),
        Err(e) => Err(e.to_string()),
    }
}
