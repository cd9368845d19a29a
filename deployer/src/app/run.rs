//! Deploy run
//!
//! Opens the session, drives the stages in order and closes the session on
//! every exit path, including interruption.

use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, info, warn};

use crate::app::options::DeployOptions;
use crate::deploy::activate::activate;
use crate::deploy::fsm::{DeployEvent, DeployFsm, DeployStage};
use crate::deploy::retention::{prune, PruneReport};
use crate::deploy::secrets::provision;
use crate::deploy::strategy::{select_strategy, BuildStrategy};
use crate::deploy::transfer::transfer;
use crate::errors::DeployError;
use crate::models::request::{ActivationAction, DeployRequest};
use crate::session::runner::CommandRunner;
use crate::session::ssh::Session;
use crate::utils::generate_uuid;

/// Result of a successful deploy, printed on stdout
#[derive(Debug, Clone, Serialize)]
pub struct DeployOutcome {
    /// Fresh identifier, so callers can tell that a deploy happened
    pub id: String,
    pub target: String,
    pub out_path: String,
    pub strategy: BuildStrategy,
    pub action: ActivationAction,
    pub prune: PruneReport,
    pub stages: Vec<DeployStage>,
    pub finished_at: DateTime<Utc>,
}

/// Deploy `request` to its target.
///
/// `shutdown_signal` resolving aborts the run with
/// [`DeployError::Interrupted`]; the session is still torn down.
pub async fn run(
    request: &DeployRequest,
    options: &DeployOptions,
    runner: Arc<dyn CommandRunner>,
    shutdown_signal: impl Future<Output = ()>,
) -> Result<DeployOutcome, DeployError> {
    info!(
        "Deploying {} to {} ({})",
        request.build_plan, request.target, request.action
    );
    request.validate()?;

    let mut fsm = DeployFsm::new();
    advance(&mut fsm, DeployEvent::Connect)?;

    let mut ssh_options = options.ssh.clone();
    ssh_options.verbose |= request.verbose;

    tokio::pin!(shutdown_signal);

    let session = record(
        &mut fsm,
        Session::create(runner.clone(), &request.target, &ssh_options).await,
    )?;

    let outcome = tokio::select! {
        result = pipeline(&session, request, options, runner.as_ref(), &mut fsm) => Some(result),
        _ = &mut shutdown_signal => None,
    };

    session.close().await;

    match outcome {
        Some(Ok(outcome)) => {
            info!("Deploy {} of {} completed", outcome.id, outcome.out_path);
            Ok(outcome)
        }
        Some(Err(e)) => {
            error!("Deploy failed during {}: {}", fsm.stage(), e);
            Err(e)
        }
        None => {
            warn!("Interrupted during {}", fsm.stage());
            Err(DeployError::Interrupted(fsm.stage().to_string()))
        }
    }
}

async fn pipeline(
    session: &Session,
    request: &DeployRequest,
    options: &DeployOptions,
    local: &dyn CommandRunner,
    fsm: &mut DeployFsm,
) -> Result<DeployOutcome, DeployError> {
    record(fsm, session.connect().await)?;
    advance(fsm, DeployEvent::Connected)?;

    record(fsm, provision(session, &request.secrets).await)?;
    advance(fsm, DeployEvent::SecretsProvisioned)?;

    let strategy = select_strategy(
        &request.local_system,
        &request.target_system,
        request.build_on_target,
    );
    info!(
        "Build strategy: {} (deployer {}, target {})",
        strategy, request.local_system, request.target_system
    );

    let build_args = [
        options.build_args.as_slice(),
        request.extra_build_options.as_slice(),
    ]
    .concat();
    let out_path = record(
        fsm,
        transfer(
            session,
            local,
            strategy,
            &request.build_plan,
            &build_args,
            &options.transfer,
        )
        .await,
    )?;
    if let Some(expected) = &request.output_path {
        if expected != &out_path {
            warn!(
                "Realised {} but the evaluator predicted {}; deploying the realised path",
                out_path, expected
            );
        }
    }
    advance(fsm, DeployEvent::ArtifactReady)?;

    if let Err(e) = activate(session, &out_path, &options.profile_path, request.action).await {
        let event = if e.is_partial_activation() {
            DeployEvent::ActivationFailed(e.to_string())
        } else {
            DeployEvent::Fail(e.to_string())
        };
        advance(fsm, event)?;
        return Err(e);
    }
    advance(fsm, DeployEvent::Activated)?;

    let report = prune(
        session,
        &options.profile_path,
        &request.retention,
        request.perform_gc,
    )
    .await;
    advance(fsm, DeployEvent::Pruned)?;

    Ok(DeployOutcome {
        id: generate_uuid(),
        target: request.target.to_string(),
        out_path,
        strategy,
        action: request.action,
        prune: report,
        stages: fsm.history().to_vec(),
        finished_at: Utc::now(),
    })
}

fn advance(fsm: &mut DeployFsm, event: DeployEvent) -> Result<(), DeployError> {
    fsm.process(event).map(|_| ()).map_err(DeployError::Internal)
}

/// Move the FSM to `Failed` when a stage errs
fn record<T>(fsm: &mut DeployFsm, result: Result<T, DeployError>) -> Result<T, DeployError> {
    if let Err(e) = &result {
        advance(fsm, DeployEvent::Fail(e.to_string()))?;
    }
    result
}
