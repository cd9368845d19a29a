//! End-to-end deploy runs against a scripted target

use std::sync::Arc;

use tokio_test::{assert_err, assert_ok};

use nixdeploy::app::options::DeployOptions;
use nixdeploy::app::run::run;
use nixdeploy::deploy::fsm::DeployStage;
use nixdeploy::deploy::retention::RetentionWarning;
use nixdeploy::deploy::strategy::BuildStrategy;
use nixdeploy::errors::DeployError;
use nixdeploy::models::request::{ActivationAction, RetentionPolicy};
use nixdeploy::models::secrets::SecretBundle;

use crate::common::{failed, request, ScriptedRunner, DRV, OUT, REMOTE_DIR};

const SYSTEM_PROFILE: &str = "/nix/var/nix/profiles/system";

fn never() -> std::future::Pending<()> {
    std::future::pending()
}

/// `nix-store` runs on the deployer
fn local_builds(runner: &ScriptedRunner) -> usize {
    runner
        .calls()
        .iter()
        .filter(|c| c.program == "nix-store")
        .count()
}

fn before(runner: &ScriptedRunner, first: &[&str], second: &[&str]) -> bool {
    match (runner.position(first), runner.position(second)) {
        (Some(a), Some(b)) => a < b,
        _ => false,
    }
}

#[tokio::test]
async fn test_same_system_builds_locally_and_switches() {
    let runner = Arc::new(ScriptedRunner::new());
    let mut req = request();
    req.secrets = SecretBundle::from_json("{}").unwrap();
    req.retention = RetentionPolicy::parse("+5").unwrap();
    req.perform_gc = true;

    let result = run(&req, &DeployOptions::default(), runner.clone(), never()).await;
    let outcome = assert_ok!(result);

    assert_eq!(outcome.out_path, OUT);
    assert_eq!(outcome.strategy, BuildStrategy::BuildOnDeployer);
    assert_eq!(outcome.action, ActivationAction::Switch);
    assert_eq!(outcome.stages.last(), Some(&DeployStage::Completed));
    assert!(outcome.prune.generations_deleted);
    assert!(outcome.prune.gc_ran);
    assert!(outcome.prune.warnings.is_empty());

    let realize = ["nix-store --realize", DRV];
    let copy = ["nix-copy-closure --to root@10.0.0.5", "--gzip", "--use-substitutes", OUT];
    let set_profile = ["nix-env --profile", SYSTEM_PROFILE, "--set", OUT];
    let switch = ["/bin/switch-to-configuration switch"];
    let delete = ["--delete-generations +5"];
    let gc = ["nix-store --gc"];

    assert_eq!(local_builds(&runner), 1);
    assert_eq!(runner.count(&copy), 1);
    assert_eq!(runner.count(&set_profile), 1);
    assert!(before(&runner, &["unpack-keys.sh", "maybe-sudo.sh"], &realize));
    assert!(before(&runner, &realize, &copy));
    assert!(before(&runner, &copy, &set_profile));
    assert!(before(&runner, &set_profile, &switch));
    assert!(before(&runner, &switch, &delete));
    assert!(before(&runner, &delete, &gc));

    // The target never builds in this mode
    assert_eq!(runner.count(&["maybe-sudo.sh nix-store --realize"]), 0);
    assert_eq!(runner.control_exits(), 1);
}

#[tokio::test]
async fn test_cross_system_builds_on_target() {
    let runner = Arc::new(ScriptedRunner::new());
    let mut req = request();
    req.local_system = "x86_64-linux".to_string();
    req.target_system = "aarch64-linux".to_string();
    req.action = ActivationAction::Boot;

    let outcome = assert_ok!(run(&req, &DeployOptions::default(), runner.clone(), never()).await);
    assert_eq!(outcome.strategy, BuildStrategy::BuildOnTarget);

    let copy_plan = ["nix-copy-closure --to root@10.0.0.5", DRV];
    let remote_realize = ["maybe-sudo.sh nix-store --realize", DRV];
    assert_eq!(runner.count(&copy_plan), 1);
    assert_eq!(runner.count(&remote_realize), 1);
    assert!(before(&runner, &copy_plan, &remote_realize));
    assert_eq!(runner.count(&["nix-copy-closure", OUT]), 0);
    assert_eq!(local_builds(&runner), 0);

    assert_eq!(runner.count(&["/bin/switch-to-configuration boot"]), 1);
    // Default retention keeps everything and gc is off
    assert_eq!(runner.count(&["--delete-generations"]), 0);
    assert_eq!(runner.count(&["nix-store --gc"]), 0);
}

#[tokio::test]
async fn test_build_on_target_flag_overrides_matching_systems() {
    let runner = Arc::new(ScriptedRunner::new());
    let mut req = request();
    req.build_on_target = true;

    let outcome = assert_ok!(run(&req, &DeployOptions::default(), runner.clone(), never()).await);
    assert_eq!(outcome.strategy, BuildStrategy::BuildOnTarget);
    assert_eq!(local_builds(&runner), 0);
}

#[tokio::test]
async fn test_activation_failure_is_partial_and_skips_pruning() {
    let runner = Arc::new(ScriptedRunner::new());
    runner.answer(&["switch-to-configuration"], failed(4, "Failed to start unit foo.service"));
    let mut req = request();
    req.retention = RetentionPolicy::parse("+1").unwrap();
    req.perform_gc = true;

    let err = assert_err!(run(&req, &DeployOptions::default(), runner.clone(), never()).await);
    assert!(err.is_partial_activation());
    assert_eq!(err.exit_code(), 2);
    match &err {
        DeployError::ActivationError { profile, out_path, reason } => {
            assert_eq!(profile, SYSTEM_PROFILE);
            assert_eq!(out_path, OUT);
            assert!(reason.contains("foo.service"));
        }
        other => panic!("unexpected error: {other}"),
    }

    assert_eq!(runner.count(&["--set", OUT]), 1);
    assert_eq!(runner.count(&["--delete-generations"]), 0);
    assert_eq!(runner.count(&["nix-store --gc"]), 0);
    assert_eq!(runner.control_exits(), 1);
}

#[tokio::test]
async fn test_profile_failure_is_not_partial() {
    let runner = Arc::new(ScriptedRunner::new());
    runner.answer(&["--set"], failed(1, "permission denied"));

    let err = assert_err!(run(&request(), &DeployOptions::default(), runner.clone(), never()).await);
    assert!(matches!(err, DeployError::ProfileError(_)));
    assert_eq!(err.exit_code(), 1);
    assert_eq!(runner.count(&["switch-to-configuration"]), 0);
}

#[tokio::test]
async fn test_secrets_unpacked_once_before_profile_changes() {
    let runner = Arc::new(ScriptedRunner::new());
    let mut req = request();
    req.secrets =
        SecretBundle::from_json(r#"{"wg-key": "abc", "db-password": "it's secret"}"#).unwrap();

    assert_ok!(run(&req, &DeployOptions::default(), runner.clone(), never()).await);

    let unpack = format!(
        "-- {dir}/maybe-sudo.sh {dir}/unpack-keys.sh {dir}/packed-keys.json",
        dir = REMOTE_DIR
    );
    assert_eq!(runner.count(&[unpack.as_str()]), 1);
    assert!(before(&runner, &[unpack.as_str()], &["nix-env"]));

    // Helper and bundle travel in one scp, keeping their modes
    let upload = runner
        .calls()
        .into_iter()
        .find(|c| c.program == "scp" && c.to_string().contains("packed-keys.json"))
        .unwrap();
    assert_eq!(upload.args.first().map(String::as_str), Some("-p"));
    assert_eq!(
        upload.args.last().map(String::as_str),
        Some(format!("root@10.0.0.5:{}/", REMOTE_DIR).as_str())
    );

    // Secret contents never appear on a command line
    assert!(runner.lines().iter().all(|line| !line.contains("it's secret")));
}

#[tokio::test]
async fn test_unpack_failure_stops_before_build() {
    let runner = Arc::new(ScriptedRunner::new());
    runner.answer(&["unpack-keys.sh", "maybe-sudo.sh"], failed(1, "jq: not found"));

    let err = assert_err!(run(&request(), &DeployOptions::default(), runner.clone(), never()).await);
    assert!(matches!(err, DeployError::UnpackError(_)));
    assert_eq!(runner.count(&["--realize"]), 0);
    assert_eq!(runner.count(&["nix-env"]), 0);
    assert_eq!(runner.control_exits(), 1);
}

#[tokio::test]
async fn test_build_failure_leaves_profile_alone() {
    let runner = Arc::new(ScriptedRunner::new());
    runner.answer(&["nix-store --realize"], failed(1, "builder failed"));

    let err = assert_err!(run(&request(), &DeployOptions::default(), runner.clone(), never()).await);
    assert!(matches!(err, DeployError::BuildError(_)));
    assert_eq!(runner.count(&["nix-copy-closure"]), 0);
    assert_eq!(runner.count(&["nix-env"]), 0);
    assert_eq!(runner.control_exits(), 1);
}

#[tokio::test]
async fn test_retention_failures_are_warnings() {
    let runner = Arc::new(ScriptedRunner::new());
    runner.answer(&["--delete-generations"], failed(1, "no such generation"));
    let mut req = request();
    req.retention = RetentionPolicy::parse("14d").unwrap();
    req.perform_gc = true;

    let outcome = assert_ok!(run(&req, &DeployOptions::default(), runner.clone(), never()).await);
    assert!(!outcome.prune.generations_deleted);
    assert!(outcome.prune.gc_ran);
    assert!(matches!(
        outcome.prune.warnings.as_slice(),
        [RetentionWarning::Prune(_)]
    ));
}

#[tokio::test]
async fn test_connection_failure_cleans_up() {
    let runner = Arc::new(ScriptedRunner::new());
    runner.answer(&["-- true"], failed(255, "ssh: connect to host 10.0.0.5: Connection refused"));

    let err = assert_err!(run(&request(), &DeployOptions::default(), runner.clone(), never()).await);
    assert!(matches!(err, DeployError::ConnectionError(_)));
    assert_eq!(runner.calls().len(), 2);
    assert_eq!(runner.control_exits(), 1);

    let scratch = runner.scratch_dir().unwrap();
    assert!(!scratch.exists());
}

#[tokio::test]
async fn test_session_torn_down_after_success() {
    let runner = Arc::new(ScriptedRunner::new());

    assert_ok!(run(&request(), &DeployOptions::default(), runner.clone(), never()).await);

    assert_eq!(runner.count(&["rm -rf", REMOTE_DIR]), 1);
    assert!(before(&runner, &["rm -rf"], &["-O exit"]));
    assert_eq!(runner.control_exits(), 1);
    assert!(!runner.scratch_dir().unwrap().exists());

    let probe = runner.calls().into_iter().next().unwrap();
    let probe = probe.to_string();
    assert!(probe.contains("ControlMaster=auto"));
    assert!(probe.contains("StrictHostKeyChecking=no"));
    assert!(probe.contains("BatchMode=yes"));
}

#[tokio::test]
async fn test_interrupt_during_build_tears_down() {
    let runner = Arc::new(ScriptedRunner::new());
    let started = runner.hang_on(&["nix-store --realize"]);
    let signal = async move {
        let _ = started.await;
    };

    let err = assert_err!(run(&request(), &DeployOptions::default(), runner.clone(), signal).await);
    match &err {
        DeployError::Interrupted(stage) => assert_eq!(stage, "building"),
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(err.exit_code(), 130);
    assert_eq!(runner.count(&["nix-env"]), 0);
    assert_eq!(runner.control_exits(), 1);
    assert!(!runner.scratch_dir().unwrap().exists());
}

#[tokio::test]
async fn test_invalid_request_never_connects() {
    let runner = Arc::new(ScriptedRunner::new());
    let mut req = request();
    req.build_plan = "relative.drv".to_string();

    let err = assert_err!(run(&req, &DeployOptions::default(), runner.clone(), never()).await);
    assert!(matches!(err, DeployError::ValidationError(_)));
    assert!(runner.calls().is_empty());
}

async fn interrupted_at(needles: &[&str]) -> (DeployError, Arc<ScriptedRunner>) {
    let runner = Arc::new(ScriptedRunner::new());
    let started = runner.hang_on(needles);
    let signal = async move {
        let _ = started.await;
    };
    let err = assert_err!(run(&request(), &DeployOptions::default(), runner.clone(), signal).await);
    (err, runner)
}

#[tokio::test]
async fn test_interrupt_while_connecting_stops_control_master() {
    let (err, runner) = interrupted_at(&["-- true"]).await;

    assert!(matches!(&err, DeployError::Interrupted(stage) if stage == "connecting"));
    assert_eq!(runner.control_exits(), 1);
    assert_eq!(runner.count(&["rm -rf"]), 0);
    assert!(!runner.scratch_dir().unwrap().exists());
}

#[tokio::test]
async fn test_interrupt_while_provisioning_tears_down() {
    let (err, runner) = interrupted_at(&["maybe-sudo.sh", "unpack-keys.sh"]).await;

    assert!(matches!(&err, DeployError::Interrupted(stage) if stage == "provisioning"));
    assert_eq!(runner.count(&["--realize"]), 0);
    assert_eq!(runner.count(&["rm -rf", REMOTE_DIR]), 1);
    assert_eq!(runner.control_exits(), 1);
    assert!(!runner.scratch_dir().unwrap().exists());
}

#[tokio::test]
async fn test_interrupt_while_activating_tears_down() {
    let (err, runner) = interrupted_at(&["switch-to-configuration"]).await;

    assert!(matches!(&err, DeployError::Interrupted(stage) if stage == "activating"));
    assert_eq!(err.exit_code(), 130);
    assert_eq!(runner.count(&["--delete-generations"]), 0);
    assert_eq!(runner.count(&["rm -rf", REMOTE_DIR]), 1);
    assert_eq!(runner.control_exits(), 1);
    assert!(!runner.scratch_dir().unwrap().exists());
}

#[tokio::test]
async fn test_rejected_login_still_stops_control_master() {
    let runner = Arc::new(ScriptedRunner::new());
    runner.answer(&["-- true"], failed(1, "This account is currently not available."));

    let err = assert_err!(run(&request(), &DeployOptions::default(), runner.clone(), never()).await);
    assert!(matches!(err, DeployError::ConnectionError(_)));
    assert_eq!(runner.control_exits(), 1);
    assert!(!runner.scratch_dir().unwrap().exists());
}

#[tokio::test]
async fn test_whitespace_in_ssh_options_is_rejected_before_connecting() {
    let runner = Arc::new(ScriptedRunner::new());
    let mut options = DeployOptions::default();
    options.ssh.extra_options = vec!["-o".to_string(), "ProxyCommand=nc %h %p".to_string()];

    let err = assert_err!(run(&request(), &options, runner.clone(), never()).await);
    assert!(matches!(err, DeployError::ConfigError(_)));
    assert!(runner.calls().is_empty());
}

#[tokio::test]
async fn test_secret_upload_failure_is_reported() {
    let runner = Arc::new(ScriptedRunner::new());
    runner.answer(&["scp", "packed-keys.json"], failed(1, "scp: write failed"));

    let err = assert_err!(run(&request(), &DeployOptions::default(), runner.clone(), never()).await);
    assert!(matches!(err, DeployError::TransferError(_)));
    assert_eq!(runner.count(&["unpack-keys.sh", "maybe-sudo.sh"]), 0);
    assert_eq!(runner.control_exits(), 1);
    assert!(!runner.scratch_dir().unwrap().exists());
}
