//! FSM unit tests

use nixdeploy::deploy::fsm::{DeployEvent, DeployFsm, DeployStage};

fn fsm_at_activation() -> DeployFsm {
    let mut fsm = DeployFsm::new();
    fsm.process(DeployEvent::Connect).unwrap();
    fsm.process(DeployEvent::Connected).unwrap();
    fsm.process(DeployEvent::SecretsProvisioned).unwrap();
    fsm.process(DeployEvent::ArtifactReady).unwrap();
    fsm
}

#[test]
fn test_fsm_initial_stage() {
    let fsm = DeployFsm::new();
    assert_eq!(fsm.stage(), DeployStage::Pending);
    assert!(fsm.error().is_none());
    assert_eq!(fsm.history(), &[DeployStage::Pending]);
}

#[test]
fn test_fsm_success_flow() {
    let mut fsm = fsm_at_activation();
    assert_eq!(fsm.stage(), DeployStage::Activating);

    fsm.process(DeployEvent::Activated).unwrap();
    assert_eq!(fsm.stage(), DeployStage::Pruning);

    fsm.process(DeployEvent::Pruned).unwrap();
    assert_eq!(fsm.stage(), DeployStage::Completed);
    assert_eq!(
        fsm.history(),
        &[
            DeployStage::Pending,
            DeployStage::Connecting,
            DeployStage::Provisioning,
            DeployStage::Building,
            DeployStage::Activating,
            DeployStage::Pruning,
            DeployStage::Completed,
        ]
    );
}

#[test]
fn test_fsm_activation_failure_is_partial() {
    let mut fsm = fsm_at_activation();

    fsm.process(DeployEvent::ActivationFailed("unit failed".to_string()))
        .unwrap();

    assert_eq!(fsm.stage(), DeployStage::PartiallyActivated);
    assert_eq!(fsm.error(), Some("unit failed"));
    assert!(fsm.stage().is_terminal());
}

#[test]
fn test_fsm_fail_from_build() {
    let mut fsm = DeployFsm::new();
    fsm.process(DeployEvent::Connect).unwrap();
    fsm.process(DeployEvent::Connected).unwrap();
    fsm.process(DeployEvent::SecretsProvisioned).unwrap();

    fsm.process(DeployEvent::Fail("builder failed".to_string()))
        .unwrap();
    assert_eq!(fsm.stage(), DeployStage::Failed);
    assert_eq!(fsm.error(), Some("builder failed"));
}

#[test]
fn test_fsm_invalid_transitions() {
    let mut fsm = DeployFsm::new();

    // Cannot prune before activating
    assert!(fsm.process(DeployEvent::Pruned).is_err());
    assert!(fsm.process(DeployEvent::Activated).is_err());
    assert_eq!(fsm.stage(), DeployStage::Pending);

    // Secrets must be provisioned before the artifact is ready
    fsm.process(DeployEvent::Connect).unwrap();
    fsm.process(DeployEvent::Connected).unwrap();
    assert!(fsm.process(DeployEvent::ArtifactReady).is_err());

    // Pruning failures never fail the deploy
    let mut fsm = fsm_at_activation();
    fsm.process(DeployEvent::Activated).unwrap();
    assert!(fsm.process(DeployEvent::Fail("gc".to_string())).is_err());
    assert_eq!(fsm.stage(), DeployStage::Pruning);
}

#[test]
fn test_fsm_terminal_stages_accept_nothing() {
    let mut fsm = DeployFsm::new();
    fsm.process(DeployEvent::Connect).unwrap();
    fsm.process(DeployEvent::Fail("unreachable".to_string()))
        .unwrap();

    assert!(fsm.process(DeployEvent::Connect).is_err());
    assert!(fsm.process(DeployEvent::Fail("again".to_string())).is_err());
    assert_eq!(fsm.error(), Some("unreachable"));
}
