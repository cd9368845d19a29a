//! Finite State Machine for a deploy run
//!
//! Stages only move forward. Pruning is reachable only through a successful
//! activation, and a failed activation lands in `PartiallyActivated` rather
//! than `Failed` because the profile has already moved.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Deploy stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeployStage {
    /// Nothing done yet
    Pending,

    /// Opening the SSH session
    Connecting,

    /// Shipping and unpacking secrets
    Provisioning,

    /// Realising and copying the system closure
    Building,

    /// Setting the profile and running the activation script
    Activating,

    /// Deleting old generations and collecting garbage
    Pruning,

    /// Deploy finished
    Completed,

    /// Failed before the profile moved
    Failed,

    /// Profile moved but activation failed
    PartiallyActivated,
}

impl DeployStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeployStage::Pending => "pending",
            DeployStage::Connecting => "connecting",
            DeployStage::Provisioning => "provisioning",
            DeployStage::Building => "building",
            DeployStage::Activating => "activating",
            DeployStage::Pruning => "pruning",
            DeployStage::Completed => "completed",
            DeployStage::Failed => "failed",
            DeployStage::PartiallyActivated => "partially-activated",
        }
    }

    /// No further transitions possible
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DeployStage::Completed | DeployStage::Failed | DeployStage::PartiallyActivated
        )
    }
}

impl fmt::Display for DeployStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Deploy event
#[derive(Debug, Clone)]
pub enum DeployEvent {
    /// Start connecting
    Connect,

    /// Session established
    Connected,

    /// Secrets unpacked on the target
    SecretsProvisioned,

    /// Target holds the realised output path
    ArtifactReady,

    /// Activation script succeeded
    Activated,

    /// Activation script failed after the profile moved
    ActivationFailed(String),

    /// Retention stage finished (warnings included)
    Pruned,

    /// A stage failed before the profile moved
    Fail(String),
}

/// Deploy FSM
#[derive(Debug, Clone)]
pub struct DeployFsm {
    stage: DeployStage,
    error: Option<String>,
    history: Vec<DeployStage>,
}

impl DeployFsm {
    /// Create a new FSM in pending stage
    pub fn new() -> Self {
        Self {
            stage: DeployStage::Pending,
            error: None,
            history: vec![DeployStage::Pending],
        }
    }

    /// Get current stage
    pub fn stage(&self) -> DeployStage {
        self.stage
    }

    /// Get error message if any
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Every stage entered, in order
    pub fn history(&self) -> &[DeployStage] {
        &self.history
    }

    /// Process an event and transition stage
    pub fn process(&mut self, event: DeployEvent) -> Result<DeployStage, String> {
        let new_stage = match (self.stage, &event) {
            (DeployStage::Pending, DeployEvent::Connect) => DeployStage::Connecting,
            (DeployStage::Connecting, DeployEvent::Connected) => DeployStage::Provisioning,
            (DeployStage::Provisioning, DeployEvent::SecretsProvisioned) => DeployStage::Building,
            (DeployStage::Building, DeployEvent::ArtifactReady) => DeployStage::Activating,
            (DeployStage::Activating, DeployEvent::Activated) => DeployStage::Pruning,
            (DeployStage::Activating, DeployEvent::ActivationFailed(err)) => {
                self.error = Some(err.clone());
                DeployStage::PartiallyActivated
            }
            (DeployStage::Pruning, DeployEvent::Pruned) => DeployStage::Completed,

            (
                DeployStage::Connecting
                | DeployStage::Provisioning
                | DeployStage::Building
                | DeployStage::Activating,
                DeployEvent::Fail(err),
            ) => {
                self.error = Some(err.clone());
                DeployStage::Failed
            }

            // Invalid transitions
            (stage, event) => {
                return Err(format!("Invalid transition: {:?} -> {:?}", stage, event));
            }
        };

        self.stage = new_stage;
        self.history.push(new_stage);
        Ok(new_stage)
    }
}

impl Default for DeployFsm {
    fn default() -> Self {
        Self::new()
    }
}
