//! Build strategy selection

use std::fmt;

use serde::{Deserialize, Serialize};

/// Where the system closure gets realised
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BuildStrategy {
    /// Realise locally, then push the output closure
    BuildOnDeployer,
    /// Push the derivation closure, realise on the target
    BuildOnTarget,
}

impl fmt::Display for BuildStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BuildStrategy::BuildOnDeployer => f.write_str("build-on-deployer"),
            BuildStrategy::BuildOnTarget => f.write_str("build-on-target"),
        }
    }
}

/// Pick a strategy. A deployer cannot build for a foreign system, so a
/// system mismatch forces the target to build whatever the caller asked.
pub fn select_strategy(
    local_system: &str,
    target_system: &str,
    build_on_target: bool,
) -> BuildStrategy {
    if local_system != target_system || build_on_target {
        BuildStrategy::BuildOnTarget
    } else {
        BuildStrategy::BuildOnDeployer
    }
}
