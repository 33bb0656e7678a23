//! Cluster-level actions requested by users and the provisioner-level verbs they
//! expand into.

use std::fmt;
use std::str::FromStr;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::KernelError;

/// An action requested on a whole cluster.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClusterAction {
    ClusterCreate,
    ClusterDelete,
    ClusterConfigure,
    ClusterConfigureWithRestart,
    StopServices,
    StartServices,
    RestartServices,
    AddServices,
}

impl ClusterAction {
    pub const ALL: [ClusterAction; 8] = [
        ClusterAction::ClusterCreate,
        ClusterAction::ClusterDelete,
        ClusterAction::ClusterConfigure,
        ClusterAction::ClusterConfigureWithRestart,
        ClusterAction::StopServices,
        ClusterAction::StartServices,
        ClusterAction::RestartServices,
        ClusterAction::AddServices,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ClusterCreate => "CLUSTER_CREATE",
            Self::ClusterDelete => "CLUSTER_DELETE",
            Self::ClusterConfigure => "CLUSTER_CONFIGURE",
            Self::ClusterConfigureWithRestart => "CLUSTER_CONFIGURE_WITH_RESTART",
            Self::StopServices => "STOP_SERVICES",
            Self::StartServices => "START_SERVICES",
            Self::RestartServices => "RESTART_SERVICES",
            Self::AddServices => "ADD_SERVICES",
        }
    }
}

impl fmt::Display for ClusterAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ClusterAction {
    type Err = KernelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|a| a.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| KernelError::Validation(format!("unknown cluster action '{}'", s)))
    }
}

/// A verb executed by a provisioner against one node (and optionally one service).
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProvisionerAction {
    Create,
    Confirm,
    Bootstrap,
    Install,
    Configure,
    Initialize,
    Start,
    Stop,
    Delete,
}

impl ProvisionerAction {
    pub const ALL: [ProvisionerAction; 9] = [
        ProvisionerAction::Create,
        ProvisionerAction::Confirm,
        ProvisionerAction::Bootstrap,
        ProvisionerAction::Install,
        ProvisionerAction::Configure,
        ProvisionerAction::Initialize,
        ProvisionerAction::Start,
        ProvisionerAction::Stop,
        ProvisionerAction::Delete,
    ];

    /// The fixed machine sub-plan of a cluster create, in order.
    pub const MACHINE_CHAIN: [ProvisionerAction; 3] = [
        ProvisionerAction::Create,
        ProvisionerAction::Confirm,
        ProvisionerAction::Bootstrap,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "CREATE",
            Self::Confirm => "CONFIRM",
            Self::Bootstrap => "BOOTSTRAP",
            Self::Install => "INSTALL",
            Self::Configure => "CONFIGURE",
            Self::Initialize => "INITIALIZE",
            Self::Start => "START",
            Self::Stop => "STOP",
            Self::Delete => "DELETE",
        }
    }

    /// Machine-level actions run without a service.
    pub fn is_machine_action(&self) -> bool {
        matches!(
            self,
            Self::Create | Self::Confirm | Self::Bootstrap | Self::Delete
        )
    }

    /// Actions whose failure is handled by deleting and re-creating the machine.
    pub fn is_rollback_chain(&self) -> bool {
        matches!(self, Self::Create | Self::Confirm)
    }
}

impl fmt::Display for ProvisionerAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProvisionerAction {
    type Err = KernelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|a| a.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| KernelError::Validation(format!("unknown provisioner action '{}'", s)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn actions_parse_case_insensitively() {
        assert_eq!(
            "stop_services".parse::<ClusterAction>().unwrap(),
            ClusterAction::StopServices
        );
        assert_eq!(
            "Confirm".parse::<ProvisionerAction>().unwrap(),
            ProvisionerAction::Confirm
        );
        assert!("REBOOT".parse::<ProvisionerAction>().is_err());
    }

    #[test]
    fn serde_uses_wire_names() {
        let json = serde_json::to_value(ClusterAction::ClusterConfigureWithRestart).unwrap();
        assert_eq!(json, serde_json::json!("CLUSTER_CONFIGURE_WITH_RESTART"));
        let action: ProvisionerAction = serde_json::from_value(serde_json::json!("BOOTSTRAP")).unwrap();
        assert_eq!(action, ProvisionerAction::Bootstrap);
    }

    #[test]
    fn machine_actions_have_no_service() {
        assert!(ProvisionerAction::Delete.is_machine_action());
        assert!(!ProvisionerAction::Install.is_machine_action());
        assert!(ProvisionerAction::Confirm.is_rollback_chain());
        assert!(!ProvisionerAction::Bootstrap.is_rollback_chain());
    }
}
