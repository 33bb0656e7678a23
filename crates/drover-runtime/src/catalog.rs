//! Which provisioner actions a cluster action runs, and how actions order across
//! dependent services.
//!
//! The catalog is plain configuration handed to the resolver and the schedulers;
//! the default catalog carries the standard provisioning plan.

use std::collections::BTreeMap;

use drover_kernel::{ClusterAction, ProvisionerAction};

/// Which declared dependency set a rule follows.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DependencyStage {
    Install,
    Runtime,
}

/// Orders `action` on a service after `waits_for` on each service it depends on.
///
/// A reversed rule flips the direction: the dependency's `action` waits for
/// `waits_for` on its dependents (teardown order).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CrossServiceRule {
    pub action: ProvisionerAction,
    pub waits_for: ProvisionerAction,
    pub stage: DependencyStage,
    pub reversed: bool,
}

impl CrossServiceRule {
    pub fn new(
        action: ProvisionerAction,
        waits_for: ProvisionerAction,
        stage: DependencyStage,
    ) -> Self {
        Self {
            action,
            waits_for,
            stage,
            reversed: false,
        }
    }

    pub fn reversed(mut self) -> Self {
        self.reversed = true;
        self
    }
}

#[derive(Clone, Debug)]
pub struct ActionCatalog {
    plans: BTreeMap<ClusterAction, Vec<ProvisionerAction>>,
    rules: Vec<CrossServiceRule>,
}

impl ActionCatalog {
    /// A catalog without plans or rules.
    pub fn empty() -> Self {
        Self {
            plans: BTreeMap::new(),
            rules: Vec::new(),
        }
    }

    /// Sets the per-service action sequence run by `action`.
    pub fn with_plan(mut self, action: ClusterAction, actions: &[ProvisionerAction]) -> Self {
        self.plans.insert(action, actions.to_vec());
        self
    }

    pub fn with_rule(mut self, rule: CrossServiceRule) -> Self {
        self.rules.push(rule);
        self
    }

    /// Service-level actions `action` runs on each covered service, in order.
    pub fn service_actions(&self, action: ClusterAction) -> &[ProvisionerAction] {
        self.plans.get(&action).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn rules(&self) -> &[CrossServiceRule] {
        &self.rules
    }

    /// The standard provisioning catalog.
    pub fn standard() -> Self {
        use ProvisionerAction::{Configure, Initialize, Install, Start, Stop};

        let bring_up = [Install, Configure, Initialize, Start];
        Self::empty()
            .with_plan(ClusterAction::ClusterCreate, &bring_up)
            .with_plan(ClusterAction::ClusterDelete, &[])
            .with_plan(ClusterAction::ClusterConfigure, &[Configure])
            .with_plan(
                ClusterAction::ClusterConfigureWithRestart,
                &[Stop, Configure, Start],
            )
            .with_plan(ClusterAction::StopServices, &[Stop])
            .with_plan(ClusterAction::StartServices, &[Start])
            .with_plan(ClusterAction::RestartServices, &[Stop, Start])
            .with_plan(ClusterAction::AddServices, &bring_up)
            .with_rule(CrossServiceRule::new(Install, Install, DependencyStage::Install))
            .with_rule(CrossServiceRule::new(Initialize, Start, DependencyStage::Runtime))
            .with_rule(CrossServiceRule::new(Start, Start, DependencyStage::Runtime))
            .with_rule(CrossServiceRule::new(Stop, Stop, DependencyStage::Runtime).reversed())
    }
}

impl Default for ActionCatalog {
    fn default() -> Self {
        Self::standard()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_catalog_plans_every_cluster_action() {
        let catalog = ActionCatalog::standard();
        assert_eq!(
            catalog.service_actions(ClusterAction::RestartServices),
            &[ProvisionerAction::Stop, ProvisionerAction::Start]
        );
        assert!(catalog.service_actions(ClusterAction::ClusterDelete).is_empty());
        assert_eq!(catalog.service_actions(ClusterAction::AddServices).len(), 4);
        assert!(catalog.rules().iter().any(|r| r.reversed));
    }

    #[test]
    fn empty_catalog_runs_nothing() {
        let catalog = ActionCatalog::empty();
        assert!(catalog.service_actions(ClusterAction::StartServices).is_empty());
        assert!(catalog.rules().is_empty());
    }
}
