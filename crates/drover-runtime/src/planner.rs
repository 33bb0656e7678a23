//! Expands a cluster action into staged `(node, service, action)` items.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};

use drover_kernel::{
    ClusterAction, ClusterJob, ClusterTask, KernelError, NodeId, ProvisionerAction, ServiceSpec,
};

use crate::catalog::ActionCatalog;
use crate::dependency_graph::DependencyGraph;
use crate::resolver::{ResolvedDependencies, ServiceAction};

/// One task-to-be: an action on one node, optionally for one service.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PlanItem {
    pub node_id: NodeId,
    pub service: Option<String>,
    pub action: ProvisionerAction,
}

impl PlanItem {
    pub fn machine(node_id: impl Into<NodeId>, action: ProvisionerAction) -> Self {
        Self {
            node_id: node_id.into(),
            service: None,
            action,
        }
    }

    pub fn service(
        node_id: impl Into<NodeId>,
        service: impl Into<String>,
        action: ProvisionerAction,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            service: Some(service.into()),
            action,
        }
    }
}

impl fmt::Display for PlanItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.service {
            Some(service) => write!(f, "{} {} on {}", self.action, service, self.node_id),
            None => write!(f, "{} on {}", self.action, self.node_id),
        }
    }
}

/// Ordered stages of plan items; every item of a stage may run concurrently.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct JobPlan {
    pub stages: Vec<Vec<PlanItem>>,
}

impl JobPlan {
    pub fn task_count(&self) -> usize {
        self.stages.iter().map(Vec::len).sum()
    }

    /// Allocates task ids on `job`, records the stages on it and returns the
    /// first-attempt tasks.
    pub fn materialize(self, job: &mut ClusterJob, now: DateTime<Utc>) -> Vec<ClusterTask> {
        let mut tasks = Vec::with_capacity(self.task_count());
        let mut stages = Vec::with_capacity(self.stages.len());
        for stage in self.stages {
            let mut ids = Vec::with_capacity(stage.len());
            for item in stage {
                let id = job.allocate_task_id();
                ids.push(id.clone());
                tasks.push(ClusterTask::new(id, item.node_id, item.service, item.action, 1, now));
            }
            stages.push(ids);
        }
        job.stages = stages;
        job.current_stage = 0;
        tasks
    }
}

/// Inputs of one planning run.
pub struct PlanRequest<'a> {
    pub action: ClusterAction,
    /// Node -> services the action runs on that node.
    pub placement: &'a BTreeMap<NodeId, BTreeSet<String>>,
    pub specs: &'a BTreeMap<String, ServiceSpec>,
    pub dependencies: &'a ResolvedDependencies,
}

pub struct JobPlanner<'a> {
    catalog: &'a ActionCatalog,
}

impl<'a> JobPlanner<'a> {
    pub fn new(catalog: &'a ActionCatalog) -> Self {
        Self { catalog }
    }

    pub fn plan(&self, request: &PlanRequest<'_>) -> Result<JobPlan, KernelError> {
        let nodes: Vec<&NodeId> = request.placement.keys().collect();
        let mut stages = Vec::new();
        match request.action {
            ClusterAction::ClusterDelete => {
                stages.push(machine_stage(&nodes, ProvisionerAction::Delete));
            }
            ClusterAction::ClusterCreate => {
                for action in ProvisionerAction::MACHINE_CHAIN {
                    stages.push(machine_stage(&nodes, action));
                }
                stages.extend(self.service_stages(request)?);
            }
            _ => stages.extend(self.service_stages(request)?),
        }
        stages.retain(|stage| !stage.is_empty());
        Ok(JobPlan { stages })
    }

    fn service_stages(&self, request: &PlanRequest<'_>) -> Result<Vec<Vec<PlanItem>>, KernelError> {
        let actions = self.catalog.service_actions(request.action);
        let mut items = Vec::new();
        let mut by_service_action: BTreeMap<ServiceAction, Vec<PlanItem>> = BTreeMap::new();
        let mut edges = Vec::new();

        for (node_id, services) in request.placement {
            for service in services {
                let spec = request
                    .specs
                    .get(service)
                    .ok_or_else(|| KernelError::not_found("service", service))?;
                let mut previous: Option<PlanItem> = None;
                for action in actions.iter().filter(|a| spec.implements(**a)) {
                    let item = PlanItem::service(node_id.clone(), service.clone(), *action);
                    if let Some(previous) = previous.take() {
                        edges.push((item.clone(), previous));
                    }
                    by_service_action
                        .entry(ServiceAction::new(*action, service.clone()))
                        .or_default()
                        .push(item.clone());
                    items.push(item.clone());
                    previous = Some(item);
                }
            }
        }

        let graph = &request.dependencies.actions;
        for item in &items {
            let Some(service) = item.service.as_ref() else {
                continue;
            };
            let from = ServiceAction::new(item.action, service.clone());
            for target in nearest_planned(graph, &from, &by_service_action) {
                for dependency in by_service_action.get(target).into_iter().flatten() {
                    edges.push((item.clone(), dependency.clone()));
                }
            }
        }

        Ok(DependencyGraph::new(items, edges)?.levels())
    }
}

fn machine_stage(nodes: &[&NodeId], action: ProvisionerAction) -> Vec<PlanItem> {
    nodes
        .iter()
        .map(|node_id| PlanItem::machine((*node_id).clone(), action))
        .collect()
}

/// Closest dependencies of `from` that have planned items, walking through
/// dependencies the current action does not cover.
fn nearest_planned<'g>(
    graph: &'g DependencyGraph<ServiceAction>,
    from: &ServiceAction,
    planned: &BTreeMap<ServiceAction, Vec<PlanItem>>,
) -> BTreeSet<&'g ServiceAction> {
    let mut found = BTreeSet::new();
    let mut seen = BTreeSet::new();
    let mut stack: Vec<&ServiceAction> = graph.dependencies(from).collect();
    while let Some(next) = stack.pop() {
        if !seen.insert(next) {
            continue;
        }
        if planned.contains_key(next) {
            found.insert(next);
        } else {
            stack.extend(graph.dependencies(next));
        }
    }
    found
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use drover_kernel::JobId;

    use super::*;
    use crate::resolver::ServiceDependencyResolver;
    use ProvisionerAction::{Bootstrap, Configure, Confirm, Create, Delete, Install, Start, Stop};

    fn spec(name: &str, actions: &[ProvisionerAction]) -> ServiceSpec {
        actions
            .iter()
            .fold(ServiceSpec::new(name), |spec, a| spec.with_action(*a, "shell"))
    }

    fn plan(
        action: ClusterAction,
        placement: Vec<(&str, Vec<&str>)>,
        services: Vec<ServiceSpec>,
    ) -> Result<JobPlan, KernelError> {
        let catalog = ActionCatalog::standard();
        let resolved =
            ServiceDependencyResolver::new(Arc::new(catalog.clone())).resolve(&services)?;
        let placement: BTreeMap<NodeId, BTreeSet<String>> = placement
            .into_iter()
            .map(|(node, svcs)| {
                (
                    node.to_string(),
                    svcs.into_iter().map(str::to_string).collect(),
                )
            })
            .collect();
        let specs: BTreeMap<String, ServiceSpec> =
            services.into_iter().map(|s| (s.name.clone(), s)).collect();
        JobPlanner::new(&catalog).plan(&PlanRequest {
            action,
            placement: &placement,
            specs: &specs,
            dependencies: &resolved,
        })
    }

    fn stage_actions(plan: &JobPlan) -> Vec<Vec<String>> {
        plan.stages
            .iter()
            .map(|stage| stage.iter().map(ToString::to_string).collect())
            .collect()
    }

    #[test]
    fn single_node_create_has_machine_chain_then_service_stage() {
        let plan = plan(
            ClusterAction::ClusterCreate,
            vec![("n1", vec!["base"])],
            vec![spec("base", &[Install])],
        )
        .unwrap();
        assert_eq!(
            stage_actions(&plan),
            vec![
                vec!["CREATE on n1"],
                vec!["CONFIRM on n1"],
                vec!["BOOTSTRAP on n1"],
                vec!["INSTALL base on n1"],
            ]
        );
        let machine_tasks = plan
            .stages
            .iter()
            .flatten()
            .filter(|i| matches!(i.action, Create | Confirm | Bootstrap))
            .count();
        assert_eq!(machine_tasks, 3);
    }

    #[test]
    fn start_waits_for_dependencies_on_every_node() {
        let plan = plan(
            ClusterAction::StartServices,
            vec![("n1", vec!["app"]), ("n2", vec!["db"])],
            vec![
                spec("app", &[Start]).runtime_requires("db"),
                spec("db", &[Start]),
            ],
        )
        .unwrap();
        assert_eq!(
            stage_actions(&plan),
            vec![vec!["START db on n2"], vec!["START app on n1"]]
        );
    }

    #[test]
    fn stop_runs_dependents_first() {
        let plan = plan(
            ClusterAction::StopServices,
            vec![("n1", vec!["app", "db"])],
            vec![
                spec("app", &[Stop]).runtime_requires("db"),
                spec("db", &[Stop]),
            ],
        )
        .unwrap();
        assert_eq!(
            stage_actions(&plan),
            vec![vec!["STOP app on n1"], vec!["STOP db on n1"]]
        );
    }

    #[test]
    fn per_service_actions_chain_in_catalog_order() {
        let plan = plan(
            ClusterAction::ClusterConfigureWithRestart,
            vec![("n1", vec!["web"])],
            vec![spec("web", &[Stop, Configure, Start])],
        )
        .unwrap();
        assert_eq!(
            stage_actions(&plan),
            vec![
                vec!["STOP web on n1"],
                vec!["CONFIGURE web on n1"],
                vec!["START web on n1"],
            ]
        );
    }

    #[test]
    fn delete_is_one_machine_stage() {
        let plan = plan(
            ClusterAction::ClusterDelete,
            vec![("n1", vec![]), ("n2", vec![])],
            Vec::new(),
        )
        .unwrap();
        assert_eq!(plan.stages.len(), 1);
        assert!(plan.stages[0].iter().all(|i| i.action == Delete && i.service.is_none()));
    }

    #[test]
    fn materialize_numbers_tasks_in_stage_order() {
        let plan = plan(
            ClusterAction::ClusterCreate,
            vec![("n1", vec!["base"]), ("n2", vec!["base"])],
            vec![spec("base", &[Install])],
        )
        .unwrap();
        let mut job = ClusterJob::new(JobId::new("c1", 1), "t1", ClusterAction::ClusterCreate, 3, Utc::now());
        let tasks = plan.materialize(&mut job, Utc::now());
        assert_eq!(tasks.len(), 8);
        assert_eq!(job.stages.len(), 4);
        assert_eq!(job.stages[0][0].to_string(), "c1-001-001");
        assert_eq!(job.stages[3][1].to_string(), "c1-001-008");
        assert!(tasks.iter().all(|t| t.attempt == 1));
    }
}
