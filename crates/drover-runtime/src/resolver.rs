//! Service dependency resolution.
//!
//! Turns the declared `requires`/`uses` sets of a cluster's services into one
//! minimal [DependencyGraph] per stage, then into an action-level graph over
//! `(action, service)` pairs driven by the [ActionCatalog] rules.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use drover_kernel::{KernelError, ProvisionerAction, ServiceSpec, StageDependencies};

use crate::catalog::{ActionCatalog, DependencyStage};
use crate::dependency_graph::DependencyGraph;

/// One provisioner action on one service, cluster-wide.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ServiceAction {
    pub action: ProvisionerAction,
    pub service: String,
}

impl ServiceAction {
    pub fn new(action: ProvisionerAction, service: impl Into<String>) -> Self {
        Self {
            action,
            service: service.into(),
        }
    }
}

impl fmt::Display for ServiceAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.action, self.service)
    }
}

#[derive(Clone, Debug)]
pub struct ResolvedDependencies {
    pub install: DependencyGraph<String>,
    pub runtime: DependencyGraph<String>,
    /// `(action, service) -> (action, service)` ordering for cluster-wide execution.
    pub actions: DependencyGraph<ServiceAction>,
}

impl ResolvedDependencies {
    pub fn stage(&self, stage: DependencyStage) -> &DependencyGraph<String> {
        match stage {
            DependencyStage::Install => &self.install,
            DependencyStage::Runtime => &self.runtime,
        }
    }
}

pub struct ServiceDependencyResolver {
    catalog: Arc<ActionCatalog>,
}

impl ServiceDependencyResolver {
    pub fn new(catalog: Arc<ActionCatalog>) -> Self {
        Self { catalog }
    }

    /// Resolves the dependencies among `services`, the full service set of one
    /// cluster.
    ///
    /// A `requires` entry matching no service (by name or `provides` alias) is a
    /// validation error; unmatched `uses` entries are ignored. Cycles are
    /// configuration errors.
    pub fn resolve(&self, services: &[ServiceSpec]) -> Result<ResolvedDependencies, KernelError> {
        let specs: BTreeMap<&str, &ServiceSpec> =
            services.iter().map(|s| (s.name.as_str(), s)).collect();
        let providers = provider_index(services);

        let install = stage_graph(&specs, &providers, |s| &s.install)?.transitive_reduction();
        let runtime = stage_graph(&specs, &providers, |s| &s.runtime)?.transitive_reduction();

        let mut nodes = BTreeSet::new();
        for spec in services {
            for action in spec.actions.keys() {
                nodes.insert(ServiceAction::new(*action, spec.name.clone()));
            }
        }
        let mut edges = Vec::new();
        for rule in self.catalog.rules() {
            let graph = match rule.stage {
                DependencyStage::Install => &install,
                DependencyStage::Runtime => &runtime,
            };
            // the dependent side acts first in a reversed rule
            let (anchor_action, reached_action) = if rule.reversed {
                (rule.waits_for, rule.action)
            } else {
                (rule.action, rule.waits_for)
            };
            for spec in services {
                if !spec.implements(anchor_action) {
                    continue;
                }
                let anchor = ServiceAction::new(anchor_action, spec.name.clone());
                for dependency in bridged_dependencies(graph, &specs, &spec.name, reached_action) {
                    let reached = ServiceAction::new(reached_action, dependency);
                    if rule.reversed {
                        edges.push((reached, anchor.clone()));
                    } else {
                        edges.push((anchor.clone(), reached));
                    }
                }
            }
        }
        let actions = DependencyGraph::new(nodes, edges)?.transitive_reduction();

        log::debug!(
            "dependencies_resolved services={} install_edges={} runtime_edges={} action_edges={}",
            services.len(),
            install.edge_count(),
            runtime.edge_count(),
            actions.edge_count()
        );
        Ok(ResolvedDependencies {
            install,
            runtime,
            actions,
        })
    }
}

/// Reachability query over a resolved graph.
pub fn does_depend_on<N>(a: &N, b: &N, graph: &DependencyGraph<N>) -> bool
where
    N: Ord + Clone + fmt::Display,
{
    graph.depends_on(a, b)
}

/// Name or alias -> concrete services answering to it.
fn provider_index(services: &[ServiceSpec]) -> BTreeMap<&str, BTreeSet<&str>> {
    let mut index: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
    for spec in services {
        index
            .entry(spec.name.as_str())
            .or_default()
            .insert(spec.name.as_str());
        for alias in &spec.provides {
            index
                .entry(alias.as_str())
                .or_default()
                .insert(spec.name.as_str());
        }
    }
    index
}

fn stage_graph(
    specs: &BTreeMap<&str, &ServiceSpec>,
    providers: &BTreeMap<&str, BTreeSet<&str>>,
    stage: impl Fn(&ServiceSpec) -> &StageDependencies,
) -> Result<DependencyGraph<String>, KernelError> {
    let mut edges = Vec::new();
    for (name, spec) in specs {
        let declared = stage(spec);
        for required in &declared.requires {
            let targets = providers.get(required.as_str()).ok_or_else(|| {
                KernelError::Validation(format!(
                    "service '{}' requires '{}', which no service in the cluster provides",
                    name, required
                ))
            })?;
            edges.extend(
                targets
                    .iter()
                    .filter(|t| *t != name)
                    .map(|t| (name.to_string(), t.to_string())),
            );
        }
        for used in &declared.uses {
            if let Some(targets) = providers.get(used.as_str()) {
                edges.extend(
                    targets
                        .iter()
                        .filter(|t| *t != name)
                        .map(|t| (name.to_string(), t.to_string())),
                );
            }
        }
    }
    DependencyGraph::new(specs.keys().map(|name| name.to_string()), edges)
}

/// Nearest dependencies of `service` implementing `action`, bridging through
/// dependencies that do not implement it.
fn bridged_dependencies(
    graph: &DependencyGraph<String>,
    specs: &BTreeMap<&str, &ServiceSpec>,
    service: &str,
    action: ProvisionerAction,
) -> BTreeSet<String> {
    let mut found = BTreeSet::new();
    let mut seen = BTreeSet::new();
    let mut stack: Vec<&String> = graph.dependencies(&service.to_string()).collect();
    while let Some(next) = stack.pop() {
        if !seen.insert(next.clone()) {
            continue;
        }
        let implements = specs
            .get(next.as_str())
            .is_some_and(|spec| spec.implements(action));
        if implements {
            found.insert(next.clone());
        } else {
            stack.extend(graph.dependencies(next));
        }
    }
    found
}
