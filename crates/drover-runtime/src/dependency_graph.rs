//! Directed acyclic dependency graph.
//!
//! An edge `a -> b` reads "a depends on b". Construction rejects cycles with a
//! [KernelError::Config] naming the cycle, so every query below can assume a DAG.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Display;

use drover_kernel::KernelError;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DependencyGraph<N: Ord + Clone> {
    dependencies: BTreeMap<N, BTreeSet<N>>,
    dependents: BTreeMap<N, BTreeSet<N>>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Visiting,
    Done,
}

impl<N: Ord + Clone + Display> DependencyGraph<N> {
    /// Builds the graph over `nodes` plus every edge endpoint.
    pub fn new<I, E>(nodes: I, edges: E) -> Result<Self, KernelError>
    where
        I: IntoIterator<Item = N>,
        E: IntoIterator<Item = (N, N)>,
    {
        let mut graph = Self::empty();
        for node in nodes {
            graph.add_node(node);
        }
        for (from, to) in edges {
            if from == to {
                return Err(KernelError::Config(format!(
                    "dependency cycle: {} -> {}",
                    from, to
                )));
            }
            graph.add_node(from.clone());
            graph.add_node(to.clone());
            graph
                .dependencies
                .entry(from.clone())
                .or_default()
                .insert(to.clone());
            graph.dependents.entry(to).or_default().insert(from);
        }
        if let Some(cycle) = graph.find_cycle() {
            let rendered: Vec<String> = cycle.iter().map(ToString::to_string).collect();
            return Err(KernelError::Config(format!(
                "dependency cycle: {}",
                rendered.join(" -> ")
            )));
        }
        Ok(graph)
    }

    pub fn empty() -> Self {
        Self {
            dependencies: BTreeMap::new(),
            dependents: BTreeMap::new(),
        }
    }

    fn add_node(&mut self, node: N) {
        self.dependencies.entry(node.clone()).or_default();
        self.dependents.entry(node).or_default();
    }

    pub fn contains(&self, node: &N) -> bool {
        self.dependencies.contains_key(node)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &N> {
        self.dependencies.keys()
    }

    /// Every `(dependent, dependency)` pair.
    pub fn edges(&self) -> impl Iterator<Item = (&N, &N)> {
        self.dependencies
            .iter()
            .flat_map(|(from, tos)| tos.iter().map(move |to| (from, to)))
    }

    pub fn edge_count(&self) -> usize {
        self.dependencies.values().map(BTreeSet::len).sum()
    }

    /// Direct dependencies of `node`.
    pub fn dependencies(&self, node: &N) -> impl Iterator<Item = &N> {
        self.dependencies.get(node).into_iter().flatten()
    }

    /// Nodes depending directly on `node`.
    pub fn dependents(&self, node: &N) -> impl Iterator<Item = &N> {
        self.dependents.get(node).into_iter().flatten()
    }

    pub fn transitive_dependencies(&self, node: &N) -> BTreeSet<N> {
        reach(&self.dependencies, node)
    }

    pub fn transitive_dependents(&self, node: &N) -> BTreeSet<N> {
        reach(&self.dependents, node)
    }

    /// Whether `a` reaches `b` through one or more edges.
    pub fn depends_on(&self, a: &N, b: &N) -> bool {
        self.transitive_dependencies(a).contains(b)
    }

    /// Drops every edge `a -> c` for which another path `a -> b -> ... -> c` exists.
    pub fn transitive_reduction(&self) -> Self {
        let mut reduced = Self::empty();
        for node in self.nodes() {
            reduced.add_node(node.clone());
        }
        for (from, to) in self.edges() {
            let implied = self
                .dependencies(from)
                .filter(|other| *other != to)
                .any(|other| self.depends_on(other, to));
            if !implied {
                reduced
                    .dependencies
                    .entry(from.clone())
                    .or_default()
                    .insert(to.clone());
                reduced
                    .dependents
                    .entry(to.clone())
                    .or_default()
                    .insert(from.clone());
            }
        }
        reduced
    }

    /// Level-order topological grouping: level 0 holds nodes without
    /// dependencies, level `k` the nodes whose dependencies all sit below `k`.
    pub fn levels(&self) -> Vec<Vec<N>> {
        let mut remaining: BTreeMap<&N, usize> = self
            .dependencies
            .iter()
            .map(|(node, deps)| (node, deps.len()))
            .collect();
        let mut current: Vec<&N> = remaining
            .iter()
            .filter(|(_, count)| **count == 0)
            .map(|(node, _)| *node)
            .collect();
        let mut levels = Vec::new();
        while !current.is_empty() {
            for node in &current {
                remaining.remove(node);
            }
            let mut next = BTreeSet::new();
            for node in &current {
                for dependent in self.dependents(node) {
                    if let Some(count) = remaining.get_mut(dependent) {
                        *count -= 1;
                        if *count == 0 {
                            next.insert(dependent);
                        }
                    }
                }
            }
            levels.push(current.iter().map(|node| (*node).clone()).collect());
            current = next.into_iter().collect();
        }
        levels
    }

    fn find_cycle(&self) -> Option<Vec<N>> {
        let mut marks: BTreeMap<&N, Mark> = BTreeMap::new();
        let mut path: Vec<&N> = Vec::new();
        for start in self.dependencies.keys() {
            if let Some(cycle) = self.visit(start, &mut marks, &mut path) {
                return Some(cycle);
            }
        }
        None
    }

    fn visit<'a>(
        &'a self,
        node: &'a N,
        marks: &mut BTreeMap<&'a N, Mark>,
        path: &mut Vec<&'a N>,
    ) -> Option<Vec<N>> {
        match marks.get(node) {
            Some(Mark::Done) => return None,
            Some(Mark::Visiting) => {
                let at = path.iter().position(|n| *n == node)?;
                let mut cycle: Vec<N> = path[at..].iter().map(|n| (*n).clone()).collect();
                cycle.push(node.clone());
                return Some(cycle);
            }
            None => {}
        }
        marks.insert(node, Mark::Visiting);
        path.push(node);
        for dependency in self.dependencies(node) {
            if let Some(cycle) = self.visit(dependency, marks, path) {
                return Some(cycle);
            }
        }
        path.pop();
        marks.insert(node, Mark::Done);
        None
    }
}

fn reach<N: Ord + Clone>(adjacency: &BTreeMap<N, BTreeSet<N>>, start: &N) -> BTreeSet<N> {
    let mut seen = BTreeSet::new();
    let mut stack: Vec<&N> = adjacency.get(start).into_iter().flatten().collect();
    while let Some(node) = stack.pop() {
        if seen.insert(node.clone()) {
            stack.extend(adjacency.get(node).into_iter().flatten());
        }
    }
    seen
}

#[cfg(test)]
mod tests {
    use drover_kernel::ErrorKind;

    use super::*;

    fn graph(edges: &[(&str, &str)]) -> Result<DependencyGraph<String>, KernelError> {
        DependencyGraph::new(
            Vec::<String>::new(),
            edges.iter().map(|(a, b)| (a.to_string(), b.to_string())),
        )
    }

    fn s(v: &str) -> String {
        v.to_string()
    }

    #[test]
    fn cycles_fail_with_config_error_naming_the_path() {
        let err = graph(&[("a", "b"), ("b", "c"), ("c", "a")]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Config);
        let message = err.to_string();
        assert!(message.contains("a -> b -> c -> a"), "{}", message);

        assert!(graph(&[("a", "a")]).is_err());
    }

    #[test]
    fn reachability_queries() {
        let g = graph(&[("app", "db"), ("db", "storage"), ("cache", "storage")]).unwrap();
        assert!(g.depends_on(&s("app"), &s("storage")));
        assert!(!g.depends_on(&s("storage"), &s("app")));
        assert_eq!(
            g.transitive_dependents(&s("storage")),
            BTreeSet::from([s("app"), s("db"), s("cache")])
        );
        assert_eq!(g.dependencies(&s("app")).cloned().collect::<Vec<_>>(), vec![s("db")]);
        assert_eq!(g.dependents(&s("ghost")).count(), 0);
    }

    #[test]
    fn transitive_reduction_drops_implied_edges_only() {
        let g = graph(&[("a", "b"), ("b", "c"), ("a", "c"), ("a", "d")]).unwrap();
        let reduced = g.transitive_reduction();
        let edges: Vec<(String, String)> = reduced
            .edges()
            .map(|(a, b)| (a.clone(), b.clone()))
            .collect();
        assert_eq!(
            edges,
            vec![(s("a"), s("b")), (s("a"), s("d")), (s("b"), s("c"))]
        );
        // minimality: no remaining edge is implied by another path
        for (from, to) in reduced.edges() {
            assert!(!reduced
                .dependencies(from)
                .filter(|o| *o != to)
                .any(|o| reduced.depends_on(o, to)));
        }
        assert!(reduced.depends_on(&s("a"), &s("c")));
    }

    #[test]
    fn levels_group_by_longest_dependency_chain() {
        let g = DependencyGraph::new(
            vec![s("lone")],
            vec![
                (s("web"), s("app")),
                (s("app"), s("db")),
                (s("worker"), s("db")),
            ],
        )
        .unwrap();
        assert_eq!(
            g.levels(),
            vec![
                vec![s("db"), s("lone")],
                vec![s("app"), s("worker")],
                vec![s("web")],
            ]
        );
    }
}
