//! Group dependency resolution
//!
//! Orders groups so that each one runs after everything it depends on. The
//! graph is kept as index-based adjacency lists; groups without an ordering
//! constraint between them keep their declaration order.

use std::collections::{BTreeSet, HashMap, HashSet};

use strata_core::{DisabledDependencyPolicy, MigrationError, MigrationResult};

use crate::definitions::{Group, SkipReason, SkippedGroup};

/// Dependency graph over a slice of groups, addressed by declaration index
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    names: Vec<String>,
    /// `dependencies[i]` lists the groups `i` depends on
    dependencies: Vec<Vec<usize>>,
    /// `dependents[i]` lists the groups depending on `i`
    dependents: Vec<Vec<usize>>,
}

impl DependencyGraph {
    /// Build the graph, rejecting duplicate names and unknown dependencies
    pub fn build(groups: &[Group]) -> MigrationResult<Self> {
        let mut index = HashMap::with_capacity(groups.len());
        for (i, group) in groups.iter().enumerate() {
            if index.insert(group.name.as_str(), i).is_some() {
                return Err(MigrationError::configuration(format!(
                    "group '{}' is declared more than once",
                    group.name
                )));
            }
        }

        let mut dependencies = vec![Vec::new(); groups.len()];
        let mut dependents = vec![Vec::new(); groups.len()];

        for (i, group) in groups.iter().enumerate() {
            for dependency in &group.dependencies {
                let &dep = index.get(dependency.as_str()).ok_or_else(|| {
                    MigrationError::configuration(format!(
                        "group '{}' depends on unknown group '{}'",
                        group.name, dependency
                    ))
                })?;
                if !dependencies[i].contains(&dep) {
                    dependencies[i].push(dep);
                    dependents[dep].push(i);
                }
            }
        }

        Ok(Self {
            names: groups.iter().map(|g| g.name.clone()).collect(),
            dependencies,
            dependents,
        })
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn name(&self, index: usize) -> &str {
        &self.names[index]
    }

    pub fn dependencies_of(&self, index: usize) -> &[usize] {
        &self.dependencies[index]
    }

    /// Topological order using Kahn's algorithm; ready groups are taken
    /// lowest declaration index first
    pub fn topological_order(&self) -> MigrationResult<Vec<usize>> {
        let mut in_degree: Vec<usize> = self.dependencies.iter().map(Vec::len).collect();
        let mut ready: BTreeSet<usize> = in_degree
            .iter()
            .enumerate()
            .filter(|(_, &degree)| degree == 0)
            .map(|(i, _)| i)
            .collect();

        let mut order = Vec::with_capacity(self.len());
        while let Some(current) = ready.pop_first() {
            order.push(current);
            for &dependent in &self.dependents[current] {
                in_degree[dependent] -= 1;
                if in_degree[dependent] == 0 {
                    ready.insert(dependent);
                }
            }
        }

        if order.len() != self.len() {
            return Err(MigrationError::CyclicDependency {
                cycle: self.find_cycle(),
            });
        }

        Ok(order)
    }

    /// Every group that depends on `index`, directly or transitively
    pub fn dependents_closure(&self, index: usize) -> HashSet<usize> {
        let mut seen = HashSet::new();
        let mut stack = vec![index];
        while let Some(current) = stack.pop() {
            for &dependent in &self.dependents[current] {
                if seen.insert(dependent) {
                    stack.push(dependent);
                }
            }
        }
        seen
    }

    /// Locate one cycle with a colouring DFS, returned as `a -> b -> a`
    fn find_cycle(&self) -> Vec<String> {
        #[derive(Clone, Copy, PartialEq)]
        enum Color {
            White,
            Gray,
            Black,
        }

        fn visit(
            graph: &DependencyGraph,
            node: usize,
            colors: &mut [Color],
            path: &mut Vec<usize>,
        ) -> Option<Vec<usize>> {
            colors[node] = Color::Gray;
            path.push(node);

            for &dep in &graph.dependencies[node] {
                match colors[dep] {
                    Color::Gray => {
                        let start = path.iter().position(|&n| n == dep).unwrap_or(0);
                        let mut cycle = path[start..].to_vec();
                        cycle.push(dep);
                        return Some(cycle);
                    }
                    Color::White => {
                        if let Some(cycle) = visit(graph, dep, colors, path) {
                            return Some(cycle);
                        }
                    }
                    Color::Black => {}
                }
            }

            path.pop();
            colors[node] = Color::Black;
            None
        }

        let mut colors = vec![Color::White; self.len()];
        for start in 0..self.len() {
            if colors[start] == Color::White {
                let mut path = Vec::new();
                if let Some(cycle) = visit(self, start, &mut colors, &mut path) {
                    // The DFS follows "depends on" edges; report in execution direction
                    return cycle
                        .into_iter()
                        .rev()
                        .map(|i| self.names[i].clone())
                        .collect();
                }
            }
        }

        Vec::new()
    }
}

/// Groups to execute, in order, plus the ones left out
#[derive(Debug, Clone)]
pub struct ExecutionPlan {
    pub graph: DependencyGraph,
    /// Indices into the group slice, in execution order
    pub order: Vec<usize>,
    pub skipped: Vec<SkippedGroup>,
}

impl ExecutionPlan {
    pub fn names(&self) -> Vec<&str> {
        self.order.iter().map(|&i| self.graph.name(i)).collect()
    }
}

/// Resolve the execution order of the enabled groups
///
/// Cycles and unknown dependencies are reported regardless of whether the
/// groups involved are enabled.
pub fn resolve(groups: &[Group], policy: DisabledDependencyPolicy) -> MigrationResult<ExecutionPlan> {
    let graph = DependencyGraph::build(groups)?;
    let topological = graph.topological_order()?;

    let mut excluded = vec![false; groups.len()];
    let mut order = Vec::new();
    let mut skipped = Vec::new();

    for index in topological {
        let group = &groups[index];
        if !group.enabled {
            excluded[index] = true;
            skipped.push(SkippedGroup {
                name: group.name.clone(),
                reason: SkipReason::Disabled,
            });
            continue;
        }

        let blocked_by = graph
            .dependencies_of(index)
            .iter()
            .copied()
            .find(|&dep| excluded[dep]);

        match (blocked_by, policy) {
            (None, _) => order.push(index),
            (Some(dep), DisabledDependencyPolicy::Fail) => {
                return Err(MigrationError::configuration(format!(
                    "group '{}' depends on disabled group '{}'; enable it or set on_disabled_dependency: skip",
                    group.name,
                    graph.name(dep)
                )));
            }
            (Some(dep), DisabledDependencyPolicy::Skip) => {
                tracing::warn!(
                    group = %group.name,
                    dependency = graph.name(dep),
                    "Skipping group with a disabled dependency"
                );
                excluded[index] = true;
                skipped.push(SkippedGroup {
                    name: group.name.clone(),
                    reason: SkipReason::DisabledDependency(graph.name(dep).to_string()),
                });
            }
        }
    }

    Ok(ExecutionPlan {
        graph,
        order,
        skipped,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn group(name: &str, deps: &[&str]) -> Group {
        Group::new(name, format!("/tmp/{}", name)).with_dependencies(deps.iter().copied())
    }

    fn position(order: &[&str], name: &str) -> usize {
        order.iter().position(|n| *n == name).unwrap()
    }

    #[test]
    fn test_default_trio_excludes_disabled_dummy_data() {
        let groups = vec![
            group("structures", &[]),
            group("basic-data", &["structures"]),
            group("dummy-data", &["structures", "basic-data"]).enabled(false),
        ];

        let plan = resolve(&groups, DisabledDependencyPolicy::Fail).unwrap();

        assert_eq!(plan.names(), vec!["structures", "basic-data"]);
        assert_eq!(
            plan.skipped,
            vec![SkippedGroup {
                name: "dummy-data".into(),
                reason: SkipReason::Disabled
            }]
        );
    }

    #[test]
    fn test_dependencies_declared_after_dependents() {
        let groups = vec![
            group("c", &["b"]),
            group("b", &["a"]),
            group("a", &[]),
        ];

        let plan = resolve(&groups, DisabledDependencyPolicy::Fail).unwrap();
        assert_eq!(plan.names(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_ties_follow_declaration_order() {
        let groups = vec![
            group("zeta", &[]),
            group("alpha", &[]),
            group("mid", &["zeta"]),
            group("beta", &[]),
        ];

        let plan = resolve(&groups, DisabledDependencyPolicy::Fail).unwrap();
        assert_eq!(plan.names(), vec!["zeta", "alpha", "mid", "beta"]);
    }

    #[test]
    fn test_every_group_follows_its_dependencies() {
        let groups = vec![
            group("reports", &["orders", "users"]),
            group("orders", &["products", "users"]),
            group("users", &["core"]),
            group("products", &["core"]),
            group("core", &[]),
            group("audit", &["core"]),
        ];

        let plan = resolve(&groups, DisabledDependencyPolicy::Fail).unwrap();
        let order = plan.names();
        assert_eq!(order.len(), groups.len());

        for g in &groups {
            for dep in &g.dependencies {
                assert!(
                    position(&order, dep) < position(&order, &g.name),
                    "{} must run before {}",
                    dep,
                    g.name
                );
            }
        }
    }

    #[test]
    fn test_unknown_dependency_is_configuration_error() {
        let groups = vec![group("basic-data", &["structure"])];

        let err = resolve(&groups, DisabledDependencyPolicy::Fail).unwrap_err();
        assert!(matches!(err, MigrationError::Configuration { .. }));
        assert!(err.to_string().contains("unknown group 'structure'"));
    }

    #[test]
    fn test_two_group_cycle_is_named() {
        let groups = vec![group("a", &["b"]), group("b", &["a"])];

        match resolve(&groups, DisabledDependencyPolicy::Fail).unwrap_err() {
            MigrationError::CyclicDependency { cycle } => {
                assert_eq!(cycle.len(), 3);
                assert_eq!(cycle.first(), cycle.last());
                assert!(cycle.contains(&"a".to_string()));
                assert!(cycle.contains(&"b".to_string()));
            }
            other => panic!("expected cycle, got {:?}", other),
        }
    }

    #[test]
    fn test_long_cycle_behind_acyclic_prefix() {
        let groups = vec![
            group("root", &[]),
            group("a", &["root", "d"]),
            group("b", &["a"]),
            group("c", &["b"]),
            group("d", &["c"]),
        ];

        match resolve(&groups, DisabledDependencyPolicy::Fail).unwrap_err() {
            MigrationError::CyclicDependency { cycle } => {
                assert_eq!(cycle.len(), 5);
                assert!(!cycle.contains(&"root".to_string()));
            }
            other => panic!("expected cycle, got {:?}", other),
        }
    }

    #[test]
    fn test_cycle_among_disabled_groups_is_still_rejected() {
        let groups = vec![
            group("a", &[]),
            group("x", &["y"]).enabled(false),
            group("y", &["x"]).enabled(false),
        ];

        assert!(matches!(
            resolve(&groups, DisabledDependencyPolicy::Skip),
            Err(MigrationError::CyclicDependency { .. })
        ));
    }

    #[test]
    fn test_self_dependency_is_a_cycle() {
        let groups = vec![group("a", &["a"])];
        match resolve(&groups, DisabledDependencyPolicy::Fail).unwrap_err() {
            MigrationError::CyclicDependency { cycle } => assert_eq!(cycle, vec!["a", "a"]),
            other => panic!("expected cycle, got {:?}", other),
        }
    }

    #[test]
    fn test_enabled_dependent_of_disabled_group_fails_fast() {
        let groups = vec![
            group("structures", &[]).enabled(false),
            group("basic-data", &["structures"]),
        ];

        let err = resolve(&groups, DisabledDependencyPolicy::Fail).unwrap_err();
        assert!(err.to_string().contains("disabled group 'structures'"));
    }

    #[test]
    fn test_skip_policy_excludes_dependents_transitively() {
        let groups = vec![
            group("structures", &[]),
            group("fixtures", &["structures"]).enabled(false),
            group("demo", &["fixtures"]),
            group("demo-extra", &["demo"]),
            group("basic-data", &["structures"]),
        ];

        let plan = resolve(&groups, DisabledDependencyPolicy::Skip).unwrap();

        assert_eq!(plan.names(), vec!["structures", "basic-data"]);
        let skipped: Vec<_> = plan.skipped.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(skipped, vec!["fixtures", "demo", "demo-extra"]);
        assert_eq!(
            plan.skipped[2].reason,
            SkipReason::DisabledDependency("demo".into())
        );
    }

    #[test]
    fn test_duplicate_dependencies_are_collapsed() {
        let groups = vec![group("a", &[]), group("b", &["a", "a"])];
        let plan = resolve(&groups, DisabledDependencyPolicy::Fail).unwrap();
        assert_eq!(plan.names(), vec!["a", "b"]);
    }

    #[test]
    fn test_dependents_closure() {
        let groups = vec![
            group("a", &[]),
            group("b", &["a"]),
            group("c", &["b"]),
            group("d", &[]),
        ];
        let graph = DependencyGraph::build(&groups).unwrap();

        let closure = graph.dependents_closure(0);
        assert_eq!(closure, HashSet::from([1, 2]));
        assert!(graph.dependents_closure(3).is_empty());
    }
}
