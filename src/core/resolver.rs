use crate::{AppManError, Result};
use crate::core::registry::ProfileRegistry;
use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::debug;

/// Which profiles end up in a resolved order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    /// Targets plus everything they transitively depend on
    WithDependencies,
    /// Only the targets, ordered so that dependencies among them come first
    TargetsOnly,
}

/// Resolved order plus the targets that could not be resolved
#[derive(Debug, Default)]
pub struct Plan {
    pub order: Vec<String>,
    pub rejected: Vec<(String, AppManError)>,
}

pub struct DependencyResolver<'a> {
    registry: &'a ProfileRegistry,
}

impl<'a> DependencyResolver<'a> {
    pub fn new(registry: &'a ProfileRegistry) -> Self {
        Self { registry }
    }

    /// Every registered profile in dependency order
    pub fn resolve_all(&self) -> Result<Vec<String>> {
        self.resolve(&self.registry.names(), Scope::WithDependencies)
    }

    /// Order `targets` so that each profile follows its dependencies.
    ///
    /// Fails as a whole on an unknown target or dependency and on a cycle;
    /// no partial order is produced.
    pub fn resolve(&self, targets: &[String], scope: Scope) -> Result<Vec<String>> {
        let targets = targets
            .iter()
            .map(|t| t.to_lowercase())
            .collect::<Vec<_>>();

        let closure = self.closure(&targets)?;
        self.check_cycles(&closure)?;

        let mut order = Vec::with_capacity(closure.len());
        let mut visited = FxHashSet::default();
        for target in &targets {
            self.visit(target, &mut visited, &mut order);
        }

        if scope == Scope::TargetsOnly {
            let wanted: FxHashSet<&String> = targets.iter().collect();
            order.retain(|name| wanted.contains(name));
        }

        debug!(?order, ?scope, "resolved");
        Ok(order)
    }

    /// Resolve targets one by one so that a broken target does not take
    /// the others down, then order the good ones together.
    pub fn plan(&self, targets: &[String], scope: Scope) -> Plan {
        let mut plan = Plan::default();
        let mut accepted = Vec::new();

        for target in targets {
            match self.resolve(std::slice::from_ref(target), scope) {
                Ok(_) => accepted.push(target.clone()),
                Err(e) => plan.rejected.push((target.clone(), e)),
            }
        }

        match self.resolve(&accepted, scope) {
            Ok(order) => plan.order = order,
            Err(e) => {
                let reason = e.to_string();
                plan.rejected.extend(
                    accepted
                        .into_iter()
                        .map(|target| (target, AppManError::Config(reason.clone()))),
                );
            }
        }
        plan
    }

    /// Targets and their transitive dependencies, in discovery order
    fn closure(&self, targets: &[String]) -> Result<Vec<String>> {
        let mut seen = FxHashSet::default();
        let mut closure = Vec::new();
        let mut stack: Vec<String> = targets.iter().rev().cloned().collect();

        for target in targets {
            if !self.registry.contains(target) {
                return Err(AppManError::ProfileNotFound(target.clone()));
            }
        }

        while let Some(name) = stack.pop() {
            if !seen.insert(name.clone()) {
                continue;
            }
            let profile = self.registry.require(&name)?;
            for dep in profile.spec().dependencies().iter().rev() {
                if !self.registry.contains(dep) {
                    return Err(AppManError::UnknownDependency {
                        profile: name.clone(),
                        dependency: dep.clone(),
                    });
                }
                stack.push(dep.clone());
            }
            closure.push(name);
        }

        Ok(closure)
    }

    fn check_cycles(&self, closure: &[String]) -> Result<()> {
        let mut graph = DiGraph::<&str, ()>::new();
        let mut nodes: FxHashMap<&str, NodeIndex> = FxHashMap::default();

        for name in closure {
            nodes.insert(name.as_str(), graph.add_node(name.as_str()));
        }
        for name in closure {
            if let Some(profile) = self.registry.get(name) {
                for dep in profile.spec().dependencies() {
                    if let Some(&to) = nodes.get(dep.as_str()) {
                        graph.add_edge(nodes[name.as_str()], to, ());
                    }
                }
            }
        }

        for component in tarjan_scc(&graph) {
            let is_cycle = component.len() > 1
                || graph.contains_edge(component[0], component[0]);
            if is_cycle {
                let members: FxHashSet<NodeIndex> = component.iter().copied().collect();
                return Err(AppManError::DependencyCycle(cycle_path(&graph, &members)));
            }
        }
        Ok(())
    }

    fn visit(&self, name: &str, visited: &mut FxHashSet<String>, order: &mut Vec<String>) {
        if !visited.insert(name.to_string()) {
            return;
        }
        if let Some(profile) = self.registry.get(name) {
            let mut deps: Vec<&String> = profile.spec().dependencies().iter().collect();
            deps.sort_by_key(|dep| self.registry.position(dep));
            for dep in deps {
                self.visit(dep, visited, order);
            }
        }
        order.push(name.to_string());
    }
}

/// Walk a strongly connected component back to its first member,
/// e.g. `["a", "b", "a"]`
fn cycle_path(graph: &DiGraph<&str, ()>, members: &FxHashSet<NodeIndex>) -> Vec<String> {
    let Some(&start) = members.iter().min_by_key(|n| graph[**n]) else {
        return Vec::new();
    };

    let mut path = vec![start];
    let mut on_path = FxHashSet::default();
    on_path.insert(start);
    let mut current = start;

    loop {
        let mut next: Vec<NodeIndex> = graph
            .neighbors(current)
            .filter(|n| members.contains(n))
            .collect();
        next.sort_by_key(|n| graph[*n]);

        if next.contains(&start) {
            path.push(start);
            break;
        }
        match next.into_iter().find(|n| !on_path.contains(n)) {
            Some(n) => {
                on_path.insert(n);
                path.push(n);
                current = n;
            }
            None => break,
        }
    }

    path.into_iter().map(|n| graph[n].to_string()).collect()
}
