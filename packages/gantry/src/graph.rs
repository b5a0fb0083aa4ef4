//! The in-memory target graph.
//!
//! The graph is populated by the parser collaborator before the build phase;
//! the core treats it as a read-mostly store of [`TargetNode`]s and assumes
//! the dependency structure is acyclic (cycle detection happens upstream).

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, RwLock},
};

use color_eyre::{
    Result,
    eyre::{Context, ContextCompat, bail},
};
use tracing::instrument;

use crate::{
    label::BuildLabel,
    target::{Target, TargetNode},
};

/// Shared store of all targets known to this build invocation.
#[derive(Default)]
pub struct Graph {
    targets: RwLock<HashMap<BuildLabel, Arc<TargetNode>>>,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a target. Labels are unique; re-registration is an error.
    pub fn add_target(&self, target: Target) -> Result<Arc<TargetNode>> {
        let label = target.label.clone();
        let node = Arc::new(TargetNode::new(target));
        let mut targets = self.targets.write().expect("graph lock poisoned");
        if targets.contains_key(&label) {
            bail!("target {label} is already registered");
        }
        targets.insert(label, node.clone());
        Ok(node)
    }

    pub fn target(&self, label: &BuildLabel) -> Option<Arc<TargetNode>> {
        self.targets
            .read()
            .expect("graph lock poisoned")
            .get(label)
            .cloned()
    }

    /// Look up a target that must exist.
    pub fn target_or_die(&self, label: &BuildLabel) -> Result<Arc<TargetNode>> {
        self.target(label)
            .with_context(|| format!("unknown target {label}"))
    }

    /// Direct dependencies of a target, including source and tool targets.
    pub fn dependencies(&self, target: &Target) -> Result<Vec<Arc<TargetNode>>> {
        target
            .dependency_labels()
            .iter()
            .map(|label| self.target_or_die(label))
            .collect()
    }

    /// Targets that directly depend on `label`.
    pub fn reverse_dependencies(&self, label: &BuildLabel) -> Vec<Arc<TargetNode>> {
        let targets = self.targets.read().expect("graph lock poisoned");
        targets
            .values()
            .filter(|node| node.with(|t| t.dependency_labels().contains(label)))
            .cloned()
            .collect()
    }

    /// The transitive dependency closure of a target, breadth-first,
    /// excluding the target itself.
    pub fn transitive_dependencies(&self, target: &Target) -> Result<Vec<Arc<TargetNode>>> {
        let mut seen = HashSet::new();
        let mut queue = target.dependency_labels();
        let mut closure = Vec::new();
        while let Some(label) = queue.pop() {
            if !seen.insert(label.clone()) {
                continue;
            }
            let node = self.target_or_die(&label)?;
            queue.extend(node.with(Target::dependency_labels));
            closure.push(node);
        }
        Ok(closure)
    }

    /// Whether every dependency of the target is in a terminal state.
    pub fn all_deps_built(&self, target: &Target) -> Result<bool> {
        Ok(self
            .dependencies(target)?
            .iter()
            .all(|dep| dep.state().is_terminal()))
    }

    /// Run the target's pre-build hook, if any. The hook may mutate the
    /// target; its memoized rule hash is invalidated afterwards.
    #[instrument(skip_all, fields(target = %node.label()))]
    pub fn run_pre_build(&self, node: &TargetNode) -> Result<()> {
        let hook = node.with(|t| t.pre_build.clone());
        let Some(hook) = hook else { return Ok(()) };
        node.with_mut(|t| {
            let result = hook.call(t);
            t.rule_hash = None;
            result
        })
        .with_context(|| format!("pre-build hook of {}", node.label()))
    }

    /// Run the target's post-build hook with the build's stdout, if any.
    #[instrument(skip_all, fields(target = %node.label()))]
    pub fn run_post_build(&self, node: &TargetNode, stdout: &[u8]) -> Result<()> {
        let hook = node.with(|t| t.post_build.clone());
        let Some(hook) = hook else { return Ok(()) };
        node.with_mut(|t| {
            let result = hook.call(t, stdout);
            t.rule_hash = None;
            result
        })
        .with_context(|| format!("post-build hook of {}", node.label()))
    }

    /// All registered labels, sorted. Mostly useful for diagnostics.
    pub fn labels(&self) -> Vec<BuildLabel> {
        let targets = self.targets.read().expect("graph lock poisoned");
        let mut labels: Vec<_> = targets.keys().cloned().collect();
        labels.sort();
        labels
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::target::{BuildInput, BuildState, TargetKind};

    fn command_target(name: &str, deps: &[&str]) -> Target {
        Target::builder()
            .label(BuildLabel::new("pkg", name))
            .kind(TargetKind::Command)
            .deps(deps.iter().map(|d| BuildLabel::new("pkg", *d)).collect())
            .build()
    }

    #[test]
    fn rejects_duplicate_labels() {
        let graph = Graph::new();
        graph.add_target(command_target("a", &[])).unwrap();
        assert!(graph.add_target(command_target("a", &[])).is_err());
    }

    #[test]
    fn resolves_source_targets_as_dependencies() {
        let graph = Graph::new();
        graph.add_target(command_target("dep", &[])).unwrap();
        let mut t = command_target("top", &[]);
        t.sources
            .push(BuildInput::Target(BuildLabel::new("pkg", "dep")));
        let node = graph.add_target(t).unwrap();

        let deps = node.with(|t| graph.dependencies(t)).unwrap();
        assert_eq!(deps.len(), 1);
        assert_eq!(deps[0].label(), &BuildLabel::new("pkg", "dep"));
    }

    #[test]
    fn transitive_closure_walks_all_levels() {
        let graph = Graph::new();
        graph.add_target(command_target("leaf", &[])).unwrap();
        graph.add_target(command_target("mid", &["leaf"])).unwrap();
        let top = graph.add_target(command_target("top", &["mid"])).unwrap();

        let closure = top.with(|t| graph.transitive_dependencies(t)).unwrap();
        let mut labels: Vec<_> = closure.iter().map(|n| n.label().name.clone()).collect();
        labels.sort();
        assert_eq!(labels, vec!["leaf", "mid"]);
    }

    #[test]
    fn all_deps_built_tracks_terminal_states() {
        let graph = Graph::new();
        let dep = graph.add_target(command_target("dep", &[])).unwrap();
        let top = graph.add_target(command_target("top", &["dep"])).unwrap();

        assert!(!top.with(|t| graph.all_deps_built(t)).unwrap());
        dep.set_state(BuildState::Built);
        assert!(top.with(|t| graph.all_deps_built(t)).unwrap());
    }
}
