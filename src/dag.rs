//! Stage dependency graph and the validated [`PipelineDefinition`].
//!
//! Nodes are stage names; an edge runs from a dependency to its dependent.
//! Construction rejects duplicate names, undefined or self-referencing
//! dependencies and cycles (every offending cycle is reported), so a
//! definition that exists is always executable.
//!
//! The topological order is Kahn's algorithm with a min-heap over
//! declaration indices: whenever several stages are ready, the one declared
//! first wins. The same configuration therefore always yields the same
//! order.

use crate::condition::Condition;
use crate::config::{PipelineConfig, StageSpec};
use crate::error::ConfigError;
use std::cmp::Reverse;
use std::collections::{BTreeSet, BinaryHeap, HashMap, HashSet, VecDeque};
use std::path::Path;

/// Directed acyclic graph over stage names.
#[derive(Debug, Clone)]
pub struct StageGraph {
    names: Vec<String>,
    index: HashMap<String, usize>,
    /// `dependencies[i]`: stages `i` waits for.
    dependencies: Vec<Vec<usize>>,
    /// `dependents[i]`: stages waiting for `i`.
    dependents: Vec<Vec<usize>>,
    order: Vec<usize>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    InProgress,
    Done,
}

impl StageGraph {
    /// Build and validate the graph for the given stage specs.
    pub fn build(specs: &[StageSpec]) -> Result<Self, ConfigError> {
        let mut index = HashMap::with_capacity(specs.len());
        let mut names = Vec::with_capacity(specs.len());
        for (i, spec) in specs.iter().enumerate() {
            if index.insert(spec.name.clone(), i).is_some() {
                return Err(ConfigError::DuplicateStage {
                    name: spec.name.clone(),
                });
            }
            names.push(spec.name.clone());
        }

        let mut dependencies = vec![Vec::new(); specs.len()];
        let mut dependents = vec![Vec::new(); specs.len()];
        for (i, spec) in specs.iter().enumerate() {
            let mut seen = HashSet::new();
            for dep in &spec.dependencies {
                if dep == &spec.name {
                    return Err(ConfigError::SelfDependency {
                        stage: spec.name.clone(),
                    });
                }
                let &d = index.get(dep).ok_or_else(|| ConfigError::UnknownDependency {
                    stage: spec.name.clone(),
                    dependency: dep.clone(),
                })?;
                if seen.insert(d) {
                    dependencies[i].push(d);
                    dependents[d].push(i);
                }
            }
        }

        let mut graph = Self {
            names,
            index,
            dependencies,
            dependents,
            order: Vec::new(),
        };

        let cycles = graph.find_cycles();
        if !cycles.is_empty() {
            return Err(ConfigError::Cycle { cycles });
        }
        graph.order = graph.stable_topological_order();
        Ok(graph)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// Stage names in execution order.
    pub fn topological_order(&self) -> Vec<&str> {
        self.order.iter().map(|&i| self.names[i].as_str()).collect()
    }

    /// Direct dependencies of `name`, in declaration order.
    pub fn dependencies(&self, name: &str) -> Vec<&str> {
        self.index
            .get(name)
            .map(|&i| {
                self.dependencies[i]
                    .iter()
                    .map(|&d| self.names[d].as_str())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Direct dependents of `name`.
    pub fn dependents(&self, name: &str) -> Vec<&str> {
        self.index
            .get(name)
            .map(|&i| {
                self.dependents[i]
                    .iter()
                    .map(|&d| self.names[d].as_str())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Every stage reachable from `name` along dependency edges.
    pub fn transitive_dependents(&self, name: &str) -> BTreeSet<&str> {
        let mut out = BTreeSet::new();
        let Some(&start) = self.index.get(name) else {
            return out;
        };
        let mut queue = VecDeque::from([start]);
        let mut seen = HashSet::from([start]);
        while let Some(n) = queue.pop_front() {
            for &d in &self.dependents[n] {
                if seen.insert(d) {
                    out.insert(self.names[d].as_str());
                    queue.push_back(d);
                }
            }
        }
        out
    }

    /// Every distinct cycle reached by a depth-first walk in declaration
    /// order, each closed by repeating its first stage.
    fn find_cycles(&self) -> Vec<Vec<String>> {
        let mut marks = vec![Mark::Unvisited; self.names.len()];
        let mut stack = Vec::new();
        let mut cycles = Vec::new();
        for i in 0..self.names.len() {
            if marks[i] == Mark::Unvisited {
                self.visit(i, &mut marks, &mut stack, &mut cycles);
            }
        }
        cycles
    }

    fn visit(
        &self,
        node: usize,
        marks: &mut [Mark],
        stack: &mut Vec<usize>,
        cycles: &mut Vec<Vec<String>>,
    ) {
        marks[node] = Mark::InProgress;
        stack.push(node);
        for &next in &self.dependents[node] {
            match marks[next] {
                Mark::Unvisited => self.visit(next, marks, stack, cycles),
                Mark::InProgress => {
                    if let Some(pos) = stack.iter().position(|&n| n == next) {
                        let mut cycle: Vec<String> =
                            stack[pos..].iter().map(|&n| self.names[n].clone()).collect();
                        cycle.push(self.names[next].clone());
                        cycles.push(cycle);
                    }
                }
                Mark::Done => {}
            }
        }
        stack.pop();
        marks[node] = Mark::Done;
    }

    fn stable_topological_order(&self) -> Vec<usize> {
        let mut in_degree: Vec<usize> = self.dependencies.iter().map(Vec::len).collect();
        let mut ready: BinaryHeap<Reverse<usize>> = in_degree
            .iter()
            .enumerate()
            .filter(|(_, &d)| d == 0)
            .map(|(i, _)| Reverse(i))
            .collect();

        let mut order = Vec::with_capacity(self.names.len());
        while let Some(Reverse(n)) = ready.pop() {
            order.push(n);
            for &d in &self.dependents[n] {
                in_degree[d] -= 1;
                if in_degree[d] == 0 {
                    ready.push(Reverse(d));
                }
            }
        }
        order
    }
}

/// A validated, immutable pipeline: configuration, graph and compiled
/// stage conditions.
#[derive(Debug, Clone)]
pub struct PipelineDefinition {
    config: PipelineConfig,
    graph: StageGraph,
    conditions: HashMap<String, Condition>,
}

impl PipelineDefinition {
    /// Validate a configuration.
    pub fn new(config: PipelineConfig) -> Result<Self, ConfigError> {
        if config.name.trim().is_empty() {
            return Err(ConfigError::Invalid("pipeline name must not be empty".into()));
        }
        if config.max_parallel_stages == 0 {
            return Err(ConfigError::Invalid(
                "max_parallel_stages must be ≥ 1".into(),
            ));
        }
        for spec in &config.stages {
            validate_spec(spec)?;
        }

        let graph = StageGraph::build(&config.stages)?;

        let mut conditions = HashMap::new();
        for spec in &config.stages {
            if let Some(expr) = &spec.condition {
                let compiled =
                    Condition::parse(expr).map_err(|e| ConfigError::InvalidCondition {
                        stage: spec.name.clone(),
                        detail: e.to_string(),
                    })?;
                conditions.insert(spec.name.clone(), compiled);
            }
        }

        Ok(Self {
            config,
            graph,
            conditions,
        })
    }

    /// Load and validate a YAML or JSON pipeline file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Self::new(PipelineConfig::from_file(path)?)
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn version(&self) -> &str {
        &self.config.version
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn graph(&self) -> &StageGraph {
        &self.graph
    }

    /// Stage specs in declaration order.
    pub fn stages(&self) -> &[StageSpec] {
        &self.config.stages
    }

    pub fn stage(&self, name: &str) -> Option<&StageSpec> {
        self.graph
            .index
            .get(name)
            .map(|&i| &self.config.stages[i])
    }

    pub fn condition(&self, name: &str) -> Option<&Condition> {
        self.conditions.get(name)
    }

    pub fn topological_order(&self) -> Vec<&str> {
        self.graph.topological_order()
    }
}

fn validate_spec(spec: &StageSpec) -> Result<(), ConfigError> {
    if spec.name.trim().is_empty() {
        return Err(ConfigError::Invalid("stage name must not be empty".into()));
    }
    if spec.max_parallel == 0 {
        return Err(ConfigError::Invalid(format!(
            "stage '{}': max_parallel must be ≥ 1",
            spec.name
        )));
    }
    if spec.batch_size == Some(0) {
        return Err(ConfigError::Invalid(format!(
            "stage '{}': batch_size must be ≥ 1",
            spec.name
        )));
    }
    let cpu = spec.resources.cpu_cores;
    if !cpu.is_finite() || cpu < 0.0 {
        return Err(ConfigError::Invalid(format!(
            "stage '{}': cpu_cores must be a non-negative number, got {cpu}",
            spec.name
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(name: &str, deps: &[&str]) -> StageSpec {
        StageSpec::new(name).depends_on(deps.iter().copied())
    }

    #[test]
    fn diamond_order_follows_declaration_for_ties() {
        let specs = vec![
            spec("a", &[]),
            spec("c", &["a"]),
            spec("b", &["a"]),
            spec("d", &["b", "c"]),
        ];
        let g = StageGraph::build(&specs).unwrap();
        assert_eq!(g.topological_order(), vec!["a", "c", "b", "d"]);
        assert_eq!(g.dependencies("d"), vec!["b", "c"]);
        assert_eq!(g.dependents("a"), vec!["c", "b"]);
    }

    #[test]
    fn ready_stages_follow_declaration_order() {
        let specs = vec![spec("z", &[]), spec("y", &["z"]), spec("x", &[])];
        let g = StageGraph::build(&specs).unwrap();
        // `y` becomes ready after `z` and was declared before `x`.
        assert_eq!(g.topological_order(), vec!["z", "y", "x"]);
    }

    #[test]
    fn rejects_duplicate_names() {
        let err = StageGraph::build(&[spec("a", &[]), spec("a", &[])]).unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateStage { name } if name == "a"));
    }

    #[test]
    fn rejects_unknown_dependency() {
        let err = StageGraph::build(&[spec("a", &["ghost"])]).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::UnknownDependency { ref stage, ref dependency }
                if stage == "a" && dependency == "ghost"
        ));
    }

    #[test]
    fn rejects_self_dependency() {
        let err = StageGraph::build(&[spec("a", &["a"])]).unwrap_err();
        assert!(matches!(err, ConfigError::SelfDependency { .. }));
    }

    #[test]
    fn reports_every_cycle() {
        let specs = vec![
            spec("a", &["c"]),
            spec("b", &["a"]),
            spec("c", &["b"]),
            spec("d", &[]),
            spec("e", &["f"]),
            spec("f", &["e"]),
        ];
        let err = StageGraph::build(&specs).unwrap_err();
        let ConfigError::Cycle { cycles } = err else {
            panic!("expected cycle error");
        };
        assert_eq!(cycles.len(), 2);
        assert_eq!(cycles[0], vec!["a", "b", "c", "a"]);
        assert_eq!(cycles[1], vec!["e", "f", "e"]);
    }

    #[test]
    fn duplicate_dependency_entries_are_collapsed() {
        let g = StageGraph::build(&[spec("a", &[]), spec("b", &["a", "a"])]).unwrap();
        assert_eq!(g.dependencies("b"), vec!["a"]);
    }

    #[test]
    fn transitive_dependents_walks_whole_subgraph() {
        let specs = vec![
            spec("a", &[]),
            spec("b", &["a"]),
            spec("c", &["b"]),
            spec("d", &[]),
        ];
        let g = StageGraph::build(&specs).unwrap();
        let down: Vec<_> = g.transitive_dependents("a").into_iter().collect();
        assert_eq!(down, vec!["b", "c"]);
        assert!(g.transitive_dependents("d").is_empty());
    }

    #[test]
    fn definition_compiles_conditions() {
        let def = PipelineConfig::builder("p")
            .stage(StageSpec::new("a").condition("has_images"))
            .build()
            .unwrap();
        assert!(def.condition("a").is_some());
        assert_eq!(def.stage("a").map(|s| s.name.as_str()), Some("a"));
    }

    #[test]
    fn definition_rejects_bad_condition() {
        let err = PipelineConfig::builder("p")
            .stage(StageSpec::new("a").condition("has_images &&"))
            .build()
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidCondition { .. }));
    }

    #[test]
    fn definition_rejects_zero_parallelism() {
        let err = PipelineConfig::builder("p")
            .max_parallel_stages(0)
            .stage(StageSpec::new("a"))
            .build()
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }
}
