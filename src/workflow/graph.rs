//! Parsed Workflow Graph
//!
//! The immutable result of parsing: resolved calls, the dependency DAG
//! between them and the declared workflow outputs.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use log::debug;
use serde_json::Value;

use super::expression::{InputExpr, OutputExpr};
use super::model::{CallDefinition, Fqn, WorkflowId, WorkflowOptions, WorkflowSources};
use super::validator::ValidationError;

/// Dependency DAG over call FQNs. An edge A -> B means B needs A.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    order: Vec<Fqn>,
    upstream: BTreeMap<Fqn, BTreeSet<Fqn>>,
    downstream: BTreeMap<Fqn, BTreeSet<Fqn>>,
}

impl DependencyGraph {
    /// Builds the graph from each call's upstream set and sorts it
    /// topologically using Kahn's algorithm.
    ///
    /// Fails with [`ValidationError::CyclicDependency`] naming every call
    /// that could not be ordered.
    pub fn build(
        edges: impl IntoIterator<Item = (Fqn, BTreeSet<Fqn>)>,
    ) -> Result<Self, ValidationError> {
        let upstream: BTreeMap<Fqn, BTreeSet<Fqn>> = edges.into_iter().collect();

        let mut downstream: BTreeMap<Fqn, BTreeSet<Fqn>> =
            upstream.keys().map(|k| (k.clone(), BTreeSet::new())).collect();
        for (call, parents) in &upstream {
            for parent in parents {
                downstream
                    .entry(parent.clone())
                    .or_default()
                    .insert(call.clone());
            }
        }

        // Build in-degree map
        let mut in_degree: BTreeMap<&Fqn, usize> =
            upstream.iter().map(|(k, v)| (k, v.len())).collect();

        // Start with root nodes (in-degree = 0)
        let mut queue: VecDeque<&Fqn> = in_degree
            .iter()
            .filter(|(_, degree)| **degree == 0)
            .map(|(fqn, _)| *fqn)
            .collect();

        let mut order: Vec<Fqn> = Vec::with_capacity(upstream.len());

        while let Some(current) = queue.pop_front() {
            order.push(current.clone());

            if let Some(successors) = downstream.get(current) {
                for successor in successors {
                    if let Some(degree) = in_degree.get_mut(successor) {
                        *degree -= 1;
                        if *degree == 0 {
                            queue.push_back(successor);
                        }
                    }
                }
            }
        }

        if order.len() != upstream.len() {
            let stuck = in_degree
                .iter()
                .filter(|(_, degree)| **degree > 0)
                .map(|(fqn, _)| fqn.to_string())
                .collect();
            return Err(ValidationError::CyclicDependency(stuck));
        }

        debug!("Topological order: {:?}", order);

        Ok(Self {
            order,
            upstream,
            downstream,
        })
    }

    /// Calls in dependency order.
    pub fn topological_order(&self) -> &[Fqn] {
        &self.order
    }

    pub fn upstream(&self, fqn: &Fqn) -> impl Iterator<Item = &Fqn> + '_ {
        self.upstream.get(fqn).into_iter().flatten()
    }

    pub fn downstream(&self, fqn: &Fqn) -> impl Iterator<Item = &Fqn> + '_ {
        self.downstream.get(fqn).into_iter().flatten()
    }

    /// Every call that transitively depends on `fqn`.
    pub fn descendants(&self, fqn: &Fqn) -> BTreeSet<Fqn> {
        let mut seen = BTreeSet::new();
        let mut queue: VecDeque<&Fqn> = self.downstream(fqn).collect();
        while let Some(next) = queue.pop_front() {
            if seen.insert(next.clone()) {
                queue.extend(self.downstream(next));
            }
        }
        seen
    }

    /// Calls with no dependencies.
    pub fn roots(&self) -> Vec<&Fqn> {
        self.upstream
            .iter()
            .filter(|(_, parents)| parents.is_empty())
            .map(|(fqn, _)| fqn)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

/// Scatter of a parsed call.
#[derive(Debug, Clone, PartialEq)]
pub struct ScatterNode {
    pub variable: String,
    pub collection: InputExpr,
}

/// A call with its references resolved.
#[derive(Debug, Clone)]
pub struct CallNode {
    pub fqn: Fqn,
    pub definition: CallDefinition,
    pub inputs: BTreeMap<String, InputExpr>,
    pub outputs: BTreeMap<String, OutputExpr>,
    pub scatter: Option<ScatterNode>,
}

impl CallNode {
    pub fn is_scattered(&self) -> bool {
        self.scatter.is_some()
    }
}

/// A declared workflow output, `<workflow>.<call>.<output>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputReference {
    pub fqn: String,
    pub call: Fqn,
    pub name: String,
}

/// Output of the parser collaborator.
#[derive(Debug, Clone)]
pub struct WorkflowGraph {
    pub name: String,
    pub calls: BTreeMap<Fqn, CallNode>,
    pub graph: DependencyGraph,
    /// Workflow inputs after defaults were applied
    pub inputs: BTreeMap<String, Value>,
    pub outputs: Vec<OutputReference>,
}

impl WorkflowGraph {
    pub fn call(&self, fqn: &Fqn) -> Option<&CallNode> {
        self.calls.get(fqn)
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }
}

/// Everything a supervisor needs to run one workflow. Never mutated.
#[derive(Debug, Clone)]
pub struct WorkflowDescriptor {
    pub id: WorkflowId,
    pub sources: WorkflowSources,
    pub workflow: WorkflowGraph,
    pub options: WorkflowOptions,
}

impl WorkflowDescriptor {
    /// Retry budget of a call: its own, then the workflow option, then `fallback`.
    pub fn max_retries(&self, node: &CallNode, fallback: u32) -> u32 {
        node.definition
            .max_retries
            .or(self.options.max_retries)
            .unwrap_or(fallback)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fqn(name: &str) -> Fqn {
        Fqn::call("wf", name)
    }

    fn edges(spec: &[(&str, &[&str])]) -> Vec<(Fqn, BTreeSet<Fqn>)> {
        spec.iter()
            .map(|(call, parents)| (fqn(call), parents.iter().map(|p| fqn(p)).collect()))
            .collect()
    }

    #[test]
    fn test_topological_order_diamond() {
        let graph = DependencyGraph::build(edges(&[
            ("d", &["b", "c"]),
            ("b", &["a"]),
            ("c", &["a"]),
            ("a", &[]),
        ]))
        .unwrap();

        let order: Vec<&str> = graph
            .topological_order()
            .iter()
            .map(|f| f.call_name())
            .collect();
        assert_eq!(order, vec!["a", "b", "c", "d"]);
        assert_eq!(graph.roots(), vec![&fqn("a")]);
        assert_eq!(graph.len(), 4);
    }

    #[test]
    fn test_cycle_detected() {
        let error = DependencyGraph::build(edges(&[
            ("a", &["c"]),
            ("b", &["a"]),
            ("c", &["b"]),
            ("d", &[]),
        ]))
        .unwrap_err();

        assert_eq!(
            error,
            ValidationError::CyclicDependency(vec![
                "wf.a".to_string(),
                "wf.b".to_string(),
                "wf.c".to_string(),
            ])
        );
    }

    #[test]
    fn test_descendants() {
        let graph = DependencyGraph::build(edges(&[
            ("a", &[]),
            ("b", &["a"]),
            ("c", &["b"]),
            ("x", &[]),
        ]))
        .unwrap();

        let descendants = graph.descendants(&fqn("a"));
        assert!(descendants.contains(&fqn("b")));
        assert!(descendants.contains(&fqn("c")));
        assert!(!descendants.contains(&fqn("x")));
        assert_eq!(graph.upstream(&fqn("c")).collect::<Vec<_>>(), vec![&fqn("b")]);
        assert_eq!(graph.downstream(&fqn("c")).count(), 0);
    }
}
