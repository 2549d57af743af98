//! The arena every deferred call is recorded into.
//!
//! Nodes are stored in a `petgraph` graph with an edge from each dependency to
//! the task consuming it. Handles only ever hold node indices, so there are no
//! ownership cycles even when forward declarations wire up a cyclic graph;
//! such cycles are reported when the graph is planned for execution.

use std::any::type_name;
use std::borrow::Cow;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use petgraph::Direction;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::graphmap::DiGraphMap;

use crate::core::{Dynamic, GraphId};
use crate::engine::{Body, Constant, NodeId, TaskNode};
use crate::error::ExecError;

/// The set of nodes one computation has to run, and the dependency edges
/// between them.
pub(crate) struct Plan {
    pub(crate) nodes: HashMap<NodeIndex, Arc<TaskNode>>,
    pub(crate) order: DiGraphMap<NodeIndex, ()>,
}

pub struct Graph {
    id: GraphId,
    inner: RwLock<DiGraph<Arc<TaskNode>, ()>>,
}

impl Graph {
    pub(crate) fn new() -> Self {
        Self {
            id: GraphId::next(),
            inner: RwLock::new(DiGraph::new()),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, DiGraph<Arc<TaskNode>, ()>> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, DiGraph<Arc<TaskNode>, ()>> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of recorded nodes, including forward declarations.
    pub fn len(&self) -> usize {
        self.read().node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check(&self, id: NodeId) -> Result<(), ExecError> {
        if id.graph == self.id {
            Ok(())
        } else {
            Err(ExecError::ForeignNode)
        }
    }

    fn add(&self, name: Cow<'static, str>, body: Option<Body>) -> Result<NodeId, ExecError> {
        let dependencies = body
            .as_ref()
            .map(|body| body.dependencies.clone())
            .unwrap_or_default();

        for &dependency in &dependencies {
            self.check(dependency)?;
        }

        let mut graph = self.write();

        if let Some(missing) = dependencies
            .iter()
            .find(|dependency| graph.node_weight(dependency.index).is_none())
        {
            tracing::warn!(node = %missing, "dependency is not part of this graph");
            return Err(ExecError::ForeignNode);
        }

        let index = NodeIndex::new(graph.node_count());
        let id = NodeId::new(self.id, index);
        graph.add_node(Arc::new(TaskNode::new(id, name, body)));

        for dependency in dependencies {
            graph.update_edge(dependency.index, index, ());
        }

        Ok(id)
    }

    /// Records a task. Construction never looks at the results of the
    /// dependencies, only at their identities.
    pub(crate) fn record(&self, name: Cow<'static, str>, body: Body) -> Result<NodeId, ExecError> {
        self.add(name, Some(body))
    }

    /// Records a value that is already known, so that it can be shared by
    /// many tasks without being copied into each of them.
    pub(crate) fn record_ready<T>(&self, name: Cow<'static, str>, value: Arc<T>) -> NodeId
    where
        T: Send + Sync + 'static,
    {
        let value: Dynamic = value;
        let body = Body {
            dependencies: vec![],
            task: Box::new(Constant {
                value: value.clone(),
                type_name: type_name::<T>(),
            }),
        };

        let mut graph = self.write();
        let index = NodeIndex::new(graph.node_count());
        let id = NodeId::new(self.id, index);
        let node = TaskNode::new(id, name, Some(body));
        let _ = node.commit(Ok(value));
        graph.add_node(Arc::new(node));
        id
    }

    /// Records a node with no body yet; see [`Graph::define`].
    pub(crate) fn placeholder(&self, name: Cow<'static, str>) -> NodeId {
        let mut graph = self.write();
        let index = NodeIndex::new(graph.node_count());
        let id = NodeId::new(self.id, index);
        graph.add_node(Arc::new(TaskNode::new(id, name, None)));
        id
    }

    /// Binds the body of a forward-declared node. A node listing itself as an
    /// argument is rejected right away; longer cycles are found by
    /// [`Graph::plan`].
    pub(crate) fn define(&self, id: NodeId, body: Body) -> Result<(), ExecError> {
        self.check(id)?;
        for &dependency in &body.dependencies {
            self.check(dependency)?;
        }

        // Held across the whole update so a concurrent plan never sees the
        // body without its edges.
        let mut graph = self.write();
        let node = graph
            .node_weight(id.index)
            .cloned()
            .ok_or(ExecError::ForeignNode)?;

        if body.dependencies.contains(&id) {
            return Err(ExecError::GraphCycle {
                node: node.name.to_string(),
            });
        }

        if let Some(missing) = body
            .dependencies
            .iter()
            .find(|dependency| graph.node_weight(dependency.index).is_none())
        {
            tracing::warn!(node = %missing, "dependency is not part of this graph");
            return Err(ExecError::ForeignNode);
        }

        let dependencies = body.dependencies.clone();
        node.define(body)?;

        for dependency in dependencies {
            graph.update_edge(dependency.index, id.index, ());
        }

        Ok(())
    }

    pub(crate) fn node(&self, id: NodeId) -> Result<Arc<TaskNode>, ExecError> {
        self.check(id)?;
        self.read()
            .node_weight(id.index)
            .cloned()
            .ok_or(ExecError::ForeignNode)
    }

    /// Reads the committed result of `id` as a `T`.
    pub(crate) fn output<T>(&self, id: NodeId) -> Result<Arc<T>, ExecError>
    where
        T: Send + Sync + 'static,
    {
        let node = self.node(id)?;
        match node.result() {
            Some(Ok(output)) => {
                output
                    .clone()
                    .downcast::<T>()
                    .map_err(|_| ExecError::TypeMismatch {
                        expected: type_name::<T>(),
                    })
            }
            Some(Err(err)) => Err(err.clone()),
            None => Err(ExecError::UnresolvedDependency {
                node: node.name.to_string(),
            }),
        }
    }

    /// Collects the committed outputs of `dependencies` for the task `name`.
    ///
    /// Fails with [`ExecError::UpstreamFailure`] if any of them failed and
    /// with [`ExecError::UnresolvedDependency`] if any of them has not run.
    pub(crate) fn inputs(
        &self,
        name: &str,
        dependencies: &[NodeId],
    ) -> Result<Vec<Dynamic>, ExecError> {
        let graph = self.read();
        let mut inputs = Vec::with_capacity(dependencies.len());

        for dependency in dependencies {
            self.check(*dependency)?;
            let node = graph
                .node_weight(dependency.index)
                .ok_or(ExecError::ForeignNode)?;

            match node.result() {
                Some(Ok(output)) => inputs.push(output.clone()),
                Some(Err(cause)) => return Err(ExecError::upstream(name, cause)),
                None => {
                    return Err(ExecError::UnresolvedDependency {
                        node: node.name.to_string(),
                    });
                }
            }
        }

        Ok(inputs)
    }

    /// Walks the graph backwards from `roots` and returns every node that
    /// still has to run. Nodes with a committed result are memoized and cut
    /// the walk short.
    ///
    /// Fails before anything is scheduled if the walk reaches a forward
    /// declaration that was never defined, or if the nodes left to run
    /// contain a cycle.
    pub(crate) fn plan(&self, roots: &[NodeId]) -> Result<Plan, ExecError> {
        for &root in roots {
            self.check(root)?;
        }

        let graph = self.read();
        let mut nodes = HashMap::new();
        let mut order = DiGraphMap::new();
        let mut seen = HashSet::new();
        let mut stack: Vec<NodeIndex> = roots.iter().map(|root| root.index).collect();

        while let Some(index) = stack.pop() {
            if !seen.insert(index) {
                continue;
            }

            let node = graph.node_weight(index).ok_or(ExecError::ForeignNode)?;

            if node.result().is_some() {
                continue;
            }

            if !node.is_defined() {
                return Err(ExecError::UndefinedNode {
                    node: node.name.to_string(),
                });
            }

            order.add_node(index);
            nodes.insert(index, node.clone());
            stack.extend(graph.neighbors_directed(index, Direction::Incoming));
        }

        // Another computation may commit a dependency while the walk is
        // running, so edges are only drawn between nodes that made it into
        // the plan. A dependency left out has its result by now.
        for &index in nodes.keys() {
            for dependency in graph.neighbors_directed(index, Direction::Incoming) {
                if nodes.contains_key(&dependency) {
                    order.add_edge(dependency, index, ());
                }
            }
        }

        petgraph::algo::toposort(&order, None).map_err(|cycle| ExecError::GraphCycle {
            node: graph[cycle.node_id()].name.to_string(),
        })?;

        Ok(Plan { nodes, order })
    }
}

impl std::fmt::Display for Graph {
    /// Renders the graph as a Mermaid flowchart.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let graph = self.read();

        writeln!(f, "graph LR")?;

        for index in graph.node_indices() {
            let node = &graph[index];
            let name = node.name.replace('"', "\\\"");
            let state = match node.result() {
                Some(Ok(_)) => " (done)",
                Some(Err(_)) => " (failed)",
                None if !node.is_defined() => " (undefined)",
                None => "",
            };
            writeln!(f, "    {}[\"{}{}\"]", index.index(), name, state)?;
        }

        for edge in graph.edge_indices() {
            let Some((source, target)) = graph.edge_endpoints(edge) else {
                continue;
            };
            let type_name = graph[source]
                .output_type_name()
                .replace('<', "&lt;")
                .replace('>', "&gt;");
            writeln!(
                f,
                "    {} -- \"{}\" --> {}",
                source.index(),
                type_name,
                target.index()
            )?;
        }

        Ok(())
    }
}
