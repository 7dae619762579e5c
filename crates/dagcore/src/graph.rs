//! Static graph model.
//!
//! A [`GraphCluster`] is built once from a [`ClusterSpec`] and never changes
//! afterwards. Vertices live in a per-graph arena (`Vec<Vertex>`); every edge
//! is stored as an index into that arena, on both endpoints.

use crate::expr::Expression;
use crate::spec::{ClusterSpec, DataBinding, GraphSpec, VertexSpec};
use crate::{BuildError, Value};
use petgraph::algo::toposort;
use petgraph::graph::DiGraph;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

/// Operator name that condition vertices are bound to
pub const EXPR_OPERATOR: &str = "__dag_expr_operator__";

/// Result a predecessor must report for a dependency edge to be satisfied
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Expect {
    Any,
    Ok,
    Fail,
}

impl Expect {
    pub fn accepts(self, actual: VertexResult) -> bool {
        match self {
            Expect::Any => true,
            Expect::Ok => actual == VertexResult::Ok,
            Expect::Fail => actual == VertexResult::Fail,
        }
    }
}

/// Terminal state of a vertex within one run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum VertexResult {
    Init = 0,
    Ok = 1,
    Fail = 2,
    TimedOut = 3,
}

impl VertexResult {
    pub fn from_u8(raw: u8) -> Self {
        match raw {
            1 => VertexResult::Ok,
            2 => VertexResult::Fail,
            3 => VertexResult::TimedOut,
            _ => VertexResult::Init,
        }
    }
}

impl fmt::Display for VertexResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            VertexResult::Init => "init",
            VertexResult::Ok => "ok",
            VertexResult::Fail => "fail",
            VertexResult::TimedOut => "timed_out",
        };
        f.write_str(s)
    }
}

/// Ports an operator declares, used when a vertex has no explicit bindings
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OperatorPorts {
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
}

/// What the builder needs to know about registered operators
pub trait OperatorCatalog {
    /// Ports of `operator`, or `None` if no such operator is registered
    fn ports(&self, operator: &str) -> Option<OperatorPorts>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dependency {
    /// Arena index of the predecessor
    pub vertex: usize,
    pub expect: Expect,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Successor {
    /// Arena index of the successor
    pub vertex: usize,
    /// Position of this edge in the successor's `deps`
    pub slot: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataInput {
    /// Port name on this vertex's operator
    pub name: String,
    /// Graph-wide data id
    pub data: String,
    /// Arena index of the producing vertex
    pub producer: usize,
    /// Port name on the producer's operator
    pub producer_port: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataOutput {
    pub name: String,
    pub data: String,
}

#[derive(Debug, Clone)]
pub struct Vertex {
    id: String,
    index: usize,
    operator: String,
    condition: Option<Arc<Expression>>,
    start: bool,
    config: HashMap<String, Value>,
    inputs: Vec<DataInput>,
    outputs: Vec<DataOutput>,
    deps: Vec<Dependency>,
    next: Vec<Successor>,
}

impl Vertex {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// Registered operator name; `EXPR_OPERATOR` for condition vertices
    pub fn operator(&self) -> &str {
        &self.operator
    }

    pub fn condition(&self) -> Option<&Arc<Expression>> {
        self.condition.as_ref()
    }

    pub fn is_condition(&self) -> bool {
        self.condition.is_some()
    }

    pub fn is_start(&self) -> bool {
        self.start
    }

    pub fn config(&self) -> &HashMap<String, Value> {
        &self.config
    }

    pub fn inputs(&self) -> &[DataInput] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[DataOutput] {
        &self.outputs
    }

    pub fn deps(&self) -> &[Dependency] {
        &self.deps
    }

    pub fn next(&self) -> &[Successor] {
        &self.next
    }
}

#[derive(Debug, Clone)]
pub struct Graph {
    name: String,
    vertices: Vec<Vertex>,
    index: HashMap<String, usize>,
}

impl Graph {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn vertices(&self) -> &[Vertex] {
        &self.vertices
    }

    pub fn vertex(&self, id: &str) -> Option<&Vertex> {
        self.index.get(id).map(|&idx| &self.vertices[idx])
    }

    pub fn len(&self) -> usize {
        self.vertices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vertices.is_empty()
    }

    /// Vertices with no dependency; they are dispatched when a run starts
    pub fn entry_vertices(&self) -> impl Iterator<Item = &Vertex> {
        self.vertices.iter().filter(|v| v.deps.is_empty())
    }

    /// Build one graph: register vertices, infer data edges, wire relations,
    /// then validate the result.
    pub fn build(spec: &GraphSpec, catalog: &dyn OperatorCatalog) -> Result<Self, BuildError> {
        if spec.vertices.is_empty() {
            return Err(BuildError::EmptyGraph(spec.name.clone()));
        }

        let mut builder = GraphBuilder {
            graph: &spec.name,
            drafts: Vec::with_capacity(spec.vertices.len()),
            index: HashMap::new(),
        };
        for vertex in &spec.vertices {
            builder.add_vertex(vertex, catalog)?;
        }
        builder.link_data()?;
        builder.link_relations()?;
        builder.verify()?;
        Ok(builder.finish())
    }
}

#[derive(Debug, Clone)]
pub struct GraphCluster {
    graphs: Vec<Graph>,
    index: HashMap<String, usize>,
}

impl GraphCluster {
    pub fn build(spec: &ClusterSpec, catalog: &dyn OperatorCatalog) -> Result<Self, BuildError> {
        if spec.graphs.is_empty() {
            return Err(BuildError::EmptyCluster);
        }

        let mut graphs = Vec::with_capacity(spec.graphs.len());
        let mut index = HashMap::new();
        for graph_spec in &spec.graphs {
            if index.contains_key(&graph_spec.name) {
                return Err(BuildError::DuplicateGraph(graph_spec.name.clone()));
            }
            let graph = Graph::build(graph_spec, catalog)?;
            index.insert(graph.name.clone(), graphs.len());
            graphs.push(graph);
        }

        tracing::debug!("Built graph cluster with {} graphs", graphs.len());
        Ok(Self { graphs, index })
    }

    pub fn graphs(&self) -> &[Graph] {
        &self.graphs
    }

    pub fn graph(&self, name: &str) -> Option<&Graph> {
        self.position(name).map(|idx| &self.graphs[idx])
    }

    /// Position of graph `name` in `graphs()`
    pub fn position(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    pub fn graph_names(&self) -> Vec<String> {
        self.graphs.iter().map(|g| g.name.clone()).collect()
    }
}

/// Vertex under construction
struct Draft {
    id: String,
    operator: String,
    condition: Option<Arc<Expression>>,
    start: bool,
    config: HashMap<String, Value>,
    input_bindings: Vec<DataBinding>,
    outputs: Vec<DataOutput>,
    inputs: Vec<DataInput>,
    relations: [(&'static str, Vec<String>); 6],
    deps: BTreeMap<usize, Expect>,
    next: BTreeSet<usize>,
}

struct GraphBuilder<'a> {
    graph: &'a str,
    drafts: Vec<Draft>,
    index: HashMap<String, usize>,
}

fn non_empty(s: &Option<String>) -> Option<&str> {
    s.as_deref().filter(|s| !s.is_empty())
}

fn bindings_or_ports(explicit: &[DataBinding], ports: &[String]) -> Vec<DataBinding> {
    if explicit.is_empty() {
        ports.iter().map(DataBinding::new).collect()
    } else {
        explicit.to_vec()
    }
}

impl<'a> GraphBuilder<'a> {
    fn add_vertex(
        &mut self,
        spec: &VertexSpec,
        catalog: &dyn OperatorCatalog,
    ) -> Result<(), BuildError> {
        let graph = self.graph.to_string();
        let draft = match (non_empty(&spec.operator), non_empty(&spec.cond)) {
            (Some(_), Some(_)) => {
                return Err(BuildError::OperatorAndCondition {
                    graph,
                    vertex: non_empty(&spec.id).unwrap_or_default().to_string(),
                })
            }
            (None, None) => return Err(BuildError::AnonymousVertex(graph)),
            (None, Some(cond)) => {
                let id = non_empty(&spec.id)
                    .ok_or_else(|| BuildError::AnonymousCondition(graph.clone()))?;
                let expr = Expression::parse(cond).map_err(|source| BuildError::InvalidCondition {
                    graph: graph.clone(),
                    vertex: id.to_string(),
                    source,
                })?;
                self.draft(spec, id, EXPR_OPERATOR, Some(Arc::new(expr)), OperatorPorts::default())
            }
            (Some(op), None) => {
                let id = non_empty(&spec.id).unwrap_or(op);
                let ports = catalog.ports(op).ok_or_else(|| BuildError::UnknownOperator {
                    graph: graph.clone(),
                    vertex: id.to_string(),
                    operator: op.to_string(),
                })?;
                self.draft(spec, id, op, None, ports)
            }
        };

        if self.index.contains_key(&draft.id) {
            return Err(BuildError::DuplicateVertex {
                graph,
                vertex: draft.id,
            });
        }
        self.index.insert(draft.id.clone(), self.drafts.len());
        self.drafts.push(draft);
        Ok(())
    }

    fn draft(
        &self,
        spec: &VertexSpec,
        id: &str,
        operator: &str,
        condition: Option<Arc<Expression>>,
        ports: OperatorPorts,
    ) -> Draft {
        let outputs = bindings_or_ports(&spec.output, &ports.outputs)
            .into_iter()
            .map(|b| DataOutput {
                data: b.data_id().to_string(),
                name: b.name,
            })
            .collect();

        Draft {
            id: id.to_string(),
            operator: operator.to_string(),
            condition,
            start: spec.start,
            config: spec.config.clone(),
            input_bindings: bindings_or_ports(&spec.input, &ports.inputs),
            outputs,
            inputs: Vec::new(),
            relations: [
                ("next", spec.next.clone()),
                ("next_on_ok", spec.next_on_ok.clone()),
                ("next_on_fail", spec.next_on_fail.clone()),
                ("deps", spec.deps.clone()),
                ("deps_on_ok", spec.deps_on_ok.clone()),
                ("deps_on_fail", spec.deps_on_fail.clone()),
            ],
            deps: BTreeMap::new(),
            next: BTreeSet::new(),
        }
    }

    /// Record `pre --> succ`, overwriting the predicate of an existing edge
    fn depend(&mut self, pre: usize, succ: usize, expect: Expect) {
        self.drafts[succ].deps.insert(pre, expect);
        self.drafts[pre].next.insert(succ);
    }

    /// Data-driven edges: every input depends (on Ok) on the vertex producing it
    fn link_data(&mut self) -> Result<(), BuildError> {
        let mut producers: HashMap<String, (usize, String)> = HashMap::new();
        for (idx, draft) in self.drafts.iter().enumerate() {
            for output in &draft.outputs {
                if let Some((first, _)) = producers.get(&output.data) {
                    return Err(BuildError::DuplicateOutput {
                        graph: self.graph.to_string(),
                        data: output.data.clone(),
                        first: self.drafts[*first].id.clone(),
                        second: draft.id.clone(),
                    });
                }
                producers.insert(output.data.clone(), (idx, output.name.clone()));
            }
        }

        for idx in 0..self.drafts.len() {
            let bindings = std::mem::take(&mut self.drafts[idx].input_bindings);
            for binding in bindings {
                let data = binding.data_id().to_string();
                let (producer, producer_port) =
                    producers
                        .get(&data)
                        .cloned()
                        .ok_or_else(|| BuildError::MissingProducer {
                            graph: self.graph.to_string(),
                            vertex: self.drafts[idx].id.clone(),
                            data: data.clone(),
                        })?;
                self.depend(producer, idx, Expect::Ok);
                self.drafts[idx].inputs.push(DataInput {
                    name: binding.name,
                    data,
                    producer,
                    producer_port,
                });
            }
        }
        Ok(())
    }

    /// Process-driven edges from the six relation lists
    fn link_relations(&mut self) -> Result<(), BuildError> {
        for idx in 0..self.drafts.len() {
            let relations = self.drafts[idx].relations.clone();
            for (relation, targets) in relations {
                for target in targets {
                    let other = *self.index.get(&target).ok_or_else(|| BuildError::UnknownVertex {
                        graph: self.graph.to_string(),
                        vertex: self.drafts[idx].id.clone(),
                        relation,
                        target: target.clone(),
                    })?;
                    match relation {
                        "next" => self.depend(idx, other, Expect::Any),
                        "next_on_ok" => self.depend(idx, other, Expect::Ok),
                        "next_on_fail" => self.depend(idx, other, Expect::Fail),
                        "deps" => self.depend(other, idx, Expect::Any),
                        "deps_on_ok" => self.depend(other, idx, Expect::Ok),
                        _ => self.depend(other, idx, Expect::Fail),
                    }
                }
            }
        }
        Ok(())
    }

    fn verify(&self) -> Result<(), BuildError> {
        for draft in &self.drafts {
            if draft.start {
                if !draft.deps.is_empty() {
                    return Err(BuildError::StartWithDeps {
                        graph: self.graph.to_string(),
                        vertex: draft.id.clone(),
                    });
                }
            } else if draft.deps.is_empty() && draft.next.is_empty() {
                return Err(BuildError::Isolated {
                    graph: self.graph.to_string(),
                    vertex: draft.id.clone(),
                });
            }
        }

        let mut relation = DiGraph::<usize, ()>::with_capacity(self.drafts.len(), 0);
        let nodes: Vec<_> = (0..self.drafts.len()).map(|idx| relation.add_node(idx)).collect();
        for (idx, draft) in self.drafts.iter().enumerate() {
            for &succ in &draft.next {
                relation.add_edge(nodes[idx], nodes[succ], ());
            }
        }
        if let Err(cycle) = toposort(&relation, None) {
            return Err(BuildError::Cycle {
                graph: self.graph.to_string(),
                vertex: self.drafts[relation[cycle.node_id()]].id.clone(),
            });
        }
        Ok(())
    }

    fn finish(self) -> Graph {
        let mut next: Vec<Vec<Successor>> = vec![Vec::new(); self.drafts.len()];
        let mut deps: Vec<Vec<Dependency>> = Vec::with_capacity(self.drafts.len());
        for (succ, draft) in self.drafts.iter().enumerate() {
            let mut edges = Vec::with_capacity(draft.deps.len());
            for (slot, (&vertex, &expect)) in draft.deps.iter().enumerate() {
                next[vertex].push(Successor { vertex: succ, slot });
                edges.push(Dependency { vertex, expect });
            }
            deps.push(edges);
        }

        let vertices = self
            .drafts
            .into_iter()
            .zip(deps.into_iter().zip(next))
            .enumerate()
            .map(|(index, (draft, (deps, next)))| Vertex {
                id: draft.id,
                index,
                operator: draft.operator,
                condition: draft.condition,
                start: draft.start,
                config: draft.config,
                inputs: draft.inputs,
                outputs: draft.outputs,
                deps,
                next,
            })
            .collect();

        Graph {
            name: self.graph.to_string(),
            vertices,
            index: self.index,
        }
    }
}
