//! Lowering: turns interchange-graph nodes into compute IR operators.
//!
//! Every supported source operator kind has one or more `Lower` matchers
//! registered under its `NodeKind`. Dispatch looks up the node's kind and
//! asks the matchers of that bucket in order; the first one reporting a
//! positive `Match` activates the node into exactly one IR operator.

mod nn;
mod tensor;
#[cfg(test)]
mod tests;

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::fmt;

use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use thiserror::Error;

use super::builder::IrBuilder;
use super::{ComputeGraph, DType, GraphError, OpId, OpKind, TensorData, TensorKind};
use crate::diagnostic::Diagnostic;
use crate::onnx::{self, InitData, Node, ValueInfo};

// ─── Node kinds ───────────────────────────────────────────────────

/// Source operator kinds the registry can be keyed by.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum NodeKind {
    Conv,
    Gemm,
    Scale,
    MaxPool,
    AveragePool,
    Lrn,
    Softmax,
    Relu,
    Flatten,
    Reshape,
    Dropout,
    Concat,
    Sum,
    Max,
    Mul,
    RandomNormal,
    ReduceProd,
}

impl NodeKind {
    pub fn parse(op_type: &str) -> Option<Self> {
        let kind = match op_type {
            "Conv" => NodeKind::Conv,
            "Gemm" => NodeKind::Gemm,
            "Scale" => NodeKind::Scale,
            "MaxPool" => NodeKind::MaxPool,
            "AveragePool" => NodeKind::AveragePool,
            "LRN" => NodeKind::Lrn,
            "Softmax" => NodeKind::Softmax,
            "Relu" => NodeKind::Relu,
            "Flatten" => NodeKind::Flatten,
            "Reshape" => NodeKind::Reshape,
            "Dropout" => NodeKind::Dropout,
            "Concat" => NodeKind::Concat,
            "Sum" => NodeKind::Sum,
            "Max" => NodeKind::Max,
            "Mul" => NodeKind::Mul,
            "RandomNormal" => NodeKind::RandomNormal,
            "ReduceProd" => NodeKind::ReduceProd,
            _ => return None,
        };
        Some(kind)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            NodeKind::Conv => "Conv",
            NodeKind::Gemm => "Gemm",
            NodeKind::Scale => "Scale",
            NodeKind::MaxPool => "MaxPool",
            NodeKind::AveragePool => "AveragePool",
            NodeKind::Lrn => "LRN",
            NodeKind::Softmax => "Softmax",
            NodeKind::Relu => "Relu",
            NodeKind::Flatten => "Flatten",
            NodeKind::Reshape => "Reshape",
            NodeKind::Dropout => "Dropout",
            NodeKind::Concat => "Concat",
            NodeKind::Sum => "Sum",
            NodeKind::Max => "Max",
            NodeKind::Mul => "Mul",
            NodeKind::RandomNormal => "RandomNormal",
            NodeKind::ReduceProd => "ReduceProd",
        }
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─── Errors ───────────────────────────────────────────────────────

/// Inclusive bounds on an operand count.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Arity {
    pub min: usize,
    pub max: usize,
}

impl Arity {
    pub const fn exactly(n: usize) -> Self {
        Self { min: n, max: n }
    }

    pub const fn between(min: usize, max: usize) -> Self {
        Self { min, max }
    }

    pub const fn at_least(min: usize) -> Self {
        Self {
            min,
            max: usize::MAX,
        }
    }

    pub fn admits(self, n: usize) -> bool {
        n >= self.min && n <= self.max
    }
}

impl fmt::Display for Arity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.min == self.max {
            write!(f, "{}", self.min)
        } else if self.max == usize::MAX {
            write!(f, "at least {}", self.min)
        } else {
            write!(f, "{} to {}", self.min, self.max)
        }
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum LowerError {
    #[error("node '{node}' ({op_type}): expected {expected} inputs, found {found}")]
    InputArity {
        node: String,
        op_type: String,
        expected: Arity,
        found: usize,
    },
    #[error("node '{node}' ({op_type}): expected {expected} outputs, found {found}")]
    OutputArity {
        node: String,
        op_type: String,
        expected: Arity,
        found: usize,
    },
    #[error("node '{node}' ({op_type}): missing required attribute '{attr}'")]
    MissingAttribute {
        node: String,
        op_type: String,
        attr: String,
    },
    #[error("node '{node}' ({op_type}): invalid attribute '{attr}': {reason}")]
    InvalidAttribute {
        node: String,
        op_type: String,
        attr: String,
        reason: String,
    },
    #[error("unsupported operator '{op_type}' in node '{node}'")]
    Unsupported { node: String, op_type: String },
    #[error("tensor '{tensor}' is produced by both '{first}' and '{second}'")]
    DuplicateProducer {
        tensor: String,
        first: String,
        second: String,
    },
    #[error("interchange graph has a cycle through node '{node}'")]
    Cycle { node: String },
    #[error(transparent)]
    Graph(#[from] GraphError),
}

impl LowerError {
    /// Per-node validation failures: the node is skipped and lowering continues.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            LowerError::InputArity { .. }
                | LowerError::OutputArity { .. }
                | LowerError::MissingAttribute { .. }
                | LowerError::InvalidAttribute { .. }
        )
    }

    pub(crate) fn missing(node: &Node, attr: &str) -> Self {
        LowerError::MissingAttribute {
            node: node.label(),
            op_type: node.op_type.clone(),
            attr: attr.to_string(),
        }
    }

    pub(crate) fn invalid(node: &Node, attr: &str, reason: impl Into<String>) -> Self {
        LowerError::InvalidAttribute {
            node: node.label(),
            op_type: node.op_type.clone(),
            attr: attr.to_string(),
            reason: reason.into(),
        }
    }
}

// ─── Matchers ─────────────────────────────────────────────────────

/// Outcome of asking a matcher about a node.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Match {
    NotMine,
    Standard,
}

/// Translates one kind of interchange node into an IR operator.
pub trait Lower: Send + Sync {
    /// Bucket this matcher is registered under.
    fn kind(&self) -> NodeKind;

    /// Classify `node` without side effects.
    fn is_me(&self, node: &Node) -> Match;

    /// Validate `node` and append its IR operator. On error the graph is
    /// left untouched.
    fn activate(&self, builder: &mut IrBuilder<'_>, node: &Node) -> Result<OpId, LowerError>;
}

/// Attribute parser of a table-driven matcher.
pub type ParseFn = fn(&IrBuilder<'_>, &Node) -> Result<OpKind, LowerError>;

/// Table-driven matcher: arity bounds plus an attribute parser.
pub struct StandardLower {
    kind: NodeKind,
    inputs: Arity,
    outputs: Arity,
    accepts: fn(&Node) -> bool,
    parse: ParseFn,
}

fn accept_any(_: &Node) -> bool {
    true
}

impl StandardLower {
    pub fn new(kind: NodeKind, inputs: Arity, outputs: Arity, parse: ParseFn) -> Self {
        Self {
            kind,
            inputs,
            outputs,
            accepts: accept_any,
            parse,
        }
    }

    /// Restrict the shapes of node this matcher claims.
    pub fn accepting(mut self, accepts: fn(&Node) -> bool) -> Self {
        self.accepts = accepts;
        self
    }
}

impl Lower for StandardLower {
    fn kind(&self) -> NodeKind {
        self.kind
    }

    fn is_me(&self, node: &Node) -> Match {
        if node.op_type == self.kind.as_str() && (self.accepts)(node) {
            Match::Standard
        } else {
            Match::NotMine
        }
    }

    fn activate(&self, builder: &mut IrBuilder<'_>, node: &Node) -> Result<OpId, LowerError> {
        let inputs = node.present_inputs();
        if !self.inputs.admits(inputs.len()) || inputs.iter().any(|i| i.is_empty()) {
            return Err(LowerError::InputArity {
                node: node.label(),
                op_type: node.op_type.clone(),
                expected: self.inputs,
                found: inputs.iter().filter(|i| !i.is_empty()).count(),
            });
        }
        if !self.outputs.admits(node.outputs.len()) {
            return Err(LowerError::OutputArity {
                node: node.label(),
                op_type: node.op_type.clone(),
                expected: self.outputs,
                found: node.outputs.len(),
            });
        }
        let kind = (self.parse)(builder, node)?;
        Ok(builder.operator(kind, inputs, &node.outputs))
    }
}

// ─── Registry ─────────────────────────────────────────────────────

/// Matchers bucketed by source operator kind.
#[derive(Default)]
pub struct LowerRegistry {
    buckets: HashMap<NodeKind, Vec<Box<dyn Lower>>>,
}

impl LowerRegistry {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Registry with the standard matcher for every supported kind.
    pub fn standard() -> Self {
        let mut registry = Self::empty();
        for lower in nn::lowerings().into_iter().chain(tensor::lowerings()) {
            registry.register(Box::new(lower));
        }
        registry
    }

    /// Append a matcher behind those already registered for its kind.
    pub fn register(&mut self, lower: Box<dyn Lower>) {
        self.buckets.entry(lower.kind()).or_default().push(lower);
    }

    /// Put a matcher in front of those already registered for its kind.
    pub fn register_first(&mut self, lower: Box<dyn Lower>) {
        self.buckets.entry(lower.kind()).or_default().insert(0, lower);
    }

    /// First matcher claiming `node`.
    pub fn find(&self, node: &Node) -> Option<&dyn Lower> {
        let kind = NodeKind::parse(&node.op_type)?;
        self.buckets
            .get(&kind)?
            .iter()
            .find(|l| l.is_me(node) == Match::Standard)
            .map(|l| l.as_ref())
    }

    pub fn supports(&self, kind: NodeKind) -> bool {
        self.buckets.get(&kind).is_some_and(|b| !b.is_empty())
    }
}

// ─── Graph lowering ───────────────────────────────────────────────

/// What to do with a node no matcher claims.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum UnsupportedPolicy {
    /// Fail the whole conversion.
    #[default]
    Abort,
    /// Warn and leave the node out.
    Skip,
}

/// Result of lowering an interchange graph.
#[derive(Debug)]
pub struct Lowered {
    pub graph: ComputeGraph,
    pub diagnostics: Vec<Diagnostic>,
}

/// Lower every node of `source` into a new compute graph.
pub fn lower_graph(
    source: &onnx::Graph,
    registry: &LowerRegistry,
    policy: UnsupportedPolicy,
) -> Result<Lowered, LowerError> {
    let mut graph = ComputeGraph::new(source.name.clone());
    let mut diagnostics = Vec::new();

    for init in &source.initializers {
        let data = match &init.data {
            InitData::Float(v) => TensorData::F32(v.clone()),
            InitData::Int64(v) => TensorData::I64(v.clone()),
        };
        graph.add_tensor(
            init.name.clone(),
            init.dims.clone(),
            DType::from(init.elem_type),
            TensorKind::Initializer,
            Some(data),
        );
    }
    for input in &source.inputs {
        if graph.find(&input.name).is_some() {
            continue;
        }
        let id = graph.add_tensor(
            input.name.clone(),
            input.shape.clone(),
            DType::from(input.elem_type),
            TensorKind::Input,
            None,
        );
        graph.mark_input(id);
    }

    let hints: HashMap<String, ValueInfo> = source
        .value_info
        .iter()
        .chain(&source.outputs)
        .map(|v| (v.name.clone(), v.clone()))
        .collect();

    let order = topological_order(&source.nodes)?;
    let mut builder = IrBuilder::new(&mut graph, &hints);
    for idx in order {
        let node = &source.nodes[idx];
        let Some(lower) = registry.find(node) else {
            match policy {
                UnsupportedPolicy::Abort => {
                    return Err(LowerError::Unsupported {
                        node: node.label(),
                        op_type: node.op_type.clone(),
                    })
                }
                UnsupportedPolicy::Skip => {
                    diagnostics.push(
                        Diagnostic::warning(format!(
                            "unsupported operator '{}' skipped",
                            node.op_type
                        ))
                        .with_subject(node.label()),
                    );
                    continue;
                }
            }
        };
        match lower.activate(&mut builder, node) {
            Ok(op) => log::debug!("lowered {} '{}' to {}", node.op_type, node.label(), op),
            Err(e) if e.is_validation() => {
                diagnostics.push(
                    Diagnostic::warning(format!("node skipped: {}", e))
                        .with_subject(node.label()),
                );
            }
            Err(e) => return Err(e),
        }
    }

    for out in &source.outputs {
        match graph.find(&out.name) {
            Some(id) => graph.mark_output(id),
            None => diagnostics.push(
                Diagnostic::warning("graph output is never produced".to_string())
                    .with_subject(out.name.clone()),
            ),
        }
    }

    graph.validate()?;
    log::info!(
        "lowered '{}': {} operators, {} tensors",
        graph.name,
        graph.ops().len(),
        graph.tensors().len()
    );
    Ok(Lowered { graph, diagnostics })
}

/// Order nodes so producers come before consumers, keeping source order
/// among independent nodes.
fn topological_order(nodes: &[Node]) -> Result<Vec<usize>, LowerError> {
    let mut dag: DiGraph<usize, ()> = DiGraph::with_capacity(nodes.len(), nodes.len());
    let indices: Vec<NodeIndex> = (0..nodes.len()).map(|i| dag.add_node(i)).collect();

    let mut producer: HashMap<&str, usize> = HashMap::new();
    for (i, node) in nodes.iter().enumerate() {
        for out in node.outputs.iter().filter(|o| !o.is_empty()) {
            if let Some(&first) = producer.get(out.as_str()) {
                return Err(LowerError::DuplicateProducer {
                    tensor: out.clone(),
                    first: nodes[first].label(),
                    second: node.label(),
                });
            }
            producer.insert(out, i);
        }
    }
    for (i, node) in nodes.iter().enumerate() {
        for input in node.present_inputs() {
            if let Some(&p) = producer.get(input.as_str()) {
                dag.add_edge(indices[p], indices[i], ());
            }
        }
    }

    let mut pending: Vec<usize> = indices
        .iter()
        .map(|&n| dag.neighbors_directed(n, Direction::Incoming).count())
        .collect();
    let mut ready: BinaryHeap<Reverse<usize>> = pending
        .iter()
        .enumerate()
        .filter(|&(_, &deg)| deg == 0)
        .map(|(i, _)| Reverse(i))
        .collect();

    let mut order = Vec::with_capacity(nodes.len());
    while let Some(Reverse(i)) = ready.pop() {
        order.push(i);
        for next in dag.neighbors_directed(indices[i], Direction::Outgoing) {
            let j = dag[next];
            pending[j] -= 1;
            if pending[j] == 0 {
                ready.push(Reverse(j));
            }
        }
    }

    if order.len() < nodes.len() {
        let stuck = pending.iter().position(|&d| d > 0).unwrap_or_default();
        return Err(LowerError::Cycle {
            node: nodes[stuck].label(),
        });
    }
    Ok(order)
}
