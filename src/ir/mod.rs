//! Compute IR: the device-independent operator graph.
//!
//! Tensors and operators live in two arenas addressed by stable integer
//! handles (`TensorId`, `OpId`). Operators are stored in execution order;
//! every pass after lowering reads the graph through handles and produces
//! a new graph instead of patching shared state in place.

pub mod builder;
pub mod lower;
pub mod op;

use std::collections::HashMap;
use std::fmt;

use thiserror::Error;

use crate::onnx::ElemType;
pub use op::{ConvAttrs, GemmAttrs, LayerClass, LrnAttrs, OpKind, PoolAttrs, RandomNormalAttrs};

// ─── Handles ──────────────────────────────────────────────────────

/// Handle of a tensor in a `ComputeGraph`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TensorId(pub u32);

impl fmt::Display for TensorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "%{}", self.0)
    }
}

/// Handle of an operator in a `ComputeGraph`. Ordering follows execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OpId(pub u32);

impl OpId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

// ─── Tensors ──────────────────────────────────────────────────────

/// Element type of an IR tensor.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DType {
    F32,
    U8,
    I8,
    I16,
    I32,
    I64,
}

impl DType {
    pub fn name(self) -> &'static str {
        match self {
            DType::F32 => "f32",
            DType::U8 => "u8",
            DType::I8 => "i8",
            DType::I16 => "i16",
            DType::I32 => "i32",
            DType::I64 => "i64",
        }
    }
}

impl From<ElemType> for DType {
    fn from(t: ElemType) -> Self {
        match t {
            ElemType::Float => DType::F32,
            ElemType::Uint8 => DType::U8,
            ElemType::Int8 => DType::I8,
            ElemType::Int16 => DType::I16,
            ElemType::Int32 => DType::I32,
            ElemType::Int64 => DType::I64,
        }
    }
}

/// Where a tensor's value comes from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TensorKind {
    /// Graph input fed at run time.
    Input,
    /// Constant baked into the graph (weights, biases, shapes).
    Initializer,
    /// Produced by an operator.
    Value,
}

/// Constant payload of an initializer tensor.
#[derive(Clone, Debug, PartialEq)]
pub enum TensorData {
    F32(Vec<f32>),
    I8(Vec<i8>),
    I16(Vec<i16>),
    I64(Vec<i64>),
}

impl TensorData {
    pub fn len(&self) -> usize {
        match self {
            TensorData::F32(v) => v.len(),
            TensorData::I8(v) => v.len(),
            TensorData::I16(v) => v.len(),
            TensorData::I64(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dtype(&self) -> DType {
        match self {
            TensorData::F32(_) => DType::F32,
            TensorData::I8(_) => DType::I8,
            TensorData::I16(_) => DType::I16,
            TensorData::I64(_) => DType::I64,
        }
    }

    /// Raw little-endian bytes, element after element.
    pub fn to_le_bytes(&self) -> Vec<u8> {
        match self {
            TensorData::F32(v) => v.iter().flat_map(|x| x.to_le_bytes()).collect(),
            TensorData::I8(v) => v.iter().flat_map(|x| x.to_le_bytes()).collect(),
            TensorData::I16(v) => v.iter().flat_map(|x| x.to_le_bytes()).collect(),
            TensorData::I64(v) => v.iter().flat_map(|x| x.to_le_bytes()).collect(),
        }
    }
}

/// A named graph value shared by operators as an edge.
#[derive(Clone, Debug)]
pub struct Tensor {
    pub id: TensorId,
    pub name: String,
    pub shape: Vec<usize>,
    pub dtype: DType,
    pub kind: TensorKind,
    pub data: Option<TensorData>,
}

impl Tensor {
    /// Number of elements implied by the shape (1 for scalars).
    pub fn volume(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn is_constant(&self) -> bool {
        self.kind == TensorKind::Initializer
    }

    pub fn f32_data(&self) -> Option<&[f32]> {
        match &self.data {
            Some(TensorData::F32(v)) => Some(v.as_slice()),
            _ => None,
        }
    }
}

// ─── Operators ────────────────────────────────────────────────────

/// A lowered operator: typed parameters plus ordered tensor edges.
#[derive(Clone, Debug)]
pub struct ComputeOperator {
    pub id: OpId,
    pub kind: OpKind,
    pub inputs: Vec<TensorId>,
    pub outputs: Vec<TensorId>,
}

impl ComputeOperator {
    pub fn input(&self, idx: usize) -> Option<TensorId> {
        self.inputs.get(idx).copied()
    }

    pub fn output(&self, idx: usize) -> Option<TensorId> {
        self.outputs.get(idx).copied()
    }
}

// ─── Errors ───────────────────────────────────────────────────────

/// Structural violations of the compute graph.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum GraphError {
    #[error("operator {op} ('{layer}') reads '{tensor}' before it is produced")]
    ForwardReference {
        op: OpId,
        layer: String,
        tensor: String,
    },
    #[error("tensor '{tensor}' is consumed but never produced")]
    Unproduced { tensor: String },
    #[error("tensor '{tensor}' is produced by both {first} and {second}")]
    Redefined {
        tensor: String,
        first: OpId,
        second: OpId,
    },
    #[error("operator {op} has no output")]
    NoOutput { op: OpId },
    #[error("expected exactly one data input, found {found}")]
    DataInputCount { found: usize },
}

// ─── Graph ────────────────────────────────────────────────────────

/// Handle-addressed compute graph. Operators are kept in execution order.
#[derive(Clone, Debug, Default)]
pub struct ComputeGraph {
    pub name: String,
    tensors: Vec<Tensor>,
    ops: Vec<ComputeOperator>,
    inputs: Vec<TensorId>,
    outputs: Vec<TensorId>,
    by_name: HashMap<String, TensorId>,
}

impl ComputeGraph {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Add a tensor, or return the existing handle when the name is taken.
    pub fn add_tensor(
        &mut self,
        name: impl Into<String>,
        shape: Vec<usize>,
        dtype: DType,
        kind: TensorKind,
        data: Option<TensorData>,
    ) -> TensorId {
        let name = name.into();
        if let Some(&id) = self.by_name.get(&name) {
            return id;
        }
        let id = TensorId(self.tensors.len() as u32);
        self.by_name.insert(name.clone(), id);
        self.tensors.push(Tensor {
            id,
            name,
            shape,
            dtype,
            kind,
            data,
        });
        id
    }

    /// Append an operator at the end of the execution order.
    pub fn add_operator(
        &mut self,
        kind: OpKind,
        inputs: Vec<TensorId>,
        outputs: Vec<TensorId>,
    ) -> OpId {
        let id = OpId(self.ops.len() as u32);
        self.ops.push(ComputeOperator {
            id,
            kind,
            inputs,
            outputs,
        });
        id
    }

    pub fn mark_input(&mut self, id: TensorId) {
        if !self.inputs.contains(&id) {
            self.inputs.push(id);
        }
    }

    pub fn mark_output(&mut self, id: TensorId) {
        if !self.outputs.contains(&id) {
            self.outputs.push(id);
        }
    }

    pub fn find(&self, name: &str) -> Option<TensorId> {
        self.by_name.get(name).copied()
    }

    pub fn tensor(&self, id: TensorId) -> &Tensor {
        &self.tensors[id.0 as usize]
    }

    pub fn tensor_mut(&mut self, id: TensorId) -> &mut Tensor {
        &mut self.tensors[id.0 as usize]
    }

    pub fn tensors(&self) -> &[Tensor] {
        &self.tensors
    }

    pub fn op(&self, id: OpId) -> &ComputeOperator {
        &self.ops[id.index()]
    }

    pub fn ops(&self) -> &[ComputeOperator] {
        &self.ops
    }

    pub fn inputs(&self) -> &[TensorId] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[TensorId] {
        &self.outputs
    }

    pub fn name_of(&self, id: TensorId) -> &str {
        &self.tensor(id).name
    }

    /// Layer name of an operator: the name of its first output.
    pub fn layer_name(&self, op: OpId) -> &str {
        match self.op(op).outputs.first() {
            Some(&out) => self.name_of(out),
            None => "",
        }
    }

    /// Number of operand slots reading `id` across the whole graph.
    ///
    /// An operator reading the same tensor twice counts twice.
    pub fn use_count(&self, id: TensorId) -> usize {
        self.ops
            .iter()
            .map(|op| op.inputs.iter().filter(|&&t| t == id).count())
            .sum()
    }

    /// Operators reading `id`, in execution order.
    pub fn consumers(&self, id: TensorId) -> Vec<OpId> {
        self.ops
            .iter()
            .filter(|op| op.inputs.contains(&id))
            .map(|op| op.id)
            .collect()
    }

    /// Whether any operator after `op` still reads `id`.
    pub fn used_after(&self, id: TensorId, op: OpId) -> bool {
        self.ops[op.index() + 1..]
            .iter()
            .any(|later| later.inputs.contains(&id))
    }

    /// Run-time inputs that are not backed by an initializer.
    pub fn data_inputs(&self) -> Vec<TensorId> {
        self.inputs
            .iter()
            .copied()
            .filter(|&id| self.tensor(id).kind == TensorKind::Input)
            .collect()
    }

    /// The single network data input.
    pub fn data_input(&self) -> Result<TensorId, GraphError> {
        let inputs = self.data_inputs();
        match inputs.as_slice() {
            [only] => Ok(*only),
            _ => Err(GraphError::DataInputCount {
                found: inputs.len(),
            }),
        }
    }

    /// Check that every operand exists before it is read.
    pub fn validate(&self) -> Result<(), GraphError> {
        let mut producer: HashMap<TensorId, OpId> = HashMap::new();
        for op in &self.ops {
            if op.outputs.is_empty() {
                return Err(GraphError::NoOutput { op: op.id });
            }
            for &out in &op.outputs {
                if let Some(&first) = producer.get(&out) {
                    return Err(GraphError::Redefined {
                        tensor: self.name_of(out).to_string(),
                        first,
                        second: op.id,
                    });
                }
                producer.insert(out, op.id);
            }
        }

        for op in &self.ops {
            for &input in &op.inputs {
                let tensor = self.tensor(input);
                if tensor.kind != TensorKind::Value {
                    continue;
                }
                match producer.get(&input) {
                    Some(&p) if p < op.id => {}
                    Some(_) => {
                        return Err(GraphError::ForwardReference {
                            op: op.id,
                            layer: self.layer_name(op.id).to_string(),
                            tensor: tensor.name.clone(),
                        })
                    }
                    None => {
                        return Err(GraphError::Unproduced {
                            tensor: tensor.name.clone(),
                        })
                    }
                }
            }
        }
        Ok(())
    }

    /// BLAKE3 digest of the graph structure (operator kinds and tensor
    /// names in execution order). Used to detect stale calibration tables.
    pub fn digest(&self) -> String {
        let mut hasher = blake3::Hasher::new();
        for op in &self.ops {
            hasher.update(op.kind.name().as_bytes());
            hasher.update(b"(");
            for &t in &op.inputs {
                hasher.update(self.name_of(t).as_bytes());
                hasher.update(b",");
            }
            hasher.update(b")->");
            for &t in &op.outputs {
                hasher.update(self.name_of(t).as_bytes());
                hasher.update(b",");
            }
            hasher.update(b";");
        }
        hasher.finalize().to_hex().to_string()
    }
}

// ─── Display ──────────────────────────────────────────────────────

impl fmt::Display for ComputeGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "graph {} {{", self.name)?;
        for t in &self.tensors {
            if t.kind == TensorKind::Value {
                continue;
            }
            let role = match t.kind {
                TensorKind::Input => "input",
                _ => "const",
            };
            writeln!(
                f,
                "  {} {} {}{:?} {}",
                role,
                t.id,
                t.dtype.name(),
                t.shape,
                t.name
            )?;
        }
        for op in &self.ops {
            let outs: Vec<String> = op.outputs.iter().map(|t| t.to_string()).collect();
            let ins: Vec<String> = op.inputs.iter().map(|t| t.to_string()).collect();
            writeln!(
                f,
                "  {} = {}({})  // {}",
                outs.join(", "),
                op.kind,
                ins.join(", "),
                self.layer_name(op.id)
            )?;
        }
        write!(f, "}}")
    }
}
