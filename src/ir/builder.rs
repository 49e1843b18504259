//! IrBuilder: the graph-mutation surface handed to lowering matchers.

use std::collections::HashMap;

use super::{ComputeGraph, DType, OpId, OpKind, Tensor, TensorId, TensorKind};
use crate::onnx::ValueInfo;

/// Binds tensors by name and appends operators to a `ComputeGraph`.
///
/// Shapes of tensors created here come from the interchange graph's
/// declared value infos when available, and are left empty otherwise.
pub struct IrBuilder<'a> {
    graph: &'a mut ComputeGraph,
    hints: &'a HashMap<String, ValueInfo>,
}

impl<'a> IrBuilder<'a> {
    pub fn new(graph: &'a mut ComputeGraph, hints: &'a HashMap<String, ValueInfo>) -> Self {
        Self { graph, hints }
    }

    /// Look up an already bound tensor.
    pub fn lookup(&self, name: &str) -> Option<&Tensor> {
        self.graph.find(name).map(|id| self.graph.tensor(id))
    }

    /// Return the tensor named `name`, creating a value tensor if needed.
    pub fn bind(&mut self, name: &str) -> TensorId {
        if let Some(id) = self.graph.find(name) {
            return id;
        }
        let (shape, dtype) = match self.hints.get(name) {
            Some(info) => (info.shape.clone(), DType::from(info.elem_type)),
            None => (Vec::new(), DType::F32),
        };
        self.graph
            .add_tensor(name, shape, dtype, TensorKind::Value, None)
    }

    /// Append one operator wired to the named tensors.
    pub fn operator(&mut self, kind: OpKind, inputs: &[String], outputs: &[String]) -> OpId {
        let ins: Vec<TensorId> = inputs.iter().map(|n| self.bind(n)).collect();
        let outs: Vec<TensorId> = outputs.iter().map(|n| self.bind(n)).collect();
        self.graph.add_operator(kind, ins, outs)
    }
}
