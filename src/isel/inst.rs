//! Target instructions produced by instruction selection.

use std::fmt;

use crate::ir::{ComputeGraph, DType, TensorId};

/// Element-wise combination mode.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EltwiseMode {
    Sum,
    Max,
    Mul,
}

/// Instruction opcode with its operator parameters.
#[derive(Clone, Debug, PartialEq)]
pub enum InstOp {
    Conv {
        kernel: [usize; 2],
        strides: [usize; 2],
        pads: [usize; 4],
        dilations: [usize; 2],
        group: usize,
        has_bias: bool,
    },
    Fc {
        trans_b: bool,
        has_bias: bool,
    },
    Scale {
        axis: i64,
        has_bias: bool,
    },
    MaxPool {
        kernel: [usize; 2],
        strides: [usize; 2],
        pads: [usize; 4],
    },
    AvgPool {
        kernel: [usize; 2],
        strides: [usize; 2],
        pads: [usize; 4],
        count_include_pad: bool,
    },
    Relu,
    Lrn {
        size: usize,
        alpha: f32,
        beta: f32,
        bias: f32,
    },
    Softmax {
        axis: i64,
    },
    Eltwise {
        mode: EltwiseMode,
    },
    Concat {
        axis: i64,
    },
}

impl InstOp {
    pub fn type_name(&self) -> &'static str {
        match self {
            InstOp::Conv { .. } => "conv",
            InstOp::Fc { .. } => "fc",
            InstOp::Scale { .. } => "scale",
            InstOp::MaxPool { .. } => "maxpool",
            InstOp::AvgPool { .. } => "avgpool",
            InstOp::Relu => "relu",
            InstOp::Lrn { .. } => "lrn",
            InstOp::Softmax { .. } => "softmax",
            InstOp::Eltwise {
                mode: EltwiseMode::Sum,
            } => "eltwise_sum",
            InstOp::Eltwise {
                mode: EltwiseMode::Max,
            } => "eltwise_max",
            InstOp::Eltwise {
                mode: EltwiseMode::Mul,
            } => "eltwise_mul",
            InstOp::Concat { .. } => "concat",
        }
    }
}

/// A tensor reference carried by an instruction.
#[derive(Clone, Debug, PartialEq)]
pub struct Operand {
    pub name: String,
    pub shape: Vec<usize>,
    pub dtype: DType,
}

impl Operand {
    pub fn of(graph: &ComputeGraph, id: TensorId) -> Self {
        let t = graph.tensor(id);
        Self {
            name: t.name.clone(),
            shape: t.shape.clone(),
            dtype: t.dtype,
        }
    }
}

/// Calibration fields of an int8 instruction.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct QuantFields {
    /// Thresholds of the activation inputs, in input order.
    pub threshold_x: Vec<f32>,
    pub threshold_y: f32,
    pub right_shift: Option<u32>,
    pub multiplier: Option<i32>,
    pub threshold_x_quantized: Vec<i32>,
}

/// One selected target instruction.
#[derive(Clone, Debug, PartialEq)]
pub struct Instruction {
    pub layer_name: String,
    pub op: InstOp,
    pub inputs: Vec<Operand>,
    pub outputs: Vec<Operand>,
    pub quant: Option<QuantFields>,
}

impl Instruction {
    pub fn type_name(&self) -> &'static str {
        self.op.type_name()
    }
}

fn names(operands: &[Operand]) -> String {
    operands
        .iter()
        .map(|o| o.name.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:<12} {} ({}) -> ({})",
            self.type_name(),
            self.layer_name,
            names(&self.inputs),
            names(&self.outputs)
        )?;
        match &self.op {
            InstOp::Conv {
                kernel,
                strides,
                pads,
                group,
                ..
            } => write!(
                f,
                " k={}x{} s={}x{} p={},{},{},{} g={}",
                kernel[0], kernel[1], strides[0], strides[1], pads[0], pads[1], pads[2], pads[3], group
            )?,
            InstOp::MaxPool {
                kernel, strides, ..
            }
            | InstOp::AvgPool {
                kernel, strides, ..
            } => write!(
                f,
                " k={}x{} s={}x{}",
                kernel[0], kernel[1], strides[0], strides[1]
            )?,
            InstOp::Lrn { size, .. } => write!(f, " size={}", size)?,
            InstOp::Softmax { axis } | InstOp::Concat { axis } => write!(f, " axis={}", axis)?,
            _ => {}
        }
        if let Some(q) = &self.quant {
            write!(f, " ; thy={}", q.threshold_y)?;
            if let Some(rs) = q.right_shift {
                write!(f, " rshift={}", rs)?;
            }
            if let Some(m) = q.multiplier {
                write!(f, " mul={}", m)?;
            }
            if !q.threshold_x_quantized.is_empty() {
                write!(f, " thx_q={:?}", q.threshold_x_quantized)?;
            }
        }
        Ok(())
    }
}
