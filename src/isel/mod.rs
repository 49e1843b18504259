//! Target instruction selection.
//!
//! Each backend implements `TargetLowering`: one operator in, at most one
//! instruction out. Operators a backend has no matcher for are dropped with
//! a warning so a new backend can be brought up one kind at a time.

mod bm1680;
mod bm1880;
mod inst;

use thiserror::Error;

pub use bm1680::Bm1680Lowering;
pub use bm1880::Bm1880Lowering;
pub use inst::{EltwiseMode, InstOp, Instruction, Operand, QuantFields};

use crate::calibrate::CalibrationTable;
use crate::config::March;
use crate::diagnostic::Diagnostic;
use crate::ir::{ComputeGraph, ComputeOperator, OpKind};

/// Fatal instruction-selection failures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SelectError {
    #[error("target '{target}' requires a calibration table")]
    NoTable { target: String },
    #[error("no calibration record for layer '{layer}' ({kind})")]
    MissingCalibration { layer: String, kind: String },
    #[error("calibration record of layer '{layer}' lacks '{field}'")]
    MissingField { layer: String, field: &'static str },
}

/// Instructions in source execution order, plus dropped-operator warnings.
#[derive(Debug, Default)]
pub struct Selection {
    pub instructions: Vec<Instruction>,
    pub diagnostics: Vec<Diagnostic>,
}

impl Selection {
    /// Assembly-style listing, one instruction per line.
    pub fn listing(&self) -> String {
        let mut out = String::new();
        for inst in &self.instructions {
            out.push_str(&inst.to_string());
            out.push('\n');
        }
        out
    }
}

/// Lowers compute-graph operators to the instructions of one target.
pub trait TargetLowering {
    /// The target name (e.g. "bm1880").
    fn target_name(&self) -> &str;

    /// Lower one operator. `Ok(None)` means the target has no matcher for
    /// the operator's kind.
    fn lower_operation(
        &self,
        graph: &ComputeGraph,
        op: &ComputeOperator,
        table: Option<&CalibrationTable>,
    ) -> Result<Option<Instruction>, SelectError>;

    /// Lower every operator of `graph` in execution order.
    fn select(
        &self,
        graph: &ComputeGraph,
        table: Option<&CalibrationTable>,
    ) -> Result<Selection, SelectError> {
        let mut selection = Selection::default();
        for op in graph.ops() {
            match self.lower_operation(graph, op, table)? {
                Some(inst) => {
                    log::debug!("{}: {}", self.target_name(), inst);
                    selection.instructions.push(inst);
                }
                None => selection.diagnostics.push(
                    Diagnostic::warning(format!(
                        "{} has no instruction for {}; operator dropped",
                        self.target_name(),
                        op.kind.name()
                    ))
                    .with_subject(graph.layer_name(op.id).to_string()),
                ),
            }
        }
        log::info!(
            "{}: selected {} instructions, dropped {} operators",
            self.target_name(),
            selection.instructions.len(),
            selection.diagnostics.len()
        );
        Ok(selection)
    }
}

/// Create the instruction selector for a machine architecture.
pub fn create_lowering(march: March) -> Box<dyn TargetLowering> {
    match march {
        March::Bm1880 => Box::new(Bm1880Lowering),
        March::Bm1680 => Box::new(Bm1680Lowering),
    }
}

/// Opcode and parameters of operator kinds every backend shares.
fn base_op(op: &ComputeOperator) -> Option<InstOp> {
    let has_bias = op.inputs.len() > 2;
    Some(match &op.kind {
        OpKind::Conv(a) => InstOp::Conv {
            kernel: a.kernel,
            strides: a.strides,
            pads: a.pads,
            dilations: a.dilations,
            group: a.group,
            has_bias,
        },
        OpKind::Gemm(a) => InstOp::Fc {
            trans_b: a.trans_b,
            has_bias,
        },
        OpKind::MaxPool(a) => InstOp::MaxPool {
            kernel: a.kernel,
            strides: a.strides,
            pads: a.pads,
        },
        OpKind::AveragePool(a) => InstOp::AvgPool {
            kernel: a.kernel,
            strides: a.strides,
            pads: a.pads,
            count_include_pad: a.count_include_pad,
        },
        OpKind::Relu => InstOp::Relu,
        OpKind::Lrn(a) => InstOp::Lrn {
            size: a.size,
            alpha: a.alpha,
            beta: a.beta,
            bias: a.bias,
        },
        OpKind::Softmax { axis } => InstOp::Softmax { axis: *axis },
        OpKind::Sum => InstOp::Eltwise {
            mode: EltwiseMode::Sum,
        },
        _ => return None,
    })
}

fn operands(graph: &ComputeGraph, op: &ComputeOperator) -> (Vec<Operand>, Vec<Operand>) {
    (
        op.inputs.iter().map(|&t| Operand::of(graph, t)).collect(),
        op.outputs.iter().map(|&t| Operand::of(graph, t)).collect(),
    )
}

#[cfg(test)]
mod tests;
