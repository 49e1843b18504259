//! BM1680: floating-point inference accelerator. Needs no calibration.

use crate::calibrate::CalibrationTable;
use crate::ir::{ComputeGraph, ComputeOperator, OpKind};

use super::{base_op, operands, EltwiseMode, InstOp, Instruction, SelectError, TargetLowering};

pub struct Bm1680Lowering;

impl TargetLowering for Bm1680Lowering {
    fn target_name(&self) -> &str {
        "bm1680"
    }

    fn lower_operation(
        &self,
        graph: &ComputeGraph,
        op: &ComputeOperator,
        _table: Option<&CalibrationTable>,
    ) -> Result<Option<Instruction>, SelectError> {
        let inst = match &op.kind {
            OpKind::Scale { axis } => InstOp::Scale {
                axis: *axis,
                has_bias: op.inputs.len() > 2,
            },
            OpKind::Concat { axis } => InstOp::Concat { axis: *axis },
            OpKind::Max => InstOp::Eltwise {
                mode: EltwiseMode::Max,
            },
            OpKind::Mul => InstOp::Eltwise {
                mode: EltwiseMode::Mul,
            },
            _ => match base_op(op) {
                Some(inst) => inst,
                None => return Ok(None),
            },
        };
        let (inputs, outputs) = operands(graph, op);
        Ok(Some(Instruction {
            layer_name: graph.layer_name(op.id).to_string(),
            op: inst,
            inputs,
            outputs,
            quant: None,
        }))
    }
}
