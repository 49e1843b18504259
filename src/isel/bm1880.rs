//! BM1880: int8 inference accelerator.
//!
//! Every instruction carries the calibration fields of its layer. Weighted
//! layers need a right shift, pooling layers a right shift and multiplier,
//! element-wise sums a shared right shift plus one integer ratio per input.

use crate::calibrate::{CalibrationTable, LayerCalibrationParameter};
use crate::ir::{ComputeGraph, ComputeOperator};

use super::{base_op, operands, InstOp, Instruction, QuantFields, SelectError, TargetLowering};

pub struct Bm1880Lowering;

impl Bm1880Lowering {
    fn quant_fields(
        graph: &ComputeGraph,
        op: &ComputeOperator,
        inst: &InstOp,
        table: &CalibrationTable,
        record: &LayerCalibrationParameter,
    ) -> Result<QuantFields, SelectError> {
        let layer = graph.layer_name(op.id);
        let missing = |field| SelectError::MissingField {
            layer: layer.to_string(),
            field,
        };
        let blob = record.output().ok_or_else(|| missing("blob_param"))?;

        let mut threshold_x = Vec::new();
        for &input in &op.inputs {
            if graph.tensor(input).is_constant() {
                continue;
            }
            let name = graph.name_of(input);
            let x = table
                .blob(name)
                .ok_or_else(|| SelectError::MissingCalibration {
                    layer: name.to_string(),
                    kind: "activation".to_string(),
                })?;
            threshold_x.push(x.threshold_y);
        }

        let mut fields = QuantFields {
            threshold_x,
            threshold_y: blob.threshold_y,
            ..QuantFields::default()
        };
        match inst {
            InstOp::Conv { .. } | InstOp::Fc { .. } => {
                fields.right_shift = Some(blob.right_shift.ok_or_else(|| missing("right_shift"))?);
            }
            InstOp::MaxPool { .. } | InstOp::AvgPool { .. } => {
                fields.right_shift = Some(blob.right_shift.ok_or_else(|| missing("right_shift"))?);
                fields.multiplier = Some(blob.multiplier.ok_or_else(|| missing("multiplier"))?);
            }
            InstOp::Eltwise { .. } => {
                fields.right_shift = Some(blob.right_shift.ok_or_else(|| missing("right_shift"))?);
                if record.threshold_x_quantized.len() != op.inputs.len() {
                    return Err(missing("threshold_x_quantized"));
                }
                fields.threshold_x_quantized = record.threshold_x_quantized.clone();
            }
            _ => {}
        }
        Ok(fields)
    }
}

impl TargetLowering for Bm1880Lowering {
    fn target_name(&self) -> &str {
        "bm1880"
    }

    fn lower_operation(
        &self,
        graph: &ComputeGraph,
        op: &ComputeOperator,
        table: Option<&CalibrationTable>,
    ) -> Result<Option<Instruction>, SelectError> {
        let Some(inst) = base_op(op) else {
            return Ok(None);
        };
        let table = table.ok_or_else(|| SelectError::NoTable {
            target: self.target_name().to_string(),
        })?;
        let layer_name = graph.layer_name(op.id);
        let record = table
            .layer(layer_name)
            .ok_or_else(|| SelectError::MissingCalibration {
                layer: layer_name.to_string(),
                kind: op.kind.name().to_string(),
            })?;
        let quant = Self::quant_fields(graph, op, &inst, table, record)?;
        let (inputs, outputs) = operands(graph, op);
        Ok(Some(Instruction {
            layer_name: layer_name.to_string(),
            op: inst,
            inputs,
            outputs,
            quant: Some(quant),
        }))
    }
}
