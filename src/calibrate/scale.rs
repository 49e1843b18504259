//! Fixed-point scale derivation.
//!
//! A real ratio `r` is carried as `(multiplier, right_shift)` with
//! `r ≈ multiplier / 2^right_shift`. Weighted layers fold the ratio into
//! their weights and keep only a right shift; pooling and multiplying
//! layers carry an explicit multiplier; summing layers carry one integer
//! ratio per input plus a shared shift.

use crate::diagnostic::Diagnostic;
use crate::ir::{ComputeGraph, ComputeOperator, LayerClass, OpKind, TensorId};

use super::error::{CalibrationError, ScaleError};
use super::requant::{QuantTarget, WeightPlan};
use super::table::{BlobParameter, CalibrationTable, LayerCalibrationParameter};
use super::ThresholdMap;

/// Largest right shift the hardware shifter accepts.
pub const MAX_RIGHT_SHIFT: u32 = 31;

/// Input range of int8 activations.
const INT8_RANGE: f32 = 128.0;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FixedScale {
    pub right_shift: u32,
    pub multiplier: i32,
}

fn check_threshold(tensor: &str, value: f32) -> Result<(), ScaleError> {
    if value > 0.0 && value.is_finite() {
        Ok(())
    } else {
        Err(ScaleError::Threshold {
            tensor: tensor.to_string(),
            value,
        })
    }
}

/// Scale mapping input threshold `x` onto output threshold `y`.
///
/// The shift grows while `2^shift < 256 / x * y`; the multiplier is
/// `round(x / y * 2^shift)` and must fit a signed `bits`-bit integer.
pub fn fixed_scale(tensor: &str, x: f32, y: f32, bits: u32) -> Result<FixedScale, ScaleError> {
    check_threshold(tensor, x)?;
    check_threshold(tensor, y)?;
    let ceiling = 256.0 / x as f64 * y as f64;
    let mut shift = 0u32;
    while ((1u64 << shift) as f64) < ceiling {
        shift += 1;
        if shift > MAX_RIGHT_SHIFT {
            return Err(ScaleError::Shift {
                tensor: tensor.to_string(),
                max: MAX_RIGHT_SHIFT,
            });
        }
    }
    let multiplier = (x as f64 / y as f64 * (1u64 << shift) as f64).round() as i64;
    let limit = 1i64 << (bits.clamp(2, 32) - 1);
    if multiplier >= limit || multiplier < -limit {
        return Err(ScaleError::Multiplier {
            tensor: tensor.to_string(),
            multiplier,
            bits,
        });
    }
    Ok(FixedScale {
        right_shift: shift,
        multiplier: multiplier as i32,
    })
}

/// Right shift that brings `max |v| * scale` into `[64, 128)`.
pub fn right_shift(tensor: &str, values: &[f32], scale: f32) -> Result<u32, ScaleError> {
    let mut max = values.iter().fold(0.0f32, |m, v| m.max(v.abs())) * scale;
    if !(max > 0.0 && max < INT8_RANGE) {
        return Err(ScaleError::Range {
            tensor: tensor.to_string(),
            max,
        });
    }
    let mut shift = 0u32;
    while max < 64.0 {
        shift += 1;
        max *= 2.0;
        if shift > MAX_RIGHT_SHIFT {
            return Err(ScaleError::Shift {
                tensor: tensor.to_string(),
                max: MAX_RIGHT_SHIFT,
            });
        }
    }
    Ok(shift)
}

/// Table records and requantization plans of every layer.
#[derive(Debug, Default)]
pub struct DerivedLayers {
    pub table: CalibrationTable,
    pub plans: Vec<WeightPlan>,
    pub diagnostics: Vec<Diagnostic>,
}

/// Derive per-layer fixed-point parameters from finalized thresholds.
pub fn derive_layers(
    graph: &ComputeGraph,
    thresholds: &ThresholdMap,
    multiplier_bits: u32,
) -> Result<DerivedLayers, CalibrationError> {
    let mut out = DerivedLayers::default();
    out.table.model_digest = graph.digest();

    let input = graph.data_input()?;
    let name = graph.name_of(input);
    let mut data = LayerCalibrationParameter::new(name);
    data.blobs.push(BlobParameter::threshold(
        name,
        thresholds.require(graph, input)?,
    ));
    out.table.layers.push(data);

    for op in graph.ops() {
        let layer_name = graph.layer_name(op.id).to_string();
        let mut layer = LayerCalibrationParameter::new(layer_name.clone());
        for (idx, &t) in op.outputs.iter().enumerate() {
            let threshold = if idx == 0 {
                thresholds.require(graph, t)?
            } else {
                match thresholds.get(t) {
                    Some(v) => v,
                    None => continue,
                }
            };
            layer
                .blobs
                .push(BlobParameter::threshold(graph.name_of(t), threshold));
        }

        match op.kind.class() {
            LayerClass::Weighted => {
                let rs = weighted(graph, op, thresholds, &mut out.plans)?;
                set_primary(&mut layer, Some(rs), None);
            }
            LayerClass::Pool => {
                let x = thresholds.require(graph, operand(graph, op, 0)?)?;
                let y = thresholds.require(graph, operand_out(graph, op)?)?;
                let x = match &op.kind {
                    OpKind::AveragePool(attrs) => x / attrs.area() as f32,
                    _ => x,
                };
                let s = fixed_scale(&layer_name, x, y, multiplier_bits)?;
                set_primary(&mut layer, Some(s.right_shift), Some(s.multiplier));
            }
            LayerClass::Eltwise if op.kind == OpKind::Mul => {
                let xa = thresholds.require(graph, operand(graph, op, 0)?)?;
                let xb = thresholds.require(graph, operand(graph, op, 1)?)?;
                let y = thresholds.require(graph, operand_out(graph, op)?)?;
                let s = fixed_scale(&layer_name, xa * xb / INT8_RANGE, y, multiplier_bits)?;
                set_primary(&mut layer, Some(s.right_shift), Some(s.multiplier));
            }
            LayerClass::Eltwise => {
                let y = thresholds.require(graph, operand_out(graph, op)?)?;
                check_threshold(&layer_name, y)?;
                let mut ratios = Vec::with_capacity(op.inputs.len());
                for &input in &op.inputs {
                    ratios.push(thresholds.require(graph, input)? / y);
                }
                let rs = right_shift(&layer_name, &ratios, 1.0)?;
                layer.threshold_x_quantized = ratios
                    .iter()
                    .map(|r| (r * (1u64 << rs) as f32).round() as i32)
                    .collect();
                set_primary(&mut layer, Some(rs), None);
            }
            LayerClass::PassThrough | LayerClass::Merge | LayerClass::Passive => {}
            LayerClass::Unclassified => out.diagnostics.push(
                Diagnostic::warning(format!(
                    "no calibration policy for {}; only thresholds recorded",
                    op.kind.name()
                ))
                .with_subject(layer_name.clone()),
            ),
        }
        if let Some(blob) = layer.output() {
            log::debug!(
                "layer {}: threshold_y={} right_shift={:?} multiplier={:?}",
                layer.name,
                blob.threshold_y,
                blob.right_shift,
                blob.multiplier
            );
        }
        out.table.layers.push(layer);
    }
    Ok(out)
}

fn set_primary(layer: &mut LayerCalibrationParameter, rs: Option<u32>, multiplier: Option<i32>) {
    if let Some(blob) = layer.blobs.first_mut() {
        blob.right_shift = rs;
        blob.multiplier = multiplier;
    }
}

fn operand(graph: &ComputeGraph, op: &ComputeOperator, idx: usize) -> Result<TensorId, CalibrationError> {
    op.input(idx).ok_or_else(|| CalibrationError::MissingThreshold {
        tensor: format!("{} input #{}", graph.layer_name(op.id), idx),
    })
}

fn operand_out(graph: &ComputeGraph, op: &ComputeOperator) -> Result<TensorId, CalibrationError> {
    op.output(0).ok_or_else(|| CalibrationError::MissingThreshold {
        tensor: format!("{} output", graph.layer_name(op.id)),
    })
}

/// Right shift of a weighted layer, plus its weight and bias plans.
fn weighted(
    graph: &ComputeGraph,
    op: &ComputeOperator,
    thresholds: &ThresholdMap,
    plans: &mut Vec<WeightPlan>,
) -> Result<u32, CalibrationError> {
    let layer = graph.layer_name(op.id);
    let x = thresholds.require(graph, operand(graph, op, 0)?)?;
    let y = thresholds.require(graph, operand_out(graph, op)?)?;
    check_threshold(layer, x)?;
    check_threshold(layer, y)?;

    let weight = operand(graph, op, 1)?;
    let values = graph
        .tensor(weight)
        .f32_data()
        .ok_or_else(|| CalibrationError::NonConstantWeight {
            layer: layer.to_string(),
            tensor: graph.name_of(weight).to_string(),
        })?;
    let rs = right_shift(graph.name_of(weight), values, x / y)?;
    plans.push(WeightPlan {
        tensor: weight,
        target: QuantTarget::Weight,
        ratio: x / y,
        right_shift: rs,
    });

    if let Some(bias) = op.input(2) {
        if graph.tensor(bias).f32_data().is_none() {
            return Err(CalibrationError::NonConstantWeight {
                layer: layer.to_string(),
                tensor: graph.name_of(bias).to_string(),
            });
        }
        plans.push(WeightPlan {
            tensor: bias,
            target: QuantTarget::Bias,
            ratio: INT8_RANGE / y,
            right_shift: rs,
        });
    }
    Ok(rs)
}
