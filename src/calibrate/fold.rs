//! Threshold folding across operators whose output range is known from
//! their inputs.

use crate::ir::ComputeGraph;

use super::error::CalibrationError;
use super::ThresholdMap;

/// Execution order: a pass-through output takes its input's threshold.
pub fn forward(graph: &ComputeGraph, thresholds: &mut ThresholdMap) -> Result<(), CalibrationError> {
    for op in graph.ops().iter().filter(|op| op.kind.is_pass_through()) {
        let (Some(input), Some(output)) = (op.input(0), op.output(0)) else {
            continue;
        };
        let value = thresholds.require(graph, input)?;
        thresholds.set(output, value);
    }
    Ok(())
}

/// Reverse execution order: a pass-through input takes its output's
/// threshold, and a merge pushes its output threshold into every input.
///
/// A merge input read anywhere else cannot be overwritten; all inputs are
/// checked before any threshold changes.
pub fn backward(
    graph: &ComputeGraph,
    thresholds: &mut ThresholdMap,
) -> Result<(), CalibrationError> {
    for op in graph.ops().iter().rev() {
        if op.kind.is_pass_through() {
            let (Some(input), Some(output)) = (op.input(0), op.output(0)) else {
                continue;
            };
            let value = thresholds.require(graph, output)?;
            thresholds.set(input, value);
        } else if op.kind.is_merge() {
            let Some(output) = op.output(0) else {
                continue;
            };
            for &input in &op.inputs {
                let consumers = graph.use_count(input);
                if consumers > 1 {
                    return Err(CalibrationError::SharedFoldInput {
                        output: graph.name_of(output).to_string(),
                        input: graph.name_of(input).to_string(),
                        consumers,
                    });
                }
            }
            let value = thresholds.require(graph, output)?;
            for &input in &op.inputs {
                thresholds.set(input, value);
            }
        }
    }
    Ok(())
}

/// Forward then backward folding.
pub fn fold(graph: &ComputeGraph, thresholds: &mut ThresholdMap) -> Result<(), CalibrationError> {
    forward(graph, thresholds)?;
    backward(graph, thresholds)?;
    log::info!("folded thresholds over {} tensors", thresholds.len());
    Ok(())
}
