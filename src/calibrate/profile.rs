//! Profiling pass: run every operator on every batch, one operator at a
//! time in execution order, and record output thresholds.

use std::collections::HashMap;

use crate::ir::{ComputeGraph, TensorData, TensorId};

use super::error::{CalibrationError, OracleError};
use super::kld::KlSearch;
use super::oracle::{Activation, ExecutionOracle};
use super::CalibrationState;

/// Profile `graph` starting from the data-input `batches`.
///
/// The data input is thresholded first. After each operator its outputs
/// are thresholded over all batches, and buffers with no remaining
/// consumer are evicted.
pub fn profile(
    graph: &ComputeGraph,
    batches: Vec<Activation>,
    oracle: &dyn ExecutionOracle,
    search: &KlSearch,
    state: &mut CalibrationState,
) -> Result<(), CalibrationError> {
    let input = graph.data_input()?;
    let iterations = batches.len();
    let threshold = search.threshold(&concat(&batches));
    log::debug!("threshold {} = {}", graph.name_of(input), threshold);
    state.thresholds.set(input, threshold);
    state.activations.insert(input, batches);

    let constants = constants(graph);
    for op in graph.ops() {
        let layer = graph.layer_name(op.id);
        for run in 0..iterations {
            let mut inputs: Vec<&Activation> = Vec::with_capacity(op.inputs.len());
            for &id in &op.inputs {
                let value = constants
                    .get(&id)
                    .or_else(|| state.activations.get(&id).and_then(|b| b.get(run)))
                    .ok_or_else(|| OracleError::MissingInput {
                        layer: layer.to_string(),
                        tensor: graph.name_of(id).to_string(),
                    })?;
                inputs.push(value);
            }
            let outputs = oracle.execute(graph, op.id, &inputs)?;
            for (&id, value) in op.outputs.iter().zip(outputs) {
                state.activations.entry(id).or_default().push(value);
            }
        }

        for &out in &op.outputs {
            if let Some(buffers) = state.activations.get(&out) {
                let threshold = search.threshold(&concat(buffers));
                log::debug!("threshold {} = {}", graph.name_of(out), threshold);
                state.thresholds.set(out, threshold);
            }
        }

        for &id in op.inputs.iter().chain(&op.outputs) {
            if !graph.used_after(id, op.id) && state.activations.remove(&id).is_some() {
                log::trace!("evicted {}", graph.name_of(id));
            }
        }
    }
    Ok(())
}

fn concat(batches: &[Activation]) -> Vec<f32> {
    let mut all = Vec::with_capacity(batches.iter().map(Activation::len).sum());
    for b in batches {
        all.extend_from_slice(&b.data);
    }
    all
}

/// Initializers as floating activations, fed to the oracle on every run.
fn constants(graph: &ComputeGraph) -> HashMap<TensorId, Activation> {
    graph
        .tensors()
        .iter()
        .filter_map(|t| {
            let data: Vec<f32> = match t.data.as_ref()? {
                TensorData::F32(v) => v.clone(),
                TensorData::I8(v) => v.iter().map(|&x| x as f32).collect(),
                TensorData::I16(v) => v.iter().map(|&x| x as f32).collect(),
                TensorData::I64(v) => v.iter().map(|&x| x as f32).collect(),
            };
            Some((t.id, Activation::new(t.shape.clone(), data)))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibrate::oracle::ReferenceOracle;
    use crate::ir::{DType, OpKind, TensorKind};

    /// Records the order operators are executed in.
    struct Spy {
        inner: ReferenceOracle,
        seen: std::cell::RefCell<Vec<usize>>,
    }

    impl ExecutionOracle for Spy {
        fn execute(
            &self,
            graph: &ComputeGraph,
            op: crate::ir::OpId,
            inputs: &[&Activation],
        ) -> Result<Vec<Activation>, OracleError> {
            self.seen.borrow_mut().push(op.index());
            self.inner.execute(graph, op, inputs)
        }
    }

    fn relu_chain() -> ComputeGraph {
        let mut g = ComputeGraph::new("chain");
        let x = g.add_tensor("x", vec![1, 4], DType::F32, TensorKind::Input, None);
        g.mark_input(x);
        let a = g.add_tensor("a", vec![1, 4], DType::F32, TensorKind::Value, None);
        let b = g.add_tensor("b", vec![1, 4], DType::F32, TensorKind::Value, None);
        g.add_operator(OpKind::Relu, vec![x], vec![a]);
        g.add_operator(OpKind::Dropout { ratio: 0.5 }, vec![a], vec![b]);
        g.mark_output(b);
        g
    }

    #[test]
    fn test_profile_thresholds_every_tensor_and_evicts() {
        let g = relu_chain();
        let batches = vec![
            Activation::new(vec![1, 4], vec![-1.0, 0.5, 2.0, 1.0]),
            Activation::new(vec![1, 4], vec![0.25, -3.0, 1.5, 0.0]),
        ];
        let spy = Spy {
            inner: ReferenceOracle,
            seen: Default::default(),
        };
        let mut state = CalibrationState::default();
        profile(&g, batches, &spy, &KlSearch::new(8, 8), &mut state).unwrap();

        assert_eq!(*spy.seen.borrow(), vec![0, 0, 1, 1]);
        let x = g.find("x").unwrap();
        let a = g.find("a").unwrap();
        let b = g.find("b").unwrap();
        assert_eq!(state.thresholds.get(x), Some(3.0));
        assert_eq!(state.thresholds.get(a), Some(2.0));
        assert_eq!(state.thresholds.get(b), Some(2.0));
        assert!(state.activations.is_empty());
    }

    #[test]
    fn test_missing_activation_is_reported_by_name() {
        let mut g = ComputeGraph::new("g");
        let x = g.add_tensor("x", vec![1], DType::F32, TensorKind::Input, None);
        g.mark_input(x);
        let ghost = g.add_tensor("ghost", vec![1], DType::F32, TensorKind::Value, None);
        let y = g.add_tensor("y", vec![1], DType::F32, TensorKind::Value, None);
        g.add_operator(OpKind::Sum, vec![x, ghost], vec![y]);
        let mut state = CalibrationState::default();
        let err = profile(
            &g,
            vec![Activation::new(vec![1], vec![1.0])],
            &ReferenceOracle,
            &KlSearch::default(),
            &mut state,
        )
        .unwrap_err();
        match err {
            CalibrationError::Oracle(OracleError::MissingInput { tensor, .. }) => {
                assert_eq!(tensor, "ghost")
            }
            other => panic!("unexpected {}", other),
        }
    }
}
