//! Weight and bias requantization.

use std::collections::BTreeMap;

use crate::diagnostic::Diagnostic;
use crate::ir::{ComputeGraph, DType, TensorData, TensorId, TensorKind};

use super::error::CalibrationError;

/// Destination integer type of a quantized initializer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QuantTarget {
    /// int8 weights.
    Weight,
    /// int16 biases.
    Bias,
}

/// How one floating initializer is converted.
#[derive(Clone, Debug, PartialEq)]
pub struct WeightPlan {
    pub tensor: TensorId,
    pub target: QuantTarget,
    /// Threshold ratio applied before the shift.
    pub ratio: f32,
    pub right_shift: u32,
}

#[derive(Clone, Debug, PartialEq)]
pub enum QuantizedData {
    Weight(Vec<i8>),
    Bias(Vec<i16>),
}

impl QuantizedData {
    pub fn len(&self) -> usize {
        match self {
            QuantizedData::Weight(v) => v.len(),
            QuantizedData::Bias(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn into_tensor_data(self) -> (DType, TensorData) {
        match self {
            QuantizedData::Weight(v) => (DType::I8, TensorData::I8(v)),
            QuantizedData::Bias(v) => (DType::I16, TensorData::I16(v)),
        }
    }
}

/// Quantized initializers keyed by tensor name.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct QuantizedWeightStore {
    entries: BTreeMap<String, QuantizedData>,
}

impl QuantizedWeightStore {
    pub fn get(&self, name: &str) -> Option<&QuantizedData> {
        self.entries.get(name)
    }

    pub fn insert(&mut self, name: impl Into<String>, data: QuantizedData) {
        self.entries.insert(name.into(), data);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &QuantizedData)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }
}

fn scaled(w: f32, factor: f64) -> f64 {
    (w as f64 * factor).round()
}

/// `round(w * ratio * 2^rs)` saturated into int8.
pub fn quantize_i8(values: &[f32], ratio: f32, right_shift: u32) -> Vec<i8> {
    let factor = ratio as f64 * (1u64 << right_shift) as f64;
    values
        .iter()
        .map(|&w| scaled(w, factor).clamp(i8::MIN as f64, i8::MAX as f64) as i8)
        .collect()
}

/// `round(w * ratio * 2^rs)` saturated into int16.
pub fn quantize_i16(values: &[f32], ratio: f32, right_shift: u32) -> Vec<i16> {
    let factor = ratio as f64 * (1u64 << right_shift) as f64;
    values
        .iter()
        .map(|&w| scaled(w, factor).clamp(i16::MIN as f64, i16::MAX as f64) as i16)
        .collect()
}

/// Quantize every planned initializer of `graph`.
pub fn requantize(
    graph: &ComputeGraph,
    plans: &[WeightPlan],
) -> Result<QuantizedWeightStore, CalibrationError> {
    let mut store = QuantizedWeightStore::default();
    for plan in plans {
        let tensor = graph.tensor(plan.tensor);
        let values = tensor
            .f32_data()
            .ok_or_else(|| CalibrationError::NonConstantWeight {
                layer: graph
                    .consumers(plan.tensor)
                    .first()
                    .map(|&op| graph.layer_name(op).to_string())
                    .unwrap_or_default(),
                tensor: tensor.name.clone(),
            })?;
        let data = match plan.target {
            QuantTarget::Weight => {
                QuantizedData::Weight(quantize_i8(values, plan.ratio, plan.right_shift))
            }
            QuantTarget::Bias => {
                QuantizedData::Bias(quantize_i16(values, plan.ratio, plan.right_shift))
            }
        };
        if data.len() != values.len() {
            return Err(CalibrationError::ElementCount {
                tensor: tensor.name.clone(),
                source_len: values.len(),
                quantized: data.len(),
            });
        }
        log::debug!(
            "quantized {} ({} elements, rs={})",
            tensor.name,
            data.len(),
            plan.right_shift
        );
        store.insert(tensor.name.clone(), data);
    }
    Ok(store)
}

/// New graph with quantized initializers swapped in and every activation
/// retyped to int8. Floating initializers without a quantized version are
/// kept as they are, with a warning.
pub fn apply(graph: &ComputeGraph, store: &QuantizedWeightStore) -> (ComputeGraph, Vec<Diagnostic>) {
    let mut quantized = graph.clone();
    let mut diagnostics = Vec::new();

    let ids: Vec<TensorId> = graph.tensors().iter().map(|t| t.id).collect();
    for id in ids {
        let tensor = quantized.tensor_mut(id);
        match tensor.kind {
            TensorKind::Initializer => {
                if let Some(data) = store.get(&tensor.name) {
                    let (dtype, data) = data.clone().into_tensor_data();
                    tensor.dtype = dtype;
                    tensor.data = Some(data);
                } else if tensor.dtype == DType::F32 {
                    diagnostics.push(
                        Diagnostic::warning("initializer left in floating point".to_string())
                            .with_subject(tensor.name.clone()),
                    );
                }
            }
            TensorKind::Input | TensorKind::Value => tensor.dtype = DType::I8,
        }
    }
    (quantized, diagnostics)
}
