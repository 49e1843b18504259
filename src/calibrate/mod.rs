//! Calibration engine.
//!
//! One run walks the floating compute graph through these stages:
//! load dataset batches, profile every operator through an execution
//! oracle (thresholds by KL-divergence search), fold thresholds across
//! pass-through and merge operators, derive per-layer fixed-point scales,
//! requantize weights and biases, and emit the calibration table.
//!
//! All mutable run state lives in a `CalibrationState` owned by the call;
//! the input graph is never modified and a new, quantized graph is returned.

pub mod dataset;
mod error;
pub mod fold;
pub mod kld;
pub mod oracle;
pub mod profile;
pub mod requant;
pub mod scale;
pub mod table;

use std::collections::{BTreeMap, HashMap};

pub use dataset::{Cursor, Datum, Normalization, Record, RecordStore};
pub use error::{CalibrationError, DatasetError, OracleError, ScaleError};
pub use kld::KlSearch;
pub use oracle::{Activation, ExecutionOracle, ReferenceOracle};
pub use requant::{QuantTarget, QuantizedData, QuantizedWeightStore, WeightPlan};
pub use scale::FixedScale;
pub use table::{BlobParameter, CalibrationTable, LayerCalibrationParameter};

use crate::diagnostic::Diagnostic;
use crate::ir::{ComputeGraph, TensorId};

/// Knobs of one calibration run.
#[derive(Clone, Debug, PartialEq)]
pub struct CalibrationConfig {
    /// Number of dataset batches to profile.
    pub iterations: usize,
    /// Histogram bins of the threshold search.
    pub bins: usize,
    /// Quantization levels of the threshold search.
    pub levels: usize,
    pub normalization: Normalization,
    /// Signed width of fixed-point multipliers.
    pub multiplier_bits: u32,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            iterations: 1,
            bins: 2048,
            levels: 128,
            normalization: Normalization::default(),
            multiplier_bits: 16,
        }
    }
}

impl CalibrationConfig {
    pub fn search(&self) -> KlSearch {
        KlSearch::new(self.bins, self.levels)
    }
}

/// Per-tensor clipping thresholds.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ThresholdMap {
    values: BTreeMap<TensorId, f32>,
}

impl ThresholdMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, id: TensorId, value: f32) {
        self.values.insert(id, value);
    }

    pub fn get(&self, id: TensorId) -> Option<f32> {
        self.values.get(&id).copied()
    }

    /// Threshold of `id`, or the fatal missing-threshold error naming it.
    pub fn require(&self, graph: &ComputeGraph, id: TensorId) -> Result<f32, CalibrationError> {
        self.get(id).ok_or_else(|| CalibrationError::MissingThreshold {
            tensor: graph.name_of(id).to_string(),
        })
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (TensorId, f32)> + '_ {
        self.values.iter().map(|(&id, &v)| (id, v))
    }
}

/// Mutable state scoped to one calibration run.
#[derive(Debug, Default)]
pub struct CalibrationState {
    /// Live activation buffers, one entry per batch.
    pub activations: HashMap<TensorId, Vec<Activation>>,
    pub thresholds: ThresholdMap,
}

/// Everything a calibration run produces.
#[derive(Debug)]
pub struct CalibrationOutput {
    pub table: CalibrationTable,
    /// Graph with quantized initializers and int8 activations.
    pub graph: ComputeGraph,
    pub weights: QuantizedWeightStore,
    pub thresholds: ThresholdMap,
    pub diagnostics: Vec<Diagnostic>,
}

/// Run the whole calibration pipeline over `graph`.
pub fn calibrate(
    graph: &ComputeGraph,
    store: &RecordStore,
    oracle: &dyn ExecutionOracle,
    config: &CalibrationConfig,
) -> Result<CalibrationOutput, CalibrationError> {
    if config.iterations == 0 {
        return Err(CalibrationError::NoIterations);
    }
    let input = graph.data_input()?;
    let input_tensor = graph.tensor(input);

    let mut cursor = store.cursor();
    let batches = dataset::read_batches(
        &mut cursor,
        &input_tensor.name,
        &input_tensor.shape,
        config.iterations,
        &config.normalization,
    )?;
    log::info!(
        "calibrating '{}' on {} batches of '{}'",
        graph.name,
        batches.len(),
        input_tensor.name
    );

    let mut state = CalibrationState::default();
    profile::profile(graph, batches, oracle, &config.search(), &mut state)?;
    fold::fold(graph, &mut state.thresholds)?;

    let derived = scale::derive_layers(graph, &state.thresholds, config.multiplier_bits)?;
    let weights = requant::requantize(graph, &derived.plans)?;
    let (quantized, mut diagnostics) = requant::apply(graph, &weights);

    let mut all = derived.diagnostics;
    all.append(&mut diagnostics);
    log::info!(
        "calibration table: {} layers, {} quantized initializers",
        derived.table.layers.len(),
        weights.len()
    );
    Ok(CalibrationOutput {
        table: derived.table,
        graph: quantized,
        weights,
        thresholds: state.thresholds,
        diagnostics: all,
    })
}

/// Requantize `graph` from a previously emitted table instead of a dataset.
///
/// Thresholds are read back from the table's blob records; the table itself
/// is returned unchanged. The caller checks that the table belongs to
/// `graph`.
pub fn from_table(
    graph: &ComputeGraph,
    table: &CalibrationTable,
    multiplier_bits: u32,
) -> Result<CalibrationOutput, CalibrationError> {
    let mut thresholds = ThresholdMap::new();
    for tensor in graph.tensors() {
        if let Some(blob) = table.blob(&tensor.name) {
            thresholds.set(tensor.id, blob.threshold_y);
        }
    }
    let derived = scale::derive_layers(graph, &thresholds, multiplier_bits)?;
    let weights = requant::requantize(graph, &derived.plans)?;
    let (quantized, diagnostics) = requant::apply(graph, &weights);
    log::info!(
        "requantized '{}' from a {}-layer table",
        graph.name,
        table.layers.len()
    );
    Ok(CalibrationOutput {
        table: table.clone(),
        graph: quantized,
        weights,
        thresholds,
        diagnostics,
    })
}
