//! End-to-end compilation: lower, calibrate, select instructions.
//!
//! The stages run strictly in sequence; each finishes before the next
//! starts and hands over a new graph.

use thiserror::Error;

use crate::calibrate::{
    self, CalibrationConfig, CalibrationError, CalibrationTable, ExecutionOracle,
    QuantizedWeightStore, RecordStore,
};
use crate::config::TargetConfig;
use crate::diagnostic::Diagnostic;
use crate::ir::lower::{lower_graph, LowerError, LowerRegistry, NodeKind, UnsupportedPolicy};
use crate::ir::ComputeGraph;
use crate::isel::{create_lowering, SelectError, Selection};
use crate::onnx::{self, Initializer, Model};

#[derive(Debug, Error)]
pub enum CompileError {
    #[error(transparent)]
    Lower(#[from] LowerError),
    #[error(transparent)]
    Calibration(#[from] CalibrationError),
    #[error(transparent)]
    Select(#[from] SelectError),
    #[error("calibration table was built for graph {found}, this graph is {expected}")]
    StaleTable { expected: String, found: String },
    #[error("target '{target}' needs calibration: provide a dataset, a table, or a dummy table")]
    NoCalibration { target: String },
    #[error("dummy weights cannot be calibrated; pair them with a calibration table or a dummy table")]
    DummyWeightCalibration,
}

/// Options of one compilation.
#[derive(Clone, Debug)]
pub struct CompileOptions {
    pub target: TargetConfig,
    pub calibration: CalibrationConfig,
    pub unsupported: UnsupportedPolicy,
    /// Previously emitted table to reuse instead of calibrating.
    pub ctable: Option<CalibrationTable>,
    /// Skip calibration entirely.
    pub ignore_calibration: bool,
    /// With `ignore_calibration`, synthesize a placeholder table.
    pub dummy_ctable: bool,
    /// Zero-fill weight inputs that have no initializer.
    pub dummy_weight: bool,
}

impl Default for CompileOptions {
    fn default() -> Self {
        let target = TargetConfig::bm1880();
        let calibration = CalibrationConfig {
            multiplier_bits: target.multiplier_bits,
            ..CalibrationConfig::default()
        };
        Self {
            target,
            calibration,
            unsupported: UnsupportedPolicy::default(),
            ctable: None,
            ignore_calibration: false,
            dummy_ctable: false,
            dummy_weight: false,
        }
    }
}

/// Artifacts of a successful compilation.
#[derive(Debug)]
pub struct Compiled {
    /// Final graph: quantized for int8 targets, floating otherwise.
    pub graph: ComputeGraph,
    pub table: Option<CalibrationTable>,
    pub weights: QuantizedWeightStore,
    pub selection: Selection,
    /// Non-fatal diagnostics of every stage, in stage order.
    pub diagnostics: Vec<Diagnostic>,
}

impl Compiled {
    /// Initializer payloads concatenated in tensor order, little-endian.
    pub fn weight_blob(&self) -> Vec<u8> {
        let mut blob = Vec::new();
        for tensor in self.graph.tensors() {
            if let Some(data) = &tensor.data {
                blob.extend_from_slice(&data.to_le_bytes());
            }
        }
        blob
    }
}

/// Graph inputs feeding a weight slot that have no initializer get a
/// zero-filled one of the declared shape.
pub fn add_dummy_weights(graph: &mut onnx::Graph) -> Vec<Diagnostic> {
    let mut diagnostics = Vec::new();
    let mut missing: Vec<(String, Vec<usize>)> = Vec::new();
    for node in &graph.nodes {
        let weighted = matches!(
            NodeKind::parse(&node.op_type),
            Some(NodeKind::Conv | NodeKind::Gemm | NodeKind::Scale)
        );
        if !weighted {
            continue;
        }
        for name in node.present_inputs().iter().skip(1) {
            if graph.initializer(name).is_some() || missing.iter().any(|(n, _)| n == name) {
                continue;
            }
            if let Some(decl) = graph.inputs.iter().find(|v| &v.name == name) {
                missing.push((name.clone(), decl.shape.clone()));
            }
        }
    }
    for (name, dims) in missing {
        let volume: usize = dims.iter().product();
        diagnostics.push(
            Diagnostic::warning(format!("zero-filled dummy weight of {} elements", volume))
                .with_subject(name.clone()),
        );
        graph
            .initializers
            .push(Initializer::float(name, dims, vec![0.0; volume]));
    }
    diagnostics
}

/// Compile `model` for `options.target`.
///
/// `dataset` is only read when the target is quantized and no table is
/// supplied or skipped.
pub fn compile(
    model: &Model,
    options: &CompileOptions,
    dataset: Option<&RecordStore>,
    oracle: &dyn ExecutionOracle,
) -> Result<Compiled, CompileError> {
    let calibrating =
        options.target.quantized && options.ctable.is_none() && !options.ignore_calibration;
    if options.dummy_weight && calibrating {
        return Err(CompileError::DummyWeightCalibration);
    }

    let mut diagnostics = Vec::new();
    let mut source = model.graph.clone();
    if options.dummy_weight {
        diagnostics.extend(add_dummy_weights(&mut source));
    }

    let lowered = lower_graph(&source, &LowerRegistry::standard(), options.unsupported)?;
    diagnostics.extend(lowered.diagnostics);
    let floating = lowered.graph;

    let (graph, table, weights) = if !options.target.quantized {
        (floating, None, QuantizedWeightStore::default())
    } else if let Some(table) = &options.ctable {
        let digest = floating.digest();
        if table.model_digest != digest {
            return Err(CompileError::StaleTable {
                expected: digest,
                found: table.model_digest.clone(),
            });
        }
        let out = calibrate::from_table(&floating, table, options.target.multiplier_bits)?;
        diagnostics.extend(out.diagnostics);
        (out.graph, Some(out.table), out.weights)
    } else if options.ignore_calibration {
        if !options.dummy_ctable {
            return Err(CompileError::NoCalibration {
                target: options.target.name.clone(),
            });
        }
        log::info!("calibration skipped; using a placeholder table");
        let table = CalibrationTable::dummy(&floating);
        (floating, Some(table), QuantizedWeightStore::default())
    } else {
        let store = dataset.ok_or_else(|| CompileError::NoCalibration {
            target: options.target.name.clone(),
        })?;
        let out = calibrate::calibrate(&floating, store, oracle, &options.calibration)?;
        diagnostics.extend(out.diagnostics);
        (out.graph, Some(out.table), out.weights)
    };

    let lowering = create_lowering(options.target.march);
    let selection = lowering.select(&graph, table.as_ref())?;
    diagnostics.extend(selection.diagnostics.iter().cloned());

    Ok(Compiled {
        graph,
        table,
        weights,
        selection,
        diagnostics,
    })
}
