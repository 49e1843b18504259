//! The calibration table: ordered per-layer quantization records.

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::ir::{ComputeGraph, LayerClass};

use super::error::CalibrationError;

/// Quantization record of one layer output.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BlobParameter {
    pub name: String,
    pub threshold_y: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub right_shift: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub multiplier: Option<i32>,
}

impl BlobParameter {
    pub fn threshold(name: impl Into<String>, threshold_y: f32) -> Self {
        Self {
            name: name.into(),
            threshold_y,
            right_shift: None,
            multiplier: None,
        }
    }
}

/// All records of one layer, named after its first output.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LayerCalibrationParameter {
    pub name: String,
    pub blobs: Vec<BlobParameter>,
    /// Per-input integer ratios of element-wise layers.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub threshold_x_quantized: Vec<i32>,
}

impl LayerCalibrationParameter {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            blobs: Vec::new(),
            threshold_x_quantized: Vec::new(),
        }
    }

    /// Record of the layer's primary output.
    pub fn output(&self) -> Option<&BlobParameter> {
        self.blobs.first()
    }
}

/// Ordered per-layer records: the data input first, then one per operator
/// in execution order.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CalibrationTable {
    /// Structural digest of the graph the table was derived from.
    pub model_digest: String,
    pub layers: Vec<LayerCalibrationParameter>,
}

impl CalibrationTable {
    pub fn layer(&self, name: &str) -> Option<&LayerCalibrationParameter> {
        self.layers.iter().find(|l| l.name == name)
    }

    /// Record of the tensor `name`, whichever layer produced it.
    pub fn blob(&self, name: &str) -> Option<&BlobParameter> {
        self.layers
            .iter()
            .flat_map(|l| l.blobs.iter())
            .find(|b| b.name == name)
    }

    /// Placeholder table for running without calibration: unit thresholds
    /// and identity scales.
    pub fn dummy(graph: &ComputeGraph) -> Self {
        let mut layers = Vec::with_capacity(graph.ops().len() + 1);
        if let Ok(input) = graph.data_input() {
            let name = graph.name_of(input);
            let mut data = LayerCalibrationParameter::new(name);
            data.blobs.push(BlobParameter::threshold(name, 1.0));
            layers.push(data);
        }
        for op in graph.ops() {
            let mut layer = LayerCalibrationParameter::new(graph.layer_name(op.id));
            for &out in &op.outputs {
                layer.blobs.push(BlobParameter::threshold(graph.name_of(out), 1.0));
            }
            if let Some(primary) = layer.blobs.first_mut() {
                match op.kind.class() {
                    LayerClass::Weighted => primary.right_shift = Some(0),
                    LayerClass::Pool => {
                        primary.right_shift = Some(0);
                        primary.multiplier = Some(1);
                    }
                    LayerClass::Eltwise => {
                        primary.right_shift = Some(0);
                        layer.threshold_x_quantized = vec![1; op.inputs.len()];
                    }
                    _ => {}
                }
            }
            layers.push(layer);
        }
        Self {
            model_digest: graph.digest(),
            layers,
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn save(&self, path: &Path) -> Result<(), CalibrationError> {
        let err = |reason: String| CalibrationError::Table {
            path: path.display().to_string(),
            reason,
        };
        let json = self.to_json().map_err(|e| err(e.to_string()))?;
        std::fs::write(path, json).map_err(|e| err(e.to_string()))
    }

    pub fn load(path: &Path) -> Result<Self, CalibrationError> {
        let err = |reason: String| CalibrationError::Table {
            path: path.display().to_string(),
            reason,
        };
        let text = std::fs::read_to_string(path).map_err(|e| err(e.to_string()))?;
        Self::from_json(&text).map_err(|e| err(e.to_string()))
    }
}

/// Text rendering for inspection.
impl fmt::Display for CalibrationTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for layer in &self.layers {
            writeln!(f, "layer {{")?;
            writeln!(f, "  name: \"{}\"", layer.name)?;
            for blob in &layer.blobs {
                writeln!(f, "  blob_param {{")?;
                writeln!(f, "    name: \"{}\"", blob.name)?;
                writeln!(f, "    threshold_y: {}", blob.threshold_y)?;
                if let Some(rs) = blob.right_shift {
                    writeln!(f, "    right_shift: {}", rs)?;
                }
                if let Some(m) = blob.multiplier {
                    writeln!(f, "    multiplier: {}", m)?;
                }
                writeln!(f, "  }}")?;
            }
            for q in &layer.threshold_x_quantized {
                writeln!(f, "  threshold_x_quantized: {}", q)?;
            }
            writeln!(f, "}}")?;
        }
        Ok(())
    }
}
