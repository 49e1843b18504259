use thiserror::Error;

use crate::ir::GraphError;

/// Failures reading the calibration dataset.
#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("cannot read record store '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("record store '{path}' is corrupt: {reason}")]
    Corrupt { path: String, reason: String },
    #[error("record store exhausted after {read} of {wanted} records")]
    Exhausted { read: usize, wanted: usize },
    #[error("input '{input}' must be 4-D (NCHW), found shape {shape:?}")]
    Rank { input: String, shape: Vec<usize> },
    #[error("record '{key}' has {found} channels, input '{input}' expects {expected}")]
    Channels {
        key: String,
        input: String,
        expected: usize,
        found: usize,
    },
    #[error("record '{key}' is {height}x{width}, smaller than the {crop_h}x{crop_w} crop")]
    TooSmall {
        key: String,
        height: usize,
        width: usize,
        crop_h: usize,
        crop_w: usize,
    },
    #[error("input '{input}' declares {declared} elements but the loaded batch has {loaded}")]
    VolumeMismatch {
        input: String,
        declared: usize,
        loaded: usize,
    },
}

/// Failures of the execution oracle.
#[derive(Debug, Error, PartialEq)]
pub enum OracleError {
    #[error("operator '{layer}': no activation for input '{tensor}'")]
    MissingInput { layer: String, tensor: String },
    #[error("operator '{layer}' ({kind}) cannot be executed by this oracle")]
    Unsupported { layer: String, kind: String },
    #[error("operator '{layer}': {reason}")]
    Shape { layer: String, reason: String },
}

/// Infeasible fixed-point quantization.
#[derive(Debug, Error, PartialEq)]
pub enum ScaleError {
    #[error("threshold {value} of '{tensor}' is not a positive finite number")]
    Threshold { tensor: String, value: f32 },
    #[error("maximum scaled magnitude {max} of '{tensor}' is outside (0, 128)")]
    Range { tensor: String, max: f32 },
    #[error("multiplier {multiplier} for '{tensor}' exceeds the signed {bits}-bit range")]
    Multiplier {
        tensor: String,
        multiplier: i64,
        bits: u32,
    },
    #[error("right shift for '{tensor}' would exceed {max}")]
    Shift { tensor: String, max: u32 },
}

/// Fatal conditions of one calibration run.
#[derive(Debug, Error)]
pub enum CalibrationError {
    #[error(transparent)]
    Dataset(#[from] DatasetError),
    #[error(transparent)]
    Oracle(#[from] OracleError),
    #[error(transparent)]
    Scale(#[from] ScaleError),
    #[error(transparent)]
    Graph(#[from] GraphError),
    #[error("calibration needs at least one iteration")]
    NoIterations,
    #[error("layer '{layer}': weight '{tensor}' has no constant data")]
    NonConstantWeight { layer: String, tensor: String },
    #[error("no threshold for tensor '{tensor}'")]
    MissingThreshold { tensor: String },
    #[error(
        "cannot fold threshold of '{output}' into '{input}': '{input}' has {consumers} consumers"
    )]
    SharedFoldInput {
        output: String,
        input: String,
        consumers: usize,
    },
    #[error("quantized '{tensor}' has {quantized} elements, source has {source_len}")]
    ElementCount {
        tensor: String,
        source_len: usize,
        quantized: usize,
    },
    #[error("calibration table '{path}': {reason}")]
    Table { path: String, reason: String },
}
