//! Quantization-aware ahead-of-time compiler for int8 neural accelerators.
//!
//! Three stages run in sequence over a model:
//!
//! 1. `ir::lower` turns interchange-format nodes into a handle-addressed
//!    compute graph.
//! 2. `calibrate` profiles the graph on a sample dataset, picks per-tensor
//!    clipping thresholds, derives fixed-point scales, requantizes weights
//!    and emits the calibration table.
//! 3. `isel` turns the graph plus the table into target instructions.
//!
//! `pipeline::compile` chains them.

pub mod calibrate;
pub mod config;
pub mod diagnostic;
pub mod ir;
pub mod isel;
pub mod onnx;
pub mod pipeline;

pub use calibrate::{calibrate, CalibrationConfig, CalibrationError, CalibrationTable};
pub use config::{March, TargetConfig};
pub use diagnostic::Diagnostic;
pub use ir::ComputeGraph;
pub use pipeline::{compile, CompileError, CompileOptions, Compiled};
