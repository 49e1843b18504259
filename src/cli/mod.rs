pub mod build;
pub mod calibrate;
pub mod lower;

use std::path::{Path, PathBuf};
use std::process;

use clap::Args;

use calibra::calibrate::{Normalization, RecordStore};
use calibra::config::TargetConfig;
use calibra::onnx::Model;

/// Dataset options shared by `build` and `calibrate`.
#[derive(Args)]
pub struct DatasetArgs {
    /// Calibration record store (rkyv archive)
    #[arg(long, value_name = "PATH")]
    pub dataset: Option<PathBuf>,
    /// Number of dataset batches to profile
    #[arg(long, default_value_t = 1)]
    pub iterations: usize,
    /// Divide raw pixels by this value
    #[arg(long, default_value_t = 256.0, conflicts_with = "mean")]
    pub divisor: f32,
    /// Subtract a per-channel mean instead (comma separated)
    #[arg(long, value_delimiter = ',', value_name = "M0,M1,..")]
    pub mean: Option<Vec<f32>>,
}

impl DatasetArgs {
    pub fn normalization(&self) -> Normalization {
        match &self.mean {
            Some(mean) => Normalization::MeanSubtract { mean: mean.clone() },
            None => Normalization::Scale {
                divisor: self.divisor,
            },
        }
    }
}

pub fn fail(message: impl std::fmt::Display) -> ! {
    eprintln!("error: {}", message);
    process::exit(1);
}

pub fn load_model(path: &Path) -> Model {
    let text = match std::fs::read_to_string(path) {
        Ok(t) => t,
        Err(e) => fail(format!("cannot read '{}': {}", path.display(), e)),
    };
    match Model::from_json(&text) {
        Ok(m) => m,
        Err(e) => fail(format!("cannot parse model '{}': {}", path.display(), e)),
    }
}

pub fn load_store(path: &Path) -> RecordStore {
    match RecordStore::open(path) {
        Ok(store) => {
            log::info!("opened {} records from '{}'", store.len(), path.display());
            store
        }
        Err(e) => fail(e),
    }
}

pub fn resolve_target(name: &str) -> TargetConfig {
    match TargetConfig::resolve(name) {
        Ok(t) => t,
        Err(e) => fail(e),
    }
}

/// `<input stem><suffix>` next to the input, unless `output` is given.
pub fn artifact_base(input: &Path, output: &Option<PathBuf>) -> PathBuf {
    match output {
        Some(o) => o.clone(),
        None => input.with_extension(""),
    }
}

pub fn with_suffix(base: &Path, suffix: &str) -> PathBuf {
    let mut name = base.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

pub fn write_file(path: &Path, contents: impl AsRef<[u8]>) {
    if let Err(e) = std::fs::write(path, contents) {
        fail(format!("cannot write '{}': {}", path.display(), e));
    }
}
