use std::path::PathBuf;

use clap::Args;

use calibra::calibrate::{calibrate, CalibrationConfig, ReferenceOracle};
use calibra::diagnostic::render_diagnostics;
use calibra::ir::lower::{lower_graph, LowerRegistry, UnsupportedPolicy};

use super::{artifact_base, fail, load_model, load_store, resolve_target, with_suffix, DatasetArgs};

#[derive(Args)]
pub struct CalibrateArgs {
    /// Input model (JSON interchange graph)
    pub input: PathBuf,
    /// Output path prefix (default: input without extension)
    #[arg(short, long)]
    pub output: Option<PathBuf>,
    /// Target whose multiplier width to use
    #[arg(long, default_value = "bm1880")]
    pub target: String,
    #[command(flatten)]
    pub dataset: DatasetArgs,
    /// Histogram bins of the threshold search
    #[arg(long, default_value_t = 2048)]
    pub bins: usize,
    /// Also print the table in text form
    #[arg(long)]
    pub text: bool,
}

pub fn cmd_calibrate(args: CalibrateArgs) {
    let Some(dataset) = &args.dataset.dataset else {
        fail("calibrate needs --dataset");
    };
    let target = resolve_target(&args.target);
    let model = load_model(&args.input);
    let store = load_store(dataset);

    let lowered = match lower_graph(
        &model.graph,
        &LowerRegistry::standard(),
        UnsupportedPolicy::Abort,
    ) {
        Ok(l) => l,
        Err(e) => fail(e),
    };
    render_diagnostics(&lowered.diagnostics);

    let config = CalibrationConfig {
        iterations: args.dataset.iterations,
        bins: args.bins,
        normalization: args.dataset.normalization(),
        multiplier_bits: target.multiplier_bits,
        ..CalibrationConfig::default()
    };
    let out = match calibrate(&lowered.graph, &store, &ReferenceOracle, &config) {
        Ok(o) => o,
        Err(e) => fail(e),
    };
    render_diagnostics(&out.diagnostics);

    let path = with_suffix(&artifact_base(&args.input, &args.output), ".ctable.json");
    if let Err(e) = out.table.save(&path) {
        fail(e);
    }
    if args.text {
        print!("{}", out.table);
    }
    eprintln!(
        "Calibrated {} layers -> {}",
        out.table.layers.len(),
        path.display()
    );
}
