use std::path::PathBuf;

use clap::Args;

use calibra::calibrate::{CalibrationConfig, CalibrationTable, ReferenceOracle};
use calibra::diagnostic::render_diagnostics;
use calibra::ir::lower::UnsupportedPolicy;
use calibra::pipeline::{compile, CompileOptions};

use super::{artifact_base, fail, load_model, load_store, resolve_target, with_suffix, write_file, DatasetArgs};

#[derive(Args)]
pub struct BuildArgs {
    /// Input model (JSON interchange graph)
    pub input: PathBuf,
    /// Output path prefix (default: input without extension)
    #[arg(short, long)]
    pub output: Option<PathBuf>,
    /// Target architecture
    #[arg(long, default_value = "bm1880")]
    pub target: String,
    #[command(flatten)]
    pub dataset: DatasetArgs,
    /// Reuse a calibration table instead of calibrating
    #[arg(long, value_name = "PATH")]
    pub import_ctable: Option<PathBuf>,
    /// Skip calibration
    #[arg(long)]
    pub ignore_calibration: bool,
    /// Synthesize a placeholder calibration table (with --ignore-calibration)
    #[arg(long, requires = "ignore_calibration")]
    pub add_dummy_ctable: bool,
    /// Zero-fill weights that have no initializer
    #[arg(long)]
    pub add_dummy_weight: bool,
    /// Skip operators no lowering matches instead of failing
    #[arg(long)]
    pub skip_unsupported: bool,
    /// Print the instruction listing to stdout
    #[arg(short = 'S')]
    pub print_listing: bool,
}

pub fn cmd_build(args: BuildArgs) {
    let model = load_model(&args.input);
    let target = resolve_target(&args.target);

    let ctable = args.import_ctable.as_ref().map(|path| {
        CalibrationTable::load(path).unwrap_or_else(|e| fail(e))
    });
    let dataset = match (&args.dataset.dataset, target.quantized) {
        (Some(path), true) if ctable.is_none() && !args.ignore_calibration => {
            Some(load_store(path))
        }
        _ => None,
    };

    let options = CompileOptions {
        calibration: CalibrationConfig {
            iterations: args.dataset.iterations,
            normalization: args.dataset.normalization(),
            multiplier_bits: target.multiplier_bits,
            ..CalibrationConfig::default()
        },
        target,
        unsupported: if args.skip_unsupported {
            UnsupportedPolicy::Skip
        } else {
            UnsupportedPolicy::Abort
        },
        ctable,
        ignore_calibration: args.ignore_calibration,
        dummy_ctable: args.add_dummy_ctable,
        dummy_weight: args.add_dummy_weight,
    };

    let compiled = match compile(&model, &options, dataset.as_ref(), &ReferenceOracle) {
        Ok(c) => c,
        Err(e) => fail(e),
    };
    render_diagnostics(&compiled.diagnostics);

    let base = artifact_base(&args.input, &args.output);
    let listing = compiled.selection.listing();
    let listing_path = with_suffix(&base, &options.target.output_extension);
    write_file(&listing_path, &listing);
    if let Some(table) = &compiled.table {
        let json = table.to_json().unwrap_or_else(|e| fail(e));
        write_file(&with_suffix(&base, ".ctable.json"), json);
    }
    write_file(&with_suffix(&base, ".weight.bin"), compiled.weight_blob());

    if args.print_listing {
        print!("{}", listing);
    }
    eprintln!(
        "Compiled {} -> {} ({} instructions for {})",
        args.input.display(),
        listing_path.display(),
        compiled.selection.instructions.len(),
        options.target.display_name
    );
}
