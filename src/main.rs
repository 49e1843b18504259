mod cli;

use clap::{ArgAction, Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "calibra",
    version,
    about = "calibra: quantization-aware compiler for int8 accelerators"
)]
struct Cli {
    /// Increase log verbosity (-v info, -vv debug); RUST_LOG overrides
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Compile a model to target instructions
    Build(cli::build::BuildArgs),
    /// Calibrate a model and write its calibration table
    Calibrate(cli::calibrate::CalibrateArgs),
    /// Lower a model and print the compute graph
    Lower(cli::lower::LowerArgs),
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_timestamp(None)
        .format_target(false)
        .init();
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Command::Build(args) => cli::build::cmd_build(args),
        Command::Calibrate(args) => cli::calibrate::cmd_calibrate(args),
        Command::Lower(args) => cli::lower::cmd_lower(args),
    }
}
