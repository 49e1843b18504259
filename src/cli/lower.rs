use std::path::PathBuf;

use clap::Args;

use calibra::diagnostic::render_diagnostics;
use calibra::ir::lower::{lower_graph, LowerRegistry, UnsupportedPolicy};

use super::{fail, load_model};

#[derive(Args)]
pub struct LowerArgs {
    /// Input model (JSON interchange graph)
    pub input: PathBuf,
    /// Skip operators no lowering matches instead of failing
    #[arg(long)]
    pub skip_unsupported: bool,
    /// Print only the structural digest
    #[arg(long)]
    pub digest: bool,
}

pub fn cmd_lower(args: LowerArgs) {
    let model = load_model(&args.input);
    let policy = if args.skip_unsupported {
        UnsupportedPolicy::Skip
    } else {
        UnsupportedPolicy::Abort
    };
    let lowered = match lower_graph(&model.graph, &LowerRegistry::standard(), policy) {
        Ok(l) => l,
        Err(e) => fail(e),
    };
    render_diagnostics(&lowered.diagnostics);
    if args.digest {
        println!("{}", lowered.graph.digest());
    } else {
        print!("{}", lowered.graph);
    }
}
