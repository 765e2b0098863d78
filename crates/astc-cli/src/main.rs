//! ASTC launcher CLI
//!
//! Thin wrapper over the launcher flow: parse arguments, run, exit with
//! the contract codes (0 success, 1 usage, 2 module load, 3 parse,
//! 4 compile, 5 trap; a clean HALT's low byte otherwise).

mod launcher;
mod output;

use std::path::PathBuf;

use clap::Parser;

use launcher::{launch, LaunchOptions};
use output::Output;

#[derive(Parser)]
#[command(name = "astc")]
#[command(about = "Run an ASTC program on the native VM stack")]
#[command(version)]
struct Cli {
    /// ASTC program path
    program: PathBuf,

    /// Load this VM module instead of resolving by filename convention
    #[arg(long)]
    vm_module: Option<PathBuf>,

    /// Extra module search directory (repeatable, highest priority first)
    #[arg(long = "module-path")]
    module_paths: Vec<PathBuf>,

    /// Print diagnostic lines while launching
    #[arg(short, long)]
    verbose: bool,

    /// Alias for --verbose
    #[arg(long)]
    debug: bool,

    /// Run on the reference interpreter instead of the JIT
    #[arg(long)]
    interpret: bool,

    /// Disable optimization passes (naive emission, for debugging)
    #[arg(long)]
    no_optimize: bool,
}

fn main() {
    let cli = Cli::parse();
    let verbose = cli.verbose || cli.debug;
    let mut out = Output::new(verbose);
    let options = LaunchOptions {
        program: cli.program,
        vm_module: cli.vm_module,
        module_paths: cli.module_paths,
        interpret: cli.interpret,
        optimize: !cli.no_optimize,
    };
    std::process::exit(launch(&options, &mut out));
}
