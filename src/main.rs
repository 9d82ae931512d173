/// Affine profiler CLI (affine-prof)
/// Replays a recorded instrumentation trace through the affinity profiler and
/// writes the context dump and locality graph.

use affine_prof::{replay, Profiler, ProfilerConfig};
use clap::Parser;
use miette::{miette, IntoDiagnostic, Result};
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "affine-prof",
    version = "0.1.0",
    about = "Object-affinity heap profiler",
    long_about = "affine-prof — replay an instrumentation event trace, correlate heap \
                  accesses by allocation context, and emit a locality graph."
)]
struct Cli {
    /// Recorded instrumentation event trace to replay
    trace: PathBuf,

    /// Maximum affinity distance in bytes (power of two)
    #[arg(long = "affinity-distance", default_value_t = 1024)]
    affinity_distance: i32,

    /// Maximum size of co-allocatable objects
    #[arg(long = "max-object-size", default_value_t = 4096)]
    max_object_size: i32,

    /// Maximum stack depth kept in chain snapshots (0 = unlimited)
    #[arg(long = "max-stack-depth", default_value_t = 0)]
    max_stack_depth: usize,

    /// Contexts output filename
    #[arg(long = "contexts-output", default_value = "contexts.txt")]
    contexts_output: PathBuf,

    /// TGF output filename
    #[arg(long = "tgf-output", default_value = "locality.tgf")]
    tgf_output: PathBuf,

    /// Dynamic instruction count limit (0 = unlimited)
    #[arg(long = "instruction-limit", default_value_t = 0)]
    instruction_limit: u64,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = ProfilerConfig {
        affinity_distance: cli.affinity_distance,
        max_object_size: cli.max_object_size,
        max_stack_depth: cli.max_stack_depth,
        instruction_limit: cli.instruction_limit,
    };

    let contexts_out = File::create(&cli.contexts_output)
        .map_err(|e| miette!("Cannot create '{}': {}", cli.contexts_output.display(), e))?;

    let mut profiler = match Profiler::new(config, Box::new(BufWriter::new(contexts_out))) {
        Ok(profiler) => profiler,
        Err(e) => {
            eprintln!("ERROR: {}", e);
            std::process::exit(1);
        }
    };

    let trace = File::open(&cli.trace)
        .map_err(|e| miette!("Cannot read '{}': {}", cli.trace.display(), e))?;

    let tgf_out = File::create(&cli.tgf_output)
        .map_err(|e| miette!("Cannot create '{}': {}", cli.tgf_output.display(), e))?;
    let mut tgf = BufWriter::new(tgf_out);

    let code = replay::run(&mut profiler, BufReader::new(trace), &mut tgf)
        .map_err(|e| miette!("Trace replay failed: {}", e))?;

    tgf.flush().into_diagnostic()?;

    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}
