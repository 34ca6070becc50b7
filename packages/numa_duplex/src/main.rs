#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![cfg_attr(coverage_nightly, coverage(off))]

//! Binary entry point for the duplex copy measurement.
//!
//! This module is excluded from mutation testing because testing process entry/exit behavior
//! is impractical - it requires spawning subprocesses and checking exit codes.

use std::num::NonZero;
use std::process::ExitCode;

use argh::FromArgs;
use many_cpus::MemoryRegionId;
use new_zealand::nz;
use numa_duplex::{BackendKind, DuplexConfig, SizeRange};
use tracing_subscriber::EnvFilter;

/// Measure bidirectional copy throughput between pinned host memory in a memory region and a
/// copy device.
#[derive(FromArgs)]
struct Args {
    /// memory region that holds the host buffers (repeatable, the first one is used)
    #[argh(option)]
    numa_id: Vec<MemoryRegionId>,

    /// device that executes the copies (repeatable, the first one is used)
    #[argh(option)]
    device_id: Vec<u32>,

    /// log2 of the smallest buffer size
    #[argh(option, default = "SizeRange::SMALL.min_exponent()")]
    min_exponent: u32,

    /// log2 of the largest buffer size
    #[argh(option, default = "SizeRange::SMALL.max_exponent()")]
    max_exponent: u32,

    /// timed iterations per buffer size
    #[argh(option, default = "nz!(10)")]
    iterations: NonZero<u64>,

    /// copy engine to use (host, cuda)
    #[argh(option)]
    backend: Option<BackendKind>,

    /// do not lock host buffers in physical memory
    #[argh(switch)]
    no_lock: bool,
}

// Binary entry point - mutations would require subprocess testing which is impractical.
#[cfg_attr(test, mutants::skip)]
fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args: Args = argh::from_env();

    let sizes = match SizeRange::new(args.min_exponent, args.max_exponent) {
        Ok(sizes) => sizes,
        Err(e) => {
            eprintln!("Error: {e}");
            return ExitCode::FAILURE;
        }
    };

    let config = DuplexConfig::new()
        .with_numa_ids(args.numa_id)
        .with_device_ids(args.device_id)
        .with_sizes(sizes)
        .with_iterations(args.iterations)
        .with_lock_host_memory(!args.no_lock)
        .with_backend(args.backend.unwrap_or_default());

    let outcomes = match config.run() {
        Ok(outcomes) => outcomes,
        Err(e) => {
            eprintln!("Error: {e}");
            return ExitCode::FAILURE;
        }
    };

    for outcome in &outcomes {
        println!("{outcome}");
    }

    if outcomes.iter().any(|o| o.is_completed()) {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
