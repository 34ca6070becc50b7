use std::env;
use std::time::Duration;

use criterion::measurement::WallTime;
use criterion::{BenchmarkGroup, BenchmarkId, Criterion, SamplingMode, Throughput};
use tracing::warn;

use crate::config::bytes_for;
use crate::{
    BackendKind, CASE_NAME, CopyBackend, DuplexCase, DuplexConfig, SampleTotals, case_label,
    skip_reason,
};

/// Registers the duplex copy case with Criterion, once per configured size, executing the copies
/// on the given backend.
///
/// The time reported to Criterion is the sum of the per-iteration longest spans measured by the
/// backend's events, not the wall clock time of the benchmark loop.
pub fn execute_runs<B: CopyBackend>(c: &mut Criterion, config: &DuplexConfig, backend: B) {
    let mut g = c.benchmark_group(CASE_NAME);

    // Copies of large buffers are slow; flat sampling keeps the iteration count manageable.
    g.sampling_mode(SamplingMode::Flat);

    let mut case = DuplexCase::new(backend, config.numa_id());

    for exponent in config.sizes().exponents() {
        execute_run(&mut g, &mut case, exponent);
    }

    g.finish();
}

/// Registers the duplex copy case with Criterion on the backend selected by the configuration.
///
/// If that backend is not included in this build, nothing is registered.
pub fn execute_configured_runs(c: &mut Criterion, config: &DuplexConfig) {
    match config.backend() {
        BackendKind::Host => execute_runs(c, config, config.host_backend()),
        #[cfg(feature = "cuda")]
        BackendKind::Cuda => execute_runs(c, config, config.cuda_backend()),
        #[cfg(not(feature = "cuda"))]
        BackendKind::Cuda => {
            if !is_fake_run() {
                eprintln!("Skipping {CASE_NAME} - the cuda backend is not included in this build.");
            }
        }
    }
}

/// In some execution modes, we are only executing to list the benchmarks or to perform a dummy
/// run of a single iteration to test that it works. In these cases, we do not want to emit any
/// additional output to stderr because it will confuse the test runner.
fn is_fake_run() -> bool {
    // --test is used by cargo test
    // --exact is used by nextest
    // --list is used by both
    env::args().any(|a| a == "--test" || a == "--list" || a == "--exact")
}

/// When only listing the benchmarks, nothing is measured, so no buffers are allocated.
fn is_listing() -> bool {
    env::args().any(|a| a == "--list")
}

fn execute_run<B: CopyBackend>(
    g: &mut BenchmarkGroup<'_, WallTime>,
    case: &mut DuplexCase<B>,
    exponent: u32,
) {
    let label = case_label(exponent);

    let listing = is_listing();

    let prepared = bytes_for(exponent).and_then(|bytes| {
        let host = if listing {
            case.check_preconditions()?
        } else {
            case.setup(bytes)?
        };

        Ok((bytes, host))
    });

    let (bytes, host) = match prepared {
        Ok(prepared) => prepared,
        Err(e) => {
            warn!(exponent, reason = %e, "size skipped");

            if !is_fake_run() {
                // Be silent if it is a fake run, to avoid confusing the test runner.
                eprintln!("Skipping {label} - {}.", skip_reason(&e));
            }

            return;
        }
    };

    // Writing to stderr during listing/testing leads to test runner errors because it expects
    // a special protocol to be spoken, so we only emit this debug output during actual execution.
    if !is_fake_run() {
        eprintln!(
            "{label} reference selection: host memory region {} ({})",
            host.id(),
            host.describe()
        );
    }

    let mut totals = SampleTotals::default();

    g.throughput(Throughput::Bytes((bytes as u64).saturating_mul(2)));

    g.bench_function(BenchmarkId::from_parameter(exponent), |b| {
        b.iter_custom(|iters| {
            if !case.is_prepared() {
                case.setup(bytes)
                    .unwrap_or_else(|e| panic!("{} during setup", skip_reason(&e)));
            }

            let samples = case
                .run_iterations(iters)
                .unwrap_or_else(|e| panic!("{} during measurement", skip_reason(&e)));

            samples.iter().fold(Duration::ZERO, |total, sample| {
                totals.add(sample);

                total
                    .checked_add(sample.duration())
                    .expect("duration overflow is unfathomable within our spacetime boundaries")
            })
        });
    });

    case.teardown();

    if !is_fake_run() {
        let counters = totals.counters(bytes as u64);

        eprintln!(
            "{label} counters: bytes={} start_spread={:.3}ms stop_spread={:.3}ms over {} iterations",
            counters.bytes,
            counters.start_spread_ms,
            counters.stop_spread_ms,
            totals.iterations()
        );
    }
}
