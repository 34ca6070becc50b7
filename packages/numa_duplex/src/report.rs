use std::fmt;
use std::time::Duration;

use crate::{CASE_NAME, Error, IterationSample};

/// Renders the name of one registered size of the case.
///
/// For example, `DUPLEX/Memcpy/PinnedToGPU/log2(N):20`.
#[must_use]
pub fn case_label(exponent: u32) -> String {
    format!("{CASE_NAME}/log2(N):{exponent}")
}

/// Per-iteration averages of the spread counters, in milliseconds.
///
/// Every iteration contributes its own start and stop spread to the mean. Harnesses that report
/// twice the last iteration's spread divided by the iteration count produce different numbers for
/// the same run; compare against those with care.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
#[non_exhaustive]
pub struct Counters {
    /// Number of bytes copied in each direction per iteration.
    pub bytes: u64,

    /// Mean skew between the start events of the two copies.
    pub start_spread_ms: f64,

    /// Mean skew between the stop events of the two copies.
    pub stop_spread_ms: f64,
}

/// Accumulates iteration samples into running totals, without keeping the samples themselves.
///
/// The Criterion integration uses this to report the spread counters over all iterations
/// Criterion decided to execute.
#[derive(Clone, Copy, Debug, Default)]
pub struct SampleTotals {
    iterations: u64,
    total_ms: f64,
    start_spread_ms: f64,
    stop_spread_ms: f64,
}

impl SampleTotals {
    /// Adds one iteration to the totals.
    pub fn add(&mut self, sample: &IterationSample) {
        self.iterations = self.iterations.saturating_add(1);
        self.total_ms += f64::from(sample.longest_ms());
        self.start_spread_ms += f64::from(sample.start_spread_ms());
        self.stop_spread_ms += f64::from(sample.stop_spread_ms());
    }

    /// Number of iterations added so far.
    #[must_use]
    pub fn iterations(&self) -> u64 {
        self.iterations
    }

    /// Sum of the iteration times added so far.
    #[must_use]
    pub fn total_time(&self) -> Duration {
        Duration::try_from_secs_f64(self.total_ms / 1000.0).unwrap_or(Duration::ZERO)
    }

    /// The counters for copies of `bytes` in each direction, averaged over the iterations.
    #[must_use]
    pub fn counters(&self, bytes: u64) -> Counters {
        Counters {
            bytes,
            start_spread_ms: self.mean(self.start_spread_ms),
            stop_spread_ms: self.mean(self.stop_spread_ms),
        }
    }

    #[expect(
        clippy::cast_precision_loss,
        reason = "iteration counts are far below the point where f64 loses integer precision"
    )]
    fn mean(&self, total: f64) -> f64 {
        if self.iterations == 0 {
            0.0
        } else {
            total / self.iterations as f64
        }
    }
}

impl<'a> FromIterator<&'a IterationSample> for SampleTotals {
    fn from_iter<T: IntoIterator<Item = &'a IterationSample>>(iter: T) -> Self {
        let mut totals = Self::default();

        for sample in iter {
            totals.add(sample);
        }

        totals
    }
}

/// The result of running the duplex copy case for one buffer size.
#[derive(Clone, Debug)]
pub struct CaseReport {
    bytes: usize,
    samples: Vec<IterationSample>,
}

impl CaseReport {
    /// Creates a report for copies of `bytes` in each direction.
    #[must_use]
    pub fn new(bytes: usize, samples: Vec<IterationSample>) -> Self {
        Self { bytes, samples }
    }

    /// Number of bytes copied in each direction per iteration.
    #[must_use]
    pub fn bytes(&self) -> usize {
        self.bytes
    }

    /// Number of iterations executed.
    #[must_use]
    pub fn iterations(&self) -> u64 {
        self.samples.len() as u64
    }

    /// The timing data of each iteration.
    #[must_use]
    pub fn samples(&self) -> &[IterationSample] {
        &self.samples
    }

    /// The manual time of each iteration: the longest start-to-stop span.
    pub fn iteration_times(&self) -> impl Iterator<Item = Duration> + '_ {
        self.samples.iter().map(IterationSample::duration)
    }

    /// Sum of all iteration times.
    #[must_use]
    pub fn total_time(&self) -> Duration {
        self.totals().total_time()
    }

    /// Total bytes moved over all iterations, counting both directions.
    #[must_use]
    pub fn bytes_processed(&self) -> u64 {
        self.iterations()
            .saturating_mul(self.bytes as u64)
            .saturating_mul(2)
    }

    /// The `bytes`, `start_spread` and `stop_spread` counters.
    #[must_use]
    pub fn counters(&self) -> Counters {
        self.totals().counters(self.bytes as u64)
    }

    /// Bytes moved per second of manual time, counting both directions.
    #[must_use]
    #[expect(
        clippy::cast_precision_loss,
        reason = "bandwidth is an approximate figure for humans"
    )]
    pub fn bandwidth_bytes_per_sec(&self) -> f64 {
        let seconds = self.total_time().as_secs_f64();

        if seconds > 0.0 {
            self.bytes_processed() as f64 / seconds
        } else {
            0.0
        }
    }

    fn totals(&self) -> SampleTotals {
        self.samples.iter().collect()
    }

    #[expect(
        clippy::cast_precision_loss,
        reason = "mean time is an approximate figure for humans"
    )]
    fn mean_time_ms(&self) -> f64 {
        match self.iterations() {
            0 => 0.0,
            n => self.total_time().as_secs_f64() * 1000.0 / n as f64,
        }
    }
}

const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

impl fmt::Display for CaseReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let counters = self.counters();
        let label = case_label(self.bytes.checked_ilog2().unwrap_or(0));

        write!(
            f,
            "{label:<48} {time:>12.3} ms {iterations:>8} bytes={bytes} start_spread={start:.3} stop_spread={stop:.3} {bandwidth:.3}GiB/s",
            time = self.mean_time_ms(),
            iterations = self.iterations(),
            bytes = counters.bytes,
            start = counters.start_spread_ms,
            stop = counters.stop_spread_ms,
            bandwidth = self.bandwidth_bytes_per_sec() / GIB,
        )
    }
}

/// A buffer size for which the case could not be executed.
#[derive(Debug)]
pub struct SkippedCase {
    exponent: u32,
    reason: Error,
}

impl SkippedCase {
    /// Creates a skip record for the given log2 size.
    #[must_use]
    pub fn new(exponent: u32, reason: Error) -> Self {
        Self { exponent, reason }
    }

    /// The log2 size that was skipped.
    #[must_use]
    pub fn exponent(&self) -> u32 {
        self.exponent
    }

    /// The error that caused the skip.
    #[must_use]
    pub fn reason(&self) -> &Error {
        &self.reason
    }
}

impl fmt::Display for SkippedCase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{label:<48} ERROR OCCURRED: '{CASE_NAME} {reason}'",
            label = case_label(self.exponent),
            reason = self.reason,
        )
    }
}

/// What happened when the case was run for one buffer size.
#[derive(Debug)]
#[non_exhaustive]
pub enum SizeOutcome {
    /// The case executed all iterations.
    Completed(CaseReport),

    /// The case was skipped.
    Skipped(SkippedCase),
}

impl SizeOutcome {
    /// Whether the case executed all iterations.
    #[must_use]
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed(_))
    }
}

impl fmt::Display for SizeOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Completed(report) => report.fmt(f),
            Self::Skipped(skipped) => skipped.fmt(f),
        }
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::Operation;

    fn report() -> CaseReport {
        CaseReport::new(
            1024,
            vec![
                IterationSample::new(2.0, 0.5, 1.0),
                IterationSample::new(4.0, 1.5, 3.0),
            ],
        )
    }

    #[test]
    fn bytes_processed_counts_both_directions() {
        assert_eq!(report().bytes_processed(), 2 * 1024 * 2);
    }

    #[test]
    fn counters_are_per_iteration_means() {
        let counters = report().counters();

        assert_eq!(counters.bytes, 1024);
        assert!((counters.start_spread_ms - 1.0).abs() < 1e-9);
        assert!((counters.stop_spread_ms - 2.0).abs() < 1e-9);
    }

    #[test]
    fn total_time_is_sum_of_longest_spans() {
        let report = report();

        assert!((report.total_time().as_secs_f64() - 0.006).abs() < 1e-9);
        assert_eq!(report.iteration_times().count(), 2);
    }

    #[test]
    fn bandwidth_uses_manual_time() {
        // 4096 bytes in 6 ms.
        let expected = 4096.0 / 0.006;

        assert!((report().bandwidth_bytes_per_sec() - expected).abs() < 1e-3);
    }

    #[test]
    fn empty_report_has_zero_rates() {
        let report = CaseReport::new(1024, Vec::new());

        assert_eq!(report.iterations(), 0);
        assert_eq!(report.bytes_processed(), 0);
        assert!(report.bandwidth_bytes_per_sec().abs() < f64::EPSILON);
        assert_eq!(report.counters(), Counters { bytes: 1024, ..Counters::default() });
    }

    #[test]
    fn display_names_case_and_counters() {
        let line = report().to_string();

        assert!(line.starts_with("DUPLEX/Memcpy/PinnedToGPU/log2(N):10"));
        assert!(line.contains("bytes=1024"));
        assert!(line.contains("start_spread=1.000"));
        assert!(line.contains("stop_spread=2.000"));
    }

    #[test]
    fn skipped_display_carries_reason() {
        let skipped = SkippedCase::new(
            12,
            Error::backend(Operation::Synchronize, "launch timed out"),
        );

        let line = skipped.to_string();

        assert!(line.starts_with("DUPLEX/Memcpy/PinnedToGPU/log2(N):12"));
        assert!(line.contains(
            "'DUPLEX/Memcpy/PinnedToGPU failed to synchronize: launch timed out'"
        ));
    }

    #[test]
    fn totals_from_iterator_matches_incremental() {
        let samples = report().samples().to_vec();

        let collected: SampleTotals = samples.iter().collect();
        let mut incremental = SampleTotals::default();
        for sample in &samples {
            incremental.add(sample);
        }

        assert_eq!(collected.iterations(), incremental.iterations());
        assert_eq!(collected.counters(1), incremental.counters(1));
    }
}
