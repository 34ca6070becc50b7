use std::time::Duration;

use itertools::iproduct;

use crate::{CopyBackend, Direction, Edge, Marker, Result};

/// The longest time between any start event and any stop event of the two copies, in
/// milliseconds.
///
/// This is the time from whichever copy started first to whichever copy finished last, which is
/// the duration of the duplex copy as a whole. Negative spans (a stop recorded before a start)
/// never win; the result is at least zero.
///
/// # Errors
///
/// Returns an error if the backend cannot report the elapsed time between two events.
pub fn longest_span<B: CopyBackend + ?Sized>(backend: &B) -> Result<f32> {
    iproduct!(Direction::ALL, Direction::ALL).try_fold(0.0_f32, |longest, (started, stopped)| {
        let span = backend.elapsed_ms(Marker::start(started), Marker::stop(stopped))?;
        Ok(longest.max(span))
    })
}

/// The skew between the two copies' events of the given edge, in milliseconds.
///
/// This is the absolute time difference between the two start events (or the two stop
/// events), obtained by querying both orders and taking the larger one.
///
/// # Errors
///
/// Returns an error if the backend cannot report the elapsed time between two events.
pub fn spread<B: CopyBackend + ?Sized>(backend: &B, edge: Edge) -> Result<f32> {
    let [first, second] = Direction::ALL;

    let forward = backend.elapsed_ms(Marker::new(first, edge), Marker::new(second, edge))?;
    let backward = backend.elapsed_ms(Marker::new(second, edge), Marker::new(first, edge))?;

    Ok(forward.max(backward))
}

/// The timing data of one iteration of the duplex copy case.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct IterationSample {
    longest_ms: f32,
    start_spread_ms: f32,
    stop_spread_ms: f32,
}

impl IterationSample {
    /// Creates a sample from already measured values, in milliseconds.
    #[must_use]
    pub fn new(longest_ms: f32, start_spread_ms: f32, stop_spread_ms: f32) -> Self {
        Self {
            longest_ms,
            start_spread_ms,
            stop_spread_ms,
        }
    }

    /// Measures the events of the most recent iteration. Both copies must have completed.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot report the elapsed time between two events.
    pub fn measure<B: CopyBackend + ?Sized>(backend: &B) -> Result<Self> {
        Ok(Self {
            longest_ms: longest_span(backend)?,
            start_spread_ms: spread(backend, Edge::Start)?,
            stop_spread_ms: spread(backend, Edge::Stop)?,
        })
    }

    /// The longest start-to-stop span of the iteration, in milliseconds.
    #[must_use]
    pub fn longest_ms(&self) -> f32 {
        self.longest_ms
    }

    /// Skew between the start events of the two copies, in milliseconds.
    #[must_use]
    pub fn start_spread_ms(&self) -> f32 {
        self.start_spread_ms
    }

    /// Skew between the stop events of the two copies, in milliseconds.
    #[must_use]
    pub fn stop_spread_ms(&self) -> f32 {
        self.stop_spread_ms
    }

    /// The iteration time: the longest span, as a duration.
    #[must_use]
    pub fn duration(&self) -> Duration {
        Duration::try_from_secs_f64(f64::from(self.longest_ms) / 1000.0).unwrap_or(Duration::ZERO)
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use mockall::predicate::always;

    use super::*;
    use crate::MockCopyBackend;

    /// Event timestamps in milliseconds, in `Direction::ALL` order.
    struct Timeline {
        starts: [f32; 2],
        stops: [f32; 2],
    }

    impl Timeline {
        fn at(&self, marker: Marker) -> f32 {
            let times = match marker.edge() {
                Edge::Start => &self.starts,
                Edge::Stop => &self.stops,
            };

            times[marker.direction().index()]
        }
    }

    fn backend_with(timeline: Timeline) -> MockCopyBackend {
        let mut backend = MockCopyBackend::new();

        backend
            .expect_elapsed_ms()
            .with(always(), always())
            .returning(move |from, to| Ok(timeline.at(to) - timeline.at(from)));

        backend
    }

    #[test]
    fn longest_span_is_first_start_to_last_stop() {
        let backend = backend_with(Timeline {
            starts: [0.0, 0.5],
            stops: [4.0, 3.0],
        });

        assert!((longest_span(&backend).unwrap() - 4.0).abs() < f32::EPSILON);
    }

    #[test]
    fn longest_span_with_second_copy_first() {
        let backend = backend_with(Timeline {
            starts: [2.0, 1.0],
            stops: [3.0, 6.0],
        });

        assert!((longest_span(&backend).unwrap() - 5.0).abs() < f32::EPSILON);
    }

    #[test]
    fn longest_span_is_never_negative() {
        let mut backend = MockCopyBackend::new();
        backend.expect_elapsed_ms().returning(|_, _| Ok(-1.0));

        assert!(longest_span(&backend).unwrap().abs() < f32::EPSILON);
    }

    #[test]
    fn spread_is_absolute_difference() {
        let backend = backend_with(Timeline {
            starts: [1.0, 1.25],
            stops: [9.0, 7.0],
        });

        assert!((spread(&backend, Edge::Start).unwrap() - 0.25).abs() < f32::EPSILON);
        assert!((spread(&backend, Edge::Stop).unwrap() - 2.0).abs() < f32::EPSILON);
    }

    #[test]
    fn elapsed_time_failure_propagates() {
        let mut backend = MockCopyBackend::new();
        backend.expect_elapsed_ms().returning(|_, _| {
            Err(crate::Error::backend(crate::Operation::ElapsedTime, "not ready"))
        });

        let error = longest_span(&backend).unwrap_err();

        assert_eq!(error.operation(), Some(crate::Operation::ElapsedTime));
        assert!(IterationSample::measure(&backend).is_err());
    }

    #[test]
    fn measure_collects_all_three_values() {
        let backend = backend_with(Timeline {
            starts: [0.0, 1.0],
            stops: [10.0, 12.0],
        });

        let sample = IterationSample::measure(&backend).unwrap();

        assert!((sample.longest_ms() - 12.0).abs() < f32::EPSILON);
        assert!((sample.start_spread_ms() - 1.0).abs() < f32::EPSILON);
        assert!((sample.stop_spread_ms() - 2.0).abs() < f32::EPSILON);
    }

    #[test]
    fn duration_is_longest_span() {
        let sample = IterationSample::new(2.5, 0.0, 0.0);

        assert!((sample.duration().as_secs_f64() - 0.0025).abs() < 1e-9);
    }

    #[test]
    fn unrepresentable_duration_is_zero() {
        assert_eq!(IterationSample::new(f32::NAN, 0.0, 0.0).duration(), Duration::ZERO);
        assert_eq!(IterationSample::new(-1.0, 0.0, 0.0).duration(), Duration::ZERO);
    }
}
