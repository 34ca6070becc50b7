use std::num::NonZero;

use many_cpus::MemoryRegionId;
use tracing::debug;

use crate::{CaseReport, CopyBackend, Direction, Error, HostRegion, IterationSample, Result};

/// The name under which the duplex copy case is reported.
pub const CASE_NAME: &str = "DUPLEX/Memcpy/PinnedToGPU";

/// The duplex copy case: two concurrent copies in opposite directions between host memory in a
/// specific memory region and a copy device, timed by events recorded around each copy.
///
/// The case owns its backend. Every buffer the backend allocates for a size is released before
/// [`run()`][Self::run] returns, whether the case completed or not.
///
/// # Example
///
/// ```no_run
/// use new_zealand::nz;
/// use numa_duplex::{DuplexCase, HostBackend};
///
/// let mut case = DuplexCase::new(HostBackend::new(1, true), 0);
///
/// match case.run(1 << 20, nz!(10)) {
///     Ok(report) => println!("{report}"),
///     Err(e) => eprintln!("skipped: {e}"),
/// }
/// ```
#[derive(Debug)]
pub struct DuplexCase<B: CopyBackend> {
    backend: B,
    numa_id: MemoryRegionId,

    /// Size of the prepared buffers, if the backend is currently prepared.
    prepared_bytes: Option<usize>,
}

impl<B: CopyBackend> DuplexCase<B> {
    /// Creates a case that places its host buffers in memory region `numa_id`.
    #[must_use]
    pub fn new(backend: B, numa_id: MemoryRegionId) -> Self {
        Self {
            backend,
            numa_id,
            prepared_bytes: None,
        }
    }

    /// The memory region that holds the host buffers.
    #[must_use]
    pub fn numa_id(&self) -> MemoryRegionId {
        self.numa_id
    }

    /// The copy backend.
    #[must_use]
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Whether buffers are currently allocated.
    #[must_use]
    pub fn is_prepared(&self) -> bool {
        self.prepared_bytes.is_some()
    }

    /// Checks that the copy device is present and that host memory can be placed in the
    /// requested memory region, without touching the device.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoDevice`] if the copy device is not present or
    /// [`Error::NumaUnavailable`] if host memory cannot be placed in the requested memory region.
    pub fn check_preconditions(&self) -> Result<HostRegion> {
        if !self.backend.is_available() {
            return Err(Error::NoDevice);
        }

        HostRegion::resolve(self.numa_id)
    }

    /// Checks the preconditions of the case, resets the device and allocates streams, events
    /// and buffers for copies of `bytes` in each direction.
    ///
    /// Any previously prepared state is released first. If this fails, nothing stays allocated.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoDevice`] if the copy device is not present,
    /// [`Error::NumaUnavailable`] if host memory cannot be placed in the requested memory region,
    /// or the error of the backend step that failed.
    pub fn setup(&mut self, bytes: usize) -> Result<HostRegion> {
        self.teardown();

        let host = self.check_preconditions()?;

        let prepared = self
            .backend
            .reset_device()
            .and_then(|()| self.backend.prepare(&host, bytes));

        if let Err(e) = prepared {
            self.backend.release();
            return Err(e);
        }

        debug!(bytes, numa_id = self.numa_id, "duplex copy case prepared");
        self.prepared_bytes = Some(bytes);

        Ok(host)
    }

    /// Executes `iterations` timed iterations against the prepared backend.
    ///
    /// Each iteration launches the host-to-device copy and then the device-to-host copy without
    /// waiting in between, then waits for both to complete and measures their events.
    ///
    /// Buffers stay allocated afterwards, so this can be called repeatedly after one
    /// [`setup()`][Self::setup].
    ///
    /// # Errors
    ///
    /// Returns the error of the backend step that failed. The backend stays prepared; call
    /// [`teardown()`][Self::teardown] to release it.
    ///
    /// # Panics
    ///
    /// Panics if the case has not been set up.
    pub fn run_iterations(&mut self, iterations: u64) -> Result<Vec<IterationSample>> {
        assert!(
            self.is_prepared(),
            "setup() must succeed before iterations can be executed"
        );

        (0..iterations).map(|_| self.run_iteration()).collect()
    }

    fn run_iteration(&mut self) -> Result<IterationSample> {
        for direction in Direction::ALL {
            self.backend.launch(direction)?;
        }

        for direction in Direction::ALL {
            self.backend.synchronize(direction)?;
        }

        IterationSample::measure(&self.backend)
    }

    /// Releases everything the backend allocated for the case. No-op if nothing is allocated.
    pub fn teardown(&mut self) {
        if self.prepared_bytes.take().is_some() {
            debug!(numa_id = self.numa_id, "duplex copy case released");
        }

        self.backend.release();
    }

    /// Executes the case for copies of `bytes` in each direction.
    ///
    /// # Errors
    ///
    /// Returns the first error that occurred. The case is considered skipped in that case and
    /// no partial results are reported.
    pub fn run(&mut self, bytes: usize, iterations: NonZero<u64>) -> Result<CaseReport> {
        let result = self
            .setup(bytes)
            .and_then(|_| self.run_iterations(iterations.get()));

        self.teardown();

        Ok(CaseReport::new(bytes, result?))
    }
}

/// The reason reported for a case that could not be executed.
#[must_use]
pub fn skip_reason(error: &Error) -> String {
    format!("{CASE_NAME} {error}")
}
