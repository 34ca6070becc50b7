use std::num::NonZero;
use std::str::FromStr;

use derive_more::Display;
use many_cpus::MemoryRegionId;
use new_zealand::nz;
use tracing::{info, warn};

use crate::{
    CopyBackend, DuplexCase, Error, HostBackend, Operation, Result, SizeOutcome, SizeRange,
    SkippedCase,
};

/// Which copy engine executes the duplex copies.
#[derive(Clone, Copy, Debug, Display, Eq, Hash, PartialEq)]
#[non_exhaustive]
pub enum BackendKind {
    /// A second memory region of the host plays the role of the device.
    #[display("host")]
    Host,

    /// A CUDA device. Only usable if the package was built with the `cuda` feature.
    #[display("cuda")]
    Cuda,
}

impl BackendKind {
    /// Whether this backend is included in the current build.
    #[must_use]
    pub fn is_built(self) -> bool {
        match self {
            Self::Host => true,
            Self::Cuda => cfg!(feature = "cuda"),
        }
    }
}

impl Default for BackendKind {
    fn default() -> Self {
        if cfg!(feature = "cuda") {
            Self::Cuda
        } else {
            Self::Host
        }
    }
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "host" => Ok(Self::Host),
            "cuda" => Ok(Self::Cuda),
            _ => Err(format!("Invalid backend: '{s}'. Valid options are: host, cuda")),
        }
    }
}

/// Settings for a series of duplex copy case executions, one per buffer size.
///
/// Only the first entry of `numa_ids` and of `device_ids` is used. Both are lists so that
/// command lines written for multi-device harnesses are accepted unchanged.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DuplexConfig {
    numa_ids: Vec<MemoryRegionId>,
    device_ids: Vec<u32>,
    sizes: SizeRange,
    iterations: NonZero<u64>,
    lock_host_memory: bool,
    backend: BackendKind,
}

const DEFAULT_ITERATIONS: NonZero<u64> = nz!(10);

impl DuplexConfig {
    /// Creates a configuration with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self {
            numa_ids: vec![0],
            device_ids: vec![0],
            sizes: SizeRange::SMALL,
            iterations: DEFAULT_ITERATIONS,
            lock_host_memory: true,
            backend: BackendKind::default(),
        }
    }

    /// Sets the memory regions that may hold the host buffers. An empty list keeps the default.
    #[must_use]
    pub fn with_numa_ids(mut self, numa_ids: Vec<MemoryRegionId>) -> Self {
        if !numa_ids.is_empty() {
            self.numa_ids = numa_ids;
        }

        self
    }

    /// Sets the devices that may execute the copies. An empty list keeps the default.
    ///
    /// For the host backend, a device ID is the memory region that plays the role of the device.
    #[must_use]
    pub fn with_device_ids(mut self, device_ids: Vec<u32>) -> Self {
        if !device_ids.is_empty() {
            self.device_ids = device_ids;
        }

        self
    }

    /// Sets the buffer sizes to execute the case for.
    #[must_use]
    pub fn with_sizes(mut self, sizes: SizeRange) -> Self {
        self.sizes = sizes;
        self
    }

    /// Sets the number of timed iterations per size.
    #[must_use]
    pub fn with_iterations(mut self, iterations: NonZero<u64>) -> Self {
        self.iterations = iterations;
        self
    }

    /// Sets whether host buffers of the host backend are locked in physical memory.
    #[must_use]
    pub fn with_lock_host_memory(mut self, lock_host_memory: bool) -> Self {
        self.lock_host_memory = lock_host_memory;
        self
    }

    /// Sets the copy engine.
    #[must_use]
    pub fn with_backend(mut self, backend: BackendKind) -> Self {
        self.backend = backend;
        self
    }

    /// The memory region that holds the host buffers.
    #[must_use]
    pub fn numa_id(&self) -> MemoryRegionId {
        *self
            .numa_ids
            .first()
            .expect("the list of memory regions is never empty")
    }

    /// The device that executes the copies.
    #[must_use]
    pub fn device_id(&self) -> u32 {
        *self
            .device_ids
            .first()
            .expect("the list of devices is never empty")
    }

    /// The buffer sizes to execute the case for.
    #[must_use]
    pub fn sizes(&self) -> SizeRange {
        self.sizes
    }

    /// The number of timed iterations per size.
    #[must_use]
    pub fn iterations(&self) -> NonZero<u64> {
        self.iterations
    }

    /// Whether host buffers of the host backend are locked in physical memory.
    #[must_use]
    pub fn lock_host_memory(&self) -> bool {
        self.lock_host_memory
    }

    /// The copy engine.
    #[must_use]
    pub fn backend(&self) -> BackendKind {
        self.backend
    }

    /// Creates the host backend described by this configuration.
    #[must_use]
    pub fn host_backend(&self) -> HostBackend {
        HostBackend::new(self.device_id(), self.lock_host_memory)
    }

    /// Creates the CUDA backend described by this configuration.
    #[cfg(feature = "cuda")]
    #[must_use]
    pub fn cuda_backend(&self) -> crate::CudaBackend {
        let ordinal = usize::try_from(self.device_id())
            .expect("u32 always fits in usize on supported targets");

        crate::CudaBackend::new(ordinal)
    }

    /// Executes the case for every configured size on the configured backend.
    ///
    /// Sizes that cannot be executed are reported as skipped, they do not stop the series.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BackendNotBuilt`] if the configured backend is not included in this
    /// build.
    pub fn run(&self) -> Result<Vec<SizeOutcome>> {
        match self.backend {
            BackendKind::Host => Ok(self.run_with(self.host_backend())),
            #[cfg(feature = "cuda")]
            BackendKind::Cuda => Ok(self.run_with(self.cuda_backend())),
            #[cfg(not(feature = "cuda"))]
            BackendKind::Cuda => Err(Error::BackendNotBuilt {
                backend: BackendKind::Cuda,
            }),
        }
    }

    /// Executes the case for every configured size on the given backend.
    pub fn run_with<B: CopyBackend>(&self, backend: B) -> Vec<SizeOutcome> {
        let mut case = DuplexCase::new(backend, self.numa_id());

        self.sizes
            .exponents()
            .map(|exponent| self.run_size(&mut case, exponent))
            .collect()
    }

    fn run_size<B: CopyBackend>(&self, case: &mut DuplexCase<B>, exponent: u32) -> SizeOutcome {
        let result = bytes_for(exponent).and_then(|bytes| case.run(bytes, self.iterations));

        match result {
            Ok(report) => {
                info!(exponent, iterations = report.iterations(), "size completed");
                SizeOutcome::Completed(report)
            }
            Err(e) => {
                warn!(exponent, reason = %e, "size skipped");
                SizeOutcome::Skipped(SkippedCase::new(exponent, e))
            }
        }
    }
}

impl Default for DuplexConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// The buffer size for a log2 size, if it fits in the address space.
pub(crate) fn bytes_for(exponent: u32) -> Result<usize> {
    usize::try_from(SizeRange::bytes_for(exponent))
        .map_err(|e| Error::backend(Operation::AllocateHost, e))
}
