use std::collections::TryReserveError;
use std::io;

use derive_more::Display;
use many_cpus::MemoryRegionId;
use thiserror::Error;

use crate::{BackendKind, Direction};

/// A step of the duplex copy case that is delegated to the copy backend.
///
/// The display form reads as the object of "failed to ...", matching the reason reported when a
/// case is skipped.
#[derive(Clone, Copy, Debug, Display, Eq, Hash, PartialEq)]
#[non_exhaustive]
pub enum Operation {
    /// Resetting the copy device to a clean state.
    #[display("reset device")]
    ResetDevice,

    /// Creating one of the per-direction streams.
    #[display("create stream")]
    CreateStream,

    /// Creating one of the start/stop timing events.
    #[display("create event")]
    CreateEvent,

    /// Allocating page-locked host memory in the target memory region.
    #[display("allocate pinned host memory")]
    AllocateHost,

    /// Allocating memory owned by the copy device.
    #[display("allocate device memory")]
    AllocateDevice,

    /// Filling a device buffer with zeroes before the first copy.
    #[display("zero device memory")]
    ZeroDevice,

    /// Recording the start event of a copy.
    #[display("record start event")]
    RecordStart,

    /// Enqueueing the asynchronous copy itself.
    #[display("start asynchronous copy")]
    StartCopy,

    /// Recording the stop event of a copy.
    #[display("record stop event")]
    RecordStop,

    /// Waiting for the stop event of a copy.
    #[display("synchronize")]
    Synchronize,

    /// Querying the elapsed time between two recorded events.
    #[display("query elapsed time")]
    ElapsedTime,
}

/// Errors that can occur when preparing or executing a duplex copy case.
///
/// Any error returned while a case is executing causes that case to be skipped. The reason
/// reported for the skip is the case name followed by the display form of this error.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The copy backend reports that its device is not present.
    #[error("no copy device found")]
    NoDevice,

    /// The requested memory region does not exist or has no processors available to us.
    #[error("NUMA not available: memory region {region} has no usable processors")]
    NumaUnavailable {
        /// The memory region that was requested.
        region: MemoryRegionId,
    },

    /// The caller asked for a size range that cannot be expressed in bytes.
    #[error("invalid size range: log2 sizes {min}..={max} must ascend and stay below 64")]
    InvalidSizeRange {
        /// Smallest requested log2 size.
        min: u32,

        /// Largest requested log2 size.
        max: u32,
    },

    /// Host memory of the requested size could not be allocated.
    #[error("cannot reserve {len} bytes of host memory: {source}")]
    ReserveHostMemory {
        /// Length of the buffer that could not be allocated.
        len: usize,

        /// The error reported by the allocator.
        source: TryReserveError,
    },

    /// The operating system refused to lock host memory pages.
    #[error("failed to lock {len} bytes of host memory: {source}")]
    LockHostMemory {
        /// Length of the buffer that could not be locked.
        len: usize,

        /// The error reported by the operating system.
        source: io::Error,
    },

    /// The copy backend failed to perform one of the steps of the case.
    #[error("failed to {operation}: {source}")]
    Backend {
        /// The step that failed.
        operation: Operation,

        /// The error reported by the backend.
        source: Box<dyn std::error::Error + Send + Sync + 'static>,
    },

    /// The requested copy backend was not compiled into this build.
    #[error("the {backend} backend is not included in this build")]
    BackendNotBuilt {
        /// The backend that was requested.
        backend: BackendKind,
    },

    /// A worker thread serving one copy direction panicked.
    #[error("the {direction} copy worker panicked")]
    WorkerPanicked {
        /// The copy direction the worker was serving.
        direction: Direction,
    },
}

impl Error {
    /// Wraps a backend-specific error as a failure of the given step.
    pub fn backend(
        operation: Operation,
        source: impl Into<Box<dyn std::error::Error + Send + Sync + 'static>>,
    ) -> Self {
        Self::Backend {
            operation,
            source: source.into(),
        }
    }

    /// The step that failed, if this error came from the copy backend.
    #[must_use]
    pub fn operation(&self) -> Option<Operation> {
        match self {
            Self::Backend { operation, .. } => Some(*operation),
            _ => None,
        }
    }
}

/// A specialized `Result` type for duplex copy operations, returning the crate's
/// [`Error`] type as the error value.
pub type Result<T> = std::result::Result<T, Error>;
