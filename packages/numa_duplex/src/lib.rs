#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

//! Measures bidirectional ("duplex") copy throughput between pinned host memory placed in a
//! specific memory region and a copy device.
//!
//! Each iteration issues two asynchronous copies at the same time, one from host to device and
//! one from device to host, each on its own stream and each bracketed by a start and a stop
//! event. The iteration time is the longest span from any start event to any stop event, which
//! is the time the duplex copy took as a whole. The skew between the two start events and the
//! two stop events is reported as the start and stop spread.
//!
//! # Backends
//!
//! The copies are executed by a [`CopyBackend`]:
//!
//! * [`HostBackend`] treats a second memory region of the host as the device. Each direction is
//!   served by a worker thread pinned to the region that receives the copied data. Always
//!   available.
//! * `CudaBackend` drives a CUDA device through the driver API. Requires the `cuda` feature.
//!
//! # Memory placement
//!
//! Physical memory pages are allocated in the memory region of the processor that first touches
//! them. Host buffers are therefore allocated and initialized on threads pinned to the processors
//! of the requested memory region (see [`HostRegion`]).
//!
//! # Usage
//!
//! The `numa_duplex` binary executes the case for a range of sizes and prints one line per size.
//! The `duplex_memcpy` benchmark registers the same case with [Criterion][1] via
//! [`execute_runs()`], reporting the event-measured time instead of the wall clock.
//!
//! ```no_run
//! use numa_duplex::{DuplexConfig, SizeRange};
//!
//! let config = DuplexConfig::new()
//!     .with_numa_ids(vec![0])
//!     .with_device_ids(vec![1])
//!     .with_sizes(SizeRange::new(16, 24).unwrap());
//!
//! for outcome in config.run().unwrap() {
//!     println!("{outcome}");
//! }
//! ```
//!
//! [1]: https://bheisler.github.io/criterion.rs/book/index.html

mod backend;
mod case;
mod config;
mod direction;
mod error;
mod host_memory;
mod measure;
mod placement;
mod report;
mod run;
mod size_range;

pub use backend::*;
pub use case::*;
pub use config::*;
pub use direction::*;
pub use error::*;
pub use host_memory::*;
pub use measure::*;
pub use placement::*;
pub use report::*;
pub use run::*;
pub use size_range::*;
