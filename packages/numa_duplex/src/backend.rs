use std::fmt::Debug;

use crate::{Direction, HostRegion, Marker, Result};

mod host;

#[cfg(feature = "cuda")]
mod cuda;

#[cfg(feature = "cuda")]
pub use cuda::*;
pub use host::*;

/// The copy engine that a duplex copy case orchestrates.
///
/// A backend owns one stream per [`Direction`], a start and stop timing event per stream, and a
/// source and destination buffer per stream. The case drives it through a fixed sequence:
///
/// 1. [`is_available()`][Self::is_available] to check that the device exists.
/// 1. [`reset_device()`][Self::reset_device] to start from a clean device state.
/// 1. [`prepare()`][Self::prepare] once to create streams, events and buffers.
/// 1. Per iteration: [`launch()`][Self::launch] for each direction, then
///    [`synchronize()`][Self::synchronize] for each direction, then any number of
///    [`elapsed_ms()`][Self::elapsed_ms] queries.
/// 1. [`release()`][Self::release] to free everything, also on failure.
#[cfg_attr(test, mockall::automock)]
pub trait CopyBackend: Debug {
    /// Whether the copy device is present.
    fn is_available(&self) -> bool;

    /// Resets the copy device, releasing any resources previously allocated on it.
    ///
    /// # Errors
    ///
    /// Returns an error tagged [`Operation::ResetDevice`][crate::Operation::ResetDevice] if the
    /// device cannot be reset.
    fn reset_device(&mut self) -> Result<()>;

    /// Creates the streams and events and allocates `bytes` large buffers for both directions.
    ///
    /// Host buffers are placed in the memory region `host`. Device buffers are zero-filled.
    ///
    /// # Errors
    ///
    /// Returns an error tagged with the resource that could not be created.
    fn prepare(&mut self, host: &HostRegion, bytes: usize) -> Result<()>;

    /// Records the start event, enqueues the copy and records the stop event on the stream of
    /// the given direction. Returns without waiting for the copy to complete.
    ///
    /// # Errors
    ///
    /// Returns an error tagged with the step that failed.
    fn launch(&mut self, direction: Direction) -> Result<()>;

    /// Waits until the stop event of the given direction has completed.
    ///
    /// # Errors
    ///
    /// Returns an error if the wait fails or the copy itself failed.
    fn synchronize(&mut self, direction: Direction) -> Result<()>;

    /// Milliseconds elapsed from the `from` event to the `to` event.
    ///
    /// The result is negative if `to` was recorded before `from`.
    ///
    /// # Errors
    ///
    /// Returns an error tagged [`Operation::ElapsedTime`][crate::Operation::ElapsedTime] if
    /// either event has not completed.
    fn elapsed_ms(&self, from: Marker, to: Marker) -> Result<f32>;

    /// Releases streams, events and buffers. Calling this when nothing is allocated is a no-op.
    fn release(&mut self);
}
