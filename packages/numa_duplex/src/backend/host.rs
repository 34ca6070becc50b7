use std::thread::JoinHandle;
use std::time::Instant;
use std::{fmt, mem};

use many_cpus::MemoryRegionId;
use tracing::debug;

use crate::{
    CopyBackend, Direction, Edge, Error, HostRegion, Marker, Operation, PinnedBuffer, Result,
};

/// Host buffers that are the source of a copy are filled with this, so copies are observable.
const SOURCE_FILL: u8 = 0xA5;

/// A copy backend in which the "device" is a second memory region of the host.
///
/// Each direction is served by a worker thread pinned to the processors of the memory region
/// that owns the copy's destination, playing the role of the device's copy engine. The start and
/// stop events are timestamps captured by the worker immediately around the copy, so the elapsed
/// time between events of different directions reflects how the two copies actually overlapped.
///
/// This makes the duplex copy case runnable on systems without a GPU, where it measures
/// concurrent bidirectional copy throughput between two memory regions.
pub struct HostBackend {
    device_region: MemoryRegionId,
    lock_host_memory: bool,

    /// One lane per direction, indexed by [`Direction::index()`]. Empty until prepared.
    lanes: Option<[Lane; 2]>,
}

impl HostBackend {
    /// Creates a backend whose device buffers are placed in `device_region`.
    ///
    /// If `lock_host_memory` is set, the host buffers are locked in physical memory, the
    /// equivalent of pinned host memory.
    #[must_use]
    pub fn new(device_region: MemoryRegionId, lock_host_memory: bool) -> Self {
        Self {
            device_region,
            lock_host_memory,
            lanes: None,
        }
    }

    /// The memory region that plays the role of the device.
    #[must_use]
    pub fn device_region(&self) -> MemoryRegionId {
        self.device_region
    }

    fn lane(&self, direction: Direction, operation: Operation) -> Result<&Lane> {
        self.lanes
            .as_ref()
            .and_then(|lanes| lanes.get(direction.index()))
            .ok_or_else(|| Error::backend(operation, "backend has not been prepared"))
    }

    fn lane_mut(&mut self, direction: Direction, operation: Operation) -> Result<&mut Lane> {
        self.lanes
            .as_mut()
            .and_then(|lanes| lanes.get_mut(direction.index()))
            .ok_or_else(|| Error::backend(operation, "backend has not been prepared"))
    }

    /// The memory region whose processors execute the copies of a direction.
    #[cfg(test)]
    pub(crate) fn engine_region(&self, direction: Direction) -> Option<MemoryRegionId> {
        Some(self.lane(direction, Operation::StartCopy).ok()?.engine.id())
    }

    /// The destination buffer of a direction, if the lane is idle.
    #[cfg(test)]
    pub(crate) fn destination(&self, direction: Direction) -> Option<&[u8]> {
        match &self.lane(direction, Operation::Synchronize).ok()?.state {
            LaneState::Idle(buffers) => Some(buffers.destination.as_slice()),
            _ => None,
        }
    }
}

impl CopyBackend for HostBackend {
    fn is_available(&self) -> bool {
        crate::is_numa_available(self.device_region)
    }

    fn reset_device(&mut self) -> Result<()> {
        self.release();

        // The device region must still be there for the device to count as reset.
        HostRegion::resolve(self.device_region)
            .map(|_| ())
            .map_err(|e| Error::backend(Operation::ResetDevice, e))
    }

    fn prepare(&mut self, host: &HostRegion, bytes: usize) -> Result<()> {
        self.release();

        let device = HostRegion::resolve(self.device_region)
            .map_err(|e| Error::backend(Operation::AllocateDevice, e))?;

        debug!(
            host_region = host.id(),
            device_region = device.id(),
            bytes,
            "preparing host duplex copy"
        );

        let lock = self.lock_host_memory;

        // Host to device: pinned host source, zeroed device destination.
        let upload_source = allocate(host, Operation::AllocateHost, bytes, SOURCE_FILL, lock)?;
        let upload_destination = allocate(&device, Operation::AllocateDevice, bytes, 0, false)?;

        // Device to host: zeroed device source, pinned host destination.
        let download_source = allocate(&device, Operation::AllocateDevice, bytes, 0, false)?;
        let download_destination = allocate(host, Operation::AllocateHost, bytes, 0, lock)?;

        self.lanes = Some([
            Lane::new(
                Direction::HostToDevice,
                device,
                upload_source,
                upload_destination,
            ),
            Lane::new(
                Direction::DeviceToHost,
                host.clone(),
                download_source,
                download_destination,
            ),
        ]);

        Ok(())
    }

    fn launch(&mut self, direction: Direction) -> Result<()> {
        self.lane_mut(direction, Operation::StartCopy)?.launch()
    }

    fn synchronize(&mut self, direction: Direction) -> Result<()> {
        self.lane_mut(direction, Operation::Synchronize)?
            .synchronize()
    }

    fn elapsed_ms(&self, from: Marker, to: Marker) -> Result<f32> {
        let from = self
            .lane(from.direction(), Operation::ElapsedTime)?
            .timestamp(from.edge())?;
        let to = self
            .lane(to.direction(), Operation::ElapsedTime)?
            .timestamp(to.edge())?;

        Ok(signed_millis(from, to))
    }

    fn release(&mut self) {
        if let Some(lanes) = self.lanes.take() {
            for mut lane in lanes {
                // Anything still in flight is joined so no worker outlives its buffers' owner.
                // A panicked worker has nothing left for us to release.
                _ = lane.synchronize();
            }

            debug!(device_region = self.device_region, "released host duplex copy");
        }
    }
}

impl fmt::Debug for HostBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostBackend")
            .field("device_region", &self.device_region)
            .field("lock_host_memory", &self.lock_host_memory)
            .field("prepared", &self.lanes.is_some())
            .finish()
    }
}

impl Drop for HostBackend {
    fn drop(&mut self) {
        self.release();
    }
}

/// Allocates and fills a buffer on a thread pinned to `region`, placing it in that region.
fn allocate(
    region: &HostRegion,
    operation: Operation,
    bytes: usize,
    fill: u8,
    lock: bool,
) -> Result<PinnedBuffer> {
    region
        .spawn_pinned(move || PinnedBuffer::filled(bytes, fill, lock))
        .join()
        .map_err(|_panic| Error::backend(operation, "allocating thread panicked"))?
        .map_err(|e| Error::backend(operation, e))
}

#[expect(
    clippy::cast_possible_truncation,
    reason = "f32 milliseconds is the resolution of event timing, as with device events"
)]
fn signed_millis(from: Instant, to: Instant) -> f32 {
    if to >= from {
        (to.duration_since(from).as_secs_f64() * 1000.0) as f32
    } else {
        -((from.duration_since(to).as_secs_f64() * 1000.0) as f32)
    }
}

#[derive(Debug)]
struct Buffers {
    source: PinnedBuffer,
    destination: PinnedBuffer,
}

#[derive(Clone, Copy, Debug)]
struct Timestamps {
    start: Instant,
    stop: Instant,
}

#[derive(Debug)]
enum LaneState {
    Idle(Buffers),
    InFlight(JoinHandle<(Buffers, Timestamps)>),

    /// The worker panicked and took the buffers with it.
    Lost,
}

/// One stream of the host backend: a pair of buffers and the worker that copies between them.
#[derive(Debug)]
struct Lane {
    direction: Direction,
    engine: HostRegion,
    state: LaneState,

    /// Timestamps of the most recently completed copy.
    completed: Option<Timestamps>,
}

impl Lane {
    fn new(
        direction: Direction,
        engine: HostRegion,
        source: PinnedBuffer,
        destination: PinnedBuffer,
    ) -> Self {
        Self {
            direction,
            engine,
            state: LaneState::Idle(Buffers {
                source,
                destination,
            }),
            completed: None,
        }
    }

    fn launch(&mut self) -> Result<()> {
        let buffers = match mem::replace(&mut self.state, LaneState::Lost) {
            LaneState::Idle(buffers) => buffers,
            other => {
                self.state = other;
                return Err(Error::backend(
                    Operation::StartCopy,
                    format!("the {} stream is busy or lost", self.direction),
                ));
            }
        };

        self.state = LaneState::InFlight(self.engine.spawn_pinned(move || {
            let mut buffers = buffers;

            let start = Instant::now();
            buffers
                .destination
                .as_mut_slice()
                .copy_from_slice(buffers.source.as_slice());
            let stop = Instant::now();

            (buffers, Timestamps { start, stop })
        }));

        Ok(())
    }

    fn synchronize(&mut self) -> Result<()> {
        match mem::replace(&mut self.state, LaneState::Lost) {
            LaneState::InFlight(handle) => {
                let (buffers, timestamps) =
                    handle.join().map_err(|_panic| Error::WorkerPanicked {
                        direction: self.direction,
                    })?;

                self.state = LaneState::Idle(buffers);
                self.completed = Some(timestamps);
                Ok(())
            }
            LaneState::Idle(buffers) => {
                self.state = LaneState::Idle(buffers);
                Ok(())
            }
            LaneState::Lost => Err(Error::WorkerPanicked {
                direction: self.direction,
            }),
        }
    }

    fn timestamp(&self, edge: Edge) -> Result<Instant> {
        let timestamps = match (&self.state, self.completed) {
            (LaneState::Idle(_), Some(timestamps)) => timestamps,
            _ => {
                return Err(Error::backend(
                    Operation::ElapsedTime,
                    format!("the {} {edge} event has not completed", self.direction),
                ));
            }
        };

        Ok(match edge {
            Edge::Start => timestamps.start,
            Edge::Stop => timestamps.stop,
        })
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::time::Duration;

    use many_cpus::ProcessorSet;

    use super::*;

    fn current_region() -> MemoryRegionId {
        ProcessorSet::default().processors().first().memory_region_id()
    }

    fn prepared(bytes: usize) -> (HostBackend, HostRegion) {
        let region = current_region();
        let host = HostRegion::resolve(region).unwrap();

        let mut backend = HostBackend::new(region, false);
        assert!(backend.is_available());
        backend.reset_device().unwrap();
        backend.prepare(&host, bytes).unwrap();

        (backend, host)
    }

    #[test]
    fn missing_device_region_is_unavailable() {
        let backend = HostBackend::new(MemoryRegionId::MAX, false);

        assert!(!backend.is_available());
    }

    #[test]
    fn reset_of_missing_device_region_fails() {
        let mut backend = HostBackend::new(MemoryRegionId::MAX, false);

        let error = backend.reset_device().unwrap_err();

        assert_eq!(error.operation(), Some(Operation::ResetDevice));
    }

    #[test]
    fn launch_before_prepare_fails() {
        let mut backend = HostBackend::new(current_region(), false);

        let error = backend.launch(Direction::HostToDevice).unwrap_err();

        assert_eq!(error.operation(), Some(Operation::StartCopy));
    }

    #[test]
    fn duplex_copy_moves_data_both_ways() {
        let (mut backend, _host) = prepared(64 * 1024);

        for direction in Direction::ALL {
            backend.launch(direction).unwrap();
        }

        for direction in Direction::ALL {
            backend.synchronize(direction).unwrap();
        }

        let uploaded = backend.destination(Direction::HostToDevice).unwrap();
        assert!(uploaded.iter().all(|&b| b == SOURCE_FILL));

        let downloaded = backend.destination(Direction::DeviceToHost).unwrap();
        assert!(downloaded.iter().all(|&b| b == 0));
    }

    #[test]
    fn stop_is_not_before_start() {
        let (mut backend, _host) = prepared(4096);

        backend.launch(Direction::HostToDevice).unwrap();
        backend.synchronize(Direction::HostToDevice).unwrap();

        let span = backend
            .elapsed_ms(
                Marker::start(Direction::HostToDevice),
                Marker::stop(Direction::HostToDevice),
            )
            .unwrap();
        let reverse = backend
            .elapsed_ms(
                Marker::stop(Direction::HostToDevice),
                Marker::start(Direction::HostToDevice),
            )
            .unwrap();

        assert!(span >= 0.0);
        assert!(reverse <= 0.0);
    }

    #[test]
    fn elapsed_before_completion_fails() {
        let (backend, _host) = prepared(4096);

        let error = backend
            .elapsed_ms(
                Marker::start(Direction::DeviceToHost),
                Marker::stop(Direction::DeviceToHost),
            )
            .unwrap_err();

        assert_eq!(error.operation(), Some(Operation::ElapsedTime));
    }

    #[test]
    fn double_launch_fails_without_losing_the_copy() {
        let (mut backend, _host) = prepared(4096);

        backend.launch(Direction::DeviceToHost).unwrap();
        let error = backend.launch(Direction::DeviceToHost).unwrap_err();
        assert_eq!(error.operation(), Some(Operation::StartCopy));

        backend.synchronize(Direction::DeviceToHost).unwrap();
        assert!(backend.destination(Direction::DeviceToHost).is_some());
    }

    #[test]
    fn release_joins_in_flight_copies() {
        let (mut backend, _host) = prepared(1024 * 1024);

        backend.launch(Direction::HostToDevice).unwrap();
        backend.launch(Direction::DeviceToHost).unwrap();
        backend.release();

        assert!(backend.destination(Direction::HostToDevice).is_none());
        let error = backend.synchronize(Direction::HostToDevice).unwrap_err();
        assert_eq!(error.operation(), Some(Operation::Synchronize));

        // Releasing twice is fine.
        backend.release();
    }

    #[test]
    fn copies_execute_in_destination_region() {
        let (backend, host) = prepared(4096);

        assert_eq!(
            backend.engine_region(Direction::HostToDevice),
            Some(backend.device_region())
        );
        assert_eq!(
            backend.engine_region(Direction::DeviceToHost),
            Some(host.id())
        );
    }

    #[test]
    fn unallocatable_size_fails_prepare() {
        let region = current_region();
        let host = HostRegion::resolve(region).unwrap();
        let mut backend = HostBackend::new(region, false);

        let error = backend.prepare(&host, usize::MAX).unwrap_err();

        assert_eq!(error.operation(), Some(Operation::AllocateHost));
        assert!(
            error
                .to_string()
                .starts_with("failed to allocate pinned host memory: cannot reserve")
        );
        assert!(backend.destination(Direction::HostToDevice).is_none());
    }

    #[test]
    fn signed_millis_sign_follows_order() {
        let earlier = Instant::now();
        let later = earlier + Duration::from_millis(5);

        assert!((signed_millis(earlier, later) - 5.0).abs() < 0.001);
        assert!((signed_millis(later, earlier) + 5.0).abs() < 0.001);
        assert!(signed_millis(earlier, earlier).abs() < f32::EPSILON);
    }
}
