use std::fmt;
use std::sync::Arc;

use cudarc::driver::{CudaContext, CudaEvent, CudaSlice, CudaStream, PinnedHostSlice, sys};
use tracing::debug;

use crate::{CopyBackend, Direction, Edge, Error, HostRegion, Marker, Operation, Result};

/// Host buffers that are the source of a copy are filled with this, so copies are observable.
const SOURCE_FILL: u8 = 0xA5;

/// A copy backend that drives a CUDA device through the driver API.
///
/// Pinned host memory is allocated and initialized on a short-lived thread pinned to the
/// processors of the host memory region, which places the page-locked pages in that region.
/// The thread that calls [`prepare()`][CopyBackend::prepare] is not affected.
pub struct CudaBackend {
    ordinal: usize,
    context: Option<Arc<CudaContext>>,

    /// One lane per direction, indexed by [`Direction::index()`]. Empty until prepared.
    lanes: Option<[CudaLane; 2]>,
}

impl CudaBackend {
    /// Creates a backend for the CUDA device with the given ordinal.
    ///
    /// No driver calls are made until the backend is used.
    #[must_use]
    pub fn new(ordinal: usize) -> Self {
        Self {
            ordinal,
            context: None,
            lanes: None,
        }
    }

    /// The ordinal of the CUDA device.
    #[must_use]
    pub fn ordinal(&self) -> usize {
        self.ordinal
    }

    fn context(&mut self) -> Result<Arc<CudaContext>> {
        if let Some(context) = &self.context {
            return Ok(Arc::clone(context));
        }

        let context = CudaContext::new(self.ordinal)
            .map_err(|e| Error::backend(Operation::ResetDevice, e))?;
        self.context = Some(Arc::clone(&context));

        Ok(context)
    }

    fn lane(&self, direction: Direction, operation: Operation) -> Result<&CudaLane> {
        self.lanes
            .as_ref()
            .and_then(|lanes| lanes.get(direction.index()))
            .ok_or_else(|| Error::backend(operation, "backend has not been prepared"))
    }

    fn new_lane(
        context: &Arc<CudaContext>,
        direction: Direction,
        host: &HostRegion,
        bytes: usize,
    ) -> Result<CudaLane> {
        let stream = context
            .new_stream()
            .map_err(|e| Error::backend(Operation::CreateStream, e))?;

        let start = new_timing_event(context)?;
        let stop = new_timing_event(context)?;

        // Page-locked pages are placed by the thread that allocates them.
        let host_buffer = {
            let context = Arc::clone(context);

            host.spawn_pinned(move || new_host_buffer(&context, bytes, direction))
                .join()
                .map_err(|_panic| {
                    Error::backend(Operation::AllocateHost, "allocating thread panicked")
                })??
        };
        let device_buffer = new_device_buffer(&stream, bytes)?;

        let buffers = match direction {
            Direction::HostToDevice => CudaBuffers::Upload {
                source: host_buffer,
                destination: device_buffer,
            },
            Direction::DeviceToHost => CudaBuffers::Download {
                source: device_buffer,
                destination: host_buffer,
            },
        };

        Ok(CudaLane {
            stream,
            start,
            stop,
            buffers,
        })
    }
}

impl CopyBackend for CudaBackend {
    fn is_available(&self) -> bool {
        CudaContext::device_count()
            .ok()
            .and_then(|count| usize::try_from(count).ok())
            .is_some_and(|count| count > self.ordinal)
    }

    fn reset_device(&mut self) -> Result<()> {
        self.release();

        // Dropping the last reference to the context releases everything allocated on it.
        self.context = None;

        let context = self.context()?;
        context
            .synchronize()
            .map_err(|e| Error::backend(Operation::ResetDevice, e))?;

        debug!(ordinal = self.ordinal, "reset CUDA device");

        Ok(())
    }

    fn prepare(&mut self, host: &HostRegion, bytes: usize) -> Result<()> {
        self.release();

        let context = self.context()?;

        debug!(
            ordinal = self.ordinal,
            host_region = host.id(),
            bytes,
            "preparing CUDA duplex copy"
        );

        self.lanes = Some([
            Self::new_lane(&context, Direction::HostToDevice, host, bytes)?,
            Self::new_lane(&context, Direction::DeviceToHost, host, bytes)?,
        ]);

        Ok(())
    }

    fn launch(&mut self, direction: Direction) -> Result<()> {
        let CudaLane {
            stream,
            start,
            stop,
            buffers,
        } = self
            .lanes
            .as_mut()
            .and_then(|lanes| lanes.get_mut(direction.index()))
            .ok_or_else(|| {
                Error::backend(Operation::RecordStart, "backend has not been prepared")
            })?;

        start
            .record(stream)
            .map_err(|e| Error::backend(Operation::RecordStart, e))?;

        match buffers {
            CudaBuffers::Upload {
                source,
                destination,
            } => stream.memcpy_htod(&*source, destination),
            CudaBuffers::Download {
                source,
                destination,
            } => stream.memcpy_dtoh(&*source, destination),
        }
        .map_err(|e| Error::backend(Operation::StartCopy, e))?;

        stop.record(stream)
            .map_err(|e| Error::backend(Operation::RecordStop, e))
    }

    fn synchronize(&mut self, direction: Direction) -> Result<()> {
        self.lane(direction, Operation::Synchronize)?
            .stop
            .synchronize()
            .map_err(|e| Error::backend(Operation::Synchronize, e))
    }

    fn elapsed_ms(&self, from: Marker, to: Marker) -> Result<f32> {
        let from = self
            .lane(from.direction(), Operation::ElapsedTime)?
            .event(from.edge());
        let to = self
            .lane(to.direction(), Operation::ElapsedTime)?
            .event(to.edge());

        from.elapsed_ms(to)
            .map_err(|e| Error::backend(Operation::ElapsedTime, e))
    }

    fn release(&mut self) {
        if self.lanes.take().is_some() {
            if let Some(context) = &self.context {
                // Frees are asynchronous on the streams; wait for them before anything else.
                if let Err(e) = context.synchronize() {
                    debug!(ordinal = self.ordinal, error = %e, "synchronize after release failed");
                }
            }

            debug!(ordinal = self.ordinal, "released CUDA duplex copy");
        }
    }
}

impl fmt::Debug for CudaBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CudaBackend")
            .field("ordinal", &self.ordinal)
            .field("has_context", &self.context.is_some())
            .field("prepared", &self.lanes.is_some())
            .finish()
    }
}

impl Drop for CudaBackend {
    fn drop(&mut self) {
        self.release();
    }
}

fn new_timing_event(context: &Arc<CudaContext>) -> Result<CudaEvent> {
    // Events without flags have timing enabled, which elapsed time queries require.
    context
        .new_event(Some(sys::CUevent_flags::CU_EVENT_DEFAULT))
        .map_err(|e| Error::backend(Operation::CreateEvent, e))
}

fn new_host_buffer(
    context: &Arc<CudaContext>,
    bytes: usize,
    direction: Direction,
) -> Result<PinnedHostSlice<u8>> {
    // SAFETY: Every bit pattern is a valid u8 and we initialize the whole buffer below,
    // before the buffer is used as a copy source or destination.
    let mut buffer = unsafe { context.alloc_pinned::<u8>(bytes) }
        .map_err(|e| Error::backend(Operation::AllocateHost, e))?;

    let fill = match direction {
        Direction::HostToDevice => SOURCE_FILL,
        Direction::DeviceToHost => 0,
    };

    buffer
        .as_mut_slice()
        .map_err(|e| Error::backend(Operation::AllocateHost, e))?
        .fill(fill);

    Ok(buffer)
}

fn new_device_buffer(stream: &Arc<CudaStream>, bytes: usize) -> Result<CudaSlice<u8>> {
    // SAFETY: The buffer is zeroed below, before it is used as a copy source or destination.
    let mut buffer = unsafe { stream.alloc::<u8>(bytes) }
        .map_err(|e| Error::backend(Operation::AllocateDevice, e))?;

    stream
        .memset_zeros(&mut buffer)
        .map_err(|e| Error::backend(Operation::ZeroDevice, e))?;

    Ok(buffer)
}

enum CudaBuffers {
    Upload {
        source: PinnedHostSlice<u8>,
        destination: CudaSlice<u8>,
    },
    Download {
        source: CudaSlice<u8>,
        destination: PinnedHostSlice<u8>,
    },
}

/// One stream of the CUDA backend with its timing events and buffers.
///
/// Field order matters: buffers are dropped before the stream they were allocated on.
struct CudaLane {
    buffers: CudaBuffers,
    start: CudaEvent,
    stop: CudaEvent,
    stream: Arc<CudaStream>,
}

impl CudaLane {
    fn event(&self, edge: Edge) -> &CudaEvent {
        match edge {
            Edge::Start => &self.start,
            Edge::Stop => &self.stop,
        }
    }
}
