use derive_more::Display;

/// One of the two copies that make up a duplex copy.
///
/// Each direction is issued on its own stream, so the two copies may execute concurrently.
#[derive(Clone, Copy, Debug, Display, Eq, Hash, PartialEq)]
#[non_exhaustive]
pub enum Direction {
    /// Copy from the pinned host buffer to the device buffer.
    #[display("host-to-device")]
    HostToDevice,

    /// Copy from the device buffer to the pinned host buffer.
    #[display("device-to-host")]
    DeviceToHost,
}

impl Direction {
    /// Both directions, in the order in which their copies are issued.
    pub const ALL: [Self; 2] = [Self::HostToDevice, Self::DeviceToHost];

    /// Position of this direction in [`Direction::ALL`].
    #[must_use]
    pub const fn index(self) -> usize {
        match self {
            Self::HostToDevice => 0,
            Self::DeviceToHost => 1,
        }
    }

    /// The direction of the other copy in the pair.
    #[must_use]
    pub const fn opposite(self) -> Self {
        match self {
            Self::HostToDevice => Self::DeviceToHost,
            Self::DeviceToHost => Self::HostToDevice,
        }
    }
}

/// Which end of a copy a timing event marks.
#[derive(Clone, Copy, Debug, Display, Eq, Hash, PartialEq)]
#[non_exhaustive]
pub enum Edge {
    /// Recorded on the stream immediately before the copy is enqueued.
    #[display("start")]
    Start,

    /// Recorded on the stream immediately after the copy is enqueued.
    #[display("stop")]
    Stop,
}

/// Identifies one of the four timing events of a duplex copy.
#[derive(Clone, Copy, Debug, Display, Eq, Hash, PartialEq)]
#[display("{direction} {edge}")]
pub struct Marker {
    direction: Direction,
    edge: Edge,
}

impl Marker {
    /// Creates a marker for the given end of the copy in the given direction.
    #[must_use]
    pub const fn new(direction: Direction, edge: Edge) -> Self {
        Self { direction, edge }
    }

    /// Marker of the start event of a copy.
    #[must_use]
    pub const fn start(direction: Direction) -> Self {
        Self::new(direction, Edge::Start)
    }

    /// Marker of the stop event of a copy.
    #[must_use]
    pub const fn stop(direction: Direction) -> Self {
        Self::new(direction, Edge::Stop)
    }

    /// The copy this marker belongs to.
    #[must_use]
    pub const fn direction(self) -> Direction {
        self.direction
    }

    /// Which end of the copy this marker belongs to.
    #[must_use]
    pub const fn edge(self) -> Edge {
        self.edge
    }
}
