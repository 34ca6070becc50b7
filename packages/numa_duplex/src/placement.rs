use std::thread::{self, JoinHandle};

use many_cpus::{MemoryRegionId, ProcessorSet};
use tracing::debug;

use crate::{Error, Result};

/// The processors of one memory region, used to place host memory in that region.
///
/// Physical memory pages are allocated in the memory region of the processor that first touches
/// them. Allocating and initializing a buffer on a thread pinned to the processors of a region
/// therefore places the buffer in that region, without any allocator-level NUMA API.
#[derive(Clone, Debug)]
pub struct HostRegion {
    id: MemoryRegionId,
    processors: ProcessorSet,
}

impl HostRegion {
    /// Selects all processors of the given memory region that are available to this process.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NumaUnavailable`] if the memory region does not exist or none of its
    /// processors are available to this process.
    pub fn resolve(id: MemoryRegionId) -> Result<Self> {
        let processors = ProcessorSet::builder()
            .filter(|p| p.memory_region_id() == id)
            .take_all()
            .ok_or(Error::NumaUnavailable { region: id })?;

        debug!(
            region = id,
            processors = processors.len(),
            "resolved host memory region"
        );

        Ok(Self { id, processors })
    }

    /// The memory region ID.
    #[must_use]
    pub fn id(&self) -> MemoryRegionId {
        self.id
    }

    /// The processors of the memory region.
    #[must_use]
    pub fn processors(&self) -> &ProcessorSet {
        &self.processors
    }

    /// Restricts the current thread to the processors of the memory region.
    ///
    /// Memory first touched by the current thread after this call is placed in the region. The
    /// restriction is permanent; prefer [`spawn_pinned()`][Self::spawn_pinned] for short tasks.
    #[cfg_attr(test, mutants::skip)] // Pinning has no observable effect we can assert on.
    pub fn pin_current_thread(&self) {
        self.processors.pin_current_thread_to();
    }

    /// Spawns a thread restricted to the processors of the memory region.
    pub fn spawn_pinned<F, R>(&self, entrypoint: F) -> JoinHandle<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let processors = self.processors.clone();

        thread::spawn(move || {
            processors.pin_current_thread_to();
            entrypoint()
        })
    }

    /// Renders the processors of the memory region in the Linux cpulist format.
    #[must_use]
    pub fn describe(&self) -> String {
        cpulist::emit(self.processors.processors().iter().map(|p| p.id()))
    }
}

/// Whether host memory can be placed in the given memory region.
#[must_use]
pub fn is_numa_available(region: MemoryRegionId) -> bool {
    HostRegion::resolve(region).is_ok()
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use static_assertions::assert_impl_all;

    use super::*;

    assert_impl_all!(HostRegion: Send, Clone);

    fn current_region() -> MemoryRegionId {
        ProcessorSet::default().processors().first().memory_region_id()
    }

    #[test]
    fn resolves_region_of_current_processors() {
        let id = current_region();
        let region = HostRegion::resolve(id).unwrap();

        assert_eq!(region.id(), id);
        assert!(region.processors().len() >= 1);
        assert!(
            region
                .processors()
                .processors()
                .iter()
                .all(|p| p.memory_region_id() == id)
        );
    }

    #[test]
    fn nonexistent_region_is_unavailable() {
        let result = HostRegion::resolve(MemoryRegionId::MAX);

        assert!(matches!(
            result,
            Err(Error::NumaUnavailable { region }) if region == MemoryRegionId::MAX
        ));
        assert!(!is_numa_available(MemoryRegionId::MAX));
    }

    #[test]
    #[cfg_attr(miri, ignore)] // Miri cannot pin threads.
    fn pinned_thread_keeps_running() {
        let region = HostRegion::resolve(current_region()).unwrap();

        // A separate thread, so the test runner's thread keeps its affinity.
        let sum = thread::spawn(move || {
            region.pin_current_thread();
            (1..=10_u32).sum::<u32>()
        })
        .join()
        .unwrap();

        assert_eq!(sum, 55);
    }

    #[test]
    fn spawned_thread_returns_result() {
        let region = HostRegion::resolve(current_region()).unwrap();

        let value = region.spawn_pinned(|| 21 * 2).join().unwrap();

        assert_eq!(value, 42);
    }

    #[test]
    fn describe_is_parseable_cpulist() {
        let region = HostRegion::resolve(current_region()).unwrap();

        let parsed = cpulist::parse(&region.describe()).unwrap();

        assert_eq!(parsed.len(), region.processors().len());
    }
}
