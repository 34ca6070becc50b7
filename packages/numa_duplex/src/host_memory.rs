use std::fmt;
use std::io;
use std::ptr;

use tracing::debug;

use crate::{Error, Result};

/// We write one byte per this many bytes to make sure every page is physically allocated.
/// Pages are never smaller than this on the platforms we support.
const PAGE_TOUCH_STRIDE: usize = 4096;

/// A host memory buffer whose pages are physically allocated by the thread that created it and
/// optionally locked in physical memory, so they cannot be paged out.
///
/// Create the buffer on a thread pinned to a memory region (see
/// [`HostRegion::spawn_pinned()`][crate::HostRegion::spawn_pinned]) to place it in that region.
pub struct PinnedBuffer {
    bytes: Vec<u8>,
    locked: bool,
}

impl PinnedBuffer {
    /// Allocates a buffer of `len` bytes with every byte set to `value`.
    ///
    /// If `lock` is set, the pages are locked in physical memory until the buffer is dropped.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ReserveHostMemory`] if the memory cannot be allocated and
    /// [`Error::LockHostMemory`] if locking was requested but the operating system refused it
    /// (typically because of the locked memory resource limit).
    pub fn filled(len: usize, value: u8, lock: bool) -> Result<Self> {
        let mut bytes = Vec::new();
        bytes
            .try_reserve_exact(len)
            .map_err(|source| Error::ReserveHostMemory { len, source })?;

        // Within the reserved capacity, so this does not allocate.
        bytes.resize(len, value);

        // A zero-filled allocation may be satisfied with lazily mapped zero pages, which would
        // leave physical placement to whichever thread first writes to them. We write ourselves.
        for page in bytes.chunks_mut(PAGE_TOUCH_STRIDE) {
            if let Some(first) = page.first_mut() {
                // SAFETY: The pointer comes from a live mutable reference, so it is valid,
                // aligned and exclusive for the duration of the write.
                unsafe {
                    ptr::write_volatile(first, value);
                }
            }
        }

        let mut buffer = Self {
            bytes,
            locked: false,
        };

        if lock && len > 0 {
            buffer.lock()?;
        }

        debug!(len, locked = buffer.locked, "allocated host buffer");

        Ok(buffer)
    }

    #[cfg(unix)]
    fn lock(&mut self) -> Result<()> {
        // SAFETY: The range is exactly our own live allocation.
        let status = unsafe { libc::mlock(self.bytes.as_ptr().cast(), self.bytes.len()) };

        if status != 0 {
            return Err(Error::LockHostMemory {
                len: self.bytes.len(),
                source: io::Error::last_os_error(),
            });
        }

        self.locked = true;
        Ok(())
    }

    #[cfg(not(unix))]
    fn lock(&mut self) -> Result<()> {
        Err(Error::LockHostMemory {
            len: self.bytes.len(),
            source: io::Error::from(io::ErrorKind::Unsupported),
        })
    }

    /// Length of the buffer in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Whether the buffer has a length of zero bytes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Whether the pages of the buffer are locked in physical memory.
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.locked
    }

    /// The contents of the buffer.
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    /// The contents of the buffer, for writing.
    #[must_use]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.bytes
    }
}

impl fmt::Debug for PinnedBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PinnedBuffer")
            .field("len", &self.bytes.len())
            .field("locked", &self.locked)
            .finish()
    }
}

impl Drop for PinnedBuffer {
    fn drop(&mut self) {
        #[cfg(unix)]
        if self.locked {
            // SAFETY: The range is exactly our own allocation, which is still alive here.
            // Failure to unlock is harmless because the memory is freed right after.
            unsafe {
                libc::munlock(self.bytes.as_ptr().cast(), self.bytes.len());
            }
        }
    }
}
