//! Owned engine allocations
//!
//! A [`Buffer`] pairs a handle with the engine and storage class that produced
//! it and frees it exactly once on drop. Host access goes straight through the
//! engine for host-visible storage and is staged through a temporary host
//! allocation for device-local storage.

use crate::error::{Error, Result};
use lumen_backends::{BufferHandle, Engine, Storage};
use std::fmt;
use std::sync::Arc;

/// Allocation owned by a tensor or image
pub struct Buffer {
    engine: Arc<dyn Engine>,
    handle: BufferHandle,
    storage: Storage,
    size: usize,
}

impl Buffer {
    #[tracing::instrument(skip(engine), fields(engine = engine.name()))]
    pub fn allocate(engine: &Arc<dyn Engine>, size: usize, storage: Storage) -> Result<Self> {
        let handle = engine.allocate(size, storage)?;
        tracing::debug!(handle = %handle, size_bytes = size, storage = storage.as_str(), "buffer_allocated");
        Ok(Self {
            engine: Arc::clone(engine),
            handle,
            storage,
            size,
        })
    }

    pub fn handle(&self) -> BufferHandle {
        self.handle
    }

    pub fn storage(&self) -> Storage {
        self.storage
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn engine(&self) -> &Arc<dyn Engine> {
        &self.engine
    }

    /// Overwrite the whole buffer with `bytes`
    ///
    /// Waits for outstanding work on the engine first, so the write cannot
    /// race a queued kernel.
    pub fn upload(&self, bytes: &[u8]) -> Result<()> {
        if bytes.len() != self.size {
            return Err(Error::invalid(format!(
                "upload of {} bytes into a {}-byte buffer",
                bytes.len(),
                self.size
            )));
        }
        self.engine.wait()?;
        if self.storage.is_host_visible() {
            self.engine.write_host(self.handle, 0, bytes)?;
            return Ok(());
        }

        let staging = Buffer::allocate(&self.engine, self.size, Storage::Host)?;
        self.engine.write_host(staging.handle, 0, bytes)?;
        self.engine.copy(self.handle, staging.handle, self.size)?;
        Ok(())
    }

    /// Read the whole buffer after outstanding work completes
    pub fn download(&self) -> Result<Vec<u8>> {
        self.engine.wait()?;
        let mut out = vec![0u8; self.size];
        if self.storage.is_host_visible() {
            self.engine.read_host(self.handle, 0, &mut out)?;
            return Ok(out);
        }

        let staging = Buffer::allocate(&self.engine, self.size, Storage::Host)?;
        self.engine.copy(staging.handle, self.handle, self.size)?;
        self.engine.read_host(staging.handle, 0, &mut out)?;
        Ok(out)
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("engine", &self.engine.name())
            .field("handle", &self.handle)
            .field("storage", &self.storage)
            .field("size", &self.size)
            .finish()
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        if let Err(err) = self.engine.free(self.handle, self.storage) {
            tracing::warn!(handle = %self.handle, error = %err, "buffer_free_failed");
        }
    }
}
