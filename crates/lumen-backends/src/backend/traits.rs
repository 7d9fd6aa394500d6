//! Engine trait: one device, one command stream, one allocator

use super::types::{BufferHandle, DeviceCaps, Storage};
use crate::backends::common::MemoryManager;
use crate::error::Result;
use std::fmt;

/// Host-side function interleaved with device work
pub type HostFunc = Box<dyn FnOnce() -> Result<()> + Send + 'static>;

/// Operator kernel, executed against the engine's memory
pub type Kernel = Box<dyn FnOnce(&MemoryManager) -> Result<()> + Send + 'static>;

/// One logical device with a FIFO command stream
///
/// ```text
///   submit_copy ──┐
///   submit_kernel ├──▶ [ cmd ][ cmd ][ cmd ] ──▶ tail ──▶ wait()
///   submit_barrier┘         (FIFO, no reordering)
/// ```
///
/// Every `submit_*` call depends on the current stream tail and becomes the
/// new tail. Asynchronous engines return immediately; synchronous engines run
/// the command before returning. Only [`Engine::wait`] blocks on outstanding
/// work.
///
/// The stream tail has a single writer: an engine is shared across operators
/// of one pipeline, but submissions from several threads at once need external
/// mutual exclusion to keep a meaningful order.
///
/// Buffers referenced by in-flight commands must not be freed before
/// [`Engine::wait`] returns.
pub trait Engine: Send + Sync + fmt::Debug {
    /// Short backend name used in logs and errors
    fn name(&self) -> &str;

    /// Capabilities computed when the engine was created
    fn caps(&self) -> &DeviceCaps;

    /// Whether submissions complete before returning
    fn is_synchronous(&self) -> bool;

    /// Allocate `byte_size` zeroed bytes of `storage`
    ///
    /// # Errors
    ///
    /// `UnsupportedStorage` if this backend lacks the storage class,
    /// `OutOfMemory` if the request exceeds the remaining capacity.
    fn allocate(&self, byte_size: usize, storage: Storage) -> Result<BufferHandle>;

    /// Release an allocation made with the same storage class
    fn free(&self, handle: BufferHandle, storage: Storage) -> Result<()>;

    /// Size in bytes of a live allocation
    fn buffer_size(&self, handle: BufferHandle) -> Result<usize>;

    /// Enqueue a copy of `byte_size` bytes from `src` to `dst`
    fn submit_copy(&self, dst: BufferHandle, src: BufferHandle, byte_size: usize) -> Result<()>;

    /// Enqueue a host function
    fn submit_host_func(&self, func: HostFunc) -> Result<()>;

    /// Enqueue a synchronization point
    fn submit_barrier(&self) -> Result<()>;

    /// Enqueue an operator kernel
    fn submit_kernel(&self, kernel: Kernel) -> Result<()>;

    /// Block until the stream tail completes, then clear it
    ///
    /// # Errors
    ///
    /// `DeviceError` if any command since the last wait failed. The failure is
    /// fatal: the engine must be recreated.
    fn wait(&self) -> Result<()>;

    /// Synchronous copy
    fn copy(&self, dst: BufferHandle, src: BufferHandle, byte_size: usize) -> Result<()> {
        self.submit_copy(dst, src, byte_size)?;
        self.wait()
    }

    /// Write into host-visible memory from the calling thread
    fn write_host(&self, handle: BufferHandle, offset: usize, data: &[u8]) -> Result<()>;

    /// Read host-visible memory from the calling thread
    fn read_host(&self, handle: BufferHandle, offset: usize, out: &mut [u8]) -> Result<()>;
}
