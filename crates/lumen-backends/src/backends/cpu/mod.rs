//! CPU engine
//!
//! Every submission runs inline on the calling thread, so the stream is
//! trivially FIFO and `wait` has nothing to block on. Kernels fan out over
//! rows with rayon (see [`crate::parallel`]).
//!
//! A failed or panicking command invalidates the engine just like the stream
//! engine: the failing submission returns `DeviceError`, later submissions
//! are refused with `EngineInvalidated`, and `wait` keeps reporting the
//! failure.
//!
//! ```rust
//! use lumen_backends::{CpuEngine, Engine, Storage};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let engine = CpuEngine::new();
//! let src = engine.allocate(4, Storage::Host)?;
//! let dst = engine.allocate(4, Storage::Host)?;
//! engine.write_host(src, 0, &[1, 2, 3, 4])?;
//! engine.copy(dst, src, 4)?;
//!
//! let mut out = [0u8; 4];
//! engine.read_host(dst, 0, &mut out)?;
//! assert_eq!(out, [1, 2, 3, 4]);
//! engine.free(src, Storage::Host)?;
//! engine.free(dst, Storage::Host)?;
//! # Ok(())
//! # }
//! ```

use crate::backend::{BufferHandle, DeviceCaps, Engine, EngineConfig, HostFunc, Kernel, Storage};
use crate::backends::common::MemoryManager;
use crate::error::{BackendError, Result};
use parking_lot::Mutex;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

/// Synchronous engine over host memory
#[derive(Debug, Clone)]
pub struct CpuEngine {
    caps: DeviceCaps,
    memory: Arc<MemoryManager>,
    failure: Arc<Mutex<Option<String>>>,
}

impl CpuEngine {
    /// Create an engine for the detected host CPU
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    #[tracing::instrument(skip(config), fields(capacity = ?config.capacity))]
    pub fn with_config(config: EngineConfig) -> Self {
        let caps = config.caps.unwrap_or_else(DeviceCaps::detect_host);
        let supported = Storage::ALL
            .into_iter()
            .filter(|&storage| storage != Storage::Device && caps.supports_storage(storage))
            .collect();

        tracing::debug!(arch = ?caps.arch, vector_width = caps.vector_width, "cpu_engine_created");
        Self {
            memory: Arc::new(MemoryManager::new("cpu", supported, config.capacity)),
            failure: Arc::new(Mutex::new(None)),
            caps,
        }
    }

    pub fn memory(&self) -> &MemoryManager {
        &self.memory
    }

    /// Whether an earlier command failed
    pub fn is_invalidated(&self) -> bool {
        self.failure.lock().is_some()
    }

    /// Run one command inline, recording its failure
    fn run<F>(&self, label: &'static str, command: F) -> Result<()>
    where
        F: FnOnce() -> Result<()>,
    {
        if let Some(reason) = self.failure.lock().clone() {
            return Err(BackendError::EngineInvalidated(reason));
        }

        let reason = match panic::catch_unwind(AssertUnwindSafe(command)) {
            Ok(Ok(())) => return Ok(()),
            Ok(Err(err)) => err.to_string(),
            Err(_) => format!("{label} command panicked"),
        };
        tracing::error!(command = label, %reason, "cpu_command_failed");
        *self.failure.lock() = Some(reason.clone());
        Err(BackendError::DeviceError(reason))
    }
}

impl Default for CpuEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine for CpuEngine {
    fn name(&self) -> &str {
        "cpu"
    }

    fn caps(&self) -> &DeviceCaps {
        &self.caps
    }

    fn is_synchronous(&self) -> bool {
        true
    }

    fn allocate(&self, byte_size: usize, storage: Storage) -> Result<BufferHandle> {
        let start = std::time::Instant::now();
        let handle = self.memory.allocate(byte_size, storage)?;
        lumen_tracing::performance::record_allocation(byte_size, storage.as_str(), start.elapsed().as_micros() as u64);
        Ok(handle)
    }

    fn free(&self, handle: BufferHandle, storage: Storage) -> Result<()> {
        self.memory.free(handle, storage)
    }

    fn buffer_size(&self, handle: BufferHandle) -> Result<usize> {
        self.memory.size(handle)
    }

    fn submit_copy(&self, dst: BufferHandle, src: BufferHandle, byte_size: usize) -> Result<()> {
        self.run("copy", || self.memory.copy(dst, src, byte_size))
    }

    fn submit_host_func(&self, func: HostFunc) -> Result<()> {
        self.run("host_func", func)
    }

    fn submit_barrier(&self) -> Result<()> {
        self.run("barrier", || Ok(()))
    }

    fn submit_kernel(&self, kernel: Kernel) -> Result<()> {
        self.run("kernel", || kernel(&self.memory))
    }

    fn wait(&self) -> Result<()> {
        match self.failure.lock().clone() {
            Some(reason) => Err(BackendError::DeviceError(reason)),
            None => Ok(()),
        }
    }

    fn write_host(&self, handle: BufferHandle, offset: usize, data: &[u8]) -> Result<()> {
        self.memory.write_host(handle, offset, data)
    }

    fn read_host(&self, handle: BufferHandle, offset: usize, out: &mut [u8]) -> Result<()> {
        self.memory.read_host(handle, offset, out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn device_storage_is_rejected() {
        let engine = CpuEngine::new();
        let err = engine.allocate(1024, Storage::Device).unwrap_err();
        assert!(matches!(err, BackendError::UnsupportedStorage { storage: Storage::Device, .. }));
        assert_eq!(engine.memory().live_allocations(), 0);
    }

    #[test]
    fn host_func_runs_inline() {
        let engine = CpuEngine::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&counter);
        engine
            .submit_host_func(Box::new(move || {
                seen.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }))
            .unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        engine.wait().unwrap();
        engine.wait().unwrap();
    }

    #[test]
    fn failure_invalidates_the_engine() {
        let engine = CpuEngine::new();
        let err = engine
            .submit_host_func(Box::new(|| Err(BackendError::execution_error("boom"))))
            .unwrap_err();
        assert!(matches!(err, BackendError::DeviceError(ref reason) if reason.contains("boom")));
        assert!(engine.is_invalidated());

        let counter = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&counter);
        let refused = engine.submit_host_func(Box::new(move || {
            seen.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }));
        assert!(matches!(refused, Err(BackendError::EngineInvalidated(_))));
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        assert!(matches!(
            engine.submit_barrier(),
            Err(BackendError::EngineInvalidated(_))
        ));
        assert!(matches!(engine.wait(), Err(BackendError::DeviceError(_))));
        assert!(matches!(engine.wait(), Err(BackendError::DeviceError(_))));
    }

    #[test]
    fn panicking_kernel_is_reported_not_propagated() {
        let engine = CpuEngine::new();
        let err = engine.submit_kernel(Box::new(|_| panic!("kernel bug"))).unwrap_err();
        assert!(err.to_string().contains("panicked"));
        assert!(matches!(engine.wait(), Err(BackendError::DeviceError(_))));
    }

    #[test]
    fn out_of_bounds_kernel_access_is_a_device_failure() {
        let engine = CpuEngine::new();
        let handle = engine.allocate(4, Storage::Host).unwrap();
        let err = engine
            .submit_kernel(Box::new(move |memory| {
                let mut out = [0u8; 8];
                memory.read_host(handle, 0, &mut out)
            }))
            .unwrap_err();
        assert!(err.is_device_failure());
    }

    #[test]
    fn kernel_sees_engine_memory() {
        let engine = CpuEngine::new();
        let handle = engine.allocate(4, Storage::Host).unwrap();
        engine
            .submit_kernel(Box::new(move |memory| {
                memory.get(handle)?.write().bytes_mut().fill(9);
                Ok(())
            }))
            .unwrap();

        let mut out = [0u8; 4];
        engine.read_host(handle, 0, &mut out).unwrap();
        assert_eq!(out, [9; 4]);
    }

    #[test]
    fn capacity_is_enforced() {
        let engine = CpuEngine::with_config(EngineConfig::default().with_capacity(64));
        assert!(matches!(
            engine.allocate(65, Storage::Host),
            Err(BackendError::OutOfMemory { .. })
        ));
    }
}
