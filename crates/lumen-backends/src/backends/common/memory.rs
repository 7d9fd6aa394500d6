//! Storage-class-aware allocator shared by all engines
//!
//! Allocations are word-backed so that typed views (`f32`, `f16`) over the
//! bytes are always correctly aligned.

use crate::backend::{BufferHandle, Storage};
use crate::error::{BackendError, Result};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;

/// Alignment of every allocation in bytes
pub const MEMORY_ALIGNMENT: usize = std::mem::align_of::<u64>();

/// One live allocation
#[derive(Debug)]
pub struct Allocation {
    storage: Storage,
    len: usize,
    words: Vec<u64>,
}

impl Allocation {
    fn zeroed(len: usize, storage: Storage) -> Result<Self> {
        let word_count = len.div_ceil(MEMORY_ALIGNMENT);
        let mut words = Vec::new();
        words.try_reserve_exact(word_count).map_err(|_| BackendError::OutOfMemory {
            requested: len,
            available: 0,
        })?;
        words.resize(word_count, 0);
        Ok(Self { storage, len, words })
    }

    pub fn storage(&self) -> Storage {
        self.storage
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn bytes(&self) -> &[u8] {
        &bytemuck::cast_slice(&self.words)[..self.len]
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut bytemuck::cast_slice_mut(&mut self.words)[..self.len]
    }

    fn check_range(&self, offset: usize, size: usize) -> Result<()> {
        match offset.checked_add(size) {
            Some(end) if end <= self.len => Ok(()),
            _ => Err(BackendError::BufferOutOfBounds {
                offset,
                size,
                buffer_size: self.len,
            }),
        }
    }
}

/// Shared reference to an allocation, locked per access
pub type SharedAllocation = Arc<RwLock<Allocation>>;

#[derive(Debug, Default)]
struct Table {
    buffers: HashMap<u64, SharedAllocation>,
    next_id: u64,
    used_bytes: usize,
}

/// Allocator for one engine
///
/// The table lock is held only while looking up or inserting handles; data
/// access goes through the per-allocation lock returned by [`MemoryManager::get`].
#[derive(Debug)]
pub struct MemoryManager {
    engine: String,
    supported: Vec<Storage>,
    capacity: Option<usize>,
    table: Mutex<Table>,
}

impl MemoryManager {
    pub fn new(engine: impl Into<String>, supported: Vec<Storage>, capacity: Option<usize>) -> Self {
        Self {
            engine: engine.into(),
            supported,
            capacity,
            table: Mutex::new(Table {
                next_id: 1,
                ..Table::default()
            }),
        }
    }

    pub fn supports(&self, storage: Storage) -> bool {
        self.supported.contains(&storage)
    }

    /// Allocate `size` zeroed bytes of the given storage class
    pub fn allocate(&self, size: usize, storage: Storage) -> Result<BufferHandle> {
        if !self.supports(storage) {
            return Err(BackendError::UnsupportedStorage {
                engine: self.engine.clone(),
                storage,
            });
        }

        let mut table = self.table.lock();
        if let Some(capacity) = self.capacity {
            let available = capacity.saturating_sub(table.used_bytes);
            if size > available {
                return Err(BackendError::OutOfMemory {
                    requested: size,
                    available,
                });
            }
        }

        let allocation = Allocation::zeroed(size, storage)?;
        let id = table.next_id;
        table.next_id += 1;
        table.used_bytes += size;
        table.buffers.insert(id, Arc::new(RwLock::new(allocation)));

        tracing::trace!(engine = %self.engine, handle = id, size, storage = storage.as_str(), "allocate");
        Ok(BufferHandle::new(id))
    }

    /// Release an allocation; the storage class must match the allocation's
    pub fn free(&self, handle: BufferHandle, storage: Storage) -> Result<()> {
        let mut table = self.table.lock();
        let allocated = table
            .buffers
            .get(&handle.id())
            .map(|slot| slot.read().storage)
            .ok_or(BackendError::InvalidBufferHandle(handle))?;

        if allocated != storage {
            return Err(BackendError::StorageMismatch {
                handle,
                allocated,
                requested: storage,
            });
        }

        if let Some(slot) = table.buffers.remove(&handle.id()) {
            table.used_bytes -= slot.read().len;
        }
        tracing::trace!(engine = %self.engine, handle = handle.id(), "free");
        Ok(())
    }

    /// Look up an allocation for kernel access
    pub fn get(&self, handle: BufferHandle) -> Result<SharedAllocation> {
        self.table
            .lock()
            .buffers
            .get(&handle.id())
            .cloned()
            .ok_or(BackendError::InvalidBufferHandle(handle))
    }

    pub fn size(&self, handle: BufferHandle) -> Result<usize> {
        Ok(self.get(handle)?.read().len)
    }

    pub fn storage(&self, handle: BufferHandle) -> Result<Storage> {
        Ok(self.get(handle)?.read().storage)
    }

    /// Copy `size` bytes from the start of `src` to the start of `dst`
    pub fn copy(&self, dst: BufferHandle, src: BufferHandle, size: usize) -> Result<()> {
        let src_slot = self.get(src)?;
        if dst == src {
            return src_slot.read().check_range(0, size);
        }
        let dst_slot = self.get(dst)?;

        let src_guard = src_slot.read();
        let mut dst_guard = dst_slot.write();
        src_guard.check_range(0, size)?;
        dst_guard.check_range(0, size)?;
        dst_guard.bytes_mut()[..size].copy_from_slice(&src_guard.bytes()[..size]);
        Ok(())
    }

    /// Write host bytes into a host-visible allocation
    pub fn write_host(&self, handle: BufferHandle, offset: usize, data: &[u8]) -> Result<()> {
        let slot = self.get(handle)?;
        let mut guard = slot.write();
        if !guard.storage.is_host_visible() {
            return Err(BackendError::NotHostVisible {
                handle,
                storage: guard.storage,
            });
        }
        guard.check_range(offset, data.len())?;
        guard.bytes_mut()[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }

    /// Read host-visible bytes into `out`
    pub fn read_host(&self, handle: BufferHandle, offset: usize, out: &mut [u8]) -> Result<()> {
        let slot = self.get(handle)?;
        let guard = slot.read();
        if !guard.storage.is_host_visible() {
            return Err(BackendError::NotHostVisible {
                handle,
                storage: guard.storage,
            });
        }
        guard.check_range(offset, out.len())?;
        out.copy_from_slice(&guard.bytes()[offset..offset + out.len()]);
        Ok(())
    }

    /// Bytes currently allocated
    pub fn used_bytes(&self) -> usize {
        self.table.lock().used_bytes
    }

    /// Number of live allocations
    pub fn live_allocations(&self) -> usize {
        self.table.lock().buffers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host_only() -> MemoryManager {
        MemoryManager::new("test", vec![Storage::Host, Storage::Managed], None)
    }

    #[test]
    fn allocate_is_zeroed_and_aligned() {
        let memory = host_only();
        let handle = memory.allocate(13, Storage::Host).unwrap();
        let slot = memory.get(handle).unwrap();
        let guard = slot.read();
        assert_eq!(guard.len(), 13);
        assert!(guard.bytes().iter().all(|&b| b == 0));
        assert_eq!(guard.bytes().as_ptr() as usize % MEMORY_ALIGNMENT, 0);
    }

    #[test]
    fn unsupported_storage_is_rejected() {
        let memory = host_only();
        let err = memory.allocate(64, Storage::Device).unwrap_err();
        assert!(matches!(err, BackendError::UnsupportedStorage { storage: Storage::Device, .. }));
        assert_eq!(memory.live_allocations(), 0);
    }

    #[test]
    fn capacity_limits_allocations() {
        let memory = MemoryManager::new("small", vec![Storage::Host], Some(100));
        let first = memory.allocate(60, Storage::Host).unwrap();
        let err = memory.allocate(60, Storage::Host).unwrap_err();
        assert!(matches!(err, BackendError::OutOfMemory { requested: 60, available: 40 }));
        memory.free(first, Storage::Host).unwrap();
        assert!(memory.allocate(60, Storage::Host).is_ok());
    }

    #[test]
    fn free_requires_matching_storage_and_happens_once() {
        let memory = host_only();
        let handle = memory.allocate(8, Storage::Managed).unwrap();
        assert!(matches!(
            memory.free(handle, Storage::Host),
            Err(BackendError::StorageMismatch { .. })
        ));
        memory.free(handle, Storage::Managed).unwrap();
        assert!(matches!(
            memory.free(handle, Storage::Managed),
            Err(BackendError::InvalidBufferHandle(_))
        ));
        assert_eq!(memory.used_bytes(), 0);
    }

    #[test]
    fn copy_and_host_access() {
        let memory = host_only();
        let src = memory.allocate(4, Storage::Host).unwrap();
        let dst = memory.allocate(8, Storage::Host).unwrap();
        memory.write_host(src, 0, &[1, 2, 3, 4]).unwrap();
        memory.copy(dst, src, 4).unwrap();

        let mut out = [0u8; 8];
        memory.read_host(dst, 0, &mut out).unwrap();
        assert_eq!(out, [1, 2, 3, 4, 0, 0, 0, 0]);

        assert!(matches!(
            memory.copy(dst, src, 5),
            Err(BackendError::BufferOutOfBounds { .. })
        ));
    }

    #[test]
    fn device_memory_is_not_host_visible() {
        let memory = MemoryManager::new("dev", Storage::ALL.to_vec(), None);
        let handle = memory.allocate(4, Storage::Device).unwrap();
        assert!(matches!(
            memory.write_host(handle, 0, &[0; 4]),
            Err(BackendError::NotHostVisible { .. })
        ));
    }
}
