//! Explicit data movement between independent engines

use super::traits::Engine;
use super::types::BufferHandle;
use crate::error::{BackendError, Result};

/// Move `byte_size` bytes from `src` on `src_engine` to `dst` on `dst_engine`
///
/// Waits for `src_engine` before reading, so every previously submitted write
/// to `src` is visible. Both buffers must be host-visible; device-local data
/// has to be copied into a host-visible staging buffer on its own engine first.
/// The write on `dst_engine` is performed from the calling thread, so callers
/// must also wait on `dst_engine` if it may still be reading `dst`.
pub fn transfer(
    src_engine: &dyn Engine,
    src: BufferHandle,
    dst_engine: &dyn Engine,
    dst: BufferHandle,
    byte_size: usize,
) -> Result<()> {
    let start = std::time::Instant::now();
    src_engine.wait()?;

    let mut staging = Vec::new();
    staging
        .try_reserve_exact(byte_size)
        .map_err(|_| BackendError::OutOfMemory {
            requested: byte_size,
            available: 0,
        })?;
    staging.resize(byte_size, 0u8);

    src_engine.read_host(src, 0, &mut staging)?;
    dst_engine.write_host(dst, 0, &staging)?;

    lumen_tracing::performance::record_transfer(byte_size, "D2D", start.elapsed().as_micros() as u64);
    tracing::debug!(
        src_engine = src_engine.name(),
        dst_engine = dst_engine.name(),
        bytes = byte_size,
        "cross_engine_transfer"
    );
    Ok(())
}
