//! Execution engines for the lumen denoising runtime
//!
//! An [`Engine`] is one logical device: an allocator over a set of storage
//! classes plus a single FIFO command stream. Two engines are provided:
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │                 lumen-core                    │
//! │     (operators, tile scheduler, pipelines)    │
//! └───────────────────────┬──────────────────────┘
//!                         │ Engine trait
//!            ┌────────────┴────────────┐
//!            ▼                         ▼
//!     ┌─────────────┐          ┌───────────────┐
//!     │  CpuEngine  │          │ StreamEngine  │
//!     │ synchronous │          │ worker thread │
//!     │ Host/Managed│          │ Host/Dev/Mgd  │
//!     └─────────────┘          └───────────────┘
//! ```
//!
//! # Usage
//!
//! ```rust
//! use lumen_backends::{CpuEngine, Engine, Storage};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let engine = CpuEngine::new();
//! let src = engine.allocate(16, Storage::Host)?;
//! let dst = engine.allocate(16, Storage::Managed)?;
//!
//! let data = [1.0f32, 2.0, 3.0, 4.0];
//! engine.write_host(src, 0, bytemuck::cast_slice(&data))?;
//! engine.submit_copy(dst, src, 16)?;
//! engine.wait()?;
//!
//! let mut out = [0.0f32; 4];
//! engine.read_host(dst, 0, bytemuck::cast_slice_mut(&mut out))?;
//! assert_eq!(out, data);
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod backends;
pub mod error;
pub mod parallel;

pub use backend::{
    transfer, ArchFamily, BufferHandle, DataType, DeviceCaps, Engine, EngineConfig, HostFunc, Kernel, PostOp,
    Storage,
};
pub use backends::common::{Allocation, MemoryManager, SharedAllocation, MEMORY_ALIGNMENT};
pub use backends::{CpuEngine, Event, StreamEngine};
pub use error::{BackendError, Result};
