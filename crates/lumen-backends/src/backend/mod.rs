//! Engine trait and the types it is expressed in

mod handoff;
mod traits;
mod types;

pub use handoff::transfer;
pub use traits::{Engine, HostFunc, Kernel};
pub use types::{ArchFamily, BufferHandle, DataType, DeviceCaps, EngineConfig, PostOp, Storage};
