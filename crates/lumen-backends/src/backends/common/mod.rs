//! Infrastructure shared by every engine

pub mod memory;

pub use memory::{Allocation, MemoryManager, SharedAllocation, MEMORY_ALIGNMENT};
