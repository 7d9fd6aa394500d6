//! Engine implementations
//!
//! - `common` - allocation tables shared by all engines
//! - `cpu` - synchronous host engine
//! - `stream` - asynchronous engine with a worker-driven command queue

pub mod common;
pub mod cpu;
pub mod stream;

pub use cpu::CpuEngine;
pub use stream::{Event, StreamEngine};
