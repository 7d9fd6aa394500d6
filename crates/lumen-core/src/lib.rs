//! # lumen-core - tiled denoising pipelines
//!
//! Runs a convolutional denoising network over images of any size within a
//! fixed memory budget. The image is cut into tiles; every tile passes through
//! all stages before the next one starts, so only one tile's worth of
//! intermediate tensors is ever allocated.
//!
//! ## Architecture
//!
//! ```text
//! Executor ── Engine (lumen-backends) + Registry (operator choice per DeviceCaps)
//!    │
//!    └── PipelineBuilder ─► Pipeline ─► run(memory_budget)
//!                                         │
//!                     PipelineGeometry::plan ─► TilePlan
//!                                         │
//!                     for tile: for stage: Op::set_tile + Op::execute
//! ```
//!
//! - [`tensor`] / [`image`] - owning buffers and their copyable bindings
//! - [`tile`] - tile descriptors handed to operators
//! - [`ops`] - convolution, pooling, upsampling, process and exposure operators
//! - [`registry`] - implementation, layout and element type selection
//! - [`scheduler`] - stage geometry and budget-driven tile planning
//! - [`pipeline`] - stage topology, bindings and the tiled run
//! - [`transfer`] - transfer curves of the process operators
//! - [`config`] - run options from code or the environment
//!
//! ## Example
//!
//! ```
//! use lumen_core::{BackendType, ConvDesc, ConvWeights, Destination, Executor, Source};
//! use std::sync::Arc;
//!
//! let exec = Executor::new(BackendType::Cpu)?;
//! let mut w = vec![0.0; 3 * 3 * 9];
//! for c in 0..3 {
//!     w[(c * 3 + c) * 9 + 4] = 1.0;
//! }
//! let identity = Arc::new(ConvWeights::new(3, 3, 3, w, vec![0.0; 3])?);
//!
//! let mut pipeline = exec
//!     .pipeline(32, 32, 3)
//!     .conv(identity.clone(), ConvDesc::relu())?
//!     .conv(identity, ConvDesc::default())?
//!     .build()?;
//!
//! let data: Vec<f32> = (0..3 * 32 * 32).map(|i| (i % 5) as f32).collect();
//! let src = exec.tensor_from_chw(3, 32, 32, &data)?;
//! let dst = exec.tensor(3, 32, 32)?;
//! pipeline.set_source(Source::Tensor(src.binding()))?;
//! pipeline.set_destination(Destination::Tensor(dst.binding()))?;
//! pipeline.run(16 * 1024)?;
//! assert_eq!(dst.read_chw()?, data);
//! # Ok::<(), lumen_core::Error>(())
//! ```

pub mod buffer;
pub mod config;
pub mod error;
pub mod executor;
pub mod image;
pub mod ops;
pub mod pipeline;
pub mod registry;
pub mod scheduler;
pub mod tensor;
pub mod tile;
pub mod transfer;

pub use buffer::Buffer;
pub use config::{RunConfig, DEFAULT_MEMORY_BUDGET};
pub use error::{Error, ErrorKind, Result};
pub use executor::{BackendType, Executor};
pub use image::{Image, ImageBinding, ImageDesc, PixelFormat};
pub use ops::{
    Autoexposure, Conv, ConvDesc, ConvImpl, ConvWeights, ImageCopy, InputProcess, Op, OutputProcess, Pool,
    ProcessDesc, ScaleSource, Upsample,
};
pub use pipeline::{Destination, Pipeline, PipelineBuilder, Source};
pub use registry::Registry;
pub use scheduler::{PipelineGeometry, Resample, StageGeometry, TilePlan, TileRect};
pub use tensor::{Layout, Tensor, TensorBinding, TensorDesc};
pub use tile::{Extent, Tile};
pub use transfer::{Linear, Log, Srgb, TransferFunction};

pub use lumen_backends::{ArchFamily, DataType, DeviceCaps, Engine, EngineConfig, PostOp, Storage};
