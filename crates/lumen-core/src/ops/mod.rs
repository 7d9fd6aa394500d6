//! Tileable operators
//!
//! Every operator is bound to its buffers when it is constructed and keeps
//! only its current [`Tile`] as state. `execute` hands one kernel to the
//! engine's command stream: the CPU engine runs it inline (rows fanned out
//! over rayon), the stream engine runs it on its worker.
//!
//! - [`Conv`] - convolution with optional ReLU and fused pool/upsample
//! - [`Pool`] - 2x2 max pooling
//! - [`Upsample`] - 2x nearest-neighbor upsampling
//! - [`InputProcess`] - images to tensor channels
//! - [`OutputProcess`] - tensor channels to an image
//! - [`ImageCopy`] - image to image
//! - [`Autoexposure`] - whole-image exposure estimate

pub mod autoexposure;
pub mod conv;
pub mod image_copy;
pub mod input_process;
pub mod output_process;
pub mod pool;
pub mod upsample;

pub use autoexposure::Autoexposure;
pub use conv::{Conv, ConvDesc, ConvImpl, ConvWeights};
pub use image_copy::ImageCopy;
pub use input_process::InputProcess;
pub use output_process::OutputProcess;
pub use pool::Pool;
pub use upsample::Upsample;

use crate::error::{Error, Result};
use crate::tensor::{elements, TensorBinding};
use crate::tile::Tile;
use crate::transfer::TransferFunction;
use lumen_backends::{BackendError, BufferHandle, DataType, Engine, MemoryManager};
use std::fmt;
use std::sync::Arc;

/// Capability set shared by all operators
pub trait Op: Send + fmt::Debug {
    fn name(&self) -> &'static str;

    /// Current tile; the full destination until `set_tile` is called
    fn tile(&self) -> &Tile;

    /// Replace the current tile
    ///
    /// # Errors
    ///
    /// `InvalidArgument` if the destination rectangle leaves the destination
    /// buffer or the tile asks for source data the operator may not read.
    fn set_tile(&mut self, tile: Tile) -> Result<()>;

    /// Enqueue the current tile on the owning engine
    fn execute(&self) -> Result<()>;
}

/// Conversion options of the input and output process operators
#[derive(Debug, Clone)]
pub struct ProcessDesc {
    pub transfer: Arc<dyn TransferFunction>,
    pub hdr: bool,
    pub scale: ScaleSource,
}

/// Input scale applied by the process operators
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ScaleSource {
    Constant(f32),
    /// First element of a one-element `f32` tensor, read when the kernel runs
    Tensor(TensorBinding),
}

impl ScaleSource {
    pub(crate) fn validate(&self) -> Result<()> {
        match self {
            ScaleSource::Constant(scale) if !scale.is_finite() || *scale <= 0.0 => {
                Err(Error::invalid(format!("input scale {scale} must be finite and positive")))
            }
            ScaleSource::Tensor(binding) if binding.desc.data_type != DataType::F32 => {
                Err(Error::invalid("exposure tensor must hold f32"))
            }
            _ => Ok(()),
        }
    }

    pub(crate) fn handle(&self) -> Option<BufferHandle> {
        match self {
            ScaleSource::Constant(_) => None,
            ScaleSource::Tensor(binding) => Some(binding.handle),
        }
    }

    pub(crate) fn resolve(&self, memory: &MemoryManager) -> std::result::Result<f32, BackendError> {
        match self {
            ScaleSource::Constant(scale) => Ok(*scale),
            ScaleSource::Tensor(binding) => {
                let allocation = memory.get(binding.handle)?;
                let guard = allocation.read();
                Ok(elements(&binding.desc, guard.bytes())?.get(0))
            }
        }
    }
}

/// Reject bindings that alias: kernels lock source and destination separately
pub(crate) fn ensure_distinct(handles: &[BufferHandle]) -> Result<()> {
    for (i, a) in handles.iter().enumerate() {
        if handles[i + 1..].contains(a) {
            return Err(Error::invalid(format!("{a} is bound more than once; in-place operators are not supported")));
        }
    }
    Ok(())
}

/// Submit `kernel` for the current tile, logging it at trace level
pub(crate) fn submit<K>(engine: &Arc<dyn Engine>, name: &'static str, tile: &Tile, kernel: K) -> Result<()>
where
    K: FnOnce(&MemoryManager) -> std::result::Result<(), BackendError> + Send + 'static,
{
    tracing::trace!(
        op = name,
        h_dst = tile.h_dst,
        w_dst = tile.w_dst,
        height = tile.height,
        width = tile.width,
        "op_execute"
    );
    let pixels = tile.height * tile.width;
    engine.submit_kernel(Box::new(move |memory| {
        let span = lumen_tracing::perf_span!(name, pixels = pixels);
        let result = kernel(memory);
        lumen_tracing::performance::record_throughput(name, pixels, span.elapsed_us());
        result
    }))?;
    Ok(())
}

#[inline]
pub(crate) fn sanitize(value: f32) -> f32 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(-f32::MAX, f32::MAX)
    }
}
