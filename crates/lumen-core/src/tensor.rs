//! Three-dimensional (C, H, W) tensors
//!
//! A [`TensorDesc`] fixes dimensions, memory layout and element type. Blocked
//! layouts (`Chw8c`, `Chw16c`) group channels into blocks of 8 or 16 that sit
//! innermost, so the channel count is padded up to a multiple of the block.
//!
//! ```text
//! Chw     index = (c·H + h)·W + w
//! ChwNc   index = ((c/N)·H + h)·W·N + w·N + c%N
//! ```

use crate::buffer::Buffer;
use crate::error::{Error, Result};
use crate::tile::Extent;
use half::f16;
use lumen_backends::{BackendError, BufferHandle, DataType, Engine, Storage};
use std::sync::Arc;

/// Memory layout of a tensor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Layout {
    Chw,
    Chw8c,
    Chw16c,
}

impl Layout {
    /// Channels stored together innermost
    pub const fn block(self) -> usize {
        match self {
            Layout::Chw => 1,
            Layout::Chw8c => 8,
            Layout::Chw16c => 16,
        }
    }

    /// Layout matching a vector unit of `width` f32 lanes
    pub fn for_vector_width(width: usize) -> Self {
        match width {
            8 => Layout::Chw8c,
            16 => Layout::Chw16c,
            _ => Layout::Chw,
        }
    }
}

/// Shape, layout and element type of a tensor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TensorDesc {
    pub channels: usize,
    pub height: usize,
    pub width: usize,
    pub layout: Layout,
    pub data_type: DataType,
}

impl TensorDesc {
    pub fn new(channels: usize, height: usize, width: usize, layout: Layout, data_type: DataType) -> Self {
        Self {
            channels,
            height,
            width,
            layout,
            data_type,
        }
    }

    pub fn extent(&self) -> Extent {
        Extent::new(self.height, self.width)
    }

    /// Channel count rounded up to the layout block
    pub fn padded_channels(&self) -> usize {
        self.channels.div_ceil(self.layout.block()) * self.layout.block()
    }

    pub fn num_elements(&self) -> usize {
        self.padded_channels() * self.height * self.width
    }

    pub fn byte_size(&self) -> usize {
        self.num_elements() * self.data_type.size()
    }

    /// Bytes per spatial position, including channel padding
    pub fn bytes_per_pixel(&self) -> usize {
        self.padded_channels() * self.data_type.size()
    }

    /// Element index of `(c, h, w)`
    #[inline]
    pub fn index(&self, c: usize, h: usize, w: usize) -> usize {
        let n = self.layout.block();
        ((c / n * self.height + h) * self.width + w) * n + c % n
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.channels == 0 || self.height == 0 || self.width == 0 {
            return Err(Error::invalid(format!("empty tensor {self:?}")));
        }
        self.padded_channels()
            .checked_mul(self.height)
            .and_then(|n| n.checked_mul(self.width))
            .and_then(|n| n.checked_mul(self.data_type.size()))
            .map(|_| ())
            .ok_or_else(|| Error::invalid(format!("tensor {self:?} is too large")))
    }
}

/// Non-owning reference to a tensor, bound into operators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TensorBinding {
    pub handle: BufferHandle,
    pub desc: TensorDesc,
}

/// Tensor owning its engine allocation
#[derive(Debug)]
pub struct Tensor {
    buffer: Buffer,
    desc: TensorDesc,
}

impl Tensor {
    /// Allocate a zero-filled tensor
    pub fn new(engine: &Arc<dyn Engine>, desc: TensorDesc, storage: Storage) -> Result<Self> {
        desc.validate()?;
        let buffer = Buffer::allocate(engine, desc.byte_size(), storage)?;
        Ok(Self { buffer, desc })
    }

    /// Allocate a tensor and fill it from planar CHW values
    pub fn from_chw(engine: &Arc<dyn Engine>, desc: TensorDesc, storage: Storage, data: &[f32]) -> Result<Self> {
        let tensor = Self::new(engine, desc, storage)?;
        tensor.write_chw(data)?;
        Ok(tensor)
    }

    pub fn desc(&self) -> &TensorDesc {
        &self.desc
    }

    pub fn handle(&self) -> BufferHandle {
        self.buffer.handle()
    }

    pub fn storage(&self) -> Storage {
        self.buffer.storage()
    }

    pub fn binding(&self) -> TensorBinding {
        TensorBinding {
            handle: self.buffer.handle(),
            desc: self.desc,
        }
    }

    /// Overwrite the tensor with planar CHW values, converting layout and type
    pub fn write_chw(&self, data: &[f32]) -> Result<()> {
        let d = &self.desc;
        let expected = d.channels * d.height * d.width;
        if data.len() != expected {
            return Err(Error::invalid(format!(
                "expected {expected} CHW values, got {}",
                data.len()
            )));
        }

        let mut bytes = vec![0u8; d.byte_size()];
        {
            let mut elements = elements_mut(d, &mut bytes)?;
            for c in 0..d.channels {
                for h in 0..d.height {
                    for w in 0..d.width {
                        elements.set(d.index(c, h, w), data[(c * d.height + h) * d.width + w]);
                    }
                }
            }
        }
        self.buffer.upload(&bytes)
    }

    /// Read the tensor back as planar CHW `f32` values
    pub fn read_chw(&self) -> Result<Vec<f32>> {
        let d = &self.desc;
        let bytes = self.buffer.download()?;
        let elements = elements(d, &bytes)?;
        let mut out = Vec::with_capacity(d.channels * d.height * d.width);
        for c in 0..d.channels {
            for h in 0..d.height {
                for w in 0..d.width {
                    out.push(elements.get(d.index(c, h, w)));
                }
            }
        }
        Ok(out)
    }
}

/// Typed read view over tensor bytes
pub(crate) enum Elements<'a> {
    F32(&'a [f32]),
    F16(&'a [f16]),
}

impl Elements<'_> {
    #[inline]
    pub(crate) fn get(&self, index: usize) -> f32 {
        match self {
            Elements::F32(data) => data[index],
            Elements::F16(data) => data[index].to_f32(),
        }
    }
}

/// Typed write view over tensor bytes
pub(crate) enum ElementsMut<'a> {
    F32(&'a mut [f32]),
    F16(&'a mut [f16]),
}

impl ElementsMut<'_> {
    #[inline]
    pub(crate) fn set(&mut self, index: usize, value: f32) {
        match self {
            ElementsMut::F32(data) => data[index] = value,
            ElementsMut::F16(data) => data[index] = f16::from_f32(value),
        }
    }
}

fn tensor_bytes(desc: &TensorDesc, len: usize) -> std::result::Result<usize, BackendError> {
    let size = desc.byte_size();
    if size > len {
        return Err(BackendError::BufferOutOfBounds {
            offset: 0,
            size,
            buffer_size: len,
        });
    }
    Ok(size)
}

pub(crate) fn elements<'a>(desc: &TensorDesc, bytes: &'a [u8]) -> std::result::Result<Elements<'a>, BackendError> {
    let bytes = &bytes[..tensor_bytes(desc, bytes.len())?];
    let cast_failed = |err: bytemuck::PodCastError| BackendError::execution_error(format!("tensor view: {err:?}"));
    Ok(match desc.data_type {
        DataType::F32 => Elements::F32(bytemuck::try_cast_slice(bytes).map_err(cast_failed)?),
        DataType::F16 => Elements::F16(bytemuck::try_cast_slice(bytes).map_err(cast_failed)?),
    })
}

pub(crate) fn elements_mut<'a>(
    desc: &TensorDesc,
    bytes: &'a mut [u8],
) -> std::result::Result<ElementsMut<'a>, BackendError> {
    let size = tensor_bytes(desc, bytes.len())?;
    let bytes = &mut bytes[..size];
    let cast_failed = |err: bytemuck::PodCastError| BackendError::execution_error(format!("tensor view: {err:?}"));
    Ok(match desc.data_type {
        DataType::F32 => ElementsMut::F32(bytemuck::try_cast_slice_mut(bytes).map_err(cast_failed)?),
        DataType::F16 => ElementsMut::F16(bytemuck::try_cast_slice_mut(bytes).map_err(cast_failed)?),
    })
}
