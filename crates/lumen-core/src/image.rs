//! Two-dimensional pixel buffers
//!
//! Images are the pipeline's external interface: color, albedo and normal
//! inputs and the denoised output. Rows may be padded (`row_stride` is in
//! bytes), so pixel access goes through unaligned reads.

use crate::buffer::Buffer;
use crate::error::{Error, Result};
use crate::tile::Extent;
use half::f16;
use lumen_backends::{BackendError, BufferHandle, Engine, Storage};
use std::sync::Arc;

/// Pixel encoding of an image
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    /// Three `f32` channels
    Float3,
    /// Four `f32` channels; the fourth is written as 1.0
    Float4,
    /// Three `f16` channels
    Half3,
}

impl PixelFormat {
    pub const fn channels(self) -> usize {
        match self {
            PixelFormat::Float3 | PixelFormat::Half3 => 3,
            PixelFormat::Float4 => 4,
        }
    }

    pub const fn channel_size(self) -> usize {
        match self {
            PixelFormat::Float3 | PixelFormat::Float4 => 4,
            PixelFormat::Half3 => 2,
        }
    }

    pub const fn bytes_per_pixel(self) -> usize {
        self.channels() * self.channel_size()
    }
}

/// Dimensions and encoding of an image
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ImageDesc {
    pub width: usize,
    pub height: usize,
    /// Distance between rows in bytes
    pub row_stride: usize,
    pub format: PixelFormat,
}

impl ImageDesc {
    /// Tightly packed image
    pub fn new(width: usize, height: usize, format: PixelFormat) -> Self {
        Self {
            width,
            height,
            row_stride: width * format.bytes_per_pixel(),
            format,
        }
    }

    pub fn with_row_stride(mut self, row_stride: usize) -> Self {
        self.row_stride = row_stride;
        self
    }

    pub fn extent(&self) -> Extent {
        Extent::new(self.height, self.width)
    }

    pub fn byte_size(&self) -> usize {
        self.height * self.row_stride
    }

    #[inline]
    pub fn pixel_offset(&self, h: usize, w: usize) -> usize {
        h * self.row_stride + w * self.format.bytes_per_pixel()
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.width == 0 || self.height == 0 {
            return Err(Error::invalid(format!("empty image {self:?}")));
        }
        if self.row_stride < self.width * self.format.bytes_per_pixel() {
            return Err(Error::invalid(format!(
                "row stride {} is smaller than a row of {} pixels",
                self.row_stride, self.width
            )));
        }
        self.height
            .checked_mul(self.row_stride)
            .map(|_| ())
            .ok_or_else(|| Error::invalid(format!("image {self:?} is too large")))
    }
}

/// Non-owning reference to an image, bound into operators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageBinding {
    pub handle: BufferHandle,
    pub desc: ImageDesc,
}

/// Image owning its engine allocation
#[derive(Debug)]
pub struct Image {
    buffer: Buffer,
    desc: ImageDesc,
}

impl Image {
    /// Allocate a zero-filled image
    pub fn new(engine: &Arc<dyn Engine>, desc: ImageDesc, storage: Storage) -> Result<Self> {
        desc.validate()?;
        let buffer = Buffer::allocate(engine, desc.byte_size(), storage)?;
        Ok(Self { buffer, desc })
    }

    /// Allocate an image and fill it from interleaved channel values
    pub fn from_pixels(engine: &Arc<dyn Engine>, desc: ImageDesc, storage: Storage, pixels: &[f32]) -> Result<Self> {
        let image = Self::new(engine, desc, storage)?;
        image.write_pixels(pixels)?;
        Ok(image)
    }

    pub fn desc(&self) -> &ImageDesc {
        &self.desc
    }

    pub fn handle(&self) -> BufferHandle {
        self.buffer.handle()
    }

    pub fn binding(&self) -> ImageBinding {
        ImageBinding {
            handle: self.buffer.handle(),
            desc: self.desc,
        }
    }

    /// Overwrite every pixel; `pixels` holds `channels` values per pixel, row-major
    pub fn write_pixels(&self, pixels: &[f32]) -> Result<()> {
        let d = &self.desc;
        let channels = d.format.channels();
        let expected = d.width * d.height * channels;
        if pixels.len() != expected {
            return Err(Error::invalid(format!("expected {expected} channel values, got {}", pixels.len())));
        }

        let mut bytes = vec![0u8; d.byte_size()];
        for (index, pixel) in pixels.chunks_exact(channels).enumerate() {
            let offset = d.pixel_offset(index / d.width, index % d.width);
            store_channels(d.format, &mut bytes[offset..offset + d.format.bytes_per_pixel()], pixel);
        }
        self.buffer.upload(&bytes)
    }

    /// Read every pixel as interleaved `f32` channel values
    pub fn read_pixels(&self) -> Result<Vec<f32>> {
        let d = &self.desc;
        let bytes = self.buffer.download()?;
        let mut out = Vec::with_capacity(d.width * d.height * d.format.channels());
        for h in 0..d.height {
            for w in 0..d.width {
                let offset = d.pixel_offset(h, w);
                for c in 0..d.format.channels() {
                    out.push(load_channel(d.format, &bytes[offset..], c));
                }
            }
        }
        Ok(out)
    }
}

#[inline]
fn load_channel(format: PixelFormat, pixel: &[u8], c: usize) -> f32 {
    let at = c * format.channel_size();
    match format {
        PixelFormat::Float3 | PixelFormat::Float4 => bytemuck::pod_read_unaligned::<f32>(&pixel[at..at + 4]),
        PixelFormat::Half3 => bytemuck::pod_read_unaligned::<f16>(&pixel[at..at + 2]).to_f32(),
    }
}

fn store_channels(format: PixelFormat, pixel: &mut [u8], values: &[f32]) {
    let size = format.channel_size();
    for (c, &value) in values.iter().enumerate().take(format.channels()) {
        let slot = &mut pixel[c * size..(c + 1) * size];
        match format {
            PixelFormat::Float3 | PixelFormat::Float4 => slot.copy_from_slice(bytemuck::bytes_of(&value)),
            PixelFormat::Half3 => slot.copy_from_slice(bytemuck::bytes_of(&f16::from_f32(value))),
        }
    }
}

/// Read the RGB channels of pixel `(h, w)`
#[inline]
pub(crate) fn read_rgb(desc: &ImageDesc, bytes: &[u8], h: usize, w: usize) -> [f32; 3] {
    let pixel = &bytes[desc.pixel_offset(h, w)..];
    [
        load_channel(desc.format, pixel, 0),
        load_channel(desc.format, pixel, 1),
        load_channel(desc.format, pixel, 2),
    ]
}

/// Write RGB to pixel `(h, w)`; four-channel formats get an alpha of 1.0
#[inline]
pub(crate) fn write_rgb(desc: &ImageDesc, bytes: &mut [u8], h: usize, w: usize, rgb: [f32; 3]) {
    let offset = desc.pixel_offset(h, w);
    let pixel = &mut bytes[offset..offset + desc.format.bytes_per_pixel()];
    match desc.format {
        PixelFormat::Float4 => store_channels(desc.format, pixel, &[rgb[0], rgb[1], rgb[2], 1.0]),
        _ => store_channels(desc.format, pixel, &rgb),
    }
}

/// Check that an allocation is large enough for `desc`
pub(crate) fn check_image_bytes(desc: &ImageDesc, len: usize) -> std::result::Result<(), BackendError> {
    if desc.byte_size() > len {
        return Err(BackendError::BufferOutOfBounds {
            offset: 0,
            size: desc.byte_size(),
            buffer_size: len,
        });
    }
    Ok(())
}
