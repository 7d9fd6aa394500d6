//! Exposure estimate for HDR input
//!
//! The image is split into 16x16 bins (edge bins are smaller). Each bin's
//! mean luminance contributes its `log2` when it exceeds `EPS`; the result is
//! `KEY / 2^mean` over contributing bins, or 1.0 when no bin is bright enough.
//! Bin sums are reduced in groups of the registry's reduction width.
//!
//! The operator is never tiled: it always reads the complete image.

use super::{ensure_distinct, submit, Op};
use crate::error::{Error, Result};
use crate::image::{check_image_bytes, read_rgb, ImageBinding, ImageDesc};
use crate::tensor::{elements_mut, TensorBinding};
use crate::tile::Tile;
use lumen_backends::parallel::parallel_map;
use lumen_backends::{DataType, Engine};
use std::sync::Arc;

pub const BIN_SIZE: usize = 16;
pub const KEY: f32 = 0.18;
pub const EPS: f32 = 1e-8;

#[inline]
pub fn luminance(rgb: [f32; 3]) -> f32 {
    0.212_671 * rgb[0] + 0.715_160 * rgb[1] + 0.072_169 * rgb[2]
}

#[derive(Debug)]
pub struct Autoexposure {
    engine: Arc<dyn Engine>,
    src: ImageBinding,
    dst: TensorBinding,
    reduction_width: usize,
    tile: Tile,
}

impl Autoexposure {
    /// `dst` receives the exposure in its first element
    pub fn new(engine: Arc<dyn Engine>, reduction_width: usize, src: ImageBinding, dst: TensorBinding) -> Result<Self> {
        ensure_distinct(&[src.handle, dst.handle])?;
        if dst.desc.data_type != DataType::F32 {
            return Err(Error::invalid("exposure tensor must hold f32"));
        }
        if reduction_width == 0 {
            return Err(Error::invalid("reduction width must be positive"));
        }
        Ok(Self {
            engine,
            src,
            dst,
            reduction_width,
            tile: Tile::full(src.desc.extent()),
        })
    }

    pub fn reduction_width(&self) -> usize {
        self.reduction_width
    }
}

impl Op for Autoexposure {
    fn name(&self) -> &'static str {
        "autoexposure"
    }

    fn tile(&self) -> &Tile {
        &self.tile
    }

    /// Only the whole-image tile is accepted
    fn set_tile(&mut self, tile: Tile) -> Result<()> {
        if tile != Tile::full(self.src.desc.extent()) {
            return Err(Error::invalid("autoexposure always processes the whole image"));
        }
        Ok(())
    }

    fn execute(&self) -> Result<()> {
        let (src, dst, width) = (self.src, self.dst, self.reduction_width);
        submit(&self.engine, self.name(), &self.tile, move |memory| {
            let exposure = {
                let allocation = memory.get(src.handle)?;
                let guard = allocation.read();
                check_image_bytes(&src.desc, guard.len())?;
                estimate_exposure(&src.desc, guard.bytes(), width)?
            };
            tracing::debug!(exposure, "autoexposure_computed");

            let allocation = memory.get(dst.handle)?;
            let mut guard = allocation.write();
            elements_mut(&dst.desc, guard.bytes_mut())?.set(0, exposure);
            Ok(())
        })
    }
}

fn estimate_exposure(desc: &ImageDesc, bytes: &[u8], reduction_width: usize) -> lumen_backends::Result<f32> {
    let bins_h = desc.height.div_ceil(BIN_SIZE);
    let bins_w = desc.width.div_ceil(BIN_SIZE);

    let bins = parallel_map(bins_h * bins_w, |bin| {
        let (by, bx) = (bin / bins_w, bin % bins_w);
        let (h0, w0) = (by * BIN_SIZE, bx * BIN_SIZE);
        let (h1, w1) = ((h0 + BIN_SIZE).min(desc.height), (w0 + BIN_SIZE).min(desc.width));
        let mut sum = 0.0f32;
        for h in h0..h1 {
            for w in w0..w1 {
                sum += luminance(read_rgb(desc, bytes, h, w));
            }
        }
        Ok(sum / ((h1 - h0) * (w1 - w0)) as f32)
    })?;

    let (log_sum, count) = bins
        .chunks(reduction_width)
        .map(|group| {
            group
                .iter()
                .filter(|&&l| l > EPS)
                .fold((0.0f32, 0usize), |(s, n), &l| (s + l.log2(), n + 1))
        })
        .fold((0.0f32, 0usize), |(s, n), (gs, gn)| (s + gs, n + gn));

    Ok(if count > 0 {
        KEY / (log_sum / count as f32).exp2()
    } else {
        1.0
    })
}
