//! Convolution with fused activation and resampling
//!
//! Output value for channel `o` at source position `(r, c)`:
//!
//! ```text
//! y = bias[o] + Σ_ic Σ_kh Σ_kw w[o][ic][kh][kw] · x[ic][r + kh - k/2][c + kw - k/2]
//! ```
//!
//! summed in exactly that order, with `x` = 0 outside the tile's source
//! bounds. Both implementations keep this order per output, so results do not
//! depend on the implementation or on how the image is tiled.

use super::{ensure_distinct, submit, Op};
use crate::error::{Error, Result};
use crate::tensor::{elements, elements_mut, Elements, TensorBinding, TensorDesc};
use crate::tile::{Extent, Tile};
use lumen_backends::parallel::parallel_map;
use lumen_backends::{BackendError, Engine, MemoryManager, PostOp};
use std::sync::Arc;

/// Convolution algorithm chosen by the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConvImpl {
    /// One output channel at a time
    Reference,
    /// Output channels in blocks of `block`, sharing each source load
    Blocked { block: usize },
}

impl ConvImpl {
    fn block(self) -> usize {
        match self {
            ConvImpl::Reference => 1,
            ConvImpl::Blocked { block } => block.max(1),
        }
    }
}

/// Trained filter weights, laid out `[out][in][kh][kw]`
#[derive(Debug, Clone, PartialEq)]
pub struct ConvWeights {
    out_channels: usize,
    in_channels: usize,
    kernel_size: usize,
    weights: Vec<f32>,
    bias: Vec<f32>,
}

impl ConvWeights {
    pub fn new(
        out_channels: usize,
        in_channels: usize,
        kernel_size: usize,
        weights: Vec<f32>,
        bias: Vec<f32>,
    ) -> Result<Self> {
        if out_channels == 0 || in_channels == 0 {
            return Err(Error::invalid("convolution needs at least one input and one output channel"));
        }
        if kernel_size % 2 == 0 {
            return Err(Error::invalid(format!("kernel size {kernel_size} must be odd")));
        }
        let expected = out_channels * in_channels * kernel_size * kernel_size;
        if weights.len() != expected {
            return Err(Error::invalid(format!("expected {expected} weights, got {}", weights.len())));
        }
        if bias.len() != out_channels {
            return Err(Error::invalid(format!(
                "expected {out_channels} bias values, got {}",
                bias.len()
            )));
        }
        Ok(Self {
            out_channels,
            in_channels,
            kernel_size,
            weights,
            bias,
        })
    }

    pub fn out_channels(&self) -> usize {
        self.out_channels
    }

    pub fn in_channels(&self) -> usize {
        self.in_channels
    }

    pub fn kernel_size(&self) -> usize {
        self.kernel_size
    }

    /// Extra source pixels needed on each side
    pub fn halo(&self) -> usize {
        self.kernel_size / 2
    }

    #[inline]
    fn weight(&self, o: usize, i: usize, kh: usize, kw: usize) -> f32 {
        self.weights[((o * self.in_channels + i) * self.kernel_size + kh) * self.kernel_size + kw]
    }
}

/// Fusion options of a convolution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConvDesc {
    pub relu: bool,
    pub post_op: PostOp,
}

impl ConvDesc {
    pub fn relu() -> Self {
        Self {
            relu: true,
            post_op: PostOp::None,
        }
    }

    pub fn with_post_op(mut self, post_op: PostOp) -> Self {
        self.post_op = post_op;
        self
    }
}

/// Convolution operator
#[derive(Debug)]
pub struct Conv {
    engine: Arc<dyn Engine>,
    algo: ConvImpl,
    desc: ConvDesc,
    weights: Arc<ConvWeights>,
    src: TensorBinding,
    dst: TensorBinding,
    tile: Tile,
}

impl Conv {
    /// Bind a convolution; call through [`crate::Registry::conv`] to get the
    /// implementation and support checks for a device
    pub fn new(
        engine: Arc<dyn Engine>,
        algo: ConvImpl,
        desc: ConvDesc,
        weights: Arc<ConvWeights>,
        src: TensorBinding,
        dst: TensorBinding,
    ) -> Result<Self> {
        ensure_distinct(&[src.handle, dst.handle])?;
        if src.desc.channels != weights.in_channels {
            return Err(Error::invalid(format!(
                "source has {} channels, weights expect {}",
                src.desc.channels, weights.in_channels
            )));
        }
        if dst.desc.channels != weights.out_channels {
            return Err(Error::invalid(format!(
                "destination has {} channels, weights produce {}",
                dst.desc.channels, weights.out_channels
            )));
        }

        let tile = Tile::full_with_source(dst.desc.extent(), src.desc.extent());
        Ok(Self {
            engine,
            algo,
            desc,
            weights,
            src,
            dst,
            tile,
        })
    }

    pub fn algo(&self) -> ConvImpl {
        self.algo
    }

    pub fn desc(&self) -> ConvDesc {
        self.desc
    }
}

impl Op for Conv {
    fn name(&self) -> &'static str {
        match self.desc.post_op {
            PostOp::None => "conv",
            PostOp::Pool => "conv_pool",
            PostOp::Upsample => "conv_upsample",
        }
    }

    fn tile(&self) -> &Tile {
        &self.tile
    }

    fn set_tile(&mut self, tile: Tile) -> Result<()> {
        tile.check_destination(self.dst.desc.extent())?;
        tile.check_source_bounds(self.src.desc.extent())?;
        self.tile = tile;
        Ok(())
    }

    fn execute(&self) -> Result<()> {
        let kernel = ConvKernel {
            block: self.algo.block(),
            desc: self.desc,
            weights: Arc::clone(&self.weights),
            src: self.src,
            dst: self.dst,
            tile: self.tile,
        };
        submit(&self.engine, self.name(), &self.tile, move |memory| kernel.run(memory))
    }
}

struct ConvKernel {
    block: usize,
    desc: ConvDesc,
    weights: Arc<ConvWeights>,
    src: TensorBinding,
    dst: TensorBinding,
    tile: Tile,
}

impl ConvKernel {
    fn run(&self, memory: &MemoryManager) -> std::result::Result<(), BackendError> {
        let src_allocation = memory.get(self.src.handle)?;
        let dst_allocation = memory.get(self.dst.handle)?;
        let out_channels = self.weights.out_channels;
        let tile = self.tile;

        let rows = {
            let guard = src_allocation.read();
            let x = elements(&self.src.desc, guard.bytes())?;
            parallel_map(tile.height, |i| Ok(self.row(&x, i)))?
        };

        let mut guard = dst_allocation.write();
        let mut y = elements_mut(&self.dst.desc, guard.bytes_mut())?;
        for (i, row) in rows.iter().enumerate() {
            for o in 0..out_channels {
                for j in 0..tile.width {
                    y.set(self.dst.desc.index(o, tile.h_dst + i, tile.w_dst + j), row[o * tile.width + j]);
                }
            }
        }
        Ok(())
    }

    /// Destination row `i`, stored `[channel][column]`
    fn row(&self, x: &Elements<'_>, i: usize) -> Vec<f32> {
        let tile = &self.tile;
        let out_channels = self.weights.out_channels;
        let mut row = vec![0.0f32; out_channels * tile.width];
        let mut acc = vec![0.0f32; self.block];
        let mut best = vec![0.0f32; self.block];
        let i = i as isize;

        for j in 0..tile.width {
            let jj = j as isize;
            for first in (0..out_channels).step_by(self.block) {
                let n = self.block.min(out_channels - first);
                let values = match self.desc.post_op {
                    PostOp::None => {
                        self.outputs(x, first, tile.h_src + i, tile.w_src + jj, &mut acc[..n]);
                        &acc[..n]
                    }
                    PostOp::Pool => {
                        let r = tile.h_src + 2 * i;
                        let c = tile.w_src + 2 * jj;
                        self.outputs(x, first, r, c, &mut best[..n]);
                        for (dr, dc) in [(0, 1), (1, 0), (1, 1)] {
                            self.outputs(x, first, r + dr, c + dc, &mut acc[..n]);
                            for (m, &v) in best[..n].iter_mut().zip(&acc[..n]) {
                                *m = m.max(v);
                            }
                        }
                        &best[..n]
                    }
                    PostOp::Upsample => {
                        let r = (tile.h_src + i).div_euclid(2);
                        let c = (tile.w_src + jj).div_euclid(2);
                        self.outputs(x, first, r, c, &mut acc[..n]);
                        &acc[..n]
                    }
                };
                for (b, &v) in values.iter().enumerate() {
                    row[(first + b) * tile.width + j] = v;
                }
            }
        }
        row
    }

    /// Convolution outputs `first..first + acc.len()` at source position `(r, c)`
    fn outputs(&self, x: &Elements<'_>, first: usize, r: isize, c: isize, acc: &mut [f32]) {
        let w = &self.weights;
        let src: &TensorDesc = &self.src.desc;
        let bounds: Extent = self.tile.src_bounds;
        let halo = w.halo() as isize;

        for (b, a) in acc.iter_mut().enumerate() {
            *a = w.bias[first + b];
        }
        for ic in 0..w.in_channels {
            for kh in 0..w.kernel_size {
                let sr = r + kh as isize - halo;
                if sr < 0 || sr as usize >= bounds.height {
                    continue;
                }
                for kw in 0..w.kernel_size {
                    let sc = c + kw as isize - halo;
                    if sc < 0 || sc as usize >= bounds.width {
                        continue;
                    }
                    let v = x.get(src.index(ic, sr as usize, sc as usize));
                    for (b, a) in acc.iter_mut().enumerate() {
                        *a += w.weight(first + b, ic, kh, kw) * v;
                    }
                }
            }
        }
        if self.desc.relu {
            for a in acc.iter_mut() {
                *a = a.max(0.0);
            }
        }
    }
}
