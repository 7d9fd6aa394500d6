//! 2x nearest-neighbor upsampling

use super::{ensure_distinct, submit, Op};
use crate::error::{Error, Result};
use crate::tensor::{elements, elements_mut, TensorBinding};
use crate::tile::Tile;
use lumen_backends::parallel::parallel_map;
use lumen_backends::Engine;
use std::sync::Arc;

/// Upsampling operator
///
/// Destination pixel `(i, j)` of the tile copies source pixel
/// `((h_src + i) / 2, (w_src + j) / 2)`.
#[derive(Debug)]
pub struct Upsample {
    engine: Arc<dyn Engine>,
    src: TensorBinding,
    dst: TensorBinding,
    tile: Tile,
}

impl Upsample {
    pub fn new(engine: Arc<dyn Engine>, src: TensorBinding, dst: TensorBinding) -> Result<Self> {
        ensure_distinct(&[src.handle, dst.handle])?;
        if src.desc.channels != dst.desc.channels {
            return Err(Error::invalid(format!(
                "upsampling keeps channels: source {} != destination {}",
                src.desc.channels, dst.desc.channels
            )));
        }
        let tile = Tile::full_with_source(dst.desc.extent(), src.desc.extent());
        Ok(Self { engine, src, dst, tile })
    }

    fn check_source(tile: &Tile) -> Result<()> {
        let covers = |start: isize, len: usize, bound: usize| {
            start >= 0 && (len == 0 || (start as usize + len - 1) / 2 < bound)
        };
        if !covers(tile.h_src, tile.height, tile.src_bounds.height) || !covers(tile.w_src, tile.width, tile.src_bounds.width)
        {
            return Err(Error::invalid(format!(
                "upsampled window {}x{} at ({}, {}) exceeds source {}",
                tile.height, tile.width, tile.h_src, tile.w_src, tile.src_bounds
            )));
        }
        Ok(())
    }
}

impl Op for Upsample {
    fn name(&self) -> &'static str {
        "upsample"
    }

    fn tile(&self) -> &Tile {
        &self.tile
    }

    fn set_tile(&mut self, tile: Tile) -> Result<()> {
        tile.check_destination(self.dst.desc.extent())?;
        tile.check_source_bounds(self.src.desc.extent())?;
        Self::check_source(&tile)?;
        self.tile = tile;
        Ok(())
    }

    fn execute(&self) -> Result<()> {
        Self::check_source(&self.tile)?;
        let (src, dst, tile) = (self.src, self.dst, self.tile);
        submit(&self.engine, self.name(), &tile, move |memory| {
            let src_allocation = memory.get(src.handle)?;
            let dst_allocation = memory.get(dst.handle)?;
            let channels = src.desc.channels;
            let (h0, w0) = (tile.h_src as usize, tile.w_src as usize);

            let rows = {
                let guard = src_allocation.read();
                let x = elements(&src.desc, guard.bytes())?;
                parallel_map(tile.height, |i| {
                    let r = (h0 + i) / 2;
                    let mut row = Vec::with_capacity(channels * tile.width);
                    for c in 0..channels {
                        for j in 0..tile.width {
                            row.push(x.get(src.desc.index(c, r, (w0 + j) / 2)));
                        }
                    }
                    Ok(row)
                })?
            };

            let mut guard = dst_allocation.write();
            let mut y = elements_mut(&dst.desc, guard.bytes_mut())?;
            for (i, row) in rows.iter().enumerate() {
                for c in 0..channels {
                    for j in 0..tile.width {
                        y.set(dst.desc.index(c, tile.h_dst + i, tile.w_dst + j), row[c * tile.width + j]);
                    }
                }
            }
            Ok(())
        })
    }
}
