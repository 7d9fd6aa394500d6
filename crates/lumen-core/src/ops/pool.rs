//! 2x2 max pooling with stride 2

use super::{ensure_distinct, submit, Op};
use crate::error::{Error, Result};
use crate::tensor::{elements, elements_mut, TensorBinding};
use crate::tile::Tile;
use lumen_backends::parallel::parallel_map;
use lumen_backends::Engine;
use std::sync::Arc;

#[derive(Debug)]
pub struct Pool {
    engine: Arc<dyn Engine>,
    src: TensorBinding,
    dst: TensorBinding,
    tile: Tile,
}

impl Pool {
    pub fn new(engine: Arc<dyn Engine>, src: TensorBinding, dst: TensorBinding) -> Result<Self> {
        ensure_distinct(&[src.handle, dst.handle])?;
        if src.desc.channels != dst.desc.channels {
            return Err(Error::invalid(format!(
                "pooling keeps channels: source {} != destination {}",
                src.desc.channels, dst.desc.channels
            )));
        }
        let tile = Tile::full_with_source(dst.desc.extent(), src.desc.extent());
        Ok(Self { engine, src, dst, tile })
    }
}

impl Op for Pool {
    fn name(&self) -> &'static str {
        "pool"
    }

    fn tile(&self) -> &Tile {
        &self.tile
    }

    fn set_tile(&mut self, tile: Tile) -> Result<()> {
        tile.check_destination(self.dst.desc.extent())?;
        tile.check_source_bounds(self.src.desc.extent())?;
        tile.check_source_window(2 * tile.height, 2 * tile.width)?;
        self.tile = tile;
        Ok(())
    }

    fn execute(&self) -> Result<()> {
        // The default tile is only valid when the source is twice the destination.
        self.tile.check_source_window(2 * self.tile.height, 2 * self.tile.width)?;
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
                    let mut row = Vec::with_capacity(channels * tile.width);
                    for c in 0..channels {
                        for j in 0..tile.width {
                            let (r, s) = (h0 + 2 * i, w0 + 2 * j);
                            let value = x
                                .get(src.desc.index(c, r, s))
                                .max(x.get(src.desc.index(c, r, s + 1)))
                                .max(x.get(src.desc.index(c, r + 1, s)))
                                .max(x.get(src.desc.index(c, r + 1, s + 1)));
                            row.push(value);
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
