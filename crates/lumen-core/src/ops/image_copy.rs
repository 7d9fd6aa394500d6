//! Image-to-image copy with pixel format conversion

use super::{ensure_distinct, submit, Op};
use crate::error::Result;
use crate::image::{check_image_bytes, read_rgb, write_rgb, ImageBinding};
use crate::tile::Tile;
use lumen_backends::parallel::parallel_map;
use lumen_backends::Engine;
use std::sync::Arc;

#[derive(Debug)]
pub struct ImageCopy {
    engine: Arc<dyn Engine>,
    src: ImageBinding,
    dst: ImageBinding,
    tile: Tile,
}

impl ImageCopy {
    pub fn new(engine: Arc<dyn Engine>, src: ImageBinding, dst: ImageBinding) -> Result<Self> {
        ensure_distinct(&[src.handle, dst.handle])?;
        Ok(Self {
            engine,
            src,
            dst,
            tile: Tile::full_with_source(dst.desc.extent(), src.desc.extent()),
        })
    }
}

impl Op for ImageCopy {
    fn name(&self) -> &'static str {
        "image_copy"
    }

    fn tile(&self) -> &Tile {
        &self.tile
    }

    fn set_tile(&mut self, tile: Tile) -> Result<()> {
        tile.check_destination(self.dst.desc.extent())?;
        tile.check_source_bounds(self.src.desc.extent())?;
        tile.check_source_window(tile.height, tile.width)?;
        self.tile = tile;
        Ok(())
    }

    fn execute(&self) -> Result<()> {
        self.tile.check_source_window(self.tile.height, self.tile.width)?;
        let (src, dst, tile) = (self.src, self.dst, self.tile);
        submit(&self.engine, self.name(), &tile, move |memory| {
            let src_allocation = memory.get(src.handle)?;
            let dst_allocation = memory.get(dst.handle)?;
            let (h0, w0) = (tile.h_src as usize, tile.w_src as usize);

            let rows = {
                let guard = src_allocation.read();
                check_image_bytes(&src.desc, guard.len())?;
                let bytes = guard.bytes();
                parallel_map(tile.height, |i| {
                    Ok((0..tile.width)
                        .map(|j| read_rgb(&src.desc, bytes, h0 + i, w0 + j))
                        .collect::<Vec<_>>())
                })?
            };

            let mut guard = dst_allocation.write();
            check_image_bytes(&dst.desc, guard.len())?;
            let bytes = guard.bytes_mut();
            for (i, row) in rows.iter().enumerate() {
                for (j, &rgb) in row.iter().enumerate() {
                    write_rgb(&dst.desc, bytes, tile.h_dst + i, tile.w_dst + j, rgb);
                }
            }
            Ok(())
        })
    }
}
