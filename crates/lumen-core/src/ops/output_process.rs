//! Network output tensor to a color image
//!
//! The first three tensor channels are mapped through the inverse transfer,
//! clamped to `[0, ∞)` (HDR) or `[0, 1]` (LDR) and divided by the input scale.

use super::{ensure_distinct, submit, Op, ProcessDesc};
use crate::error::{Error, Result};
use crate::image::{check_image_bytes, write_rgb, ImageBinding};
use crate::tensor::{elements, TensorBinding};
use crate::tile::Tile;
use lumen_backends::parallel::parallel_map;
use lumen_backends::{BackendError, Engine, MemoryManager};
use std::sync::Arc;

#[derive(Debug)]
pub struct OutputProcess {
    engine: Arc<dyn Engine>,
    src: TensorBinding,
    dst: ImageBinding,
    desc: ProcessDesc,
    tile: Tile,
}

impl OutputProcess {
    pub fn new(engine: Arc<dyn Engine>, desc: ProcessDesc, src: TensorBinding, dst: ImageBinding) -> Result<Self> {
        if src.desc.channels < 3 {
            return Err(Error::invalid(format!(
                "output needs 3 source channels, tensor has {}",
                src.desc.channels
            )));
        }
        desc.scale.validate()?;
        let mut handles = vec![src.handle, dst.handle];
        handles.extend(desc.scale.handle());
        ensure_distinct(&handles)?;

        Ok(Self {
            engine,
            src,
            dst,
            desc,
            tile: Tile::full_with_source(dst.desc.extent(), src.desc.extent()),
        })
    }
}

impl Op for OutputProcess {
    fn name(&self) -> &'static str {
        "output_process"
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
        let kernel = OutputKernel {
            src: self.src,
            dst: self.dst,
            desc: self.desc.clone(),
            tile: self.tile,
        };
        submit(&self.engine, self.name(), &self.tile, move |memory| kernel.run(memory))
    }
}

struct OutputKernel {
    src: TensorBinding,
    dst: ImageBinding,
    desc: ProcessDesc,
    tile: Tile,
}

impl OutputKernel {
    fn run(&self, memory: &MemoryManager) -> std::result::Result<(), BackendError> {
        let scale = self.desc.scale.resolve(memory)?;
        let tile = self.tile;
        let (h0, w0) = (tile.h_src as usize, tile.w_src as usize);
        let src_allocation = memory.get(self.src.handle)?;
        let dst_allocation = memory.get(self.dst.handle)?;

        let rows = {
            let guard = src_allocation.read();
            let x = elements(&self.src.desc, guard.bytes())?;
            parallel_map(tile.height, |i| {
                let mut row = Vec::with_capacity(tile.width);
                for j in 0..tile.width {
                    let mut rgb = [0.0f32; 3];
                    for (c, out) in rgb.iter_mut().enumerate() {
                        let value = self.desc.transfer.inverse(x.get(self.src.desc.index(c, h0 + i, w0 + j)));
                        let value = if self.desc.hdr { value.max(0.0) } else { value.clamp(0.0, 1.0) };
                        *out = value / scale;
                    }
                    row.push(rgb);
                }
                Ok(row)
            })?
        };

        let mut guard = dst_allocation.write();
        check_image_bytes(&self.dst.desc, guard.len())?;
        let bytes = guard.bytes_mut();
        for (i, row) in rows.iter().enumerate() {
            for (j, &rgb) in row.iter().enumerate() {
                write_rgb(&self.dst.desc, bytes, tile.h_dst + i, tile.w_dst + j, rgb);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::{Image, ImageDesc, PixelFormat};
    use crate::ops::test_support::{cpu, tensor};
    use crate::ops::ScaleSource;
    use crate::tile::Extent;
    use crate::transfer::{Linear, Srgb, TransferFunction};
    use lumen_backends::Storage;

    fn desc(hdr: bool, scale: f32) -> ProcessDesc {
        ProcessDesc {
            transfer: Arc::new(Linear),
            hdr,
            scale: ScaleSource::Constant(scale),
        }
    }

    #[test]
    fn ldr_output_is_clamped() {
        let engine = cpu();
        let src = tensor(&engine, 3, 1, 1, &[1.5, -0.5, 0.25]);
        let dst = Image::new(&engine, ImageDesc::new(1, 1, PixelFormat::Float3), Storage::Host).unwrap();
        OutputProcess::new(engine, desc(false, 1.0), src.binding(), dst.binding())
            .unwrap()
            .execute()
            .unwrap();
        assert_eq!(dst.read_pixels().unwrap(), vec![1.0, 0.0, 0.25]);
    }

    #[test]
    fn hdr_output_divides_by_scale() {
        let engine = cpu();
        let src = tensor(&engine, 3, 1, 1, &[3.0, -1.0, 0.5]);
        let dst = Image::new(&engine, ImageDesc::new(1, 1, PixelFormat::Float4), Storage::Host).unwrap();
        OutputProcess::new(engine, desc(true, 0.5), src.binding(), dst.binding())
            .unwrap()
            .execute()
            .unwrap();
        assert_eq!(dst.read_pixels().unwrap(), vec![6.0, 0.0, 1.0, 1.0]);
    }

    #[test]
    fn inverse_transfer_and_tile_offsets() {
        let engine = cpu();
        let src = tensor(&engine, 3, 2, 2, &[0.5, 0.5, 0.5, 0.5, 0.2, 0.2, 0.2, 0.2, 0.9, 0.9, 0.9, 0.9]);
        let dst = Image::new(&engine, ImageDesc::new(3, 3, PixelFormat::Half3), Storage::Host).unwrap();
        let process = ProcessDesc {
            transfer: Arc::new(Srgb),
            hdr: false,
            scale: ScaleSource::Constant(1.0),
        };
        let mut op = OutputProcess::new(engine, process, src.binding(), dst.binding()).unwrap();
        op.set_tile(Tile {
            h_src: 1,
            w_src: 1,
            h_dst: 2,
            w_dst: 2,
            height: 1,
            width: 1,
            src_bounds: Extent::new(2, 2),
        })
        .unwrap();
        op.execute().unwrap();

        let pixels = dst.read_pixels().unwrap();
        let last = &pixels[pixels.len() - 3..];
        let expected = half::f16::from_f32(Srgb.inverse(0.5)).to_f32();
        assert_eq!(last[0], expected);
        assert!(pixels[..pixels.len() - 3].iter().all(|&v| v == 0.0));
    }

    #[test]
    fn source_window_must_be_readable() {
        let engine = cpu();
        let src = tensor(&engine, 3, 2, 2, &[0.0; 12]);
        let dst = Image::new(&engine, ImageDesc::new(2, 2, PixelFormat::Float3), Storage::Host).unwrap();
        let mut op = OutputProcess::new(engine, desc(false, 1.0), src.binding(), dst.binding()).unwrap();
        let tile = Tile { h_src: 1, ..*op.tile() };
        assert!(op.set_tile(tile).is_err());
    }
}
