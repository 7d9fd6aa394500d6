//! Image inputs to network tensor channels
//!
//! Channels are filled in order color, albedo, normal (three each, optional
//! images skipped); remaining destination channels are zero. Pixels of the
//! tile that fall outside the source images are written as zeros.
//!
//! | input  | transform                                                         |
//! |--------|-------------------------------------------------------------------|
//! | color  | × input scale, sanitize, clamp (`[0, ∞)` HDR, `[0, 1]` LDR), forward transfer |
//! | albedo | sanitize, clamp to `[0, 1]`                                       |
//! | normal | sanitize, clamp to `[-1, 1]`, remap to `[0, 1]`                   |

use super::{ensure_distinct, sanitize, submit, Op, ProcessDesc};
use crate::error::{Error, Result};
use crate::image::{check_image_bytes, read_rgb, ImageBinding};
use crate::tensor::{elements_mut, TensorBinding};
use crate::tile::{Extent, Tile};
use lumen_backends::parallel::parallel_map;
use lumen_backends::{BackendError, Engine, MemoryManager, SharedAllocation};
use std::sync::Arc;

#[derive(Debug)]
pub struct InputProcess {
    engine: Arc<dyn Engine>,
    color: ImageBinding,
    albedo: Option<ImageBinding>,
    normal: Option<ImageBinding>,
    dst: TensorBinding,
    desc: ProcessDesc,
    tile: Tile,
}

impl InputProcess {
    pub fn new(
        engine: Arc<dyn Engine>,
        desc: ProcessDesc,
        color: ImageBinding,
        albedo: Option<ImageBinding>,
        normal: Option<ImageBinding>,
        dst: TensorBinding,
    ) -> Result<Self> {
        let extent = color.desc.extent();
        for aux in albedo.iter().chain(normal.iter()) {
            if aux.desc.extent() != extent {
                return Err(Error::invalid(format!(
                    "auxiliary image {} does not match color image {extent}",
                    aux.desc.extent()
                )));
            }
        }
        let channels = 3 * (1 + albedo.is_some() as usize + normal.is_some() as usize);
        if dst.desc.channels < channels {
            return Err(Error::invalid(format!(
                "destination has {} channels, inputs need {channels}",
                dst.desc.channels
            )));
        }
        desc.scale.validate()?;

        let mut handles = vec![color.handle, dst.handle];
        handles.extend(albedo.map(|image| image.handle));
        handles.extend(normal.map(|image| image.handle));
        handles.extend(desc.scale.handle());
        ensure_distinct(&handles)?;

        Ok(Self {
            engine,
            color,
            albedo,
            normal,
            dst,
            desc,
            tile: Tile::full_with_source(dst.desc.extent(), extent),
        })
    }

    /// Number of tensor channels filled from images
    pub fn input_channels(&self) -> usize {
        3 * (1 + self.albedo.is_some() as usize + self.normal.is_some() as usize)
    }
}

impl Op for InputProcess {
    fn name(&self) -> &'static str {
        "input_process"
    }

    fn tile(&self) -> &Tile {
        &self.tile
    }

    fn set_tile(&mut self, tile: Tile) -> Result<()> {
        tile.check_destination(self.dst.desc.extent())?;
        tile.check_source_bounds(self.color.desc.extent())?;
        self.tile = tile;
        Ok(())
    }

    fn execute(&self) -> Result<()> {
        let kernel = InputKernel {
            color: self.color,
            albedo: self.albedo,
            normal: self.normal,
            dst: self.dst,
            desc: self.desc.clone(),
            tile: self.tile,
        };
        submit(&self.engine, self.name(), &self.tile, move |memory| kernel.run(memory))
    }
}

struct InputKernel {
    color: ImageBinding,
    albedo: Option<ImageBinding>,
    normal: Option<ImageBinding>,
    dst: TensorBinding,
    desc: ProcessDesc,
    tile: Tile,
}

impl InputKernel {
    fn run(&self, memory: &MemoryManager) -> std::result::Result<(), BackendError> {
        let scale = self.desc.scale.resolve(memory)?;
        let tile = self.tile;
        let channels = self.dst.desc.channels;

        let lookup = |image: &Option<ImageBinding>| -> std::result::Result<Option<SharedAllocation>, BackendError> {
            image.map(|image| memory.get(image.handle)).transpose()
        };
        let color = memory.get(self.color.handle)?;
        let albedo = lookup(&self.albedo)?;
        let normal = lookup(&self.normal)?;

        let rows = {
            let color = color.read();
            let albedo = albedo.as_ref().map(|a| a.read());
            let normal = normal.as_ref().map(|a| a.read());
            check_image_bytes(&self.color.desc, color.bytes().len())?;
            if let (Some(binding), Some(guard)) = (&self.albedo, &albedo) {
                check_image_bytes(&binding.desc, guard.bytes().len())?;
            }
            if let (Some(binding), Some(guard)) = (&self.normal, &normal) {
                check_image_bytes(&binding.desc, guard.bytes().len())?;
            }

            let bounds: Extent = tile.src_bounds;
            parallel_map(tile.height, |i| {
                let mut row = vec![0.0f32; channels * tile.width];
                let h = tile.h_src + i as isize;
                if h < 0 || h as usize >= bounds.height {
                    return Ok(row);
                }
                let h = h as usize;
                for j in 0..tile.width {
                    let w = tile.w_src + j as isize;
                    if w < 0 || w as usize >= bounds.width {
                        continue;
                    }
                    let w = w as usize;
                    let mut c = 0;

                    let rgb = read_rgb(&self.color.desc, color.bytes(), h, w);
                    for value in rgb {
                        let value = sanitize(value * scale);
                        let value = if self.desc.hdr { value.max(0.0) } else { value.clamp(0.0, 1.0) };
                        row[c * tile.width + j] = self.desc.transfer.forward(value);
                        c += 1;
                    }
                    if let (Some(binding), Some(guard)) = (&self.albedo, &albedo) {
                        for value in read_rgb(&binding.desc, guard.bytes(), h, w) {
                            row[c * tile.width + j] = sanitize(value).clamp(0.0, 1.0);
                            c += 1;
                        }
                    }
                    if let (Some(binding), Some(guard)) = (&self.normal, &normal) {
                        for value in read_rgb(&binding.desc, guard.bytes(), h, w) {
                            row[c * tile.width + j] = sanitize(value).clamp(-1.0, 1.0) * 0.5 + 0.5;
                            c += 1;
                        }
                    }
                }
                Ok(row)
            })?
        };

        let dst = memory.get(self.dst.handle)?;
        let mut guard = dst.write();
        let mut y = elements_mut(&self.dst.desc, guard.bytes_mut())?;
        for (i, row) in rows.iter().enumerate() {
            for c in 0..channels {
                for j in 0..tile.width {
                    y.set(self.dst.desc.index(c, tile.h_dst + i, tile.w_dst + j), row[c * tile.width + j]);
                }
            }
        }
        Ok(())
    }
}
