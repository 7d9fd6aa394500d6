//! Pipelines: ordered stages run tile by tile
//!
//! A [`PipelineBuilder`] records the stage topology and validates it against
//! the executor's registry. The built [`Pipeline`] is then bound to a caller
//! source and destination and run with a memory budget:
//!
//! 1. plan tiles for the budget (fails before any device work);
//! 2. allocate one arena tensor per intermediate result, sized for the
//!    largest tile;
//! 3. estimate exposure for HDR input without a fixed scale;
//! 4. for each tile, `set_tile` then `execute` every stage in order;
//! 5. wait for the engine, then release the arena.
//!
//! # Example
//!
//! ```
//! use lumen_core::{ConvDesc, ConvWeights, Destination, Executor, BackendType, Source};
//! use std::sync::Arc;
//!
//! let exec = Executor::new(BackendType::Cpu)?;
//! let weights = Arc::new(ConvWeights::new(3, 3, 3, vec![0.0; 81], vec![0.5; 3])?);
//! let mut pipeline = exec.pipeline(16, 16, 3).conv(weights, ConvDesc::relu())?.build()?;
//!
//! let src = exec.tensor(3, 16, 16)?;
//! let dst = exec.tensor(3, 16, 16)?;
//! pipeline.set_source(Source::Tensor(src.binding()))?;
//! pipeline.set_destination(Destination::Tensor(dst.binding()))?;
//! pipeline.run_default()?;
//! assert!(dst.read_chw()?.iter().all(|&v| v == 0.5));
//! # Ok::<(), lumen_core::Error>(())
//! ```

use crate::config::RunConfig;
use crate::error::{Error, Result};
use crate::executor::Executor;
use crate::image::ImageBinding;
use crate::ops::{ensure_distinct, ConvDesc, ConvWeights, Op, ProcessDesc, ScaleSource};
use crate::registry::Registry;
use crate::scheduler::{PipelineGeometry, Resample, StageGeometry, TilePlan};
use crate::tensor::{Layout, Tensor, TensorBinding, TensorDesc};
use crate::tile::{Extent, Tile};
use crate::transfer::{Log, Srgb, TransferFunction};
use lumen_backends::{BufferHandle, DataType, Engine, PostOp, Storage};
use std::sync::Arc;

/// Data the first stage reads
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Source {
    Tensor(TensorBinding),
    /// Color with optional auxiliary features, for an input-process stage
    Images {
        color: ImageBinding,
        albedo: Option<ImageBinding>,
        normal: Option<ImageBinding>,
    },
}

impl Source {
    pub fn color(color: ImageBinding) -> Self {
        Source::Images {
            color,
            albedo: None,
            normal: None,
        }
    }

    fn handles(&self) -> Vec<BufferHandle> {
        match self {
            Source::Tensor(binding) => vec![binding.handle],
            Source::Images { color, albedo, normal } => std::iter::once(color)
                .chain(albedo.iter())
                .chain(normal.iter())
                .map(|image| image.handle)
                .collect(),
        }
    }
}

/// Buffer the last stage writes
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Destination {
    Tensor(TensorBinding),
    /// Written by an output-process stage
    Image(ImageBinding),
}

impl Destination {
    fn handle(&self) -> BufferHandle {
        match self {
            Destination::Tensor(binding) => binding.handle,
            Destination::Image(binding) => binding.handle,
        }
    }
}

#[derive(Debug, Clone)]
enum Stage {
    InputProcess,
    Conv { weights: Arc<ConvWeights>, desc: ConvDesc },
    Pool,
    Upsample,
    OutputProcess,
}

impl Stage {
    fn name(&self) -> &'static str {
        match self {
            Stage::InputProcess => "input_process",
            Stage::Conv { .. } => "conv",
            Stage::Pool => "pool",
            Stage::Upsample => "upsample",
            Stage::OutputProcess => "output_process",
        }
    }

    fn halo(&self) -> usize {
        match self {
            Stage::Conv { weights, .. } => weights.halo(),
            _ => 0,
        }
    }

    fn resample(&self) -> Resample {
        match self {
            Stage::Conv { desc, .. } => match desc.post_op {
                PostOp::None => Resample::Same,
                PostOp::Pool => Resample::Down2,
                PostOp::Upsample => Resample::Up2,
            },
            Stage::Pool => Resample::Down2,
            Stage::Upsample => Resample::Up2,
            Stage::InputProcess | Stage::OutputProcess => Resample::Same,
        }
    }
}

/// Records stages and checks each one against the registry as it is added
#[derive(Debug)]
pub struct PipelineBuilder {
    engine: Arc<dyn Engine>,
    registry: Registry,
    input: Extent,
    /// Channels of every slot, starting with the pipeline input
    channels: Vec<usize>,
    stages: Vec<Stage>,
    config: RunConfig,
    transfer: Option<Arc<dyn TransferFunction>>,
}

impl PipelineBuilder {
    /// Pipeline over a `height` x `width` input with `in_channels` channels
    ///
    /// For image input `in_channels` counts the image channels: 3 for color
    /// alone, 6 or 9 with auxiliary features.
    pub fn new(executor: &Executor, height: usize, width: usize, in_channels: usize) -> Self {
        Self {
            engine: Arc::clone(executor.engine()),
            registry: executor.registry().clone(),
            input: Extent::new(height, width),
            channels: vec![in_channels],
            stages: Vec::new(),
            config: RunConfig::default(),
            transfer: None,
        }
    }

    pub fn config(mut self, config: RunConfig) -> Self {
        self.config = config;
        self
    }

    /// Transfer function of the process stages; defaults to a log curve for
    /// HDR runs and sRGB otherwise
    pub fn transfer(mut self, transfer: Arc<dyn TransferFunction>) -> Self {
        self.transfer = Some(transfer);
        self
    }

    fn channels(&self) -> usize {
        self.channels.last().copied().unwrap_or(0)
    }

    fn push(mut self, stage: Stage, channels: usize) -> Result<Self> {
        if matches!(self.stages.last(), Some(Stage::OutputProcess)) {
            return Err(Error::invalid(format!(
                "{} cannot follow output_process; it must be the last stage",
                stage.name()
            )));
        }
        self.stages.push(stage);
        self.channels.push(channels);
        Ok(self)
    }

    /// Convert color images (and optional albedo/normal) into a tensor with
    /// `out_channels` channels; must be the first stage
    pub fn input_process(self, out_channels: usize) -> Result<Self> {
        if !self.stages.is_empty() {
            return Err(Error::invalid("input_process must be the first stage"));
        }
        let images = self.channels();
        if !matches!(images, 3 | 6 | 9) {
            return Err(Error::invalid(format!(
                "image input has {images} channels; expected 3, 6 or 9"
            )));
        }
        if out_channels < images {
            return Err(Error::invalid(format!(
                "input_process cannot pack {images} image channels into {out_channels}"
            )));
        }
        self.push(Stage::InputProcess, out_channels)
    }

    pub fn conv(self, weights: Arc<ConvWeights>, desc: ConvDesc) -> Result<Self> {
        self.registry.check_conv(&desc)?;
        if weights.in_channels() != self.channels() {
            return Err(Error::invalid(format!(
                "convolution expects {} channels, previous stage produces {}",
                weights.in_channels(),
                self.channels()
            )));
        }
        let channels = weights.out_channels();
        self.push(Stage::Conv { weights, desc }, channels)
    }

    pub fn pool(self) -> Result<Self> {
        self.registry.check_resample("pooling")?;
        let channels = self.channels();
        self.push(Stage::Pool, channels)
    }

    pub fn upsample(self) -> Result<Self> {
        self.registry.check_resample("upsampling")?;
        let channels = self.channels();
        self.push(Stage::Upsample, channels)
    }

    /// Write the first three channels to an image; must be the last stage
    pub fn output_process(self) -> Result<Self> {
        if self.channels() < 3 {
            return Err(Error::invalid(format!(
                "output_process needs 3 channels, previous stage produces {}",
                self.channels()
            )));
        }
        self.push(Stage::OutputProcess, 3)
    }

    pub fn build(self) -> Result<Pipeline> {
        let stages = self
            .stages
            .iter()
            .zip(&self.channels[1..])
            .map(|(stage, &channels)| {
                let bytes_per_pixel = self.registry.tensor_desc(channels, 1, 1).bytes_per_pixel();
                StageGeometry::new(stage.halo(), stage.resample(), bytes_per_pixel)
            })
            .collect();
        let geometry = PipelineGeometry::new(self.input, stages)?;
        let transfer = self.transfer.unwrap_or_else(|| {
            if self.config.hdr {
                Arc::new(Log::default()) as Arc<dyn TransferFunction>
            } else {
                Arc::new(Srgb)
            }
        });

        tracing::debug!(
            stages = self.stages.len(),
            input = %geometry.input(),
            output = %geometry.output(),
            "pipeline_built"
        );
        Ok(Pipeline {
            engine: self.engine,
            registry: self.registry,
            stages: self.stages,
            channels: self.channels,
            geometry,
            config: self.config,
            transfer,
            source: None,
            destination: None,
        })
    }
}

/// Intermediate tensors of one run
struct Arena {
    tensors: Vec<Tensor>,
    exposure: Option<Tensor>,
}

#[derive(Debug)]
pub struct Pipeline {
    engine: Arc<dyn Engine>,
    registry: Registry,
    stages: Vec<Stage>,
    channels: Vec<usize>,
    geometry: PipelineGeometry,
    config: RunConfig,
    transfer: Arc<dyn TransferFunction>,
    source: Option<Source>,
    destination: Option<Destination>,
}

impl Pipeline {
    pub fn geometry(&self) -> &PipelineGeometry {
        &self.geometry
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    pub fn input(&self) -> Extent {
        self.geometry.input()
    }

    pub fn output(&self) -> Extent {
        self.geometry.output()
    }

    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(Stage::name).collect()
    }

    fn starts_with_images(&self) -> bool {
        matches!(self.stages.first(), Some(Stage::InputProcess))
    }

    fn ends_with_image(&self) -> bool {
        matches!(self.stages.last(), Some(Stage::OutputProcess))
    }

    fn check_tensor_binding(&self, binding: &TensorBinding, channels: usize, extent: Extent) -> Result<()> {
        self.registry.check_tensor(binding)?;
        if binding.desc.channels != channels || binding.desc.extent() != extent {
            return Err(Error::invalid(format!(
                "expected a {channels}-channel {extent} tensor, got {} channels at {}",
                binding.desc.channels,
                binding.desc.extent()
            )));
        }
        Ok(())
    }

    pub fn set_source(&mut self, source: Source) -> Result<()> {
        match (&source, self.starts_with_images()) {
            (Source::Tensor(binding), false) => self.check_tensor_binding(binding, self.channels[0], self.input())?,
            (Source::Images { color, albedo, normal }, true) => {
                for image in std::iter::once(color).chain(albedo.iter()).chain(normal.iter()) {
                    if image.desc.extent() != self.input() {
                        return Err(Error::invalid(format!(
                            "image {} does not match pipeline input {}",
                            image.desc.extent(),
                            self.input()
                        )));
                    }
                }
                let channels = 3 * (1 + albedo.is_some() as usize + normal.is_some() as usize);
                if channels != self.channels[0] {
                    return Err(Error::invalid(format!(
                        "pipeline expects {} image channels, source provides {channels}",
                        self.channels[0]
                    )));
                }
            }
            (Source::Tensor(_), true) => return Err(Error::invalid("input_process reads images, not a tensor")),
            (Source::Images { .. }, false) => {
                return Err(Error::invalid("image sources need an input_process first stage"))
            }
        }
        self.source = Some(source);
        Ok(())
    }

    pub fn set_destination(&mut self, destination: Destination) -> Result<()> {
        let channels = self.channels();
        match (&destination, self.ends_with_image()) {
            (Destination::Tensor(binding), false) => self.check_tensor_binding(binding, channels, self.output())?,
            (Destination::Image(image), true) => {
                if image.desc.extent() != self.output() {
                    return Err(Error::invalid(format!(
                        "image {} does not match pipeline output {}",
                        image.desc.extent(),
                        self.output()
                    )));
                }
            }
            (Destination::Tensor(_), true) => return Err(Error::invalid("output_process writes an image, not a tensor")),
            (Destination::Image(_), false) => {
                return Err(Error::invalid("image destinations need an output_process last stage"))
            }
        }
        self.destination = Some(destination);
        Ok(())
    }

    fn channels(&self) -> usize {
        self.channels.last().copied().unwrap_or(0)
    }

    fn min_tile_size(&self) -> usize {
        self.registry.caps().min_tile_size.max(self.config.min_tile_size)
    }

    /// Tile plan a run with `memory_budget` would use
    pub fn plan(&self, memory_budget: usize) -> Result<TilePlan> {
        self.geometry.plan(memory_budget, self.min_tile_size())
    }

    /// Run with the configured memory budget
    pub fn run_default(&self) -> Result<()> {
        self.run(self.config.memory_budget)
    }

    /// Run the whole pipeline, returning once the destination is written
    ///
    /// # Errors
    ///
    /// - `LogicError` if the source or destination is not set
    /// - `ConfigurationError` if no tile size fits `memory_budget`
    /// - `OutOfMemory` if the arena cannot be allocated
    /// - `DeviceError` if a command fails; tiles finished before the failure
    ///   may already be written
    #[tracing::instrument(skip(self), fields(stages = self.stages.len()))]
    pub fn run(&self, memory_budget: usize) -> Result<()> {
        let source = self
            .source
            .ok_or_else(|| Error::Logic("pipeline source is not set".into()))?;
        let destination = self
            .destination
            .ok_or_else(|| Error::Logic("pipeline destination is not set".into()))?;
        let mut handles = source.handles();
        handles.push(destination.handle());
        ensure_distinct(&handles)?;

        let plan = self.plan(memory_budget)?;
        let arena = self.allocate_arena(&plan, &source)?;

        let result = self.execute(&plan, &arena, source, destination);
        // Kernels may still reference the arena until the stream drains.
        let synced = self.engine.wait();
        drop(arena);
        result?;
        synced?;
        Ok(())
    }

    fn arena_storage(&self) -> Storage {
        if self.registry.caps().device_memory {
            Storage::Device
        } else {
            Storage::Host
        }
    }

    fn needs_exposure(&self, source: &Source) -> bool {
        self.config.hdr && self.config.input_scale.is_none() && matches!(source, Source::Images { .. })
    }

    fn allocate_arena(&self, plan: &TilePlan, source: &Source) -> Result<Arena> {
        let storage = self.arena_storage();
        let tensors = plan
            .stage_extents()
            .iter()
            .zip(&self.channels[1..])
            .map(|(extent, &channels)| {
                let desc = self.registry.tensor_desc(channels, extent.height, extent.width);
                Tensor::new(&self.engine, desc, storage)
            })
            .collect::<Result<Vec<_>>>()?;
        let exposure = if self.needs_exposure(source) {
            let desc = TensorDesc::new(1, 1, 1, Layout::Chw, DataType::F32);
            Some(Tensor::new(&self.engine, desc, storage)?)
        } else {
            None
        };
        tracing::debug!(
            tensors = tensors.len(),
            bytes = plan.peak_bytes(),
            storage = storage.as_str(),
            "arena_allocated"
        );
        Ok(Arena { tensors, exposure })
    }

    fn slot_tensor(&self, arena: &Arena, slot: usize, source: &Source, destination: &Destination) -> Result<TensorBinding> {
        let last = self.stages.len();
        match slot {
            0 => match source {
                Source::Tensor(binding) => Ok(*binding),
                Source::Images { .. } => Err(Error::Logic("stage 0 expects a tensor source".into())),
            },
            s if s == last => match destination {
                Destination::Tensor(binding) => Ok(*binding),
                Destination::Image(_) => Err(Error::Logic("last stage expects a tensor destination".into())),
            },
            s => arena
                .tensors
                .get(s - 1)
                .map(Tensor::binding)
                .ok_or_else(|| Error::Logic(format!("arena has no tensor for slot {s}"))),
        }
    }

    fn build_ops(
        &self,
        arena: &Arena,
        source: &Source,
        destination: &Destination,
        scale: ScaleSource,
    ) -> Result<Vec<Box<dyn Op>>> {
        let process = ProcessDesc {
            transfer: Arc::clone(&self.transfer),
            hdr: self.config.hdr,
            scale,
        };

        let mut ops: Vec<Box<dyn Op>> = Vec::with_capacity(self.stages.len());
        for (s, stage) in self.stages.iter().enumerate() {
            let op: Box<dyn Op> = match stage {
                Stage::InputProcess => {
                    let Source::Images { color, albedo, normal } = *source else {
                        return Err(Error::Logic("input_process expects image sources".into()));
                    };
                    let dst = self.slot_tensor(arena, s + 1, source, destination)?;
                    Box::new(
                        self.registry
                            .input_process(&self.engine, process.clone(), color, albedo, normal, dst)?,
                    )
                }
                Stage::Conv { weights, desc } => {
                    let src = self.slot_tensor(arena, s, source, destination)?;
                    let dst = self.slot_tensor(arena, s + 1, source, destination)?;
                    Box::new(self.registry.conv(&self.engine, *desc, Arc::clone(weights), src, dst)?)
                }
                Stage::Pool => {
                    let src = self.slot_tensor(arena, s, source, destination)?;
                    let dst = self.slot_tensor(arena, s + 1, source, destination)?;
                    Box::new(self.registry.pool(&self.engine, src, dst)?)
                }
                Stage::Upsample => {
                    let src = self.slot_tensor(arena, s, source, destination)?;
                    let dst = self.slot_tensor(arena, s + 1, source, destination)?;
                    Box::new(self.registry.upsample(&self.engine, src, dst)?)
                }
                Stage::OutputProcess => {
                    let Destination::Image(dst) = *destination else {
                        return Err(Error::Logic("output_process expects an image destination".into()));
                    };
                    let src = self.slot_tensor(arena, s, source, destination)?;
                    Box::new(self.registry.output_process(&self.engine, process.clone(), src, dst)?)
                }
            };
            ops.push(op);
        }
        Ok(ops)
    }

    fn execute(&self, plan: &TilePlan, arena: &Arena, source: Source, destination: Destination) -> Result<()> {
        let (scale, autoexposure) = match (&arena.exposure, &source) {
            (Some(exposure), Source::Images { color, .. }) => {
                let op = self.registry.autoexposure(&self.engine, *color, exposure.binding())?;
                (ScaleSource::Tensor(exposure.binding()), Some(op))
            }
            _ => (ScaleSource::Constant(self.config.input_scale.unwrap_or(1.0)), None),
        };
        let mut ops = self.build_ops(arena, &source, &destination, scale)?;

        if let Some(op) = &autoexposure {
            op.execute()?;
        }
        for (index, rect) in plan.tiles().iter().enumerate() {
            tracing::trace!(tile = index, h = rect.h, w = rect.w, extent = %rect.extent(), "tile_begin");
            let tiles: Vec<Tile> = plan.stage_tiles(rect);
            for (op, tile) in ops.iter_mut().zip(tiles) {
                op.set_tile(tile)?;
                op.execute()?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::BackendType;
    use crate::image::{Image, ImageDesc, PixelFormat};
    use crate::transfer::Linear;
    use crate::ErrorKind;
    use lumen_backends::{ArchFamily, DeviceCaps, EngineConfig};

    fn scalar_cpu() -> Executor {
        let config = EngineConfig::default().with_caps(DeviceCaps::cpu(ArchFamily::Scalar));
        Executor::with_config(BackendType::Cpu, config).unwrap()
    }

    fn identity(channels: usize) -> Arc<ConvWeights> {
        let mut weights = vec![0.0; channels * channels * 9];
        for c in 0..channels {
            weights[(c * channels + c) * 9 + 4] = 1.0;
        }
        Arc::new(ConvWeights::new(channels, channels, 3, weights, vec![0.0; channels]).unwrap())
    }

    #[test]
    fn output_process_must_be_last() {
        let exec = scalar_cpu();
        let err = exec
            .pipeline(8, 8, 3)
            .output_process()
            .unwrap()
            .conv(identity(3), ConvDesc::default())
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn input_process_must_be_first() {
        let exec = scalar_cpu();
        let err = exec
            .pipeline(8, 8, 3)
            .conv(identity(3), ConvDesc::default())
            .unwrap()
            .input_process(3)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn channel_mismatch_is_rejected() {
        let exec = scalar_cpu();
        let err = exec.pipeline(8, 8, 4).conv(identity(3), ConvDesc::default()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn odd_input_cannot_be_pooled() {
        let exec = scalar_cpu();
        let err = exec.pipeline(9, 8, 3).pool().unwrap().build().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn run_without_bindings_is_a_logic_error() {
        let exec = scalar_cpu();
        let mut pipeline = exec.pipeline(8, 8, 3).conv(identity(3), ConvDesc::default()).unwrap().build().unwrap();
        assert_eq!(pipeline.run_default().unwrap_err().kind(), ErrorKind::LogicError);

        let src = exec.tensor(3, 8, 8).unwrap();
        pipeline.set_source(Source::Tensor(src.binding())).unwrap();
        assert_eq!(pipeline.run_default().unwrap_err().kind(), ErrorKind::LogicError);
    }

    #[test]
    fn bindings_are_checked_against_the_topology() {
        let exec = scalar_cpu();
        let mut pipeline = exec.pipeline(8, 8, 3).conv(identity(3), ConvDesc::default()).unwrap().build().unwrap();

        let wrong_size = exec.tensor(3, 8, 4).unwrap();
        assert!(pipeline.set_source(Source::Tensor(wrong_size.binding())).is_err());

        let image = Image::new(exec.engine(), ImageDesc::new(8, 8, PixelFormat::Float3), Storage::Host).unwrap();
        assert!(pipeline.set_source(Source::color(image.binding())).is_err());
        assert!(pipeline.set_destination(Destination::Image(image.binding())).is_err());
    }

    #[test]
    fn in_place_runs_are_rejected() {
        let exec = scalar_cpu();
        let mut pipeline = exec.pipeline(8, 8, 3).conv(identity(3), ConvDesc::default()).unwrap().build().unwrap();
        let tensor = exec.tensor(3, 8, 8).unwrap();
        pipeline.set_source(Source::Tensor(tensor.binding())).unwrap();
        pipeline.set_destination(Destination::Tensor(tensor.binding())).unwrap();
        assert_eq!(pipeline.run_default().unwrap_err().kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn images_round_trip_through_process_stages() {
        let exec = scalar_cpu();
        let pipeline = exec
            .pipeline(6, 10, 3)
            .transfer(Arc::new(Linear))
            .input_process(3)
            .unwrap()
            .conv(identity(3), ConvDesc::default())
            .unwrap()
            .output_process()
            .unwrap()
            .build()
            .unwrap();
        assert_eq!(pipeline.stage_names(), ["input_process", "conv", "output_process"]);

        let desc = ImageDesc::new(10, 6, PixelFormat::Float3);
        let pixels: Vec<f32> = (0..6 * 10 * 3).map(|i| (i % 7) as f32 / 7.0).collect();
        let color = Image::from_pixels(exec.engine(), desc, Storage::Host, &pixels).unwrap();
        let out = Image::new(exec.engine(), desc, Storage::Host).unwrap();

        let mut pipeline = pipeline;
        pipeline.set_source(Source::color(color.binding())).unwrap();
        pipeline.set_destination(Destination::Image(out.binding())).unwrap();
        pipeline.run(1300).unwrap();

        let result = out.read_pixels().unwrap();
        for (a, b) in result.iter().zip(&pixels) {
            assert!((a - b).abs() < 1e-6, "{a} != {b}");
        }
    }
}
