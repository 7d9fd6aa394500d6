//! Executor: one engine plus the registry computed for it
//!
//! ```text
//! lumen_core::Executor
//!   ├── Arc<dyn Engine>   (CpuEngine | StreamEngine)
//!   └── Registry          (operator selection for the engine's DeviceCaps)
//! ```
//!
//! Tensors and images made through the executor use the registry's layout
//! and element type and the engine's preferred storage, so they can be bound
//! straight into a [`crate::Pipeline`].

use crate::error::{Error, Result};
use crate::image::{Image, ImageDesc};
use crate::pipeline::PipelineBuilder;
use crate::registry::Registry;
use crate::tensor::Tensor;
use lumen_backends::{CpuEngine, DeviceCaps, Engine, EngineConfig, Storage, StreamEngine};
use std::env;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Backend type for executor initialization
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendType {
    /// Inline execution on the calling thread (always available)
    Cpu,
    /// Asynchronous command queue on a worker thread
    Stream,
}

impl FromStr for BackendType {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "cpu" => Ok(BackendType::Cpu),
            "stream" => Ok(BackendType::Stream),
            other => Err(Error::invalid(format!("unknown backend '{other}'"))),
        }
    }
}

impl fmt::Display for BackendType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BackendType::Cpu => "cpu",
            BackendType::Stream => "stream",
        })
    }
}

pub struct Executor {
    backend: BackendType,
    engine: Arc<dyn Engine>,
    registry: Registry,
}

impl Executor {
    pub fn new(backend: BackendType) -> Result<Self> {
        Self::with_config(backend, EngineConfig::default())
    }

    #[tracing::instrument(skip(config), fields(capacity = ?config.capacity))]
    pub fn with_config(backend: BackendType, config: EngineConfig) -> Result<Self> {
        let start = std::time::Instant::now();
        let engine: Arc<dyn Engine> = match backend {
            BackendType::Cpu => Arc::new(CpuEngine::with_config(config)),
            BackendType::Stream => Arc::new(StreamEngine::with_config(config)?),
        };
        let registry = Registry::for_engine(engine.as_ref());

        tracing::debug!(
            duration_us = start.elapsed().as_micros() as u64,
            backend = %backend,
            arch = ?registry.caps().arch,
            conv = ?registry.conv_impl(),
            layout = ?registry.layout(),
            "executor_created"
        );
        Ok(Self {
            backend,
            engine,
            registry,
        })
    }

    /// Backend named by `LUMEN_BACKEND`, CPU when unset
    #[tracing::instrument]
    pub fn new_auto() -> Result<Self> {
        let backend = match env::var("LUMEN_BACKEND") {
            Ok(value) if !value.trim().is_empty() => value.parse()?,
            _ => BackendType::Cpu,
        };
        tracing::info!(backend = %backend, "auto-selected backend");
        Self::new(backend)
    }

    pub fn backend_type(&self) -> BackendType {
        self.backend
    }

    pub fn engine(&self) -> &Arc<dyn Engine> {
        &self.engine
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn caps(&self) -> &DeviceCaps {
        self.registry.caps()
    }

    /// Device memory when the engine has it, host memory otherwise
    pub fn default_storage(&self) -> Storage {
        if self.caps().device_memory {
            Storage::Device
        } else {
            Storage::Host
        }
    }

    /// Zeroed tensor in the registry's layout and element type
    pub fn tensor(&self, channels: usize, height: usize, width: usize) -> Result<Tensor> {
        let desc = self.registry.tensor_desc(channels, height, width);
        Tensor::new(&self.engine, desc, self.default_storage())
    }

    /// Tensor filled from planar `[c][h][w]` values
    pub fn tensor_from_chw(&self, channels: usize, height: usize, width: usize, data: &[f32]) -> Result<Tensor> {
        let desc = self.registry.tensor_desc(channels, height, width);
        Tensor::from_chw(&self.engine, desc, self.default_storage(), data)
    }

    pub fn image(&self, desc: ImageDesc) -> Result<Image> {
        Image::new(&self.engine, desc, self.default_storage())
    }

    /// Image filled from interleaved pixel values
    pub fn image_from_pixels(&self, desc: ImageDesc, pixels: &[f32]) -> Result<Image> {
        Image::from_pixels(&self.engine, desc, self.default_storage(), pixels)
    }

    /// Start a pipeline over a `height` x `width` input with `in_channels` channels
    pub fn pipeline(&self, height: usize, width: usize, in_channels: usize) -> PipelineBuilder {
        PipelineBuilder::new(self, height, width, in_channels)
    }

    /// Block until all submitted work completed
    pub fn wait(&self) -> Result<()> {
        self.engine.wait()?;
        Ok(())
    }
}

impl fmt::Debug for Executor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Executor")
            .field("backend", &self.backend)
            .field("engine", &self.engine.name())
            .field("registry", &self.registry)
            .finish()
    }
}
