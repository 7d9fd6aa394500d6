//! Operator selection per device
//!
//! A [`Registry`] is computed once from an engine's [`DeviceCaps`] and picks
//! one implementation, layout and element type for every operator kind. All
//! support checks happen here, when operators are constructed, so the
//! per-tile path never fails on an unsupported combination.
//!
//! | capability           | selection                                          |
//! |----------------------|----------------------------------------------------|
//! | `vector_width`       | `Reference` (1) or `Blocked { block: width }`       |
//! | `vector_width`       | `Chw` / `Chw8c` (8) / `Chw16c` (16)                 |
//! | `native_type`        | element type of intermediate tensors               |
//! | `max_work_group_size`| autoexposure reduction width 1024 / 512 / 256      |

use crate::error::{Error, Result};
use crate::image::ImageBinding;
use crate::ops::{
    Autoexposure, Conv, ConvDesc, ConvImpl, ConvWeights, ImageCopy, InputProcess, OutputProcess, Pool, ProcessDesc,
    Upsample,
};
use crate::tensor::{Layout, TensorBinding, TensorDesc};
use lumen_backends::{DataType, DeviceCaps, Engine};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registry {
    caps: DeviceCaps,
    conv: ConvImpl,
    layout: Layout,
    data_type: DataType,
    reduction_width: usize,
}

impl Registry {
    pub fn new(caps: &DeviceCaps) -> Self {
        let conv = if caps.vector_width > 1 {
            ConvImpl::Blocked {
                block: caps.vector_width,
            }
        } else {
            ConvImpl::Reference
        };
        let reduction_width = match caps.max_work_group_size {
            n if n >= 1024 => 1024,
            n if n >= 512 => 512,
            _ => 256,
        };
        Self {
            caps: caps.clone(),
            conv,
            layout: Layout::for_vector_width(caps.vector_width),
            data_type: caps.native_type,
            reduction_width,
        }
    }

    pub fn for_engine(engine: &dyn Engine) -> Self {
        Self::new(engine.caps())
    }

    pub fn caps(&self) -> &DeviceCaps {
        &self.caps
    }

    pub fn conv_impl(&self) -> ConvImpl {
        self.conv
    }

    pub fn layout(&self) -> Layout {
        self.layout
    }

    pub fn data_type(&self) -> DataType {
        self.data_type
    }

    pub fn reduction_width(&self) -> usize {
        self.reduction_width
    }

    /// Descriptor of a tensor in this device's layout and element type
    pub fn tensor_desc(&self, channels: usize, height: usize, width: usize) -> TensorDesc {
        TensorDesc::new(channels, height, width, self.layout, self.data_type)
    }

    /// Reject tensors whose layout or element type the device's kernels do not use
    pub fn check_tensor(&self, binding: &TensorBinding) -> Result<()> {
        let desc = &binding.desc;
        if desc.layout != self.layout || desc.data_type != self.data_type {
            return Err(Error::invalid(format!(
                "{:?}/{} tensor is not supported here; expected {:?}/{}",
                desc.layout, desc.data_type, self.layout, self.data_type
            )));
        }
        Ok(())
    }

    /// Reject fusion options the device cannot run
    pub fn check_conv(&self, desc: &ConvDesc) -> Result<()> {
        if !self.caps.supports_post_op(desc.post_op) {
            return Err(Error::invalid(format!(
                "{:?} cannot be fused into a convolution on {:?}",
                desc.post_op, self.caps.arch
            )));
        }
        Ok(())
    }

    /// Reject standalone resampling on devices without those kernels
    pub fn check_resample(&self, kind: &str) -> Result<()> {
        if !self.caps.standalone_resample {
            return Err(Error::invalid(format!(
                "standalone {kind} is not implemented on {:?}; fuse it into the preceding convolution",
                self.caps.arch
            )));
        }
        Ok(())
    }

    pub fn conv(
        &self,
        engine: &Arc<dyn Engine>,
        desc: ConvDesc,
        weights: Arc<ConvWeights>,
        src: TensorBinding,
        dst: TensorBinding,
    ) -> Result<Conv> {
        self.check_conv(&desc)?;
        self.check_tensor(&src)?;
        self.check_tensor(&dst)?;
        Conv::new(Arc::clone(engine), self.conv, desc, weights, src, dst)
    }

    pub fn pool(&self, engine: &Arc<dyn Engine>, src: TensorBinding, dst: TensorBinding) -> Result<Pool> {
        self.check_resample("pooling")?;
        self.check_tensor(&src)?;
        self.check_tensor(&dst)?;
        Pool::new(Arc::clone(engine), src, dst)
    }

    pub fn upsample(&self, engine: &Arc<dyn Engine>, src: TensorBinding, dst: TensorBinding) -> Result<Upsample> {
        self.check_resample("upsampling")?;
        self.check_tensor(&src)?;
        self.check_tensor(&dst)?;
        Upsample::new(Arc::clone(engine), src, dst)
    }

    pub fn input_process(
        &self,
        engine: &Arc<dyn Engine>,
        desc: ProcessDesc,
        color: ImageBinding,
        albedo: Option<ImageBinding>,
        normal: Option<ImageBinding>,
        dst: TensorBinding,
    ) -> Result<InputProcess> {
        self.check_tensor(&dst)?;
        InputProcess::new(Arc::clone(engine), desc, color, albedo, normal, dst)
    }

    pub fn output_process(
        &self,
        engine: &Arc<dyn Engine>,
        desc: ProcessDesc,
        src: TensorBinding,
        dst: ImageBinding,
    ) -> Result<OutputProcess> {
        self.check_tensor(&src)?;
        OutputProcess::new(Arc::clone(engine), desc, src, dst)
    }

    pub fn image_copy(&self, engine: &Arc<dyn Engine>, src: ImageBinding, dst: ImageBinding) -> Result<ImageCopy> {
        ImageCopy::new(Arc::clone(engine), src, dst)
    }

    /// Autoexposure writing into a one-element `f32` tensor
    pub fn autoexposure(&self, engine: &Arc<dyn Engine>, src: ImageBinding, dst: TensorBinding) -> Result<Autoexposure> {
        Autoexposure::new(Arc::clone(engine), self.reduction_width, src, dst)
    }
}
