//! Engine behavior seen through pipelines

mod common;

use common::{identity, noise, scalar_cpu, stream, weights};
use lumen_backends::BackendError;
use lumen_core::{
    ArchFamily, BackendType, ConvDesc, DataType, Destination, DeviceCaps, EngineConfig, ErrorKind, Executor, ImageDesc,
    Layout, Linear, Pipeline, PixelFormat, PostOp, Result, RunConfig, Source, Storage, Tensor, TensorDesc,
};
use std::sync::Arc;

fn unet(exec: &Executor, height: usize, width: usize) -> Result<Pipeline> {
    exec.pipeline(height, width, 3)
        .conv(weights(41, 8, 3, 3)?, ConvDesc::relu().with_post_op(PostOp::Pool))?
        .conv(weights(42, 8, 8, 3)?, ConvDesc::relu().with_post_op(PostOp::Upsample))?
        .conv(weights(43, 3, 8, 3)?, ConvDesc::default())?
        .build()
}

fn run(exec: &Executor, height: usize, width: usize, x: &[f32], budget: usize) -> Result<Vec<f32>> {
    let mut pipeline = unet(exec, height, width)?;
    let src = exec.tensor_from_chw(3, height, width, x)?;
    let dst = exec.tensor(3, height, width)?;
    pipeline.set_source(Source::Tensor(src.binding()))?;
    pipeline.set_destination(Destination::Tensor(dst.binding()))?;
    pipeline.run(budget)?;
    dst.read_chw()
}

// ============================================================================
// Backends agree
// ============================================================================

#[test]
fn test_stream_engine_matches_cpu() -> Result<()> {
    let x = noise(40, 3 * 48 * 32);
    let cpu = run(&scalar_cpu(), 48, 32, &x, usize::MAX)?;

    let exec = stream();
    assert_eq!(exec.default_storage(), Storage::Device);
    assert_eq!(exec.registry().layout(), Layout::Chw16c);
    let tiled = run(&exec, 48, 32, &x, 40_000)?;
    assert_eq!(tiled, cpu);
    Ok(())
}

#[test]
fn test_stream_engine_rejects_standalone_resampling() {
    let exec = stream();
    let err = exec.pipeline(16, 16, 3).pool().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
}

// ============================================================================
// Storage classes
// ============================================================================

#[test]
fn test_cpu_engine_has_no_device_memory() {
    let exec = scalar_cpu();
    let err = exec.engine().allocate(256, Storage::Device).unwrap_err();
    assert!(err.is_invalid_argument());

    let desc = TensorDesc::new(3, 4, 4, Layout::Chw, DataType::F32);
    let err = Tensor::new(exec.engine(), desc, Storage::Device).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
}

#[test]
fn test_capacity_limits_the_arena() -> Result<()> {
    let config = EngineConfig::default()
        .with_caps(DeviceCaps::cpu(ArchFamily::Scalar))
        .with_capacity(3 * 16 * 16 * 4 * 2 + 1024);
    let exec = Executor::with_config(BackendType::Cpu, config)?;
    let mut pipeline = exec
        .pipeline(16, 16, 3)
        .conv(weights(51, 32, 3, 3)?, ConvDesc::relu())?
        .conv(weights(52, 3, 32, 3)?, ConvDesc::default())?
        .build()?;
    let src = exec.tensor(3, 16, 16)?;
    let dst = exec.tensor(3, 16, 16)?;
    pipeline.set_source(Source::Tensor(src.binding()))?;
    pipeline.set_destination(Destination::Tensor(dst.binding()))?;

    let err = pipeline.run(usize::MAX).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::OutOfMemory);
    Ok(())
}

// ============================================================================
// Device failures
// ============================================================================

#[test]
fn test_failed_host_callback_invalidates_stream_engine() -> Result<()> {
    let exec = stream();
    let mut pipeline = unet(&exec, 16, 16)?;
    let src = exec.tensor_from_chw(3, 16, 16, &noise(60, 3 * 16 * 16))?;
    let dst = exec.tensor(3, 16, 16)?;
    pipeline.set_source(Source::Tensor(src.binding()))?;
    pipeline.set_destination(Destination::Tensor(dst.binding()))?;

    exec.engine()
        .submit_host_func(Box::new(|| Err(BackendError::execution_error("callback failed"))))?;
    assert_eq!(exec.wait().unwrap_err().kind(), ErrorKind::DeviceError);

    let err = pipeline.run_default().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::DeviceError);
    assert!(exec.engine().submit_barrier().is_err());
    Ok(())
}

#[test]
fn test_failed_kernel_invalidates_cpu_engine() -> Result<()> {
    let exec = scalar_cpu();
    let mut pipeline = unet(&exec, 16, 16)?;
    let src = exec.tensor_from_chw(3, 16, 16, &noise(61, 3 * 16 * 16))?;
    let dst = exec.tensor(3, 16, 16)?;
    pipeline.set_source(Source::Tensor(src.binding()))?;
    pipeline.set_destination(Destination::Tensor(dst.binding()))?;

    let scratch = exec.engine().allocate(4, Storage::Host)?;
    let err: lumen_core::Error = exec
        .engine()
        .submit_kernel(Box::new(move |memory| {
            let mut out = [0u8; 16];
            memory.read_host(scratch, 0, &mut out)
        }))
        .unwrap_err()
        .into();
    assert_eq!(err.kind(), ErrorKind::DeviceError);
    assert_eq!(exec.wait().unwrap_err().kind(), ErrorKind::DeviceError);

    let err = pipeline.run_default().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::DeviceError);
    Ok(())
}

// ============================================================================
// Exposure
// ============================================================================

#[test]
fn test_constant_hdr_image_is_scaled_by_its_exposure() -> Result<()> {
    for exec in [scalar_cpu(), stream()] {
        let config = RunConfig::default().with_hdr(true);
        let mut pipeline = exec
            .pipeline(20, 20, 3)
            .config(config)
            .transfer(Arc::new(Linear))
            .input_process(3)?
            .conv(identity(3, 0.18)?, ConvDesc::default())?
            .output_process()?
            .build()?;

        let desc = ImageDesc::new(20, 20, PixelFormat::Float3);
        let color = exec.image_from_pixels(desc, &vec![0.5; 20 * 20 * 3])?;
        let out = exec.image(desc)?;
        pipeline.set_source(Source::color(color.binding()))?;
        pipeline.set_destination(Destination::Image(out.binding()))?;
        pipeline.run_default()?;

        // exposure = 0.18 / 0.5; the network adds 0.18 in scaled space
        for value in out.read_pixels()? {
            assert!((value - 1.0).abs() < 1e-4, "{value}");
        }
    }
    Ok(())
}

#[test]
fn test_fixed_input_scale_skips_autoexposure() -> Result<()> {
    let exec = scalar_cpu();
    let config = RunConfig::default().with_hdr(true).with_input_scale(2.0);
    let mut pipeline = exec
        .pipeline(8, 8, 3)
        .config(config)
        .transfer(Arc::new(Linear))
        .input_process(3)?
        .conv(identity(3, 0.5)?, ConvDesc::default())?
        .output_process()?
        .build()?;

    let desc = ImageDesc::new(8, 8, PixelFormat::Float4);
    let color = exec.image_from_pixels(desc, &[0.25, 0.25, 0.25, 1.0].repeat(64))?;
    let out = exec.image(desc)?;
    pipeline.set_source(Source::color(color.binding()))?;
    pipeline.set_destination(Destination::Image(out.binding()))?;
    pipeline.run_default()?;

    // (0.25 * 2 + 0.5) / 2
    for pixel in out.read_pixels()?.chunks(4) {
        assert_eq!(pixel, [0.5, 0.5, 0.5, 1.0]);
    }
    Ok(())
}
