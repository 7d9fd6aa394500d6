//! Shared fixtures for the integration tests

#![allow(dead_code)]

use lumen_core::{ArchFamily, BackendType, ConvWeights, DeviceCaps, EngineConfig, Executor, Result};
use std::sync::Arc;

/// CPU executor with scalar kernels and `Chw` tensors
pub fn scalar_cpu() -> Executor {
    lumen_tracing::init_test_tracing();
    let config = EngineConfig::default().with_caps(DeviceCaps::cpu(ArchFamily::Scalar));
    Executor::with_config(BackendType::Cpu, config).unwrap()
}

pub fn stream() -> Executor {
    lumen_tracing::init_test_tracing();
    Executor::new(BackendType::Stream).unwrap()
}

/// Deterministic values in [-0.5, 0.5)
pub fn noise(seed: u32, len: usize) -> Vec<f32> {
    let mut state = seed.wrapping_mul(747_796_405).wrapping_add(2_891_336_453);
    (0..len)
        .map(|_| {
            state = state.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
            (state >> 8) as f32 / (1u32 << 24) as f32 - 0.5
        })
        .collect()
}

pub fn weights(seed: u32, out_channels: usize, in_channels: usize, kernel_size: usize) -> Result<Arc<ConvWeights>> {
    let count = out_channels * in_channels * kernel_size * kernel_size;
    let weights = noise(seed, count);
    let bias = noise(seed + 1, out_channels);
    Ok(Arc::new(ConvWeights::new(out_channels, in_channels, kernel_size, weights, bias)?))
}

/// 3x3 convolution passing channels through unchanged, plus `bias`
pub fn identity(channels: usize, bias: f32) -> Result<Arc<ConvWeights>> {
    let mut weights = vec![0.0; channels * channels * 9];
    for c in 0..channels {
        weights[(c * channels + c) * 9 + 4] = 1.0;
    }
    Ok(Arc::new(ConvWeights::new(channels, channels, 3, weights, vec![bias; channels])?))
}

/// Direct zero-padded convolution over planar `[c][h][w]` data
pub fn reference_conv(
    weights: &[f32],
    bias: &[f32],
    x: &[f32],
    in_channels: usize,
    height: usize,
    width: usize,
    kernel_size: usize,
    relu: bool,
) -> Vec<f32> {
    let out_channels = bias.len();
    let halo = (kernel_size / 2) as isize;
    let mut y = vec![0.0f32; out_channels * height * width];
    for o in 0..out_channels {
        for r in 0..height {
            for c in 0..width {
                let mut acc = bias[o];
                for i in 0..in_channels {
                    for kh in 0..kernel_size {
                        for kw in 0..kernel_size {
                            let (sr, sc) = (r as isize + kh as isize - halo, c as isize + kw as isize - halo);
                            if sr < 0 || sc < 0 || sr >= height as isize || sc >= width as isize {
                                continue;
                            }
                            let w = weights[((o * in_channels + i) * kernel_size + kh) * kernel_size + kw];
                            acc += w * x[(i * height + sr as usize) * width + sc as usize];
                        }
                    }
                }
                y[(o * height + r) * width + c] = if relu { acc.max(0.0) } else { acc };
            }
        }
    }
    y
}
