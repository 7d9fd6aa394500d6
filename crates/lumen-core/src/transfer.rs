//! Transfer functions applied by the input and output process operators
//!
//! `forward` maps linear color into the space the network works in;
//! `inverse` maps network output back to linear color.

use std::fmt;

pub trait TransferFunction: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    fn forward(&self, y: f32) -> f32;

    fn inverse(&self, x: f32) -> f32;
}

/// Identity curve
#[derive(Debug, Clone, Copy, Default)]
pub struct Linear;

impl TransferFunction for Linear {
    fn name(&self) -> &str {
        "linear"
    }

    fn forward(&self, y: f32) -> f32 {
        y
    }

    fn inverse(&self, x: f32) -> f32 {
        x
    }
}

/// sRGB encoding curve
#[derive(Debug, Clone, Copy, Default)]
pub struct Srgb;

impl Srgb {
    const A: f32 = 12.92;
    const B: f32 = 1.055;
    const C: f32 = 1.0 / 2.4;
    const D: f32 = -0.055;
    const Y0: f32 = 0.003_130_8;
    const X0: f32 = 0.040_45;
}

impl TransferFunction for Srgb {
    fn name(&self) -> &str {
        "srgb"
    }

    fn forward(&self, y: f32) -> f32 {
        if y <= Self::Y0 {
            Self::A * y
        } else {
            Self::B * y.powf(Self::C) + Self::D
        }
    }

    fn inverse(&self, x: f32) -> f32 {
        if x <= Self::X0 {
            x / Self::A
        } else {
            ((x - Self::D) / Self::B).powf(1.0 / Self::C)
        }
    }
}

/// Logarithmic curve normalizing `[0, max_value]` to `[0, 1]`
#[derive(Debug, Clone, Copy)]
pub struct Log {
    scale: f32,
}

impl Log {
    pub fn new(max_value: f32) -> Self {
        Self {
            scale: 1.0 / max_value.ln_1p(),
        }
    }
}

impl Default for Log {
    /// Covers the finite range of half precision
    fn default() -> Self {
        Self::new(65504.0)
    }
}

impl TransferFunction for Log {
    fn name(&self) -> &str {
        "log"
    }

    fn forward(&self, y: f32) -> f32 {
        y.ln_1p() * self.scale
    }

    fn inverse(&self, x: f32) -> f32 {
        (x / self.scale).exp_m1()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_inverts(tf: &dyn TransferFunction, values: &[f32]) {
        for &y in values {
            let back = tf.inverse(tf.forward(y));
            assert!((back - y).abs() <= 1e-4 * y.max(1.0), "{}: {y} -> {back}", tf.name());
        }
    }

    #[test]
    fn curves_invert() {
        let values = [0.0, 0.001, 0.02, 0.18, 0.5, 1.0];
        assert_inverts(&Linear, &values);
        assert_inverts(&Srgb, &values);
        assert_inverts(&Log::default(), &[0.0, 0.5, 1.0, 10.0, 1000.0]);
    }

    #[test]
    fn srgb_known_points() {
        assert_eq!(Srgb.forward(0.0), 0.0);
        assert!((Srgb.forward(1.0) - 1.0).abs() < 1e-6);
        assert!((Srgb.forward(0.18) - 0.4613).abs() < 1e-3);
    }

    #[test]
    fn log_normalizes_max_to_one() {
        let tf = Log::new(100.0);
        assert!((tf.forward(100.0) - 1.0).abs() < 1e-6);
    }
}
