//! Run configuration

use std::env;

/// Default intermediate memory budget: 512 MiB
pub const DEFAULT_MEMORY_BUDGET: usize = 512 * 1024 * 1024;

/// Options of one [`crate::Pipeline`] run
#[derive(Debug, Clone, PartialEq)]
pub struct RunConfig {
    /// Bytes available for intermediate tensors
    pub memory_budget: usize,
    /// Smallest tile edge, on top of the backend's own floor
    pub min_tile_size: usize,
    /// Treat color as high dynamic range
    pub hdr: bool,
    /// Fixed input scale; `None` lets HDR runs estimate exposure
    pub input_scale: Option<f32>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            memory_budget: DEFAULT_MEMORY_BUDGET,
            min_tile_size: 0,
            hdr: false,
            input_scale: None,
        }
    }
}

impl RunConfig {
    pub fn with_memory_budget(mut self, bytes: usize) -> Self {
        self.memory_budget = bytes;
        self
    }

    pub fn with_min_tile_size(mut self, edge: usize) -> Self {
        self.min_tile_size = edge;
        self
    }

    pub fn with_hdr(mut self, hdr: bool) -> Self {
        self.hdr = hdr;
        self
    }

    pub fn with_input_scale(mut self, scale: f32) -> Self {
        self.input_scale = Some(scale);
        self
    }

    /// Defaults overridden from the environment
    ///
    /// - `LUMEN_MAX_MEMORY_MB`: memory budget in MiB
    /// - `LUMEN_MIN_TILE`: minimum tile edge
    /// - `LUMEN_HDR`: `true`/`1`/`yes`
    /// - `LUMEN_INPUT_SCALE`: positive finite input scale
    ///
    /// Unparsable values are ignored.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(mb) = parse_var::<usize>("LUMEN_MAX_MEMORY_MB") {
            config.memory_budget = mb.saturating_mul(1024 * 1024);
        }
        if let Some(edge) = parse_var::<usize>("LUMEN_MIN_TILE") {
            config.min_tile_size = edge;
        }
        if let Ok(flag) = env::var("LUMEN_HDR") {
            config.hdr = flag.eq_ignore_ascii_case("true") || flag == "1" || flag.eq_ignore_ascii_case("yes");
        }
        if let Some(scale) = parse_var::<f32>("LUMEN_INPUT_SCALE") {
            if scale.is_finite() && scale > 0.0 {
                config.input_scale = Some(scale);
            } else {
                tracing::warn!(scale, "ignoring LUMEN_INPUT_SCALE");
            }
        }

        config
    }
}

fn parse_var<T: std::str::FromStr>(name: &str) -> Option<T> {
    let value = env::var(name).ok()?;
    let parsed = value.trim().parse().ok();
    if parsed.is_none() {
        tracing::warn!(name, value = %value, "ignoring unparsable setting");
    }
    parsed
}
