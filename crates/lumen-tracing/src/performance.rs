//! Timing spans and standard performance events.
//!
//! ```rust
//! use lumen_tracing::performance::{record_transfer, PerformanceSpan};
//!
//! let span = PerformanceSpan::new("tile_pass", Some(100));
//! drop(span); // logged only if it took at least 100μs
//!
//! record_transfer(4096, "H2D", 250);
//! ```

use std::time::Instant;

/// RAII guard that times a region and logs the duration when dropped.
pub struct PerformanceSpan {
    name: String,
    threshold_us: Option<u64>,
    start: Instant,
    span: tracing::Span,
}

impl PerformanceSpan {
    /// Start a span; `threshold_us = None` logs unconditionally.
    pub fn new(name: impl Into<String>, threshold_us: Option<u64>) -> Self {
        let name = name.into();
        let span = tracing::debug_span!("perf", name = %name);
        Self::with_fields(name, threshold_us, span)
    }

    /// Start a span around an already constructed `tracing` span carrying extra fields.
    pub fn with_fields(name: impl Into<String>, threshold_us: Option<u64>, span: tracing::Span) -> Self {
        Self {
            name: name.into(),
            threshold_us,
            start: Instant::now(),
            span,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Microseconds since the span was started.
    pub fn elapsed_us(&self) -> u64 {
        self.start.elapsed().as_micros() as u64
    }

    pub fn enter(&self) -> tracing::span::Entered<'_> {
        self.span.enter()
    }
}

impl Drop for PerformanceSpan {
    fn drop(&mut self) {
        let elapsed_us = self.elapsed_us();
        if self.threshold_us.map_or(true, |t| elapsed_us >= t) {
            let _entered = self.span.enter();
            tracing::debug!(
                duration_us = elapsed_us,
                duration_ms = elapsed_us as f64 / 1000.0,
                "performance_span_complete"
            );
        }
    }
}

/// Record an engine allocation.
pub fn record_allocation(size_bytes: usize, storage: &str, duration_us: u64) {
    tracing::debug!(
        event = "allocation",
        size_bytes = size_bytes,
        size_kb = size_bytes as f64 / 1024.0,
        storage = storage,
        duration_us = duration_us,
        "memory_allocation"
    );
}

/// Record a copy with its bandwidth. `direction` is one of `H2D`, `D2H`, `D2D`.
pub fn record_transfer(bytes: usize, direction: &str, duration_us: u64) {
    let bandwidth_mbps = if duration_us > 0 {
        (bytes as f64 / duration_us as f64) * 1_000_000.0 / (1024.0 * 1024.0)
    } else {
        0.0
    };

    tracing::debug!(
        event = "transfer",
        bytes = bytes,
        direction = direction,
        duration_us = duration_us,
        bandwidth_mbps = bandwidth_mbps,
        "data_transfer"
    );
}

/// Record pixel throughput for one operator invocation.
pub fn record_throughput(operator: &str, pixels: usize, duration_us: u64) {
    let mpix_per_sec = if duration_us > 0 {
        pixels as f64 / duration_us as f64
    } else {
        0.0
    };

    tracing::trace!(
        event = "throughput",
        operator = operator,
        pixels = pixels,
        duration_us = duration_us,
        mpix_per_sec = mpix_per_sec,
        "operator_throughput"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn span_reports_elapsed_time() {
        let span = PerformanceSpan::new("sleepy", None);
        thread::sleep(Duration::from_millis(2));
        assert!(span.elapsed_us() >= 2_000);
        assert_eq!(span.name(), "sleepy");
    }

    #[test]
    fn span_below_threshold_is_silent() {
        let span = PerformanceSpan::new("fast", Some(u64::MAX));
        let _entered = span.enter();
    }

    #[test]
    fn record_helpers_accept_zero_duration() {
        record_allocation(1024, "Host", 0);
        record_transfer(4096, "D2H", 0);
        record_throughput("conv", 64 * 64, 0);
    }
}
