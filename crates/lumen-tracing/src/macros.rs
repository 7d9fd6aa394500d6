//! Convenience macros for performance spans

/// Create a [`crate::performance::PerformanceSpan`] that logs its duration on drop.
///
/// ```rust
/// use lumen_tracing::perf_span;
///
/// {
///     let _span = perf_span!("conv_tile", tile = 3, rows = 32);
///     // ... work ...
/// }
/// ```
#[macro_export]
macro_rules! perf_span {
    ($name:expr) => {{
        $crate::performance::PerformanceSpan::new($name, None)
    }};
    ($name:expr, $($field:tt = $value:expr),+ $(,)?) => {{
        $crate::performance::PerformanceSpan::with_fields(
            $name,
            None,
            $crate::tracing::debug_span!("perf", name = $name, $($field = $value),+),
        )
    }};
}

/// Like [`perf_span!`], but only logs when the duration reaches `threshold_us`.
#[macro_export]
macro_rules! perf_span_threshold {
    ($name:expr, $threshold_us:expr) => {{
        $crate::performance::PerformanceSpan::new($name, Some($threshold_us))
    }};
    ($name:expr, $threshold_us:expr, $($field:tt = $value:expr),+ $(,)?) => {{
        $crate::performance::PerformanceSpan::with_fields(
            $name,
            Some($threshold_us),
            $crate::tracing::debug_span!("perf", name = $name, $($field = $value),+),
        )
    }};
}

/// Evaluate a block and return `(result, duration_us)`.
///
/// ```rust
/// use lumen_tracing::timed_block;
///
/// let (sum, _us) = timed_block!("sum", { (1..=10).sum::<i32>() });
/// assert_eq!(sum, 55);
/// ```
#[macro_export]
macro_rules! timed_block {
    ($name:expr, $block:block) => {{
        let start = std::time::Instant::now();
        let result = $block;
        let duration_us = start.elapsed().as_micros() as u64;
        $crate::tracing::debug!(operation = $name, duration_us = duration_us, "timed_block_complete");
        (result, duration_us)
    }};
}

#[cfg(test)]
mod tests {
    use std::thread;
    use std::time::Duration;

    #[test]
    fn perf_span_with_and_without_fields() {
        let _plain = perf_span!("plain");
        let _fielded = perf_span!("fielded", tile = 1, rows = 16);
    }

    #[test]
    fn threshold_span_accepts_fields() {
        let _span = perf_span_threshold!("slow_only", 1_000, bytes = 2048);
    }

    #[test]
    fn timed_block_measures_duration() {
        let (value, duration_us) = timed_block!("sleep", {
            thread::sleep(Duration::from_millis(5));
            7
        });
        assert_eq!(value, 7);
        assert!(duration_us >= 5_000);
    }

    #[test]
    fn timed_block_passes_errors_through() {
        let (result, _) = timed_block!("failing", { Result::<u8, &str>::Err("boom") });
        assert_eq!(result, Err("boom"));
    }
}
