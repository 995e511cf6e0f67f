/// Shown until there is enough signal for an estimate.
pub const CALCULATING: &str = "Calculating...";

/// Minimum observation window before extrapolating.
const MIN_ELAPSED_MS: i64 = 1000;

/// Estimated time remaining from a single linear rate sample.
///
/// `rate = current / elapsed_ms`, `remaining = (total - current) / rate`,
/// rounded up to whole seconds and rendered as `"{s}s"` under a minute,
/// `"{ceil(s / 60)}m"` otherwise.
pub fn estimate_remaining(current: usize, total: usize, elapsed_ms: i64) -> String {
    if current == 0 || elapsed_ms < MIN_ELAPSED_MS {
        return CALCULATING.to_string();
    }
    let rate = current as f64 / elapsed_ms as f64;
    if !rate.is_finite() || rate <= f64::EPSILON {
        return CALCULATING.to_string();
    }

    let remaining_ms = total.saturating_sub(current) as f64 / rate;
    let seconds = (remaining_ms / 1000.0).ceil() as u64;
    if seconds < 60 {
        format!("{seconds}s")
    } else {
        format!("{}m", seconds.div_ceil(60))
    }
}
