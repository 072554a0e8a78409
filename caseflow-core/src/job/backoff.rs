use crate::config::BackoffConfig;
use rand::Rng;

/// Delay before retry number `attempt` (1-based).
pub fn delay_ms<R: Rng + ?Sized>(config: &BackoffConfig, attempt: u32, rng: &mut R) -> u64 {
    let exponent = attempt.saturating_sub(1).min(63) as i32;
    let raw = config.initial_ms as f64 * config.multiplier.powi(exponent);
    let capped = raw.min(config.max_ms as f64);
    let jitter = if config.jitter > 0.0 {
        capped * config.jitter * rng.gen::<f64>()
    } else {
        0.0
    };
    (capped - jitter).max(0.0) as u64
}
