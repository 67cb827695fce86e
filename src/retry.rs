use rand::Rng;
use std::time::Duration;

/// Exponential backoff `base * 2^attempt`, capped at `max`, then scaled by a
/// random factor in `[0.5, 1.5)`.
pub fn jitter_delay(base: Duration, attempt: u32, max: Duration) -> Duration {
    let factor = rand::thread_rng().gen_range(0.5..1.5);
    capped_delay(base, attempt, max).mul_f64(factor)
}

pub fn capped_delay(base: Duration, attempt: u32, max: Duration) -> Duration {
    let multiplier = 1u32 << attempt.min(16);
    base.saturating_mul(multiplier).min(max)
}
