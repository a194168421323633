use rand::Rng;
use std::time::Duration;

/// Delay before retry attempt `n` (1-indexed): `min(base * 2^(n-1), cap)`.
pub fn backoff_delay(base: Duration, cap: Duration, attempt: u32) -> Duration {
    if attempt == 0 {
        return Duration::ZERO;
    }
    let factor = 2u32.checked_pow(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
    base.checked_mul(factor).unwrap_or(cap).min(cap)
}

/// Spread a delay by up to +/-20% to avoid thundering retries.
pub fn with_jitter(delay: Duration) -> Duration {
    if delay.is_zero() {
        return delay;
    }
    let spread = rand::thread_rng().gen_range(0.8..=1.2);
    delay.mul_f64(spread)
}
