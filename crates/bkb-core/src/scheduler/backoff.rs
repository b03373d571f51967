use std::time::Duration;

/// Exponential retry delay: `base * 2^attempts`, capped at `max`.
///
/// The delay is derived from the attempt number alone, so repeated failures
/// never compound rounding or clamping from earlier attempts.
#[derive(Clone, Copy, Debug)]
pub struct RetryBackoff {
    pub base: Duration,
    pub max: Duration,
}

impl RetryBackoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max }
    }

    pub fn delay(&self, attempts: u32) -> Duration {
        let exp = attempts.min(i32::MAX as u32) as i32;
        let secs = self.base.as_secs_f64() * 2f64.powi(exp);
        if !secs.is_finite() || secs > self.max.as_secs_f64() {
            self.max
        } else {
            Duration::from_secs_f64(secs.max(0.0))
        }
    }
}
