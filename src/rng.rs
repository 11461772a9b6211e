use rand::Rng;

/// Injectable source of randomness.
///
/// Every probabilistic gate in the system (proactive intervals, the emotion
/// sampling rate, the moment-comment skip, cycle jitter) goes through this
/// trait so tests can force either branch deterministically.
pub trait RandomSource: Send + Sync {
    /// Returns true with the given probability (clamped to [0, 1]).
    fn chance(&self, probability: f64) -> bool;

    /// Uniform integer in `[min, max]` inclusive. Returns `min` when the
    /// range is empty or inverted.
    fn range_i64(&self, min: i64, max: i64) -> i64;

    /// Uniform index in `[0, len)`. Returns 0 for empty or single-element
    /// collections.
    fn pick(&self, len: usize) -> usize;
}

/// Default source backed by the thread-local rand generator.
pub struct ThreadRngSource;

impl RandomSource for ThreadRngSource {
    fn chance(&self, probability: f64) -> bool {
        rand::thread_rng().gen_bool(probability.clamp(0.0, 1.0))
    }

    fn range_i64(&self, min: i64, max: i64) -> i64 {
        if min >= max {
            return min;
        }
        rand::thread_rng().gen_range(min..=max)
    }

    fn pick(&self, len: usize) -> usize {
        if len <= 1 {
            return 0;
        }
        rand::thread_rng().gen_range(0..len)
    }
}
