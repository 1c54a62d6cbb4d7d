//! Process-wide monotonic clock.
//!
//! All pipeline timestamps are nanoseconds on a single monotonic scale.
//! The origin is latched on first use, so values are comparable across
//! threads for the lifetime of the process but carry no wall-clock meaning.

use std::sync::OnceLock;
use std::time::Instant;

static ORIGIN: OnceLock<Instant> = OnceLock::new();

/// Current monotonic timestamp in nanoseconds since the process origin.
pub fn now_ns() -> u64 {
    let origin = ORIGIN.get_or_init(Instant::now);
    origin.elapsed().as_nanos() as u64
}

#[cfg(test)]
mod tests {
    use super::now_ns;

    #[test]
    fn monotonic_across_calls() {
        let a = now_ns();
        let b = now_ns();
        let c = now_ns();
        assert!(a <= b && b <= c);
    }
}
