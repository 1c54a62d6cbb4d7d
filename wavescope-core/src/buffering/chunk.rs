//! Typed audio chunk passed from a source worker to the analyzer thread.

/// A contiguous run of mono f32 samples with the capture timestamp of its
/// first sample.
///
/// Allocated once per worker iteration (never on the RT callback). The
/// stream format is latched separately when the source announces it; a
/// chunk carries only what varies per delivery.
#[derive(Debug, Clone)]
pub struct FloatChunk {
    /// Mono f32 samples in [-1.0, 1.0].
    pub samples: Vec<f32>,
    /// Monotonic nanosecond timestamp of `samples[0]`.
    pub timestamp_ns: u64,
}

impl FloatChunk {
    pub fn new(samples: Vec<f32>, timestamp_ns: u64) -> Self {
        Self {
            samples,
            timestamp_ns,
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}
