//! Bounded PCM buffer between a capture callback and its reader

use std::collections::VecDeque;
use std::time::Duration;

/// Audio a microphone track holds for its reader before dropping the oldest
pub const MAX_BUFFERED_AUDIO: Duration = Duration::from_millis(500);

/// FIFO of interleaved samples with a fixed capacity
///
/// Pushing past the capacity drops the oldest whole frames, so a reader that
/// never drains costs at most `capacity` samples.
#[derive(Debug)]
pub struct SampleRing {
    samples: VecDeque<f32>,
    capacity: usize,
    dropped: u64,
}

impl SampleRing {
    /// Ring holding `window` of audio in the given format
    pub fn for_window(sample_rate: u32, channels: u16, window: Duration) -> Self {
        let channels = usize::from(channels.max(1));
        let frames = (u128::from(sample_rate) * window.as_millis() / 1000) as usize;
        Self::with_capacity(frames.max(1) * channels)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
            dropped: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Samples discarded so far to stay within capacity
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn push(&mut self, data: &[f32]) {
        let data = if data.len() > self.capacity {
            let skip = data.len() - self.capacity;
            self.dropped += skip as u64;
            &data[skip..]
        } else {
            data
        };

        let overflow = (self.samples.len() + data.len()).saturating_sub(self.capacity);
        if overflow > 0 {
            self.samples.drain(..overflow);
            self.dropped += overflow as u64;
        }
        self.samples.extend(data.iter().copied());
    }

    /// Take everything buffered
    pub fn drain(&mut self) -> Vec<f32> {
        self.samples.drain(..).collect()
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }
}
