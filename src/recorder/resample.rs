//! PCM format conversion for microphones that change mid-recording
//!
//! The encoder's audio format is fixed when it opens. A microphone switched
//! in later may run at another rate or channel count, so its samples are
//! mixed down, linearly resampled and spread back out to the encoder's
//! layout.

/// Interleaved PCM layout
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PcmFormat {
    pub sample_rate: u32,
    pub channels: u16,
}

impl PcmFormat {
    pub const fn new(sample_rate: u32, channels: u16) -> Self {
        Self {
            sample_rate,
            channels,
        }
    }
}

impl std::fmt::Display for PcmFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}Hz/{}ch", self.sample_rate, self.channels)
    }
}

/// Streaming converter from one `PcmFormat` to another
///
/// Keeps the read position and the last input frame between calls, so
/// blocks of any size convert as one continuous signal.
#[derive(Debug)]
pub struct PcmConverter {
    from: PcmFormat,
    to: PcmFormat,
    /// Next output position in input frames, relative to the next block.
    /// -1 addresses `last`.
    position: f64,
    last: f32,
}

impl PcmConverter {
    /// None when no conversion is needed
    pub fn between(from: PcmFormat, to: PcmFormat) -> Option<Self> {
        if from == to || from.sample_rate == 0 || to.sample_rate == 0 {
            return None;
        }
        Some(Self {
            from,
            to,
            position: 0.0,
            last: 0.0,
        })
    }

    pub fn from_format(&self) -> PcmFormat {
        self.from
    }

    pub fn to_format(&self) -> PcmFormat {
        self.to
    }

    pub fn convert(&mut self, input: &[f32]) -> Vec<f32> {
        let mono = downmix(input, self.from.channels);
        let resampled = if self.from.sample_rate == self.to.sample_rate {
            mono
        } else {
            self.resample(&mono)
        };
        upmix(&resampled, self.to.channels)
    }

    fn resample(&mut self, input: &[f32]) -> Vec<f32> {
        if input.is_empty() {
            return Vec::new();
        }

        let step = f64::from(self.from.sample_rate) / f64::from(self.to.sample_rate);
        let end = (input.len() - 1) as f64;
        let sample = |i: isize| -> f32 {
            if i < 0 {
                self.last
            } else {
                input[(i as usize).min(input.len() - 1)]
            }
        };

        let mut output = Vec::with_capacity((input.len() as f64 / step) as usize + 1);
        let mut position = self.position;
        while position <= end {
            let index = position.floor();
            let frac = (position - index) as f32;
            let s0 = sample(index as isize);
            let s1 = sample(index as isize + 1);
            output.push(s0 + (s1 - s0) * frac);
            position += step;
        }

        self.position = position - input.len() as f64;
        self.last = input[input.len() - 1];
        output
    }
}

fn downmix(input: &[f32], channels: u16) -> Vec<f32> {
    let channels = usize::from(channels.max(1));
    if channels == 1 {
        return input.to_vec();
    }
    input
        .chunks_exact(channels)
        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
        .collect()
}

fn upmix(mono: &[f32], channels: u16) -> Vec<f32> {
    let channels = usize::from(channels.max(1));
    if channels == 1 {
        return mono.to_vec();
    }
    mono.iter()
        .flat_map(|&sample| std::iter::repeat(sample).take(channels))
        .collect()
}
