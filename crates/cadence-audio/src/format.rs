use serde::{Deserialize, Serialize};

/// PCM layout of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub bits_per_sample: u16,
    pub channels: u16,
}

impl AudioFormat {
    pub const fn new(sample_rate: u32, bits_per_sample: u16, channels: u16) -> Self {
        Self {
            sample_rate,
            bits_per_sample,
            channels,
        }
    }

    /// Bytes in one frame (one sample for every channel).
    pub const fn bytes_per_frame(&self) -> u64 {
        (self.bits_per_sample as u64).div_ceil(8) * self.channels as u64
    }

    pub const fn bytes_per_second(&self) -> u64 {
        self.bytes_per_frame() * self.sample_rate as u64
    }
}

impl Default for AudioFormat {
    /// 16 kHz, 16-bit mono: what speech recognizers expect.
    fn default() -> Self {
        Self::new(16_000, 16, 1)
    }
}
