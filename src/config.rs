//! Configuration types for the echo engine.

use std::time::Duration;

use crate::EchoError;

/// PCM layout shared by every buffer and endpoint of an engine.
///
/// All buffers in a session are sized identically from this format, so the
/// format is fixed when the engine is initialized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SampleFormat {
    /// Sample rate in Hz (e.g., 44100, 48000).
    pub sample_rate_hz: u32,
    /// Number of interleaved channels (1 = mono, 2 = stereo).
    pub channels: u16,
    /// Bits per sample (16 for signed 16-bit PCM).
    pub bits_per_sample: u16,
    /// Frames delivered per endpoint callback.
    pub frames_per_buffer: u32,
}

impl SampleFormat {
    /// Size in bytes of one buffer holding `frames_per_buffer` frames.
    ///
    /// Partial bytes round up.
    #[must_use]
    pub fn buffer_size_bytes(&self) -> usize {
        let bits = u64::from(self.frames_per_buffer)
            * u64::from(self.channels)
            * u64::from(self.bits_per_sample);
        ((bits + 7) >> 3) as usize
    }

    /// Wall-clock length of one buffer.
    #[must_use]
    pub fn buffer_duration(&self) -> Duration {
        if self.sample_rate_hz == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(f64::from(self.frames_per_buffer) / f64::from(self.sample_rate_hz))
    }
}

impl Default for SampleFormat {
    fn default() -> Self {
        EngineConfig::default().sample_format()
    }
}

/// Configuration for an [`EchoEngine`](crate::EchoEngine).
///
/// The buffer counts together determine the latency/throughput tradeoff:
/// every buffer queued ahead of the player is part of the echo delay.
///
/// # Example
///
/// ```
/// use audio_echo::EngineConfig;
///
/// let config = EngineConfig {
///     buffer_count: 8,
///     ..EngineConfig::new(48000, 192)
/// };
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Sample rate in Hz.
    ///
    /// Default: 48000
    pub sample_rate_hz: u32,

    /// Frames per buffer (the device's preferred callback size).
    ///
    /// Default: 240 (5ms at 48kHz)
    pub frames_per_buffer: u32,

    /// Channel count.
    ///
    /// Default: 1
    pub channels: u16,

    /// Bits per sample.
    ///
    /// Default: 16
    pub bits_per_sample: u16,

    /// Total number of buffers allocated in the pool.
    ///
    /// Default: 16
    pub buffer_count: usize,

    /// Maximum buffers in flight inside one endpoint.
    ///
    /// Default: 4
    pub shadow_queue_len: usize,

    /// Buffers submitted to the source endpoint when it starts.
    ///
    /// Default: 2
    pub source_kickstart_buffers: usize,

    /// Buffers the source must deliver before playback is kicked off.
    /// Also the number of buffers handed to the player at that moment.
    ///
    /// Default: 3
    pub play_kickstart_buffers: usize,

    /// Restart the decoder once a finished decode has fully drained,
    /// instead of stopping playback.
    ///
    /// Default: false
    pub loop_decoding: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sample_rate_hz: 48000,
            frames_per_buffer: 240,
            channels: 1,
            bits_per_sample: 16,
            buffer_count: 16,
            shadow_queue_len: 4,
            source_kickstart_buffers: 2,
            play_kickstart_buffers: 3,
            loop_decoding: false,
        }
    }
}

impl EngineConfig {
    /// Creates a configuration for the given device rate and callback size.
    #[must_use]
    pub fn new(sample_rate_hz: u32, frames_per_buffer: u32) -> Self {
        Self {
            sample_rate_hz,
            frames_per_buffer,
            ..Self::default()
        }
    }

    /// Smallest counts that still keep both endpoints fed.
    ///
    /// Startup latency is two buffers.
    #[must_use]
    pub fn low_latency(sample_rate_hz: u32, frames_per_buffer: u32) -> Self {
        Self {
            buffer_count: 8,
            shadow_queue_len: 2,
            source_kickstart_buffers: 2,
            play_kickstart_buffers: 2,
            ..Self::new(sample_rate_hz, frames_per_buffer)
        }
    }

    /// The PCM format every buffer and endpoint uses.
    #[must_use]
    pub fn sample_format(&self) -> SampleFormat {
        SampleFormat {
            sample_rate_hz: self.sample_rate_hz,
            channels: self.channels,
            bits_per_sample: self.bits_per_sample,
            frames_per_buffer: self.frames_per_buffer,
        }
    }

    /// Checks the configuration for values the pipeline cannot run with.
    ///
    /// # Errors
    ///
    /// Returns [`EchoError::InvalidConfig`] describing the first problem found.
    pub fn validate(&self) -> Result<(), EchoError> {
        let fail = |reason: &str| {
            Err(EchoError::InvalidConfig {
                reason: reason.to_string(),
            })
        };

        if self.sample_rate_hz == 0 {
            return fail("sample rate must be non-zero");
        }
        if self.frames_per_buffer == 0 || self.channels == 0 || self.bits_per_sample == 0 {
            return fail("frames per buffer, channels and bits per sample must be non-zero");
        }
        if self.buffer_count == 0 {
            return fail("buffer count must be non-zero");
        }
        if self.shadow_queue_len == 0 || self.shadow_queue_len > self.buffer_count {
            return fail("shadow queue length must be between 1 and the buffer count");
        }
        if self.source_kickstart_buffers == 0
            || self.source_kickstart_buffers > self.shadow_queue_len
        {
            return fail("source kickstart must be between 1 and the shadow queue length");
        }
        // The ready-queue valve parks the source once fewer than one shadow
        // queue of slots is left, so the kickstart must fire before that.
        if self.play_kickstart_buffers == 0
            || self.play_kickstart_buffers > self.buffer_count - self.shadow_queue_len
        {
            return fail("play kickstart must be non-zero and leave one shadow queue of room");
        }
        Ok(())
    }
}
