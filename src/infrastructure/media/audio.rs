//! Audio device seam
//!
//! Capture and playback hardware stay outside the crate. A call asks the
//! injected [`AudioDevices`] factory for an input and an output once the
//! codec is negotiated, and the driver pumps PCM between them and the RTP
//! channel on a fixed tick. Devices keep their own clock and buffer
//! internally; a pump only exchanges what is already buffered.

use super::rtp::RtpAudioChannel;
use tracing::{debug, warn};

/// 16-bit signed little-endian PCM format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u16,
}

impl AudioFormat {
    pub fn bytes_per_second(&self) -> usize {
        self.sample_rate as usize * self.channels as usize * 2
    }

    /// Bytes covering `ms` milliseconds of audio
    pub fn bytes_for_ms(&self, ms: u32) -> usize {
        self.bytes_per_second() * ms as usize / 1000
    }
}

/// Microphone side
pub trait AudioInput: Send {
    /// Drain PCM captured since the last call, without blocking
    fn read(&mut self) -> Vec<u8>;
    fn stop(&mut self);
}

/// Speaker side
pub trait AudioOutput: Send {
    /// Bytes the device can accept without blocking
    fn bytes_free(&self) -> usize;
    fn write(&mut self, pcm: &[u8]);
    /// The device ran dry and stopped playing
    fn is_underrun(&self) -> bool;
    fn restart(&mut self);
    fn stop(&mut self);
}

/// Factory for audio devices, injected into the client
pub trait AudioDevices: Send + Sync {
    fn open_input(&self, format: AudioFormat) -> Option<Box<dyn AudioInput>>;
    fn open_output(&self, format: AudioFormat) -> Option<Box<dyn AudioOutput>>;
}

/// Input and output bound to one call's RTP channel
pub struct AudioPipeline {
    input: Option<Box<dyn AudioInput>>,
    output: Option<Box<dyn AudioOutput>>,
}

impl AudioPipeline {
    /// Open both devices for the channel's negotiated format
    pub fn open(devices: &dyn AudioDevices, channel: &RtpAudioChannel) -> Option<Self> {
        let format = channel.audio_format()?;
        let input = devices.open_input(format);
        if input.is_none() {
            warn!("Could not open audio input for {:?}", format);
        }
        let output = devices.open_output(format);
        if output.is_none() {
            warn!("Could not open audio output for {:?}", format);
        }
        Some(Self { input, output })
    }

    /// Move captured audio into the channel and channel audio to the speaker
    pub fn pump(&mut self, channel: &mut RtpAudioChannel) {
        if let Some(input) = self.input.as_mut() {
            let pcm = input.read();
            if !pcm.is_empty() {
                if let Err(e) = channel.write(&pcm) {
                    debug!("Dropping captured audio: {}", e);
                }
            }
        }

        if let Some(output) = self.output.as_mut() {
            if output.is_underrun() {
                debug!("Audio output underrun, restarting");
                output.restart();
            }
            let free = output.bytes_free();
            if free > 0 {
                let pcm = channel.read(free);
                output.write(&pcm);
            }
        }
    }

    pub fn stop(&mut self) {
        if let Some(mut input) = self.input.take() {
            input.stop();
        }
        if let Some(mut output) = self.output.take() {
            output.stop();
        }
    }
}

impl Drop for AudioPipeline {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Devices that capture silence and discard playback, one frame per pump
#[derive(Debug, Clone, Copy)]
pub struct NullAudioDevices {
    pub frame_ms: u32,
}

impl Default for NullAudioDevices {
    fn default() -> Self {
        Self { frame_ms: 20 }
    }
}

struct SilentInput {
    frame_bytes: usize,
    running: bool,
}

impl AudioInput for SilentInput {
    fn read(&mut self) -> Vec<u8> {
        if self.running {
            vec![0; self.frame_bytes]
        } else {
            Vec::new()
        }
    }

    fn stop(&mut self) {
        self.running = false;
    }
}

struct DiscardOutput {
    frame_bytes: usize,
    running: bool,
}

impl AudioOutput for DiscardOutput {
    fn bytes_free(&self) -> usize {
        if self.running {
            self.frame_bytes
        } else {
            0
        }
    }

    fn write(&mut self, _pcm: &[u8]) {}

    fn is_underrun(&self) -> bool {
        false
    }

    fn restart(&mut self) {
        self.running = true;
    }

    fn stop(&mut self) {
        self.running = false;
    }
}

impl AudioDevices for NullAudioDevices {
    fn open_input(&self, format: AudioFormat) -> Option<Box<dyn AudioInput>> {
        Some(Box::new(SilentInput {
            frame_bytes: format.bytes_for_ms(self.frame_ms),
            running: true,
        }))
    }

    fn open_output(&self, format: AudioFormat) -> Option<Box<dyn AudioOutput>> {
        Some(Box::new(DiscardOutput {
            frame_bytes: format.bytes_for_ms(self.frame_ms),
            running: true,
        }))
    }
}
