//! Audio backend capabilities consumed by the reconcilers
//!
//! A backend owns a circular device buffer and advances its own cursor on
//! its own audio thread. The reconcilers only ever read that cursor once per
//! tick and write/read regions relative to it.

use serde::{Deserialize, Serialize};

use crate::error::AudioError;

/// Layout of the PCM data moving through a voice queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum VoiceFormat {
    /// Raw little-endian 16-bit PCM bytes
    Pcm16Bytes,
    /// 16-bit PCM samples
    #[default]
    Pcm16Samples,
}

/// Output device that renders a looping circular buffer
pub trait PlaybackDevice: Send {
    /// Whether the backend has a live channel to drive. Nothing else on
    /// this trait is called until this returns true.
    fn is_ready(&self) -> bool;

    /// Length of the circular buffer in bytes
    fn buffer_len(&self) -> usize;

    /// Current play cursor in bytes
    fn playback_cursor(&self) -> Result<usize, AudioError>;

    /// Reposition the play cursor
    fn set_playback_cursor(&mut self, cursor: usize) -> Result<(), AudioError>;

    fn set_paused(&mut self, paused: bool) -> Result<(), AudioError>;

    /// Volume from 0 to 1
    fn set_volume(&mut self, volume: f32) -> Result<(), AudioError>;

    /// Copy bytes into the circular buffer at `offset`, wrapping if needed
    fn write_region(&mut self, offset: usize, data: &[u8]) -> Result<(), AudioError>;
}

/// Input device that records into a looping circular buffer
pub trait CaptureDevice: Send {
    /// Sample rate the driver records at
    fn native_sample_rate(&self) -> u32;

    /// Length of the circular buffer in bytes
    fn buffer_len(&self) -> usize;

    fn start_capture(&mut self) -> Result<(), AudioError>;

    fn stop_capture(&mut self) -> Result<(), AudioError>;

    /// Current record cursor in bytes
    fn record_cursor(&self) -> Result<usize, AudioError>;

    /// Copy `out.len()` bytes from the circular buffer at `offset`, wrapping if needed
    fn read_region(&self, offset: usize, out: &mut [u8]) -> Result<(), AudioError>;
}

/// Factory for capture and playback devices
pub trait AudioBackend {
    /// Open a playback device backed by a circular buffer of `buffer_len` bytes
    fn open_playback(
        &self,
        buffer_len: usize,
        sample_rate: u32,
    ) -> Result<Box<dyn PlaybackDevice>, AudioError>;

    /// Open the capture driver at `driver_index` with a buffer of `buffer_seconds`
    fn open_capture(
        &self,
        driver_index: usize,
        buffer_seconds: f32,
    ) -> Result<Box<dyn CaptureDevice>, AudioError>;
}

impl<T: PlaybackDevice + ?Sized> PlaybackDevice for Box<T> {
    fn is_ready(&self) -> bool {
        (**self).is_ready()
    }

    fn buffer_len(&self) -> usize {
        (**self).buffer_len()
    }

    fn playback_cursor(&self) -> Result<usize, AudioError> {
        (**self).playback_cursor()
    }

    fn set_playback_cursor(&mut self, cursor: usize) -> Result<(), AudioError> {
        (**self).set_playback_cursor(cursor)
    }

    fn set_paused(&mut self, paused: bool) -> Result<(), AudioError> {
        (**self).set_paused(paused)
    }

    fn set_volume(&mut self, volume: f32) -> Result<(), AudioError> {
        (**self).set_volume(volume)
    }

    fn write_region(&mut self, offset: usize, data: &[u8]) -> Result<(), AudioError> {
        (**self).write_region(offset, data)
    }
}

impl<T: CaptureDevice + ?Sized> CaptureDevice for Box<T> {
    fn native_sample_rate(&self) -> u32 {
        (**self).native_sample_rate()
    }

    fn buffer_len(&self) -> usize {
        (**self).buffer_len()
    }

    fn start_capture(&mut self) -> Result<(), AudioError> {
        (**self).start_capture()
    }

    fn stop_capture(&mut self) -> Result<(), AudioError> {
        (**self).stop_capture()
    }

    fn record_cursor(&self) -> Result<usize, AudioError> {
        (**self).record_cursor()
    }

    fn read_region(&self, offset: usize, out: &mut [u8]) -> Result<(), AudioError> {
        (**self).read_region(offset, out)
    }
}
