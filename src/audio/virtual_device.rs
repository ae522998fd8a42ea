//! Manually clocked in-memory devices
//!
//! These stand in for a sound card when there is none (headless runs,
//! tests). The device side is handed to a reconciler, while the paired
//! clock handle plays the role of the audio thread and moves the cursor.

use parking_lot::Mutex;
use std::sync::Arc;

use crate::audio::backend::{AudioBackend, CaptureDevice, PlaybackDevice};
use crate::audio::circular::CircularBuffer;
use crate::constants::SAMPLE_SIZE;
use crate::error::AudioError;

#[derive(Debug)]
struct PlaybackState {
    buffer: CircularBuffer,
    cursor: usize,
    paused: bool,
    volume: f32,
    ready: bool,
    cursor_moves: usize,
}

/// Playback device whose cursor only moves when its clock is advanced
pub struct VirtualPlayback {
    state: Arc<Mutex<PlaybackState>>,
}

/// Audio-thread side of a [`VirtualPlayback`]
#[derive(Clone)]
pub struct PlaybackClock {
    state: Arc<Mutex<PlaybackState>>,
}

impl VirtualPlayback {
    /// Create a ready device with a `buffer_len` byte buffer, starting paused
    pub fn new(buffer_len: usize) -> (Self, PlaybackClock) {
        let state = Arc::new(Mutex::new(PlaybackState {
            buffer: CircularBuffer::new(buffer_len),
            cursor: 0,
            paused: true,
            volume: 1.0,
            ready: true,
            cursor_moves: 0,
        }));
        (
            Self { state: state.clone() },
            PlaybackClock { state },
        )
    }

    /// Create a device that reports not ready until the clock says so
    pub fn pending(buffer_len: usize) -> (Self, PlaybackClock) {
        let (device, clock) = Self::new(buffer_len);
        clock.set_ready(false);
        (device, clock)
    }
}

impl PlaybackDevice for VirtualPlayback {
    fn is_ready(&self) -> bool {
        self.state.lock().ready
    }

    fn buffer_len(&self) -> usize {
        self.state.lock().buffer.len()
    }

    fn playback_cursor(&self) -> Result<usize, AudioError> {
        let state = self.state.lock();
        if !state.ready {
            return Err(AudioError::BackendNotReady);
        }
        Ok(state.cursor)
    }

    fn set_playback_cursor(&mut self, cursor: usize) -> Result<(), AudioError> {
        let mut state = self.state.lock();
        let len = state.buffer.len();
        if cursor >= len {
            return Err(AudioError::RegionOutOfBounds { offset: cursor, len: 0, buffer_len: len });
        }
        state.cursor = cursor;
        state.cursor_moves += 1;
        Ok(())
    }

    fn set_paused(&mut self, paused: bool) -> Result<(), AudioError> {
        self.state.lock().paused = paused;
        Ok(())
    }

    fn set_volume(&mut self, volume: f32) -> Result<(), AudioError> {
        self.state.lock().volume = volume.clamp(0.0, 1.0);
        Ok(())
    }

    fn write_region(&mut self, offset: usize, data: &[u8]) -> Result<(), AudioError> {
        self.state.lock().buffer.write_region(offset, data)
    }
}

impl PlaybackClock {
    /// Play `bytes` worth of audio, returning what was rendered.
    ///
    /// A paused device renders nothing and its cursor stays put.
    pub fn advance(&self, bytes: usize) -> Vec<u8> {
        let mut state = self.state.lock();
        if state.paused {
            return Vec::new();
        }
        render(&mut state, bytes)
    }

    /// Move the cursor even while paused, as a misbehaving driver would
    pub fn force_advance(&self, bytes: usize) -> Vec<u8> {
        let mut state = self.state.lock();
        render(&mut state, bytes)
    }

    pub fn set_ready(&self, ready: bool) {
        self.state.lock().ready = ready;
    }

    pub fn cursor(&self) -> usize {
        self.state.lock().cursor
    }

    pub fn is_paused(&self) -> bool {
        self.state.lock().paused
    }

    pub fn volume(&self) -> f32 {
        self.state.lock().volume
    }

    /// Number of times the reconciler repositioned the cursor
    pub fn cursor_moves(&self) -> usize {
        self.state.lock().cursor_moves
    }

    /// Snapshot of the whole circular buffer
    pub fn contents(&self) -> Vec<u8> {
        self.state.lock().buffer.as_bytes().to_vec()
    }
}

fn render(state: &mut PlaybackState, bytes: usize) -> Vec<u8> {
    let len = state.buffer.len();
    if len == 0 {
        return Vec::new();
    }
    let bytes = bytes.min(len);
    let mut out = vec![0u8; bytes];
    // Bounded by len above
    let _ = state.buffer.read_region(state.cursor, &mut out);
    state.cursor = (state.cursor + bytes) % len;
    out
}

#[derive(Debug)]
struct CaptureState {
    buffer: CircularBuffer,
    cursor: usize,
    recording: bool,
    native_sample_rate: u32,
}

/// Capture device fed by hand through its [`Microphone`] handle
pub struct VirtualCapture {
    state: Arc<Mutex<CaptureState>>,
}

/// Audio-thread side of a [`VirtualCapture`]
#[derive(Clone)]
pub struct Microphone {
    state: Arc<Mutex<CaptureState>>,
}

impl VirtualCapture {
    pub fn new(native_sample_rate: u32, buffer_len: usize) -> (Self, Microphone) {
        let state = Arc::new(Mutex::new(CaptureState {
            buffer: CircularBuffer::new(buffer_len),
            cursor: 0,
            recording: false,
            native_sample_rate,
        }));
        (
            Self { state: state.clone() },
            Microphone { state },
        )
    }
}

impl CaptureDevice for VirtualCapture {
    fn native_sample_rate(&self) -> u32 {
        self.state.lock().native_sample_rate
    }

    fn buffer_len(&self) -> usize {
        self.state.lock().buffer.len()
    }

    fn start_capture(&mut self) -> Result<(), AudioError> {
        let mut state = self.state.lock();
        state.cursor = 0;
        state.recording = true;
        Ok(())
    }

    fn stop_capture(&mut self) -> Result<(), AudioError> {
        self.state.lock().recording = false;
        Ok(())
    }

    fn record_cursor(&self) -> Result<usize, AudioError> {
        Ok(self.state.lock().cursor)
    }

    fn read_region(&self, offset: usize, out: &mut [u8]) -> Result<(), AudioError> {
        self.state.lock().buffer.read_region(offset, out)
    }
}

impl Microphone {
    /// Record samples at the cursor. Ignored unless capture is running.
    pub fn speak(&self, samples: &[i16]) {
        let mut state = self.state.lock();
        if !state.recording {
            return;
        }
        for &sample in samples {
            let cursor = state.cursor;
            state.buffer.set_sample_at(cursor, sample);
            state.cursor = (cursor + SAMPLE_SIZE) % state.buffer.len();
        }
    }

    /// Record raw bytes at the cursor, which may leave it mid-sample
    pub fn write_bytes(&self, bytes: &[u8]) {
        let mut state = self.state.lock();
        if !state.recording {
            return;
        }
        let cursor = state.cursor;
        // Bounded by the buffer length
        let _ = state.buffer.write_region(cursor, bytes);
        state.cursor = (cursor + bytes.len()) % state.buffer.len();
    }

    pub fn is_recording(&self) -> bool {
        self.state.lock().recording
    }

    pub fn cursor(&self) -> usize {
        self.state.lock().cursor
    }
}

/// Backend that hands out virtual devices and keeps their clocks
pub struct VirtualBackend {
    native_sample_rate: u32,
    clocks: Mutex<Vec<PlaybackClock>>,
    microphones: Mutex<Vec<(usize, Microphone)>>,
}

impl VirtualBackend {
    pub fn new(native_sample_rate: u32) -> Self {
        Self {
            native_sample_rate,
            clocks: Mutex::new(Vec::new()),
            microphones: Mutex::new(Vec::new()),
        }
    }

    /// Clock of the most recently opened playback device
    pub fn last_clock(&self) -> Option<PlaybackClock> {
        self.clocks.lock().last().cloned()
    }

    /// Microphone of the most recently opened capture device
    pub fn last_microphone(&self) -> Option<(usize, Microphone)> {
        self.microphones.lock().last().cloned()
    }
}

impl AudioBackend for VirtualBackend {
    fn open_playback(
        &self,
        buffer_len: usize,
        _sample_rate: u32,
    ) -> Result<Box<dyn PlaybackDevice>, AudioError> {
        let (device, clock) = VirtualPlayback::new(buffer_len);
        self.clocks.lock().push(clock);
        Ok(Box::new(device))
    }

    fn open_capture(
        &self,
        driver_index: usize,
        buffer_seconds: f32,
    ) -> Result<Box<dyn CaptureDevice>, AudioError> {
        let frames = (self.native_sample_rate as f32 * buffer_seconds).ceil() as usize;
        let (device, microphone) = VirtualCapture::new(self.native_sample_rate, frames * SAMPLE_SIZE);
        self.microphones.lock().push((driver_index, microphone));
        Ok(Box::new(device))
    }
}
