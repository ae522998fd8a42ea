//! Per-tick playback reconciliation
//!
//! Every tick reads the backend's play cursor once, works out how much was
//! played since the previous tick, silences that region, tops the device
//! buffer up from the voice queue and pauses the backend when it has nothing
//! left to play. Underruns (the backend played past what was written) are
//! resolved by resynchronising the cursors instead of letting the gap grow.

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::audio::backend::{PlaybackDevice, VoiceFormat};
use crate::audio::buffer::RingBuffer;
use crate::audio::circular::{available_playback, available_write, forward_distance};
use crate::constants::SAMPLE_SIZE;
use crate::error::{AudioError, Result};

/// How to resynchronise after the backend played past the written data
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum UnderrunPolicy {
    /// Move the write cursor up to where the backend is playing
    #[default]
    SnapWriteCursor,
    /// Move the backend's play cursor back to the write cursor
    RewindPlayback,
}

enum PlaybackQueue {
    Bytes(RingBuffer<u8>),
    Samples(RingBuffer<i16>),
}

impl PlaybackQueue {
    fn format(&self) -> VoiceFormat {
        match self {
            PlaybackQueue::Bytes(_) => VoiceFormat::Pcm16Bytes,
            PlaybackQueue::Samples(_) => VoiceFormat::Pcm16Samples,
        }
    }

    fn queued_bytes(&self) -> usize {
        match self {
            PlaybackQueue::Bytes(queue) => queue.len(),
            PlaybackQueue::Samples(queue) => queue.len() * SAMPLE_SIZE,
        }
    }

    fn clear(&mut self) {
        match self {
            PlaybackQueue::Bytes(queue) => queue.clear(),
            PlaybackQueue::Samples(queue) => queue.clear(),
        }
    }
}

/// Outcome of a single reconciliation tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaybackTick {
    /// Bytes the backend played since the previous tick
    pub played: usize,
    /// Bytes copied from the queue into the device buffer
    pub written: usize,
    /// Whether the backend ran out of written audio
    pub underrun: bool,
    /// Whether the backend was left paused
    pub paused: bool,
}

/// Playback statistics
#[derive(Debug, Clone, Default)]
pub struct PlaybackStats {
    pub ticks: u64,
    pub underruns: u64,
    pub bytes_written: u64,
    pub bytes_silenced: u64,
}

/// Keeps a backend's circular buffer fed from a voice queue
pub struct PlaybackReconciler<P: PlaybackDevice> {
    device: P,
    queue: PlaybackQueue,
    policy: UnderrunPolicy,
    buffer_len: usize,
    /// Zeroes written over played regions
    silence: Vec<u8>,
    /// Sample to byte conversion buffer
    scratch: Vec<u8>,
    write_cursor: usize,
    prev_play_cursor: usize,
    available_playback_byte_count: usize,
    is_full: bool,
    paused: Option<bool>,
    stats: PlaybackStats,
}

impl<P: PlaybackDevice> PlaybackReconciler<P> {
    /// Wrap a playback device. The voice queue starts out able to hold a
    /// full device buffer.
    pub fn new(device: P, format: VoiceFormat, policy: UnderrunPolicy) -> Self {
        let buffer_len = device.buffer_len();
        let queue = match format {
            VoiceFormat::Pcm16Bytes => PlaybackQueue::Bytes(RingBuffer::new(buffer_len)),
            VoiceFormat::Pcm16Samples => PlaybackQueue::Samples(RingBuffer::new(buffer_len / SAMPLE_SIZE)),
        };

        Self {
            device,
            queue,
            policy,
            buffer_len,
            silence: vec![0u8; buffer_len],
            scratch: Vec::with_capacity(buffer_len),
            write_cursor: 0,
            prev_play_cursor: 0,
            available_playback_byte_count: 0,
            is_full: false,
            paused: None,
            stats: PlaybackStats::default(),
        }
    }

    /// Queue raw PCM bytes. Only valid in [`VoiceFormat::Pcm16Bytes`] mode.
    pub fn enqueue_bytes(&mut self, bytes: &[u8]) -> std::result::Result<(), AudioError> {
        match &mut self.queue {
            PlaybackQueue::Bytes(queue) => {
                queue.enqueue(bytes);
                Ok(())
            }
            PlaybackQueue::Samples(_) => Err(AudioError::FormatMismatch {
                expected: VoiceFormat::Pcm16Samples,
                actual: VoiceFormat::Pcm16Bytes,
            }),
        }
    }

    /// Queue PCM samples. Only valid in [`VoiceFormat::Pcm16Samples`] mode.
    pub fn enqueue_samples(&mut self, samples: &[i16]) -> std::result::Result<(), AudioError> {
        match &mut self.queue {
            PlaybackQueue::Samples(queue) => {
                queue.enqueue(samples);
                Ok(())
            }
            PlaybackQueue::Bytes(_) => Err(AudioError::FormatMismatch {
                expected: VoiceFormat::Pcm16Bytes,
                actual: VoiceFormat::Pcm16Samples,
            }),
        }
    }

    /// Run one reconciliation tick
    pub fn tick(&mut self) -> Result<PlaybackTick> {
        let len = self.buffer_len;
        let mut play_cursor = self.device.playback_cursor()?;

        // Full only carries over if nothing was played since
        self.is_full = self.is_full && play_cursor == self.prev_play_cursor;

        let played = forward_distance(self.prev_play_cursor, play_cursor, len);
        let underrun = played > self.available_playback_byte_count;
        if underrun {
            self.stats.underruns += 1;
            debug!(
                played,
                available = self.available_playback_byte_count,
                policy = ?self.policy,
                "Playback underrun"
            );
            match self.policy {
                UnderrunPolicy::SnapWriteCursor => self.write_cursor = play_cursor,
                UnderrunPolicy::RewindPlayback => {
                    self.device.set_playback_cursor(self.write_cursor)?;
                    play_cursor = self.write_cursor;
                }
            }
        }

        // Never let the backend loop back over stale audio
        if played > 0 {
            self.device.write_region(self.prev_play_cursor, &self.silence[..played])?;
            self.stats.bytes_silenced += played as u64;
        }

        let writable = available_write(play_cursor, self.write_cursor, self.is_full, len);
        let written = self.write_queued(writable)?;
        if written > 0 {
            self.write_cursor = (self.write_cursor + written) % len;
            self.is_full = self.write_cursor == play_cursor;
            self.stats.bytes_written += written as u64;
        }

        self.available_playback_byte_count =
            available_playback(play_cursor, self.write_cursor, self.is_full, len);

        let paused = self.available_playback_byte_count == 0;
        self.device.set_paused(paused)?;
        if self.paused != Some(paused) {
            debug!(paused, "Playback state changed");
            self.paused = Some(paused);
        }

        self.prev_play_cursor = play_cursor;
        self.stats.ticks += 1;

        trace!(
            played,
            written,
            available = self.available_playback_byte_count,
            "Playback tick"
        );

        Ok(PlaybackTick {
            played,
            written,
            underrun,
            paused,
        })
    }

    /// Copy as much queued audio as fits into `writable` bytes at the write
    /// cursor, returning the number of bytes written.
    fn write_queued(&mut self, writable: usize) -> Result<usize> {
        match &mut self.queue {
            PlaybackQueue::Bytes(queue) => {
                let count = queue.len().min(writable);
                if count > 0 {
                    self.device.write_region(self.write_cursor, &queue.as_slice()[..count])?;
                    queue.dequeue(count)?;
                }
                Ok(count)
            }
            PlaybackQueue::Samples(queue) => {
                let count = queue.len().min(writable / SAMPLE_SIZE);
                if count > 0 {
                    self.scratch.clear();
                    for sample in &queue.as_slice()[..count] {
                        self.scratch.extend_from_slice(&sample.to_le_bytes());
                    }
                    self.device.write_region(self.write_cursor, &self.scratch)?;
                    queue.dequeue(count)?;
                }
                Ok(count * SAMPLE_SIZE)
            }
        }
    }

    /// Drop queued audio, silence the device and rewind both cursors to 0
    pub fn reset(&mut self) -> Result<()> {
        self.queue.clear();
        self.device.write_region(0, &self.silence)?;
        self.device.set_playback_cursor(0)?;
        self.device.set_paused(true)?;
        self.write_cursor = 0;
        self.prev_play_cursor = 0;
        self.available_playback_byte_count = 0;
        self.is_full = false;
        self.paused = Some(true);
        Ok(())
    }

    /// Volume from 0 to 1
    pub fn set_volume(&mut self, volume: f32) -> std::result::Result<(), AudioError> {
        self.device.set_volume(volume)
    }

    pub fn format(&self) -> VoiceFormat {
        self.queue.format()
    }

    /// Bytes waiting in the voice queue
    pub fn queued_bytes(&self) -> usize {
        self.queue.queued_bytes()
    }

    pub fn write_cursor(&self) -> usize {
        self.write_cursor
    }

    pub fn available_playback_byte_count(&self) -> usize {
        self.available_playback_byte_count
    }

    pub fn is_full(&self) -> bool {
        self.is_full
    }

    pub fn buffer_len(&self) -> usize {
        self.buffer_len
    }

    pub fn stats(&self) -> &PlaybackStats {
        &self.stats
    }

    pub fn device(&self) -> &P {
        &self.device
    }

    pub fn device_mut(&mut self) -> &mut P {
        &mut self.device
    }
}
