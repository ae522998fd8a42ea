//! Fixed-length circular device buffer and wrap-aware cursor arithmetic
//!
//! Cursors are byte offsets that wrap modulo the buffer length. When the
//! write cursor equals the read cursor the buffer is either empty or
//! completely full; callers carry an `is_full` flag to tell the two apart.

use crate::error::AudioError;

/// Forward distance from `start` to `end` in a buffer of `len` bytes
pub fn forward_distance(start: usize, end: usize, len: usize) -> usize {
    if end >= start {
        end - start
    } else {
        len - start + end
    }
}

/// Bytes written but not yet played
pub fn available_playback(play_cursor: usize, write_cursor: usize, is_full: bool, len: usize) -> usize {
    if write_cursor > play_cursor {
        write_cursor - play_cursor
    } else if write_cursor < play_cursor {
        len - play_cursor + write_cursor
    } else if is_full {
        len
    } else {
        0
    }
}

/// Bytes that can be written without overtaking the play cursor
pub fn available_write(play_cursor: usize, write_cursor: usize, is_full: bool, len: usize) -> usize {
    if write_cursor > play_cursor {
        len - write_cursor + play_cursor
    } else if write_cursor < play_cursor {
        play_cursor - write_cursor
    } else if is_full {
        0
    } else {
        len
    }
}

/// Split a region into at most two contiguous `(offset, len)` segments,
/// the second one starting at 0 when the region crosses the wrap boundary.
pub fn split_region(
    offset: usize,
    len: usize,
    buffer_len: usize,
) -> Result<((usize, usize), (usize, usize)), AudioError> {
    if offset >= buffer_len.max(1) || len > buffer_len {
        return Err(AudioError::RegionOutOfBounds { offset, len, buffer_len });
    }
    let first = len.min(buffer_len - offset);
    Ok(((offset, first), (0, len - first)))
}

/// Byte storage shared between the reconcilers and an audio backend
#[derive(Debug, Clone)]
pub struct CircularBuffer {
    data: Box<[u8]>,
}

impl CircularBuffer {
    /// Create a zeroed buffer of `len` bytes
    pub fn new(len: usize) -> Self {
        Self {
            data: vec![0u8; len].into_boxed_slice(),
        }
    }

    /// Buffer sized for `seconds` of 16-bit PCM
    pub fn for_pcm16(sample_rate: u32, channels: u16, seconds: f32) -> Self {
        let frames = (sample_rate as f32 * seconds).ceil() as usize;
        Self::new(frames * channels as usize * crate::constants::SAMPLE_SIZE)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Copy `bytes` into the buffer starting at `offset`, wrapping if needed
    pub fn write_region(&mut self, offset: usize, bytes: &[u8]) -> Result<(), AudioError> {
        let ((o1, l1), (o2, l2)) = split_region(offset, bytes.len(), self.len())?;
        self.data[o1..o1 + l1].copy_from_slice(&bytes[..l1]);
        self.data[o2..o2 + l2].copy_from_slice(&bytes[l1..]);
        Ok(())
    }

    /// Copy `out.len()` bytes starting at `offset` into `out`, wrapping if needed
    pub fn read_region(&self, offset: usize, out: &mut [u8]) -> Result<(), AudioError> {
        let ((o1, l1), (o2, l2)) = split_region(offset, out.len(), self.len())?;
        out[..l1].copy_from_slice(&self.data[o1..o1 + l1]);
        out[l1..].copy_from_slice(&self.data[o2..o2 + l2]);
        Ok(())
    }

    /// Read one little-endian 16-bit sample at a byte offset
    pub fn sample_at(&self, offset: usize) -> i16 {
        let lo = self.data[offset % self.len()];
        let hi = self.data[(offset + 1) % self.len()];
        i16::from_le_bytes([lo, hi])
    }

    /// Write one little-endian 16-bit sample at a byte offset
    pub fn set_sample_at(&mut self, offset: usize, sample: i16) {
        let len = self.len();
        let [lo, hi] = sample.to_le_bytes();
        self.data[offset % len] = lo;
        self.data[(offset + 1) % len] = hi;
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }
}
