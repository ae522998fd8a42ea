//! Framing for multi-frame encode results
//!
//! One encode call can produce several Opus frames. They travel as a payload
//! of `[u16 little-endian length][frame bytes]` records, split at frame
//! boundaries when the batch outgrows one datagram.

use bytes::Bytes;

use crate::error::CodecError;

const LENGTH_PREFIX: usize = 2;

/// Append one length-prefixed frame to `out`
pub fn write_frame(out: &mut Vec<u8>, frame: &[u8]) -> Result<(), CodecError> {
    let len = u16::try_from(frame.len())
        .map_err(|_| CodecError::EncodingFailed(format!("Frame too large: {} bytes", frame.len())))?;
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(frame);
    Ok(())
}

/// Iterate the frames of a payload
pub fn frames(payload: &[u8]) -> Frames<'_> {
    Frames { remaining: payload }
}

/// Iterator over length-prefixed frames. Stops after the first error.
pub struct Frames<'a> {
    remaining: &'a [u8],
}

impl<'a> Iterator for Frames<'a> {
    type Item = Result<&'a [u8], CodecError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining.is_empty() {
            return None;
        }
        if self.remaining.len() < LENGTH_PREFIX {
            self.remaining = &[];
            return Some(Err(CodecError::MalformedPacket("Truncated frame header".into())));
        }

        let len = u16::from_le_bytes([self.remaining[0], self.remaining[1]]) as usize;
        let body = &self.remaining[LENGTH_PREFIX..];
        if len == 0 || len > body.len() {
            self.remaining = &[];
            return Some(Err(CodecError::MalformedPacket(format!(
                "Frame length {} with {} bytes left",
                len,
                body.len()
            ))));
        }

        let (frame, rest) = body.split_at(len);
        self.remaining = rest;
        Some(Ok(frame))
    }
}

/// Result of one encode call: every frame produced, ready to send
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedVoice {
    payload: Bytes,
    frame_count: usize,
    sample_count: usize,
}

impl EncodedVoice {
    pub(crate) fn new(payload: Bytes, frame_count: usize, sample_count: usize) -> Self {
        Self {
            payload,
            frame_count,
            sample_count,
        }
    }

    /// Wire payload
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn into_payload(self) -> Bytes {
        self.payload
    }

    pub fn frames(&self) -> Frames<'_> {
        frames(&self.payload)
    }

    pub fn frame_count(&self) -> usize {
        self.frame_count
    }

    /// Samples encoded, silence padding included
    pub fn sample_count(&self) -> usize {
        self.sample_count
    }

    /// Cut the payload at frame boundaries into pieces of at most
    /// `max_payload` bytes, each a valid payload on its own.
    pub fn split_payload(&self, max_payload: usize) -> Result<Vec<Bytes>, CodecError> {
        let mut pieces = Vec::new();
        let mut start = 0;
        let mut end = 0;
        for frame in self.frames() {
            let record = LENGTH_PREFIX + frame?.len();
            if record > max_payload {
                return Err(CodecError::EncodingFailed(format!(
                    "{} byte frame does not fit a {} byte payload",
                    record, max_payload
                )));
            }
            if end + record - start > max_payload {
                pieces.push(self.payload.slice(start..end));
                start = end;
            }
            end += record;
        }
        if end > start {
            pieces.push(self.payload.slice(start..end));
        }
        Ok(pieces)
    }
}
