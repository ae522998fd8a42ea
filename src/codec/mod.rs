//! Opus codec wrapper
//!
//! Queued mono voice samples are packed greedily into the largest legal
//! Opus frame sizes, and received frames are decoded one codec call each.

pub mod decoder;
pub mod encoder;
pub mod packet;

pub use decoder::{FrameDecoder, OpusDecoder};
pub use encoder::{FrameEncoder, OpusEncoder};
pub use packet::EncodedVoice;

use crate::constants::SAMPLE_SIZE;
use crate::error::CodecError;

/// Frame sizes (in samples at 48 kHz) Opus accepts, largest first
pub const FRAME_SIZES: [usize; 6] = [2880, 1920, 960, 480, 240, 120];

/// Largest legal frame size
pub const MAX_FRAME_SIZE: usize = FRAME_SIZES[0];

/// Smallest legal frame size
pub const MIN_FRAME_SIZE: usize = FRAME_SIZES[FRAME_SIZES.len() - 1];

/// Upper bound on a single encoded frame
pub const MAX_ENCODED_FRAME_BYTES: usize = MAX_FRAME_SIZE * SAMPLE_SIZE;

/// Largest size in `sizes` (sorted descending) that fits `available` samples
pub fn largest_frame_size(sizes: &[usize], available: usize) -> Option<usize> {
    sizes.iter().copied().find(|&size| size <= available)
}

/// Something that compresses one frame of samples at a time
pub trait FrameEncode {
    /// Encode exactly one frame, returning the number of bytes written to `output`
    fn encode_frame(&mut self, samples: &[i16], output: &mut [u8]) -> Result<usize, CodecError>;
}

/// Something that decompresses one frame at a time
pub trait FrameDecode {
    /// Number of samples the encoded frame decodes to
    fn frame_size_of(&self, frame: &[u8]) -> Result<usize, CodecError>;

    /// Decode one frame into `output`, returning the number of samples written
    fn decode_frame(&mut self, frame: &[u8], output: &mut [i16]) -> Result<usize, CodecError>;
}
