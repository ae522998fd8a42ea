//! Opus decoder wrapper and per-frame decoding
//!
//! Decoder state carries across calls so Opus can conceal gaps between
//! consecutive frames of the same stream.

use opus::{Channels, Decoder};
use tracing::warn;

use crate::codec::packet::frames;
use crate::codec::{FrameDecode, MAX_FRAME_SIZE};
use crate::error::CodecError;

/// Mono Opus decoder
pub struct OpusDecoder {
    decoder: Decoder,
    sample_rate: u32,
}

impl OpusDecoder {
    pub fn new(sample_rate: u32) -> Result<Self, CodecError> {
        let decoder = Decoder::new(sample_rate, Channels::Mono)
            .map_err(|e| CodecError::DecoderInit(e.to_string()))?;

        Ok(Self { decoder, sample_rate })
    }

    /// Reset decoder state
    pub fn reset(&mut self) -> Result<(), CodecError> {
        self.decoder.reset_state()
            .map_err(|e| CodecError::DecoderInit(e.to_string()))
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
}

impl FrameDecode for OpusDecoder {
    fn frame_size_of(&self, frame: &[u8]) -> Result<usize, CodecError> {
        if frame.is_empty() {
            return Err(CodecError::MalformedPacket("Empty frame".into()));
        }
        self.decoder
            .get_nb_samples(frame)
            .map_err(|e| CodecError::MalformedPacket(e.to_string()))
    }

    fn decode_frame(&mut self, frame: &[u8], output: &mut [i16]) -> Result<usize, CodecError> {
        self.decoder
            .decode(frame, output, false)
            .map_err(|e| CodecError::DecodingFailed(e.to_string()))
    }
}

/// Decoder statistics
#[derive(Debug, Clone, Default)]
pub struct DecoderStats {
    pub frames_decoded: u64,
    pub packets_dropped: u64,
    pub samples_produced: u64,
}

/// Turns received frames back into samples
pub struct FrameDecoder<D: FrameDecode = OpusDecoder> {
    codec: D,
    decode_buffer: Vec<i16>,
    stats: DecoderStats,
}

impl<D: FrameDecode> FrameDecoder<D> {
    pub fn new(codec: D) -> Self {
        Self {
            codec,
            decode_buffer: vec![0i16; MAX_FRAME_SIZE],
            stats: DecoderStats::default(),
        }
    }

    /// Decode a single frame with one codec call
    pub fn decode(&mut self, frame: &[u8]) -> Result<&[i16], CodecError> {
        let frame_size = self.codec.frame_size_of(frame)?;
        if frame_size == 0 || frame_size > MAX_FRAME_SIZE {
            return Err(CodecError::InvalidFrameSize(frame_size));
        }

        let decoded = self
            .codec
            .decode_frame(frame, &mut self.decode_buffer[..frame_size])?;

        self.stats.frames_decoded += 1;
        self.stats.samples_produced += decoded as u64;
        Ok(&self.decode_buffer[..decoded])
    }

    /// Decode every frame of a payload, handing each one's samples to `sink`.
    ///
    /// Returns the number of samples produced. A malformed frame aborts the
    /// rest of the payload and counts it as dropped.
    pub fn decode_packet(
        &mut self,
        payload: &[u8],
        mut sink: impl FnMut(&[i16]),
    ) -> Result<usize, CodecError> {
        let mut produced = 0;
        for frame in frames(payload) {
            let result = frame.and_then(|frame| self.decode(frame).map(|samples| {
                sink(samples);
                samples.len()
            }));
            match result {
                Ok(count) => produced += count,
                Err(e) => {
                    self.stats.packets_dropped += 1;
                    warn!("Dropping voice packet: {}", e);
                    return Err(e);
                }
            }
        }
        Ok(produced)
    }

    pub fn stats(&self) -> &DecoderStats {
        &self.stats
    }

    pub fn codec_mut(&mut self) -> &mut D {
        &mut self.codec
    }
}
