//! Opus encoder wrapper and greedy frame packer

use bytes::Bytes;
use opus::{Application, Channels, Encoder};
use tracing::{trace, warn};

use crate::audio::buffer::RingBuffer;
use crate::codec::packet::{write_frame, EncodedVoice};
use crate::codec::{largest_frame_size, FrameEncode, FRAME_SIZES, MAX_ENCODED_FRAME_BYTES};
use crate::config::{OpusApplication, OpusConfig};
use crate::error::{CodecError, QueueError};

/// Mono Opus encoder configured for voice
pub struct OpusEncoder {
    encoder: Encoder,
    config: OpusConfig,
}

impl OpusEncoder {
    /// Create a new Opus encoder with the specified configuration
    pub fn new(config: OpusConfig) -> Result<Self, CodecError> {
        let application = match config.application {
            OpusApplication::Voip => Application::Voip,
            OpusApplication::Audio => Application::Audio,
            OpusApplication::LowDelay => Application::LowDelay,
        };

        let mut encoder = Encoder::new(config.sample_rate, Channels::Mono, application)
            .map_err(|e| CodecError::EncoderInit(e.to_string()))?;

        Self::configure_encoder(&mut encoder, &config)?;

        Ok(Self { encoder, config })
    }

    /// Create encoder with the default voice settings
    pub fn voice() -> Result<Self, CodecError> {
        Self::new(OpusConfig::default())
    }

    fn configure_encoder(encoder: &mut Encoder, config: &OpusConfig) -> Result<(), CodecError> {
        encoder.set_bitrate(opus::Bitrate::Bits(config.bitrate as i32))
            .map_err(|e| CodecError::EncoderInit(format!("Failed to set bitrate: {}", e)))?;

        encoder.set_vbr(config.vbr)
            .map_err(|e| CodecError::EncoderInit(format!("Failed to set VBR: {}", e)))?;

        if config.vbr && config.cvbr {
            encoder.set_vbr_constraint(true)
                .map_err(|e| CodecError::EncoderInit(format!("Failed to set CVBR: {}", e)))?;
        }

        encoder.set_inband_fec(config.fec)
            .map_err(|e| CodecError::EncoderInit(format!("Failed to set FEC: {}", e)))?;

        if config.fec {
            encoder.set_packet_loss_perc(config.packet_loss_perc as i32)
                .map_err(|e| CodecError::EncoderInit(format!("Failed to set packet loss: {}", e)))?;
        }

        Ok(())
    }

    /// Update bitrate dynamically
    pub fn set_bitrate(&mut self, bitrate: u32) -> Result<(), CodecError> {
        self.encoder.set_bitrate(opus::Bitrate::Bits(bitrate as i32))
            .map_err(|e| CodecError::EncoderInit(format!("Failed to set bitrate: {}", e)))?;
        self.config.bitrate = bitrate;
        Ok(())
    }

    pub fn config(&self) -> &OpusConfig {
        &self.config
    }
}

impl FrameEncode for OpusEncoder {
    fn encode_frame(&mut self, samples: &[i16], output: &mut [u8]) -> Result<usize, CodecError> {
        if !FRAME_SIZES.contains(&samples.len()) {
            return Err(CodecError::InvalidFrameSize(samples.len()));
        }

        self.encoder
            .encode(samples, output)
            .map_err(|e| CodecError::EncodingFailed(e.to_string()))
    }
}

/// Encoder statistics
#[derive(Debug, Clone, Default)]
pub struct EncoderStats {
    pub frames_encoded: u64,
    pub frames_dropped: u64,
    pub bytes_produced: u64,
    pub silence_samples_padded: u64,
}

impl EncoderStats {
    pub fn average_frame_size(&self) -> f32 {
        if self.frames_encoded > 0 {
            self.bytes_produced as f32 / self.frames_encoded as f32
        } else {
            0.0
        }
    }
}

/// Drains a sample queue into as few legal-size frames as possible.
///
/// The queue itself is filled elsewhere (by the capture path) and is only
/// borrowed for the duration of a call.
pub struct FrameEncoder<E: FrameEncode = OpusEncoder> {
    codec: E,
    frame_sizes: Vec<usize>,
    frame_buffer: Vec<u8>,
    output: Vec<u8>,
    silence: Vec<i16>,
    stats: EncoderStats,
}

impl<E: FrameEncode> FrameEncoder<E> {
    pub fn new(codec: E) -> Self {
        Self::with_frame_sizes(codec, &FRAME_SIZES)
    }

    /// Use a custom set of legal frame sizes
    pub fn with_frame_sizes(codec: E, sizes: &[usize]) -> Self {
        let mut frame_sizes: Vec<usize> = sizes.iter().copied().filter(|&s| s > 0).collect();
        frame_sizes.sort_unstable_by(|a, b| b.cmp(a));
        frame_sizes.dedup();
        let min = frame_sizes.last().copied().unwrap_or(0);

        Self {
            codec,
            frame_sizes,
            frame_buffer: vec![0u8; MAX_ENCODED_FRAME_BYTES],
            output: Vec::with_capacity(MAX_ENCODED_FRAME_BYTES),
            silence: vec![0i16; min],
            stats: EncoderStats::default(),
        }
    }

    pub fn min_frame_size(&self) -> usize {
        self.frame_sizes.last().copied().unwrap_or(0)
    }

    pub fn max_frame_size(&self) -> usize {
        self.frame_sizes.first().copied().unwrap_or(0)
    }

    /// Whether at least one minimum-size frame is queued
    pub fn has_data_for_one_frame(&self, queue: &RingBuffer<i16>) -> bool {
        !self.frame_sizes.is_empty() && queue.len() >= self.min_frame_size()
    }

    /// Encode everything that fits into legal frames.
    ///
    /// With `force_flush_with_silence` a sub-frame remainder is padded with
    /// zeros up to the minimum frame size and encoded as well, leaving the
    /// queue empty. Returns `None` when nothing was encoded.
    pub fn try_get_encoded(
        &mut self,
        queue: &mut RingBuffer<i16>,
        force_flush_with_silence: bool,
    ) -> Result<Option<EncodedVoice>, QueueError> {
        if self.frame_sizes.is_empty() {
            return Ok(None);
        }

        self.output.clear();
        let mut frame_count = 0;
        let mut sample_count = 0;

        while let Some(frame_size) = largest_frame_size(&self.frame_sizes, queue.len()) {
            if self.encode_front(queue, frame_size)? {
                frame_count += 1;
                sample_count += frame_size;
            }
        }

        let remainder = queue.len();
        if force_flush_with_silence && remainder > 0 {
            let min = self.min_frame_size();
            let padding = min - remainder;
            queue.enqueue(&self.silence[..padding]);
            self.stats.silence_samples_padded += padding as u64;
            if self.encode_front(queue, min)? {
                frame_count += 1;
                sample_count += min;
            }
        }

        if frame_count == 0 {
            return Ok(None);
        }

        trace!(frame_count, sample_count, bytes = self.output.len(), "Encoded voice");
        Ok(Some(EncodedVoice::new(
            Bytes::copy_from_slice(&self.output),
            frame_count,
            sample_count,
        )))
    }

    /// Encode and dequeue one frame from the front of the queue. A frame the
    /// codec rejects is dropped so it cannot wedge the queue.
    fn encode_front(&mut self, queue: &mut RingBuffer<i16>, frame_size: usize) -> Result<bool, QueueError> {
        let encoded = self
            .codec
            .encode_frame(&queue.as_slice()[..frame_size], &mut self.frame_buffer)
            .and_then(|size| write_frame(&mut self.output, &self.frame_buffer[..size]).map(|_| size));
        queue.dequeue(frame_size)?;

        match encoded {
            Ok(size) => {
                self.stats.frames_encoded += 1;
                self.stats.bytes_produced += size as u64;
                Ok(true)
            }
            Err(e) => {
                self.stats.frames_dropped += 1;
                warn!(frame_size, "Dropping frame: {}", e);
                Ok(false)
            }
        }
    }

    pub fn stats(&self) -> &EncoderStats {
        &self.stats
    }

    pub fn reset_stats(&mut self) {
        self.stats = EncoderStats::default();
    }

    pub fn codec(&self) -> &E {
        &self.codec
    }

    pub fn codec_mut(&mut self) -> &mut E {
        &mut self.codec
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::codec::MIN_FRAME_SIZE;
    use proptest::prelude::*;

    /// Records frame sizes and emits the first sample of each frame as payload
    #[derive(Default)]
    pub(crate) struct StubCodec {
        pub frames: Vec<usize>,
        pub fail_next: bool,
    }

    impl FrameEncode for StubCodec {
        fn encode_frame(&mut self, samples: &[i16], output: &mut [u8]) -> Result<usize, CodecError> {
            if std::mem::take(&mut self.fail_next) {
                return Err(CodecError::EncodingFailed("stub".into()));
            }
            self.frames.push(samples.len());
            output[..2].copy_from_slice(&samples[0].to_le_bytes());
            output[2..4].copy_from_slice(&(samples.len() as u16).to_le_bytes());
            Ok(4)
        }
    }

    fn queue_of(len: usize) -> RingBuffer<i16> {
        let mut queue = RingBuffer::new(16);
        let samples: Vec<i16> = (0..len).map(|i| (i % 1000) as i16 + 1).collect();
        queue.enqueue(&samples);
        queue
    }

    #[test]
    fn test_greedy_largest_frames() {
        let mut encoder = FrameEncoder::new(StubCodec::default());
        let mut queue = queue_of(2880 + 960 + 120 + 50);

        let encoded = encoder.try_get_encoded(&mut queue, false).unwrap().unwrap();

        assert_eq!(encoder.codec().frames, vec![2880, 960, 120]);
        assert_eq!(encoded.frame_count(), 3);
        assert_eq!(encoded.sample_count(), 3960);
        assert_eq!(queue.len(), 50);
        assert_eq!(encoded.frames().count(), 3);
    }

    #[test]
    fn test_flush_pads_remainder() {
        let mut encoder = FrameEncoder::new(StubCodec::default());
        let mut queue = queue_of(480 + 70);

        let encoded = encoder.try_get_encoded(&mut queue, true).unwrap().unwrap();

        assert_eq!(encoder.codec().frames, vec![480, MIN_FRAME_SIZE]);
        assert_eq!(encoded.sample_count(), 480 + MIN_FRAME_SIZE);
        assert!(queue.is_empty());
        assert_eq!(encoder.stats().silence_samples_padded, 50);
    }

    #[test]
    fn test_flush_only_remainder() {
        let mut encoder = FrameEncoder::new(StubCodec::default());
        let mut queue = queue_of(10);

        assert!(!encoder.has_data_for_one_frame(&queue));
        assert!(encoder.try_get_encoded(&mut queue, false).unwrap().is_none());
        assert_eq!(queue.len(), 10);

        let encoded = encoder.try_get_encoded(&mut queue, true).unwrap().unwrap();
        assert_eq!(encoded.frame_count(), 1);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_empty_queue_yields_nothing() {
        let mut encoder = FrameEncoder::new(StubCodec::default());
        let mut queue = RingBuffer::new(16);
        assert!(encoder.try_get_encoded(&mut queue, true).unwrap().is_none());
        assert!(encoder.codec().frames.is_empty());
    }

    #[test]
    fn test_rejected_frame_is_dropped() {
        let mut encoder = FrameEncoder::new(StubCodec {
            fail_next: true,
            ..Default::default()
        });
        let mut queue = queue_of(960 + 480);

        let encoded = encoder.try_get_encoded(&mut queue, false).unwrap().unwrap();

        assert_eq!(encoded.frame_count(), 1);
        assert_eq!(encoder.stats().frames_dropped, 1);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_custom_frame_sizes() {
        let mut encoder = FrameEncoder::with_frame_sizes(StubCodec::default(), &[480, 1920, 960, 2880]);
        assert_eq!(encoder.min_frame_size(), 480);
        assert_eq!(encoder.max_frame_size(), 2880);

        let mut queue = queue_of(1000);
        encoder.try_get_encoded(&mut queue, false).unwrap();
        assert_eq!(encoder.codec().frames, vec![960]);
        assert_eq!(queue.len(), 40);
    }

    /// Fewest frames that can cover `len` samples exactly with the legal sizes
    fn min_frames(len: usize) -> usize {
        let mut best = vec![usize::MAX; len + 1];
        best[0] = 0;
        for n in 1..=len {
            for &size in &FRAME_SIZES {
                if size <= n && best[n - size] != usize::MAX {
                    best[n] = best[n].min(best[n - size] + 1);
                }
            }
        }
        best[len]
    }

    proptest! {
        #[test]
        fn prop_leaves_less_than_min_frame(len in 0usize..12000) {
            let mut encoder = FrameEncoder::new(StubCodec::default());
            let mut queue = queue_of(len);
            encoder.try_get_encoded(&mut queue, false).unwrap();
            prop_assert!(queue.len() < MIN_FRAME_SIZE);

            encoder.try_get_encoded(&mut queue, true).unwrap();
            prop_assert_eq!(queue.len(), 0);
        }

        #[test]
        fn prop_frame_count_minimal(multiple in 1usize..80) {
            let len = multiple * MIN_FRAME_SIZE;
            let mut encoder = FrameEncoder::new(StubCodec::default());
            let mut queue = queue_of(len);
            let encoded = encoder.try_get_encoded(&mut queue, false).unwrap().unwrap();
            prop_assert_eq!(encoded.frame_count(), min_frames(len));
        }
    }
}
