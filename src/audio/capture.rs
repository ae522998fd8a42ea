//! Per-tick capture reconciliation
//!
//! The capture device records into its own circular buffer and advances a
//! record cursor on its own thread. Each tick copies everything recorded
//! since the previous tick into the voice queue, resampling on the way in
//! when the driver does not record at the codec rate.

use tracing::{debug, info};

use crate::audio::backend::{CaptureDevice, VoiceFormat};
use crate::audio::buffer::RingBuffer;
use crate::audio::circular::forward_distance;
use crate::constants::SAMPLE_SIZE;
use crate::error::{AudioError, Result};
use crate::resample::{expected_output_len, Resampler, RubatoResampler};

/// Default rubato chunk size in input samples
pub const DEFAULT_RESAMPLE_CHUNK: usize = 1024;

enum RecordQueue {
    Bytes(RingBuffer<u8>),
    Samples(RingBuffer<i16>),
}

/// Outcome of a single capture tick
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RecordTick {
    /// Native-rate samples recorded since the previous tick
    pub recorded: usize,
    /// Samples appended to the voice queue, after resampling
    pub enqueued: usize,
}

/// Capture statistics
#[derive(Debug, Clone, Default)]
pub struct RecordStats {
    pub ticks: u64,
    pub samples_recorded: u64,
    pub samples_enqueued: u64,
}

/// Drains a capture device's circular buffer into a voice queue
pub struct RecordReconciler<C: CaptureDevice> {
    device: C,
    queue: RecordQueue,
    output_sample_rate: u32,
    resampler: Option<Box<dyn Resampler>>,
    resample_chunk: usize,
    prev_record_cursor: usize,
    recording: bool,
    /// Raw bytes read from the device this tick
    raw: Vec<u8>,
    /// Native-rate samples awaiting resampling
    resample_input: Vec<i16>,
    stats: RecordStats,
}

impl<C: CaptureDevice> RecordReconciler<C> {
    /// Wrap a capture device. A rubato resampler is created when the
    /// driver's native rate differs from `output_sample_rate`.
    pub fn new(device: C, format: VoiceFormat, output_sample_rate: u32) -> Result<Self> {
        Self::with_chunk_size(device, format, output_sample_rate, DEFAULT_RESAMPLE_CHUNK)
    }

    pub fn with_chunk_size(
        device: C,
        format: VoiceFormat,
        output_sample_rate: u32,
        resample_chunk: usize,
    ) -> Result<Self> {
        let resampler = build_resampler(&device, format, output_sample_rate, resample_chunk)?;
        Ok(Self::assemble(device, format, output_sample_rate, resampler, resample_chunk))
    }

    /// Wrap a capture device using the given resampler for rate conversion
    pub fn with_resampler(
        device: C,
        output_sample_rate: u32,
        resampler: Box<dyn Resampler>,
    ) -> Self {
        Self::assemble(
            device,
            VoiceFormat::Pcm16Samples,
            output_sample_rate,
            Some(resampler),
            DEFAULT_RESAMPLE_CHUNK,
        )
    }

    fn assemble(
        device: C,
        format: VoiceFormat,
        output_sample_rate: u32,
        resampler: Option<Box<dyn Resampler>>,
        resample_chunk: usize,
    ) -> Self {
        let buffer_len = device.buffer_len();
        let queue = match format {
            VoiceFormat::Pcm16Bytes => RecordQueue::Bytes(RingBuffer::new(buffer_len)),
            VoiceFormat::Pcm16Samples => RecordQueue::Samples(RingBuffer::new(buffer_len / SAMPLE_SIZE)),
        };

        Self {
            device,
            queue,
            output_sample_rate,
            resampler,
            resample_chunk,
            prev_record_cursor: 0,
            recording: false,
            raw: Vec::with_capacity(buffer_len),
            resample_input: Vec::with_capacity(buffer_len / SAMPLE_SIZE),
            stats: RecordStats::default(),
        }
    }

    pub fn start_recording(&mut self) -> Result<()> {
        if self.recording {
            return Ok(());
        }
        self.device.start_capture()?;
        self.prev_record_cursor = 0;
        self.recording = true;
        info!(native_rate = self.device.native_sample_rate(), "Recording started");
        Ok(())
    }

    pub fn stop_recording(&mut self) -> Result<()> {
        if !self.recording {
            return Ok(());
        }
        self.device.stop_capture()?;
        self.prev_record_cursor = 0;
        self.recording = false;
        if let Some(resampler) = self.resampler.as_mut() {
            resampler.reset();
        }
        info!("Recording stopped");
        Ok(())
    }

    /// Swap in a different capture device, carrying on recording if we were.
    /// Already queued audio is kept.
    pub fn replace_device(&mut self, device: C) -> Result<()> {
        let was_recording = self.recording;
        self.stop_recording()?;

        let format = self.format();
        self.resampler = build_resampler(&device, format, self.output_sample_rate, self.resample_chunk)?;
        self.device = device;

        if was_recording {
            self.start_recording()?;
        }
        Ok(())
    }

    /// Run one reconciliation tick
    pub fn tick(&mut self) -> Result<RecordTick> {
        if !self.recording {
            return Ok(RecordTick::default());
        }

        let record_cursor = self.device.record_cursor()?;
        let buffer_len = self.device.buffer_len();
        let recorded = forward_distance(self.prev_record_cursor, record_cursor, buffer_len) / SAMPLE_SIZE;
        if recorded == 0 {
            self.stats.ticks += 1;
            return Ok(RecordTick::default());
        }
        // A trailing half sample stays behind for the next tick
        let recorded_bytes = recorded * SAMPLE_SIZE;

        let enqueued = match &mut self.queue {
            RecordQueue::Bytes(queue) => {
                let spare = queue.spare_mut(recorded_bytes);
                self.device.read_region(self.prev_record_cursor, spare)?;
                queue.modify_write_position(recorded_bytes as isize)?;
                recorded
            }
            RecordQueue::Samples(queue) => {
                self.raw.resize(recorded_bytes, 0);
                self.device.read_region(self.prev_record_cursor, &mut self.raw)?;

                match self.resampler.as_mut() {
                    Some(resampler) => {
                        self.resample_input.clear();
                        self.resample_input.extend(
                            self.raw
                                .chunks_exact(SAMPLE_SIZE)
                                .map(|b| i16::from_le_bytes([b[0], b[1]])),
                        );
                        // Exact output length is only known after the call
                        let expected = expected_output_len(
                            recorded,
                            self.device.native_sample_rate(),
                            self.output_sample_rate,
                        );
                        let spare = queue.spare_mut(expected);
                        let (_, produced) = resampler.process(&self.resample_input, spare)?;
                        queue.modify_write_position(produced as isize)?;
                        produced
                    }
                    None => {
                        let spare = queue.spare_mut(recorded);
                        for (slot, bytes) in spare.iter_mut().zip(self.raw.chunks_exact(SAMPLE_SIZE)) {
                            *slot = i16::from_le_bytes([bytes[0], bytes[1]]);
                        }
                        queue.modify_write_position(recorded as isize)?;
                        recorded
                    }
                }
            }
        };

        self.prev_record_cursor = (self.prev_record_cursor + recorded_bytes) % buffer_len;
        self.stats.ticks += 1;
        self.stats.samples_recorded += recorded as u64;
        self.stats.samples_enqueued += enqueued as u64;

        Ok(RecordTick { recorded, enqueued })
    }

    /// Recorded samples. Fails unless in [`VoiceFormat::Pcm16Samples`] mode.
    pub fn samples_queue_mut(&mut self) -> std::result::Result<&mut RingBuffer<i16>, AudioError> {
        match &mut self.queue {
            RecordQueue::Samples(queue) => Ok(queue),
            RecordQueue::Bytes(_) => Err(AudioError::FormatMismatch {
                expected: VoiceFormat::Pcm16Bytes,
                actual: VoiceFormat::Pcm16Samples,
            }),
        }
    }

    /// Recorded bytes. Fails unless in [`VoiceFormat::Pcm16Bytes`] mode.
    pub fn bytes_queue_mut(&mut self) -> std::result::Result<&mut RingBuffer<u8>, AudioError> {
        match &mut self.queue {
            RecordQueue::Bytes(queue) => Ok(queue),
            RecordQueue::Samples(_) => Err(AudioError::FormatMismatch {
                expected: VoiceFormat::Pcm16Samples,
                actual: VoiceFormat::Pcm16Bytes,
            }),
        }
    }

    pub fn format(&self) -> VoiceFormat {
        match self.queue {
            RecordQueue::Bytes(_) => VoiceFormat::Pcm16Bytes,
            RecordQueue::Samples(_) => VoiceFormat::Pcm16Samples,
        }
    }

    pub fn is_recording(&self) -> bool {
        self.recording
    }

    pub fn resampling(&self) -> bool {
        self.resampler.is_some()
    }

    pub fn output_sample_rate(&self) -> u32 {
        self.output_sample_rate
    }

    pub fn stats(&self) -> &RecordStats {
        &self.stats
    }

    pub fn device(&self) -> &C {
        &self.device
    }
}

fn build_resampler<C: CaptureDevice>(
    device: &C,
    format: VoiceFormat,
    output_sample_rate: u32,
    chunk: usize,
) -> Result<Option<Box<dyn Resampler>>> {
    let native = device.native_sample_rate();
    if native == output_sample_rate || format == VoiceFormat::Pcm16Bytes {
        return Ok(None);
    }
    debug!(native, output_sample_rate, "Capture needs resampling");
    Ok(Some(Box::new(RubatoResampler::new(native, output_sample_rate, chunk)?)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::virtual_device::{Microphone, VirtualCapture};

    /// Nearest-neighbour converter that always produces the ceiling length
    struct StretchResampler {
        input_rate: u32,
        output_rate: u32,
        calls: std::sync::Arc<parking_lot::Mutex<Vec<(usize, usize)>>>,
    }

    impl Resampler for StretchResampler {
        fn process(&mut self, input: &[i16], output: &mut [i16]) -> std::result::Result<(usize, usize), AudioError> {
            self.calls.lock().push((input.len(), output.len()));
            let produced = expected_output_len(input.len(), self.input_rate, self.output_rate).min(output.len());
            for (i, slot) in output[..produced].iter_mut().enumerate() {
                let src = i * self.input_rate as usize / self.output_rate as usize;
                *slot = input[src.min(input.len() - 1)];
            }
            Ok((input.len(), produced))
        }

        fn ratio(&self) -> f64 {
            self.output_rate as f64 / self.input_rate as f64
        }

        fn latency(&self) -> usize {
            0
        }

        fn reset(&mut self) {}
    }

    fn recorder(native_rate: u32, seconds: usize) -> (RecordReconciler<VirtualCapture>, Microphone) {
        let (device, mic) = VirtualCapture::new(native_rate, native_rate as usize * SAMPLE_SIZE * seconds);
        let recorder = RecordReconciler::new(device, VoiceFormat::Pcm16Samples, native_rate).unwrap();
        (recorder, mic)
    }

    #[test]
    fn test_idle_until_started() {
        let (mut recorder, mic) = recorder(48000, 1);
        mic.speak(&[1; 100]);
        assert_eq!(recorder.tick().unwrap(), RecordTick::default());
        assert!(!recorder.resampling());
    }

    #[test]
    fn test_copies_recorded_samples() {
        let (mut recorder, mic) = recorder(48000, 1);
        recorder.start_recording().unwrap();

        mic.speak(&[1, 2, 3, 4]);
        let tick = recorder.tick().unwrap();
        assert_eq!(tick, RecordTick { recorded: 4, enqueued: 4 });

        mic.speak(&[5, 6]);
        recorder.tick().unwrap();
        assert_eq!(recorder.samples_queue_mut().unwrap().as_slice(), &[1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn test_record_cursor_wraps() {
        let (device, mic) = VirtualCapture::new(48000, 8 * SAMPLE_SIZE);
        let mut recorder = RecordReconciler::new(device, VoiceFormat::Pcm16Samples, 48000).unwrap();
        recorder.start_recording().unwrap();

        mic.speak(&[1, 2, 3, 4, 5, 6]);
        recorder.tick().unwrap();
        mic.speak(&[7, 8, 9, 10]);
        let tick = recorder.tick().unwrap();

        assert_eq!(tick.recorded, 4);
        assert_eq!(
            recorder.samples_queue_mut().unwrap().as_slice(),
            &[1, 2, 3, 4, 5, 6, 7, 8, 9, 10]
        );
    }

    #[test]
    fn test_resampled_queue_growth() {
        let (device, mic) = VirtualCapture::new(44100, 44100 * SAMPLE_SIZE);
        let calls = std::sync::Arc::new(parking_lot::Mutex::new(Vec::new()));
        let resampler = StretchResampler {
            input_rate: 44100,
            output_rate: 48000,
            calls: calls.clone(),
        };
        let mut recorder = RecordReconciler::with_resampler(device, 48000, Box::new(resampler));
        recorder.start_recording().unwrap();

        mic.speak(&[100; 500]);
        let tick = recorder.tick().unwrap();

        assert_eq!(tick.recorded, 500);
        assert_eq!(tick.enqueued, 545);
        assert_eq!(calls.lock().as_slice(), &[(500, 545)]);
        let queue = recorder.samples_queue_mut().unwrap();
        assert_eq!(queue.len(), 545);
        assert!(queue.capacity() >= 545);
    }

    #[test]
    fn test_bytes_mode() {
        let (device, mic) = VirtualCapture::new(44100, 1000);
        let mut recorder = RecordReconciler::new(device, VoiceFormat::Pcm16Bytes, 48000).unwrap();
        assert!(!recorder.resampling());
        assert!(recorder.samples_queue_mut().is_err());

        recorder.start_recording().unwrap();
        mic.speak(&[0x0102]);
        recorder.tick().unwrap();
        assert_eq!(recorder.bytes_queue_mut().unwrap().as_slice(), &[0x02, 0x01]);
    }

    #[test]
    fn test_bytes_mode_counts_samples() {
        let (device, mic) = VirtualCapture::new(48000, 1000);
        let mut recorder = RecordReconciler::new(device, VoiceFormat::Pcm16Bytes, 48000).unwrap();
        recorder.start_recording().unwrap();

        mic.speak(&[7, 8, 9]);
        let tick = recorder.tick().unwrap();
        assert_eq!(tick, RecordTick { recorded: 3, enqueued: 3 });
        assert_eq!(recorder.bytes_queue_mut().unwrap().len(), 6);
        assert_eq!(recorder.stats().samples_enqueued, 3);
    }

    #[test]
    fn test_half_sample_left_for_next_tick() {
        let (mut recorder, mic) = recorder(48000, 1);
        recorder.start_recording().unwrap();

        let first = 0x1122i16.to_le_bytes();
        let second = 0x3344i16.to_le_bytes();
        mic.write_bytes(&[first[0], first[1], second[0]]);
        let tick = recorder.tick().unwrap();
        assert_eq!(tick.recorded, 1);

        mic.write_bytes(&[second[1]]);
        mic.speak(&[0x5566]);
        let tick = recorder.tick().unwrap();
        assert_eq!(tick.recorded, 2);
        assert_eq!(
            recorder.samples_queue_mut().unwrap().as_slice(),
            &[0x1122, 0x3344, 0x5566]
        );
    }

    #[test]
    fn test_replace_device_keeps_recording() {
        let (mut recorder, mic) = recorder(48000, 1);
        recorder.start_recording().unwrap();
        mic.speak(&[1, 2]);
        recorder.tick().unwrap();

        let (device, new_mic) = VirtualCapture::new(48000, 48000 * SAMPLE_SIZE);
        recorder.replace_device(device).unwrap();
        assert!(recorder.is_recording());
        assert!(!mic.is_recording());

        new_mic.speak(&[3]);
        recorder.tick().unwrap();
        assert_eq!(recorder.samples_queue_mut().unwrap().as_slice(), &[1, 2, 3]);
    }

    #[test]
    fn test_stop_resets_cursor() {
        let (mut recorder, mic) = recorder(48000, 1);
        recorder.start_recording().unwrap();
        mic.speak(&[1; 10]);
        recorder.tick().unwrap();
        recorder.stop_recording().unwrap();

        recorder.start_recording().unwrap();
        mic.speak(&[2; 3]);
        let tick = recorder.tick().unwrap();
        assert_eq!(tick.recorded, 3);
    }
}
