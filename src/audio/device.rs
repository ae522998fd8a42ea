//! cpal-backed devices and device enumeration
//!
//! cpal streams are not `Send`, so each device keeps its stream alive on a
//! dedicated thread. The stream callback plays the role of the audio
//! thread: it owns nothing but a handle to the shared circular buffer and
//! moves the cursor as it renders or records.

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, Sample, SampleFormat, SizedSample, StreamConfig};
use crossbeam_channel::bounded;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{error, info};

use crate::audio::backend::{AudioBackend, CaptureDevice, PlaybackDevice};
use crate::audio::circular::CircularBuffer;
use crate::constants::{SAMPLE_SIZE, VOICE_CHANNELS};
use crate::error::AudioError;

/// Description of an audio device for listings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioDeviceInfo {
    /// Position in the host's input or output list; inputs use this as driver index
    pub index: usize,
    pub name: String,
    pub is_input: bool,
    pub is_default: bool,
    pub sample_rates: Vec<u32>,
    pub channels: Vec<u16>,
}

/// List input devices followed by output devices
pub fn list_devices() -> Vec<AudioDeviceInfo> {
    let host = cpal::default_host();
    let mut devices = Vec::new();

    let default_input = host.default_input_device().and_then(|d| d.name().ok());
    let default_output = host.default_output_device().and_then(|d| d.name().ok());

    if let Ok(inputs) = host.input_devices() {
        for (index, device) in inputs.enumerate() {
            let Ok(name) = device.name() else { continue };
            let (sample_rates, channels) = match device.supported_input_configs() {
                Ok(configs) => capabilities(configs),
                Err(_) => (Vec::new(), Vec::new()),
            };
            devices.push(AudioDeviceInfo {
                index,
                is_default: default_input.as_ref() == Some(&name),
                name,
                is_input: true,
                sample_rates,
                channels,
            });
        }
    }

    if let Ok(outputs) = host.output_devices() {
        for (index, device) in outputs.enumerate() {
            let Ok(name) = device.name() else { continue };
            let (sample_rates, channels) = match device.supported_output_configs() {
                Ok(configs) => capabilities(configs),
                Err(_) => (Vec::new(), Vec::new()),
            };
            devices.push(AudioDeviceInfo {
                index,
                is_default: default_output.as_ref() == Some(&name),
                name,
                is_input: false,
                sample_rates,
                channels,
            });
        }
    }

    devices
}

fn capabilities(configs: impl Iterator<Item = cpal::SupportedStreamConfigRange>) -> (Vec<u32>, Vec<u16>) {
    let mut rates = Vec::new();
    let mut channels = Vec::new();
    for config in configs {
        for rate in [16000u32, 22050, 44100, 48000, 96000] {
            let in_range = config.min_sample_rate().0 <= rate && rate <= config.max_sample_rate().0;
            if in_range && !rates.contains(&rate) {
                rates.push(rate);
            }
        }
        if !channels.contains(&config.channels()) {
            channels.push(config.channels());
        }
    }
    rates.sort_unstable();
    channels.sort_unstable();
    (rates, channels)
}

/// Keeps a stream alive on its own thread until `running` is cleared.
///
/// `build` runs on the stream thread; its result is reported back before
/// this returns so stream errors surface synchronously.
fn spawn_stream_thread<F>(
    name: String,
    running: Arc<AtomicBool>,
    build: F,
) -> Result<JoinHandle<()>, AudioError>
where
    F: FnOnce() -> Result<cpal::Stream, AudioError> + Send + 'static,
{
    let (ready_tx, ready_rx) = bounded::<Result<(), AudioError>>(1);

    let handle = thread::Builder::new()
        .name(name)
        .spawn(move || {
            let stream = match build().and_then(|stream| stream.play().map(|_| stream).map_err(Into::into)) {
                Ok(stream) => stream,
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };
            let _ = ready_tx.send(Ok(()));

            while running.load(Ordering::Relaxed) {
                thread::sleep(Duration::from_millis(10));
            }
            drop(stream);
        })
        .map_err(|e| AudioError::StreamError(e.to_string()))?;

    match ready_rx.recv() {
        Ok(Ok(())) => Ok(handle),
        Ok(Err(e)) => {
            let _ = handle.join();
            Err(e)
        }
        Err(_) => Err(AudioError::StreamError("Stream thread exited".into())),
    }
}

#[derive(Debug)]
struct PlaybackShared {
    buffer: CircularBuffer,
    cursor: usize,
    paused: bool,
    volume: f32,
}

/// Output device rendering mono 16-bit PCM from a circular buffer
pub struct CpalPlayback {
    shared: Arc<Mutex<PlaybackShared>>,
    ready: Arc<AtomicBool>,
    running: Arc<AtomicBool>,
    thread_handle: Option<JoinHandle<()>>,
}

impl CpalPlayback {
    pub fn open(device: cpal::Device, buffer_len: usize, sample_rate: u32) -> Result<Self, AudioError> {
        let name = device.name().unwrap_or_else(|_| "Unknown".to_string());
        let default_config = device.default_output_config()?;
        let sample_format = default_config.sample_format();
        let config = StreamConfig {
            channels: default_config.channels(),
            sample_rate: cpal::SampleRate(sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        let shared = Arc::new(Mutex::new(PlaybackShared {
            buffer: CircularBuffer::new(buffer_len),
            cursor: 0,
            paused: true,
            volume: 1.0,
        }));
        let ready = Arc::new(AtomicBool::new(false));
        let running = Arc::new(AtomicBool::new(true));

        let stream_shared = shared.clone();
        let stream_ready = ready.clone();
        let handle = spawn_stream_thread(format!("playback-{}", name), running.clone(), move || {
            match sample_format {
                SampleFormat::F32 => build_output::<f32>(&device, &config, stream_shared, stream_ready),
                SampleFormat::I16 => build_output::<i16>(&device, &config, stream_shared, stream_ready),
                SampleFormat::U16 => build_output::<u16>(&device, &config, stream_shared, stream_ready),
                other => Err(AudioError::UnsupportedFormat(format!("{:?}", other))),
            }
        })?;

        ready.store(true, Ordering::SeqCst);
        info!("Opened playback on {} ({} Hz, {} byte buffer)", name, sample_rate, buffer_len);

        Ok(Self {
            shared,
            ready,
            running,
            thread_handle: Some(handle),
        })
    }
}

fn build_output<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    shared: Arc<Mutex<PlaybackShared>>,
    ready: Arc<AtomicBool>,
) -> Result<cpal::Stream, AudioError>
where
    T: SizedSample + FromSample<f32> + Send + 'static,
{
    let channels = config.channels as usize;
    let stream = device.build_output_stream(
        config,
        move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
            let mut state = shared.lock();
            let len = state.buffer.len();
            for frame in data.chunks_mut(channels) {
                let value = if state.paused || len == 0 {
                    0.0
                } else {
                    let sample = state.buffer.sample_at(state.cursor);
                    state.cursor = (state.cursor + SAMPLE_SIZE) % len;
                    sample as f32 / i16::MAX as f32 * state.volume
                };
                for out in frame.iter_mut() {
                    *out = T::from_sample(value);
                }
            }
        },
        move |err| {
            error!("Playback stream error: {}", err);
            ready.store(false, Ordering::SeqCst);
        },
        None,
    )?;
    Ok(stream)
}

impl PlaybackDevice for CpalPlayback {
    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    fn buffer_len(&self) -> usize {
        self.shared.lock().buffer.len()
    }

    fn playback_cursor(&self) -> Result<usize, AudioError> {
        if !self.is_ready() {
            return Err(AudioError::BackendNotReady);
        }
        Ok(self.shared.lock().cursor)
    }

    fn set_playback_cursor(&mut self, cursor: usize) -> Result<(), AudioError> {
        let mut state = self.shared.lock();
        let buffer_len = state.buffer.len();
        if cursor >= buffer_len {
            return Err(AudioError::RegionOutOfBounds { offset: cursor, len: 0, buffer_len });
        }
        state.cursor = cursor;
        Ok(())
    }

    fn set_paused(&mut self, paused: bool) -> Result<(), AudioError> {
        self.shared.lock().paused = paused;
        Ok(())
    }

    fn set_volume(&mut self, volume: f32) -> Result<(), AudioError> {
        self.shared.lock().volume = volume.clamp(0.0, 1.0);
        Ok(())
    }

    fn write_region(&mut self, offset: usize, data: &[u8]) -> Result<(), AudioError> {
        self.shared.lock().buffer.write_region(offset, data)
    }
}

impl Drop for CpalPlayback {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
        }
    }
}

#[derive(Debug)]
struct CaptureShared {
    buffer: CircularBuffer,
    cursor: usize,
}

/// Input device recording a mono mixdown into a circular buffer
pub struct CpalCapture {
    device: cpal::Device,
    name: String,
    config: StreamConfig,
    sample_format: SampleFormat,
    shared: Arc<Mutex<CaptureShared>>,
    running: Arc<AtomicBool>,
    thread_handle: Option<JoinHandle<()>>,
}

impl CpalCapture {
    /// Open an input device at its native rate with `buffer_seconds` of storage
    pub fn open(device: cpal::Device, buffer_seconds: f32) -> Result<Self, AudioError> {
        let name = device.name().unwrap_or_else(|_| "Unknown".to_string());
        let default_config = device.default_input_config()?;
        let sample_format = default_config.sample_format();
        let config: StreamConfig = default_config.into();

        let buffer = CircularBuffer::for_pcm16(config.sample_rate.0, VOICE_CHANNELS, buffer_seconds);
        info!("Opened capture on {} ({} Hz, {} channels)", name, config.sample_rate.0, config.channels);

        Ok(Self {
            device,
            name,
            config,
            sample_format,
            shared: Arc::new(Mutex::new(CaptureShared { buffer, cursor: 0 })),
            running: Arc::new(AtomicBool::new(false)),
            thread_handle: None,
        })
    }
}

fn build_input<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    shared: Arc<Mutex<CaptureShared>>,
) -> Result<cpal::Stream, AudioError>
where
    T: SizedSample + Send + 'static,
    f32: FromSample<T>,
{
    let channels = config.channels as usize;
    let stream = device.build_input_stream(
        config,
        move |data: &[T], _: &cpal::InputCallbackInfo| {
            let mut state = shared.lock();
            let len = state.buffer.len();
            if len == 0 {
                return;
            }
            for frame in data.chunks(channels) {
                let sum: f32 = frame.iter().map(|&s| f32::from_sample(s)).sum();
                let mono = (sum / frame.len() as f32).clamp(-1.0, 1.0);
                let cursor = state.cursor;
                state.buffer.set_sample_at(cursor, (mono * i16::MAX as f32) as i16);
                state.cursor = (cursor + SAMPLE_SIZE) % len;
            }
        },
        |err| error!("Capture stream error: {}", err),
        None,
    )?;
    Ok(stream)
}

impl CaptureDevice for CpalCapture {
    fn native_sample_rate(&self) -> u32 {
        self.config.sample_rate.0
    }

    fn buffer_len(&self) -> usize {
        self.shared.lock().buffer.len()
    }

    fn start_capture(&mut self) -> Result<(), AudioError> {
        if self.running.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.shared.lock().cursor = 0;
        self.running.store(true, Ordering::SeqCst);

        let device = self.device.clone();
        let config = self.config.clone();
        let shared = self.shared.clone();
        let sample_format = self.sample_format;
        let result = spawn_stream_thread(format!("capture-{}", self.name), self.running.clone(), move || {
            match sample_format {
                SampleFormat::F32 => build_input::<f32>(&device, &config, shared),
                SampleFormat::I16 => build_input::<i16>(&device, &config, shared),
                SampleFormat::U16 => build_input::<u16>(&device, &config, shared),
                other => Err(AudioError::UnsupportedFormat(format!("{:?}", other))),
            }
        });

        match result {
            Ok(handle) => {
                self.thread_handle = Some(handle);
                Ok(())
            }
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                Err(e)
            }
        }
    }

    fn stop_capture(&mut self) -> Result<(), AudioError> {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.thread_handle.take() {
            handle
                .join()
                .map_err(|_| AudioError::StreamError("Capture thread panicked".into()))?;
        }
        Ok(())
    }

    fn record_cursor(&self) -> Result<usize, AudioError> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(AudioError::BackendNotReady);
        }
        Ok(self.shared.lock().cursor)
    }

    fn read_region(&self, offset: usize, out: &mut [u8]) -> Result<(), AudioError> {
        self.shared.lock().buffer.read_region(offset, out)
    }
}

impl Drop for CpalCapture {
    fn drop(&mut self) {
        let _ = self.stop_capture();
    }
}

/// Backend opening devices on the default cpal host
#[derive(Debug, Default, Clone, Copy)]
pub struct CpalBackend;

impl CpalBackend {
    pub fn new() -> Self {
        Self
    }
}

impl AudioBackend for CpalBackend {
    fn open_playback(
        &self,
        buffer_len: usize,
        sample_rate: u32,
    ) -> Result<Box<dyn PlaybackDevice>, AudioError> {
        let device = cpal::default_host()
            .default_output_device()
            .ok_or_else(|| AudioError::DeviceNotFound("No default output device".to_string()))?;
        Ok(Box::new(CpalPlayback::open(device, buffer_len, sample_rate)?))
    }

    fn open_capture(
        &self,
        driver_index: usize,
        buffer_seconds: f32,
    ) -> Result<Box<dyn CaptureDevice>, AudioError> {
        let device = cpal::default_host()
            .input_devices()
            .map_err(|e| AudioError::DeviceNotFound(e.to_string()))?
            .nth(driver_index)
            .ok_or_else(|| AudioError::DeviceNotFound(format!("No input device at index {}", driver_index)))?;
        Ok(Box::new(CpalCapture::open(device, buffer_seconds)?))
    }
}
