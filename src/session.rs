//! Voice sessions
//!
//! A local participant records, encodes and sends; every remote participant
//! gets its own decoder and its own playback buffer. Sessions are ticked from
//! a single thread and turn sustained backend failures into an
//! `Unavailable` status instead of per-tick errors.

use std::collections::{HashMap, HashSet};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::audio::backend::{AudioBackend, CaptureDevice, PlaybackDevice, VoiceFormat};
use crate::audio::capture::{RecordReconciler, RecordTick};
use crate::audio::playback::PlaybackReconciler;
use crate::codec::{FrameDecoder, FrameEncoder, OpusDecoder, OpusEncoder};
use crate::config::{AppConfig, OpusConfig, PlaybackConfig, RecordingConfig, SessionConfig};
use crate::constants::{MAX_PACKET_SIZE, OPUS_SAMPLE_RATE, SAMPLE_SIZE};
use crate::error::{AudioError, Error, Result};
use crate::network::packet::is_newer;
use crate::network::{Transport, VoicePacket};

/// Where a session is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    /// The backend has no live channel yet; nothing is reconciled
    AwaitingBackendReady,
    Running,
    /// Too many consecutive backend failures; ticks are no-ops
    Unavailable,
}

/// Counts consecutive failed ticks
#[derive(Debug, Clone)]
struct FailureTracker {
    consecutive: u32,
    limit: u32,
}

impl FailureTracker {
    fn new(limit: u32) -> Self {
        Self {
            consecutive: 0,
            limit: limit.max(1),
        }
    }

    /// Returns true once the limit is reached
    fn record(&mut self) -> bool {
        self.consecutive += 1;
        self.consecutive >= self.limit
    }

    fn clear(&mut self) {
        self.consecutive = 0;
    }
}

/// Queue errors mean the tick sequence itself is broken and must not be
/// absorbed as a backend failure.
fn is_fatal(error: &Error) -> bool {
    matches!(error, Error::Queue(_))
}

fn playback_buffer_len(seconds: f32) -> usize {
    (OPUS_SAMPLE_RATE as f32 * seconds).ceil() as usize * SAMPLE_SIZE
}

/// What happened to a received packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveOutcome {
    /// Decoded into this many samples
    Decoded(usize),
    /// Already seen, or older than the last packet
    Duplicate,
    /// Malformed; dropped
    Dropped,
}

/// Remote participant statistics
#[derive(Debug, Clone, Default)]
pub struct RemoteStats {
    pub packets_received: u64,
    pub packets_duplicate: u64,
    pub packets_dropped: u64,
}

/// Decodes and plays one remote participant's voice
pub struct RemoteVoice {
    participant: Uuid,
    decoder: FrameDecoder<OpusDecoder>,
    playback: PlaybackReconciler<Box<dyn PlaybackDevice>>,
    status: SessionStatus,
    failures: FailureTracker,
    last_sequence: Option<u32>,
    volume: f32,
    byte_scratch: Vec<u8>,
    stats: RemoteStats,
}

impl RemoteVoice {
    /// Open a dedicated playback buffer on `backend` for `participant`
    pub fn open(
        participant: Uuid,
        backend: &dyn AudioBackend,
        playback: &PlaybackConfig,
        session: &SessionConfig,
    ) -> Result<Self> {
        let device = backend.open_playback(playback_buffer_len(playback.buffer_seconds), OPUS_SAMPLE_RATE)?;
        Self::with_device(participant, device, playback, session)
    }

    pub fn with_device(
        participant: Uuid,
        device: Box<dyn PlaybackDevice>,
        playback: &PlaybackConfig,
        session: &SessionConfig,
    ) -> Result<Self> {
        let mut reconciler = PlaybackReconciler::new(device, playback.input_format, playback.underrun_policy);
        let status = if reconciler.device().is_ready() {
            reconciler.set_volume(playback.volume)?;
            SessionStatus::Running
        } else {
            SessionStatus::AwaitingBackendReady
        };
        debug!(%participant, ?status, "Remote voice created");

        Ok(Self {
            participant,
            decoder: FrameDecoder::new(OpusDecoder::new(OPUS_SAMPLE_RATE)?),
            playback: reconciler,
            status,
            failures: FailureTracker::new(session.max_backend_failures),
            last_sequence: None,
            volume: playback.volume,
            byte_scratch: Vec::new(),
            stats: RemoteStats::default(),
        })
    }

    /// Decode a packet straight into the playback queue
    pub fn receive(&mut self, packet: &VoicePacket) -> Result<ReceiveOutcome> {
        self.stats.packets_received += 1;
        if let Some(last) = self.last_sequence {
            if !is_newer(packet.sequence, last) {
                self.stats.packets_duplicate += 1;
                debug!(participant = %self.participant, sequence = packet.sequence, "Duplicate packet");
                return Ok(ReceiveOutcome::Duplicate);
            }
        }
        self.last_sequence = Some(packet.sequence);

        let playback = &mut self.playback;
        let scratch = &mut self.byte_scratch;
        let mut enqueued: std::result::Result<(), AudioError> = Ok(());
        let decoded = self.decoder.decode_packet(&packet.payload, |samples| {
            if enqueued.is_err() {
                return;
            }
            enqueued = match playback.format() {
                VoiceFormat::Pcm16Samples => playback.enqueue_samples(samples),
                VoiceFormat::Pcm16Bytes => {
                    scratch.clear();
                    scratch.extend(samples.iter().flat_map(|s| s.to_le_bytes()));
                    playback.enqueue_bytes(&scratch[..])
                }
            };
        });
        enqueued?;

        match decoded {
            Ok(samples) => Ok(ReceiveOutcome::Decoded(samples)),
            Err(_) => {
                // Codec concealment and the next good packet restore continuity
                self.stats.packets_dropped += 1;
                Ok(ReceiveOutcome::Dropped)
            }
        }
    }

    /// Run one playback tick
    pub fn tick(&mut self) -> Result<SessionStatus> {
        match self.status {
            SessionStatus::Unavailable => return Ok(self.status),
            SessionStatus::AwaitingBackendReady => {
                if !self.playback.device().is_ready() {
                    return Ok(self.status);
                }
                info!(participant = %self.participant, "Playback backend ready");
                self.playback.set_volume(self.volume)?;
                self.status = SessionStatus::Running;
            }
            SessionStatus::Running => {}
        }

        match self.playback.tick() {
            Ok(_) => self.failures.clear(),
            Err(e) if is_fatal(&e) => return Err(e),
            Err(e) => {
                warn!(participant = %self.participant, "Playback tick failed: {}", e);
                if self.failures.record() {
                    error!(participant = %self.participant, "Playback unavailable");
                    self.status = SessionStatus::Unavailable;
                }
            }
        }
        Ok(self.status)
    }

    /// Volume from 0 to 1
    pub fn set_volume(&mut self, volume: f32) -> Result<()> {
        self.volume = volume.clamp(0.0, 1.0);
        if self.status != SessionStatus::AwaitingBackendReady {
            self.playback.set_volume(self.volume)?;
        }
        Ok(())
    }

    pub fn participant(&self) -> Uuid {
        self.participant
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn stats(&self) -> &RemoteStats {
        &self.stats
    }

    pub fn playback(&self) -> &PlaybackReconciler<Box<dyn PlaybackDevice>> {
        &self.playback
    }

    pub fn decoder(&self) -> &FrameDecoder<OpusDecoder> {
        &self.decoder
    }
}

/// Outcome of one local tick
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LocalTick {
    pub record: RecordTick,
    pub packets_sent: usize,
}

/// Records, encodes and sends the local participant's voice
pub struct LocalVoice {
    participant: Uuid,
    recorder: RecordReconciler<Box<dyn CaptureDevice>>,
    encoder: FrameEncoder<OpusEncoder>,
    recording: RecordingConfig,
    status: SessionStatus,
    failures: FailureTracker,
    sequence: u32,
    max_packet_size: usize,
    monitor: Option<RemoteVoice>,
}

impl LocalVoice {
    pub fn open(participant: Uuid, backend: &dyn AudioBackend, config: &AppConfig) -> Result<Self> {
        let device = backend.open_capture(config.recording.driver_index, config.recording.buffer_seconds)?;
        let monitor = if config.session.monitor_own_voice {
            Some(RemoteVoice::open(participant, backend, &config.playback, &config.session)?)
        } else {
            None
        };
        let mut voice =
            Self::with_device(participant, device, &config.codec, &config.recording, &config.session, monitor)?;
        voice.set_max_packet_size(config.network.max_packet_size);
        Ok(voice)
    }

    pub fn with_device(
        participant: Uuid,
        device: Box<dyn CaptureDevice>,
        codec: &OpusConfig,
        recording: &RecordingConfig,
        session: &SessionConfig,
        monitor: Option<RemoteVoice>,
    ) -> Result<Self> {
        // The encoder consumes samples at the codec rate
        if recording.output_format != VoiceFormat::Pcm16Samples {
            return Err(AudioError::FormatMismatch {
                expected: VoiceFormat::Pcm16Samples,
                actual: recording.output_format,
            }
            .into());
        }
        if recording.output_sample_rate != codec.sample_rate {
            return Err(Error::Config(format!(
                "Recording rate {} does not match codec rate {}",
                recording.output_sample_rate, codec.sample_rate
            )));
        }

        let recorder = RecordReconciler::with_chunk_size(
            device,
            VoiceFormat::Pcm16Samples,
            recording.output_sample_rate,
            recording.resample_chunk,
        )?;

        Ok(Self {
            participant,
            recorder,
            encoder: FrameEncoder::new(OpusEncoder::new(codec.clone())?),
            recording: recording.clone(),
            status: SessionStatus::Running,
            failures: FailureTracker::new(session.max_backend_failures),
            sequence: 0,
            max_packet_size: MAX_PACKET_SIZE,
            monitor,
        })
    }

    /// Largest serialized packet to hand the transport
    pub fn set_max_packet_size(&mut self, max_packet_size: usize) {
        self.max_packet_size = max_packet_size;
    }

    pub fn start_recording(&mut self) -> Result<()> {
        self.recorder.start_recording()
    }

    /// Stop capture, sending whatever is still queued padded out to a frame
    pub fn stop_recording(&mut self, transport: &mut dyn Transport) -> Result<usize> {
        if !self.recorder.is_recording() {
            return Ok(0);
        }
        if let Err(e) = self.recorder.tick() {
            if is_fatal(&e) {
                return Err(e);
            }
            warn!("Final capture tick failed: {}", e);
        }
        self.recorder.stop_recording()?;
        self.encode_and_send(transport, true)
    }

    /// Switch to another capture driver, keeping queued audio
    pub fn set_record_driver(&mut self, backend: &dyn AudioBackend, driver_index: usize) -> Result<()> {
        let device = backend.open_capture(driver_index, self.recording.buffer_seconds)?;
        self.recorder.replace_device(device)?;
        self.recording.driver_index = driver_index;
        self.failures.clear();
        if self.status == SessionStatus::Unavailable {
            self.status = SessionStatus::Running;
        }
        info!(driver_index, "Record driver changed");
        Ok(())
    }

    /// Record what arrived since the last tick, then encode and send it
    pub fn tick(&mut self, transport: &mut dyn Transport) -> Result<LocalTick> {
        if self.status == SessionStatus::Unavailable {
            return Ok(LocalTick::default());
        }

        let record = match self.recorder.tick() {
            Ok(record) => {
                self.failures.clear();
                record
            }
            Err(e) if is_fatal(&e) => return Err(e),
            Err(e) => {
                warn!("Capture tick failed: {}", e);
                if self.failures.record() {
                    error!(participant = %self.participant, "Recording unavailable");
                    self.status = SessionStatus::Unavailable;
                }
                return Ok(LocalTick::default());
            }
        };

        let packets_sent = self.encode_and_send(transport, false)?;

        if let Some(monitor) = self.monitor.as_mut() {
            monitor.tick()?;
        }

        Ok(LocalTick { record, packets_sent })
    }

    fn encode_and_send(&mut self, transport: &mut dyn Transport, flush: bool) -> Result<usize> {
        let queue = self.recorder.samples_queue_mut()?;
        let Some(encoded) = self.encoder.try_get_encoded(queue, flush)? else {
            return Ok(0);
        };

        // A backlog can outgrow one datagram; each piece gets its own sequence number
        let budget = self
            .max_packet_size
            .saturating_sub(VoicePacket::header_size(self.participant)?);
        let payloads = match encoded.split_payload(budget) {
            Ok(payloads) => payloads,
            Err(e) => {
                warn!(frames = encoded.frame_count(), "Dropping encoded voice: {}", e);
                return Ok(0);
            }
        };

        let mut sent = 0;
        for payload in payloads {
            let packet = VoicePacket::new(self.participant, self.sequence, payload.to_vec());
            self.sequence = self.sequence.wrapping_add(1);

            if let Some(monitor) = self.monitor.as_mut() {
                monitor.receive(&packet)?;
            }

            match transport.send(&packet) {
                Ok(()) => sent += 1,
                Err(e) => warn!(sequence = packet.sequence, "Failed to send voice packet: {}", e),
            }
        }
        Ok(sent)
    }

    pub fn participant(&self) -> Uuid {
        self.participant
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn is_recording(&self) -> bool {
        self.recorder.is_recording()
    }

    pub fn driver_index(&self) -> usize {
        self.recording.driver_index
    }

    pub fn recorder(&self) -> &RecordReconciler<Box<dyn CaptureDevice>> {
        &self.recorder
    }

    pub fn encoder(&self) -> &FrameEncoder<OpusEncoder> {
        &self.encoder
    }

    pub fn monitor(&self) -> Option<&RemoteVoice> {
        self.monitor.as_ref()
    }
}

/// One participant's voice
pub enum VoiceSession {
    Local(LocalVoice),
    Remote(RemoteVoice),
}

impl VoiceSession {
    pub fn participant(&self) -> Uuid {
        match self {
            VoiceSession::Local(local) => local.participant(),
            VoiceSession::Remote(remote) => remote.participant(),
        }
    }

    pub fn status(&self) -> SessionStatus {
        match self {
            VoiceSession::Local(local) => local.status(),
            VoiceSession::Remote(remote) => remote.status(),
        }
    }
}

/// Every voice session of one client, keyed by participant
pub struct VoiceRoom<B: AudioBackend> {
    backend: B,
    config: AppConfig,
    local_id: Option<Uuid>,
    sessions: HashMap<Uuid, VoiceSession>,
    /// Participants whose playback could not be opened; their packets are dropped
    unavailable: HashSet<Uuid>,
}

impl<B: AudioBackend> VoiceRoom<B> {
    pub fn new(backend: B, config: AppConfig) -> Self {
        Self {
            backend,
            config,
            local_id: None,
            sessions: HashMap::new(),
            unavailable: HashSet::new(),
        }
    }

    /// Take ownership of the local microphone as `participant` and start recording
    pub fn start_local(&mut self, participant: Uuid) -> Result<()> {
        let mut local = LocalVoice::open(participant, &self.backend, &self.config)?;
        local.start_recording()?;
        if let Some(previous) = self.local_id.replace(participant) {
            self.sessions.remove(&previous);
        }
        self.sessions.insert(participant, VoiceSession::Local(local));
        Ok(())
    }

    /// Stop the local session, flushing its last partial frame
    pub fn stop_local(&mut self, transport: &mut dyn Transport) -> Result<()> {
        let Some(id) = self.local_id.take() else {
            return Ok(());
        };
        if let Some(VoiceSession::Local(mut local)) = self.sessions.remove(&id) {
            local.stop_recording(transport)?;
        }
        Ok(())
    }

    /// Create a remote session if `participant` is new
    pub fn join(&mut self, participant: Uuid) -> Result<&mut RemoteVoice> {
        if !self.sessions.contains_key(&participant) {
            let remote = RemoteVoice::open(participant, &self.backend, &self.config.playback, &self.config.session)?;
            info!(%participant, "Participant joined");
            self.sessions.insert(participant, VoiceSession::Remote(remote));
        }
        match self.sessions.get_mut(&participant) {
            Some(VoiceSession::Remote(remote)) => Ok(remote),
            _ => Err(Error::Config(format!("{} is the local participant", participant))),
        }
    }

    /// Tear down a participant's session
    pub fn leave(&mut self, participant: Uuid) -> bool {
        if self.local_id == Some(participant) {
            return false;
        }
        let removed = self.sessions.remove(&participant).is_some() | self.unavailable.remove(&participant);
        if removed {
            info!(%participant, "Participant left");
        }
        removed
    }

    pub fn set_volume(&mut self, participant: Uuid, volume: f32) -> Result<()> {
        match self.sessions.get_mut(&participant) {
            Some(VoiceSession::Remote(remote)) => remote.set_volume(volume),
            _ => Ok(()),
        }
    }

    pub fn set_record_driver(&mut self, driver_index: usize) -> Result<()> {
        let Some(id) = self.local_id else {
            return Ok(());
        };
        if let Some(VoiceSession::Local(local)) = self.sessions.get_mut(&id) {
            local.set_record_driver(&self.backend, driver_index)?;
        }
        self.config.recording.driver_index = driver_index;
        Ok(())
    }

    /// Deliver everything waiting on `transport`, then tick every session
    pub fn tick(&mut self, transport: &mut dyn Transport) -> Result<()> {
        loop {
            let packet = match transport.try_recv() {
                Ok(Some(packet)) => packet,
                Ok(None) => break,
                Err(e) => {
                    warn!("Receive failed: {}", e);
                    break;
                }
            };
            if Some(packet.participant) == self.local_id || self.unavailable.contains(&packet.participant) {
                continue;
            }
            match self.join(packet.participant) {
                Ok(remote) => {
                    remote.receive(&packet)?;
                }
                Err(e) if is_fatal(&e) => return Err(e),
                Err(e) => {
                    error!(participant = %packet.participant, "Playback unavailable: {}", e);
                    self.unavailable.insert(packet.participant);
                }
            }
        }

        for session in self.sessions.values_mut() {
            match session {
                VoiceSession::Local(local) => {
                    local.tick(transport)?;
                }
                VoiceSession::Remote(remote) => {
                    remote.tick()?;
                }
            }
        }
        Ok(())
    }

    pub fn session(&self, participant: Uuid) -> Option<&VoiceSession> {
        self.sessions.get(&participant)
    }

    pub fn participants(&self) -> impl Iterator<Item = Uuid> + '_ {
        self.sessions.keys().copied()
    }

    /// Whether `participant` was heard but its playback could not be opened
    pub fn is_unavailable(&self, participant: Uuid) -> bool {
        self.unavailable.contains(&participant)
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::buffer::RingBuffer;
    use crate::audio::virtual_device::{VirtualBackend, VirtualPlayback};
    use crate::network::ChannelHub;

    fn sine(len: usize) -> Vec<i16> {
        (0..len)
            .map(|i| {
                let t = i as f32 / OPUS_SAMPLE_RATE as f32;
                ((t * 330.0 * 2.0 * std::f32::consts::PI).sin() * 6000.0) as i16
            })
            .collect()
    }

    fn voice_packet(participant: Uuid, sequence: u32, samples: &[i16]) -> VoicePacket {
        let mut encoder = FrameEncoder::new(OpusEncoder::voice().unwrap());
        let mut queue = RingBuffer::new(samples.len());
        queue.enqueue(samples);
        let encoded = encoder.try_get_encoded(&mut queue, true).unwrap().unwrap();
        VoicePacket::from_encoded(participant, sequence, encoded)
    }

    fn remote(backend: &VirtualBackend, max_backend_failures: u32) -> RemoteVoice {
        let session = SessionConfig {
            max_backend_failures,
            ..Default::default()
        };
        RemoteVoice::open(Uuid::new_v4(), backend, &PlaybackConfig::default(), &session).unwrap()
    }

    #[test]
    fn test_remote_voice_plays_packet() {
        let backend = VirtualBackend::new(OPUS_SAMPLE_RATE);
        let mut voice = remote(&backend, 3);
        let clock = backend.last_clock().unwrap();

        let packet = voice_packet(voice.participant(), 0, &sine(960));
        assert_eq!(voice.receive(&packet).unwrap(), ReceiveOutcome::Decoded(960));

        assert_eq!(voice.tick().unwrap(), SessionStatus::Running);
        assert_eq!(voice.playback().available_playback_byte_count(), 960 * SAMPLE_SIZE);
        assert!(!clock.is_paused());

        let rendered = clock.advance(960 * SAMPLE_SIZE);
        assert!(rendered.iter().any(|&b| b != 0));
    }

    #[test]
    fn test_duplicate_packets_dropped() {
        let backend = VirtualBackend::new(OPUS_SAMPLE_RATE);
        let mut voice = remote(&backend, 3);
        let id = voice.participant();

        voice.receive(&voice_packet(id, 5, &sine(480))).unwrap();
        assert_eq!(voice.receive(&voice_packet(id, 5, &sine(480))).unwrap(), ReceiveOutcome::Duplicate);
        assert_eq!(voice.receive(&voice_packet(id, 4, &sine(480))).unwrap(), ReceiveOutcome::Duplicate);
        assert_eq!(voice.receive(&voice_packet(id, 6, &sine(480))).unwrap(), ReceiveOutcome::Decoded(480));
        assert_eq!(voice.stats().packets_duplicate, 2);
    }

    #[test]
    fn test_malformed_packet_dropped_not_fatal() {
        let backend = VirtualBackend::new(OPUS_SAMPLE_RATE);
        let mut voice = remote(&backend, 3);

        let packet = VoicePacket::new(voice.participant(), 0, vec![200, 0, 1]);
        assert_eq!(voice.receive(&packet).unwrap(), ReceiveOutcome::Dropped);
        assert_eq!(voice.stats().packets_dropped, 1);
        assert_eq!(voice.tick().unwrap(), SessionStatus::Running);
    }

    #[test]
    fn test_awaiting_backend_ready() {
        let (device, clock) = VirtualPlayback::pending(playback_buffer_len(0.1));
        let playback = PlaybackConfig {
            volume: 0.25,
            ..Default::default()
        };
        let mut voice =
            RemoteVoice::with_device(Uuid::new_v4(), Box::new(device), &playback, &SessionConfig::default())
                .unwrap();

        assert_eq!(voice.status(), SessionStatus::AwaitingBackendReady);
        assert_eq!(voice.tick().unwrap(), SessionStatus::AwaitingBackendReady);
        assert_eq!(voice.playback().stats().ticks, 0);

        clock.set_ready(true);
        assert_eq!(voice.tick().unwrap(), SessionStatus::Running);
        assert_eq!(voice.playback().stats().ticks, 1);
        assert_eq!(clock.volume(), 0.25);
    }

    #[test]
    fn test_sustained_failure_is_unavailable() {
        let backend = VirtualBackend::new(OPUS_SAMPLE_RATE);
        let mut voice = remote(&backend, 3);
        let clock = backend.last_clock().unwrap();

        assert_eq!(voice.tick().unwrap(), SessionStatus::Running);
        clock.set_ready(false);
        assert_eq!(voice.tick().unwrap(), SessionStatus::Running);
        assert_eq!(voice.tick().unwrap(), SessionStatus::Running);
        assert_eq!(voice.tick().unwrap(), SessionStatus::Unavailable);

        clock.set_ready(true);
        assert_eq!(voice.tick().unwrap(), SessionStatus::Unavailable);
    }

    #[test]
    fn test_failures_reset_after_success() {
        let backend = VirtualBackend::new(OPUS_SAMPLE_RATE);
        let mut voice = remote(&backend, 2);
        let clock = backend.last_clock().unwrap();

        clock.set_ready(false);
        voice.tick().unwrap();
        clock.set_ready(true);
        voice.tick().unwrap();
        clock.set_ready(false);
        assert_eq!(voice.tick().unwrap(), SessionStatus::Running);
    }

    #[test]
    fn test_local_voice_sends_and_flushes() {
        let backend = VirtualBackend::new(OPUS_SAMPLE_RATE);
        let hub = ChannelHub::new();
        let id = Uuid::new_v4();
        let mut local_end = hub.join(id);
        let mut remote_end = hub.join(Uuid::new_v4());

        let mut local = LocalVoice::open(id, &backend, &AppConfig::default()).unwrap();
        local.start_recording().unwrap();
        let (_, mic) = backend.last_microphone().unwrap();
        mic.speak(&sine(960 + 480 + 50));

        let tick = local.tick(&mut local_end).unwrap();
        assert_eq!(tick.record.recorded, 1490);
        assert_eq!(tick.packets_sent, 1);

        let packet = remote_end.try_recv().unwrap().unwrap();
        assert_eq!(packet.participant, id);
        assert_eq!(packet.sequence, 0);
        assert_eq!(crate::codec::packet::frames(&packet.payload).count(), 2);

        assert_eq!(local.stop_recording(&mut local_end).unwrap(), 1);
        assert!(!local.is_recording());
        let flushed = remote_end.try_recv().unwrap().unwrap();
        assert_eq!(flushed.sequence, 1);
        assert_eq!(local.encoder().stats().silence_samples_padded, 70);
    }

    fn noise(len: usize) -> Vec<i16> {
        let mut state = 0x2545_f491u32;
        (0..len)
            .map(|_| {
                state = state.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
                (state >> 16) as i16 / 2
            })
            .collect()
    }

    #[test]
    fn test_backlog_split_across_packets() {
        let backend = VirtualBackend::new(OPUS_SAMPLE_RATE);
        let hub = ChannelHub::new();
        let id = Uuid::new_v4();
        let mut local_end = hub.join(id);
        let mut remote_end = hub.join(Uuid::new_v4());

        let mut config = AppConfig::default();
        config.codec.vbr = false;
        let mut local = LocalVoice::open(id, &backend, &config).unwrap();
        local.start_recording().unwrap();
        let (_, mic) = backend.last_microphone().unwrap();
        mic.speak(&noise(24000));

        let tick = local.tick(&mut local_end).unwrap();
        assert_eq!(local.encoder().stats().frames_encoded, 9);
        assert!(tick.packets_sent >= 2);

        let mut frames = 0;
        let mut sequences = Vec::new();
        while let Some(packet) = remote_end.try_recv().unwrap() {
            assert!(packet.to_bytes(config.network.max_packet_size).is_ok());
            frames += crate::codec::packet::frames(&packet.payload).count();
            sequences.push(packet.sequence);
        }
        assert_eq!(frames, 9);
        assert_eq!(sequences, (0..tick.packets_sent as u32).collect::<Vec<_>>());
    }

    #[test]
    fn test_local_voice_requires_samples() {
        let backend = VirtualBackend::new(OPUS_SAMPLE_RATE);
        let mut config = AppConfig::default();
        config.recording.output_format = VoiceFormat::Pcm16Bytes;

        let result = LocalVoice::open(Uuid::new_v4(), &backend, &config);
        assert!(matches!(result, Err(Error::Audio(AudioError::FormatMismatch { .. }))));
    }

    #[test]
    fn test_set_record_driver_keeps_recording() {
        let backend = VirtualBackend::new(OPUS_SAMPLE_RATE);
        let hub = ChannelHub::new();
        let id = Uuid::new_v4();
        let mut local_end = hub.join(id);

        let mut local = LocalVoice::open(id, &backend, &AppConfig::default()).unwrap();
        local.start_recording().unwrap();
        local.set_record_driver(&backend, 2).unwrap();

        let (driver_index, mic) = backend.last_microphone().unwrap();
        assert_eq!(driver_index, 2);
        assert!(mic.is_recording());
        assert_eq!(local.driver_index(), 2);

        mic.speak(&sine(240));
        assert_eq!(local.tick(&mut local_end).unwrap().record.recorded, 240);
    }

    #[test]
    fn test_monitor_hears_own_voice() {
        let backend = VirtualBackend::new(OPUS_SAMPLE_RATE);
        let hub = ChannelHub::new();
        let id = Uuid::new_v4();
        let mut local_end = hub.join(id);

        let mut config = AppConfig::default();
        config.session.monitor_own_voice = true;
        let mut local = LocalVoice::open(id, &backend, &config).unwrap();
        local.start_recording().unwrap();

        let (_, mic) = backend.last_microphone().unwrap();
        mic.speak(&sine(960));
        local.tick(&mut local_end).unwrap();

        let monitor = local.monitor().unwrap();
        assert_eq!(monitor.decoder().stats().frames_decoded, 1);
        assert_eq!(monitor.playback().stats().bytes_written, 960 * SAMPLE_SIZE as u64);
    }

    #[test]
    fn test_room_creates_session_per_speaker() {
        let hub = ChannelHub::new();
        let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());
        let mut alice_end = hub.join(alice);
        let mut bob_end = hub.join(bob);

        let mut alice_room = VoiceRoom::new(VirtualBackend::new(OPUS_SAMPLE_RATE), AppConfig::default());
        let mut bob_room = VoiceRoom::new(VirtualBackend::new(OPUS_SAMPLE_RATE), AppConfig::default());
        alice_room.start_local(alice).unwrap();

        let (_, mic) = alice_room.backend().last_microphone().unwrap();
        mic.speak(&sine(1920));
        alice_room.tick(&mut alice_end).unwrap();
        bob_room.tick(&mut bob_end).unwrap();

        assert_eq!(bob_room.participants().collect::<Vec<_>>(), vec![alice]);
        assert_eq!(bob_room.session(alice).map(VoiceSession::status), Some(SessionStatus::Running));
        let clock = bob_room.backend().last_clock().unwrap();
        assert!(!clock.is_paused());

        assert!(bob_room.leave(alice));
        assert!(bob_room.session(alice).is_none());
    }

    /// Capture works, playback never opens
    struct NoSpeakers {
        inner: VirtualBackend,
        playback_attempts: std::sync::atomic::AtomicUsize,
    }

    impl AudioBackend for NoSpeakers {
        fn open_playback(
            &self,
            _buffer_len: usize,
            _sample_rate: u32,
        ) -> std::result::Result<Box<dyn PlaybackDevice>, AudioError> {
            self.playback_attempts.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Err(AudioError::DeviceNotFound("No default output device".into()))
        }

        fn open_capture(
            &self,
            driver_index: usize,
            buffer_seconds: f32,
        ) -> std::result::Result<Box<dyn CaptureDevice>, AudioError> {
            self.inner.open_capture(driver_index, buffer_seconds)
        }
    }

    #[test]
    fn test_room_survives_playback_open_failure() {
        let hub = ChannelHub::new();
        let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());
        let mut alice_end = hub.join(alice);
        let mut bob_end = hub.join(bob);

        let backend = NoSpeakers {
            inner: VirtualBackend::new(OPUS_SAMPLE_RATE),
            playback_attempts: Default::default(),
        };
        let mut bob_room = VoiceRoom::new(backend, AppConfig::default());
        bob_room.start_local(bob).unwrap();

        alice_end.send(&voice_packet(alice, 0, &sine(960))).unwrap();
        let (_, mic) = bob_room.backend().inner.last_microphone().unwrap();
        mic.speak(&sine(960));
        bob_room.tick(&mut bob_end).unwrap();

        assert!(bob_room.is_unavailable(alice));
        assert!(bob_room.session(alice).is_none());
        let heard = alice_end.try_recv().unwrap().unwrap();
        assert_eq!(heard.participant, bob);

        alice_end.send(&voice_packet(alice, 1, &sine(960))).unwrap();
        bob_room.tick(&mut bob_end).unwrap();
        let attempts = bob_room.backend().playback_attempts.load(std::sync::atomic::Ordering::SeqCst);
        assert_eq!(attempts, 1);

        assert!(bob_room.leave(alice));
        assert!(!bob_room.is_unavailable(alice));
    }
}
