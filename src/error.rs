//! Error types for the voice pipeline

use thiserror::Error;

use crate::audio::backend::VoiceFormat;

/// Top-level error for every voice pipeline operation
#[derive(Error, Debug)]
pub enum Error {
    #[error("Audio error: {0}")]
    Audio(#[from] AudioError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Sample queue errors.
///
/// These indicate broken tick sequencing and are never recovered from.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    #[error("Attempted to dequeue {requested} elements but only {available} are queued")]
    OutOfRange { requested: usize, available: usize },

    #[error("Write position {position} is outside of the queue (capacity {capacity})")]
    WritePositionOutOfRange { position: isize, capacity: usize },
}

/// Audio subsystem errors
#[derive(Error, Debug)]
pub enum AudioError {
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Audio stream failed: {0}")]
    StreamError(String),

    #[error("Device format not supported: {0}")]
    UnsupportedFormat(String),

    #[error("Incorrect voice format: configured for {expected:?}, called with {actual:?}")]
    FormatMismatch { expected: VoiceFormat, actual: VoiceFormat },

    #[error("Region at offset {offset} with length {len} does not fit a {buffer_len} byte buffer")]
    RegionOutOfBounds { offset: usize, len: usize, buffer_len: usize },

    #[error("Audio backend is not ready")]
    BackendNotReady,

    #[error("Resampling failed: {0}")]
    Resample(String),

    #[error("cpal error: {0}")]
    CpalError(String),
}

/// Codec errors
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Could not create Opus encoder: {0}")]
    EncoderInit(String),

    #[error("Could not create Opus decoder: {0}")]
    DecoderInit(String),

    #[error("Opus encode failed: {0}")]
    EncodingFailed(String),

    #[error("Opus decode failed: {0}")]
    DecodingFailed(String),

    #[error("{0} samples is not an Opus frame size")]
    InvalidFrameSize(usize),

    #[error("Malformed packet: {0}")]
    MalformedPacket(String),
}

/// Network errors
#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("Could not bind voice socket: {0}")]
    BindFailed(String),

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    #[error("Voice packet of {0} bytes exceeds the datagram limit")]
    PacketTooLarge(usize),

    #[error("Could not parse voice packet: {0}")]
    InvalidPacket(String),

    #[error("Participant disconnected")]
    Disconnected,
}

impl From<cpal::BuildStreamError> for AudioError {
    fn from(e: cpal::BuildStreamError) -> Self {
        AudioError::StreamError(e.to_string())
    }
}

impl From<cpal::PlayStreamError> for AudioError {
    fn from(e: cpal::PlayStreamError) -> Self {
        AudioError::StreamError(e.to_string())
    }
}

impl From<cpal::DefaultStreamConfigError> for AudioError {
    fn from(e: cpal::DefaultStreamConfigError) -> Self {
        AudioError::CpalError(e.to_string())
    }
}

impl From<bincode::Error> for NetworkError {
    fn from(e: bincode::Error) -> Self {
        NetworkError::InvalidPacket(e.to_string())
    }
}

/// Result alias over [`Error`]
pub type Result<T> = std::result::Result<T, Error>;
