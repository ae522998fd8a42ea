//! # Proximity Voice
//!
//! Real-time voice between participants with tick-driven buffer reconciliation.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────── LOCAL PARTICIPANT ─────────────────────────────┐
//! │  ┌────────────┐  record   ┌──────────────────┐         ┌──────────────────┐   │
//! │  │ Microphone │─ cursor ─▶│ RecordReconciler │────────▶│ RingBuffer<i16>  │   │
//! │  │ (circular) │           │  (+ Resampler)   │         └────────┬─────────┘   │
//! │  └────────────┘           └──────────────────┘                  │             │
//! │                                                                 ▼             │
//! │                                                       ┌──────────────────┐    │
//! │                                                       │   FrameEncoder   │    │
//! │                                                       │ greedy 2880..120 │    │
//! │                                                       └────────┬─────────┘    │
//! └────────────────────────────────────────────────────────────────┼──────────────┘
//!                                                                  │ VoicePacket
//!                                              Transport (hub / UDP)
//!                                                                  │
//! ┌──────────────────────────────── REMOTE PARTICIPANT ────────────┼──────────────┐
//! │                                                                ▼              │
//! │  ┌────────────┐   play    ┌────────────────────┐     ┌──────────────────┐     │
//! │  │  Speakers  │◀─ cursor ─│ PlaybackReconciler │◀────│   FrameDecoder   │     │
//! │  │ (circular) │           │ silence / underrun │     └──────────────────┘     │
//! │  └────────────┘           └────────────────────┘                              │
//! └───────────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every reconciler runs on a single tick thread. The only concurrency is the
//! audio backend advancing its cursors on its own thread.

pub mod audio;
pub mod codec;
pub mod config;
pub mod error;
pub mod network;
pub mod resample;
pub mod session;

pub use error::{Error, Result};

/// Application-wide constants
pub mod constants {
    /// Opus mandated sample rate for voice
    pub const OPUS_SAMPLE_RATE: u32 = 48000;

    /// Bytes per 16-bit PCM sample
    pub const SAMPLE_SIZE: usize = 2;

    /// Voice is mono
    pub const VOICE_CHANNELS: u16 = 1;

    /// Default Opus bitrate in bits per second
    pub const DEFAULT_BITRATE: u32 = 32_000;

    /// Default UDP port for voice
    pub const DEFAULT_UDP_PORT: u16 = 5000;

    /// Maximum packet size for UDP
    pub const MAX_PACKET_SIZE: usize = 1472; // MTU - IP/UDP headers
}
