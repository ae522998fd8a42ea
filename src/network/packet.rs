//! Voice packet wire format
//!
//! ```text
//! ┌──────────────────┬──────────┬──────────────────────────────┐
//! │ participant (16) │ seq (4)  │ payload (len-prefixed frames)│
//! └──────────────────┴──────────┴──────────────────────────────┘
//! ```
//!
//! Serialized with bincode; the payload is an [`EncodedVoice`] batch.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::codec::EncodedVoice;
use crate::error::NetworkError;

/// Consecutive encoded frames from one participant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoicePacket {
    pub participant: Uuid,
    /// Increments by one per packet, wrapping
    pub sequence: u32,
    pub payload: Vec<u8>,
}

impl VoicePacket {
    pub fn new(participant: Uuid, sequence: u32, payload: Vec<u8>) -> Self {
        Self {
            participant,
            sequence,
            payload,
        }
    }

    pub fn from_encoded(participant: Uuid, sequence: u32, encoded: EncodedVoice) -> Self {
        Self::new(participant, sequence, encoded.into_payload().to_vec())
    }

    /// Serialize, refusing anything larger than `max_size` bytes
    pub fn to_bytes(&self, max_size: usize) -> Result<Vec<u8>, NetworkError> {
        let bytes = bincode::serialize(self)?;
        if bytes.len() > max_size {
            return Err(NetworkError::PacketTooLarge(bytes.len()));
        }
        Ok(bytes)
    }

    /// Serialized size of a packet from `participant` with an empty payload
    pub fn header_size(participant: Uuid) -> Result<usize, NetworkError> {
        Ok(bincode::serialized_size(&Self::new(participant, 0, Vec::new()))? as usize)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, NetworkError> {
        Ok(bincode::deserialize(data)?)
    }
}

/// Whether `sequence` is newer than `last`, allowing for wraparound
pub fn is_newer(sequence: u32, last: u32) -> bool {
    (sequence.wrapping_sub(last) as i32) > 0
}
