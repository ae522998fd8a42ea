//! Network subsystem for voice transport
//!
//! Packets go from one participant to every other participant. Delivery is
//! in order and at least once; nothing here retransmits or reorders.

pub mod hub;
pub mod packet;
pub mod udp;

pub use hub::{ChannelHub, HubEndpoint};
pub use packet::VoicePacket;
pub use udp::UdpTransport;

use crate::error::NetworkError;

/// Moves voice packets between participants
pub trait Transport {
    fn send(&mut self, packet: &VoicePacket) -> Result<(), NetworkError>;

    /// Next received packet, if one is waiting. Never blocks.
    fn try_recv(&mut self) -> Result<Option<VoicePacket>, NetworkError>;
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn send(&mut self, packet: &VoicePacket) -> Result<(), NetworkError> {
        (**self).send(packet)
    }

    fn try_recv(&mut self) -> Result<Option<VoicePacket>, NetworkError> {
        (**self).try_recv()
    }
}
