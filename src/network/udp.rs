//! Non-blocking UDP transport
//!
//! A single socket both sends to the configured peer and receives from
//! anyone. Without a configured peer, the first sender heard from becomes
//! the peer.

use socket2::{Domain, Protocol, Socket, Type};
use std::io::ErrorKind;
use std::net::{SocketAddr, UdpSocket};
use tracing::{debug, info, warn};

use crate::config::NetworkConfig;
use crate::error::NetworkError;
use crate::network::{Transport, VoicePacket};

pub struct UdpTransport {
    socket: UdpSocket,
    peer: Option<SocketAddr>,
    max_packet_size: usize,
    recv_buffer: Vec<u8>,
}

impl UdpTransport {
    pub fn bind(config: &NetworkConfig) -> Result<Self, NetworkError> {
        let socket = create_socket(config.bind_address)?;
        info!(
            "UDP transport bound to {}, peer {:?}",
            config.bind_address, config.peer_address
        );
        Ok(Self {
            socket,
            peer: config.peer_address,
            max_packet_size: config.max_packet_size,
            recv_buffer: vec![0u8; config.max_packet_size],
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, NetworkError> {
        self.socket
            .local_addr()
            .map_err(|e| NetworkError::BindFailed(e.to_string()))
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn set_peer(&mut self, peer: SocketAddr) {
        self.peer = Some(peer);
    }
}

/// Non-blocking, address-reusing UDP socket
fn create_socket(addr: SocketAddr) -> Result<UdpSocket, NetworkError> {
    let bind_err = |e: std::io::Error| NetworkError::BindFailed(format!("{}: {}", addr, e));

    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP)).map_err(bind_err)?;
    socket.set_reuse_address(true).map_err(bind_err)?;
    socket.set_nonblocking(true).map_err(bind_err)?;
    socket.bind(&addr.into()).map_err(bind_err)?;
    Ok(socket.into())
}

impl Transport for UdpTransport {
    fn send(&mut self, packet: &VoicePacket) -> Result<(), NetworkError> {
        let peer = self
            .peer
            .ok_or_else(|| NetworkError::SendFailed("No peer address".into()))?;
        let bytes = packet.to_bytes(self.max_packet_size)?;

        match self.socket.send_to(&bytes, peer) {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                warn!("UDP send buffer full, dropping packet {}", packet.sequence);
                Ok(())
            }
            Err(e) => Err(NetworkError::SendFailed(e.to_string())),
        }
    }

    fn try_recv(&mut self) -> Result<Option<VoicePacket>, NetworkError> {
        loop {
            let (len, from) = match self.socket.recv_from(&mut self.recv_buffer) {
                Ok(received) => received,
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(None),
                Err(e) => return Err(NetworkError::ReceiveFailed(e.to_string())),
            };

            if self.peer.is_none() {
                info!("Learned peer address {}", from);
                self.peer = Some(from);
            }

            match VoicePacket::from_bytes(&self.recv_buffer[..len]) {
                Ok(packet) => return Ok(Some(packet)),
                Err(e) => debug!("Ignoring datagram from {}: {}", from, e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};
    use uuid::Uuid;

    fn loopback_config(peer: Option<SocketAddr>) -> NetworkConfig {
        NetworkConfig {
            bind_address: "127.0.0.1:0".parse().unwrap(),
            peer_address: peer,
            ..Default::default()
        }
    }

    fn recv_within(transport: &mut UdpTransport, timeout: Duration) -> Option<VoicePacket> {
        let start = Instant::now();
        while start.elapsed() < timeout {
            if let Some(packet) = transport.try_recv().unwrap() {
                return Some(packet);
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        None
    }

    #[test]
    fn test_empty_receive_does_not_block() {
        let mut transport = UdpTransport::bind(&loopback_config(None)).unwrap();
        assert!(transport.try_recv().unwrap().is_none());
    }

    #[test]
    fn test_send_without_peer_fails() {
        let mut transport = UdpTransport::bind(&loopback_config(None)).unwrap();
        let packet = VoicePacket::new(Uuid::new_v4(), 0, vec![1, 0, 9]);
        assert!(matches!(transport.send(&packet), Err(NetworkError::SendFailed(_))));
    }

    #[test]
    fn test_loopback_and_peer_learning() {
        let mut receiver = UdpTransport::bind(&loopback_config(None)).unwrap();
        let receiver_addr = receiver.local_addr().unwrap();
        let mut sender = UdpTransport::bind(&loopback_config(Some(receiver_addr))).unwrap();

        let packet = VoicePacket::new(Uuid::new_v4(), 3, vec![2, 0, 7, 8]);
        sender.send(&packet).unwrap();

        let received = recv_within(&mut receiver, Duration::from_secs(2));
        assert_eq!(received, Some(packet));
        assert_eq!(receiver.peer(), Some(sender.local_addr().unwrap()));
    }
}
