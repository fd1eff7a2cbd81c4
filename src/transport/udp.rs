use std::{
    io,
    net::{Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket},
};

use tracing::debug;

use super::{Transport, TransportKind};

/// Connectionless datagram sender: one frame, one `sendto`.
pub(crate) struct UdpSender {
    socket: UdpSocket,
}

impl UdpSender {
    /// Binds an ephemeral local socket and connects it to the agent address.
    ///
    /// Resolution and address-family problems surface here, at construction, not at first send.
    pub fn connect(addrs: &[SocketAddr]) -> io::Result<Self> {
        let bind_addr: SocketAddr = match addrs.first() {
            Some(SocketAddr::V6(_)) => (Ipv6Addr::UNSPECIFIED, 0).into(),
            _ => (Ipv4Addr::UNSPECIFIED, 0).into(),
        };

        let socket = UdpSocket::bind(bind_addr)?;
        socket.connect(addrs)?;

        Ok(Self { socket })
    }
}

impl Transport for UdpSender {
    fn kind(&self) -> TransportKind {
        TransportKind::Udp
    }

    fn send(&mut self, frame: &[u8]) -> bool {
        match self.socket.send(frame) {
            Ok(_) => true,
            Err(e) => {
                debug!(error = %e, "Failed to send UDP datagram.");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::UdpSocket;

    use super::UdpSender;
    use crate::transport::Transport;

    #[test]
    fn sends_one_datagram_per_frame() {
        let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
        let addr = receiver.local_addr().unwrap();

        let mut sender = UdpSender::connect(&[addr]).unwrap();
        assert!(sender.send(b"a:1|c\nb:2|g"));

        let mut buf = [0u8; 64];
        let (len, _) = receiver.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..len], b"a:1|c\nb:2|g");
    }
}
