//! # Datagram Transports
//!
//! The protocol core only needs a best-effort `send_to`. Inbound datagrams
//! are pushed into [`crate::endpoint::Endpoint::handle_datagram`] by whoever
//! owns the receive side.
//!
//! - [`udp::UdpTransport`]: a bound `std::net::UdpSocket` with a receive thread
//! - [`sim::SimNetwork`]: in-memory network with seeded loss and reordering

pub mod sim;
pub mod udp;

use std::net::SocketAddr;

use bytes::Bytes;

/// Best-effort datagram delivery. Failures are logged by the implementation,
/// never reported to the protocol.
pub trait DatagramTransport: Send + Sync {
    fn send_to(&self, remote: SocketAddr, datagram: Bytes);

    /// Address datagrams from this transport appear to come from.
    fn local_addr(&self) -> Option<SocketAddr> {
        None
    }
}
