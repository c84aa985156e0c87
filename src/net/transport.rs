//! Transport abstraction for KNXnet/IP communication.
//!
//! Presents a uniform `send(packet, optional destination)` over the two wire
//! transports the protocol defines, plus a recording mock for tests:
//!
//! - **UDP**: the connection owns a datagram socket bound to a caller-chosen
//!   local endpoint; every send names an explicit destination.
//! - **TCP**: the connection delegates to a shared stream
//!   ([`TcpConnection`]); frames are pre-framed bytes written to the stream,
//!   and the destination argument is ignored.
//!
//! Inbound traffic reaches the engine as [`FrameEvent`]s: the UDP receiver
//! task produces them from datagrams, the shared TCP reader routes them by
//! channel ID.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::UdpSocket;

use crate::net::mock::MockTransport;
use crate::net::tcp::TcpConnection;
use crate::protocol::frame::KnxnetIpHeader;

/// An inbound event delivered to a connection.
#[derive(Debug, Clone)]
pub enum FrameEvent {
    /// A complete KNXnet/IP frame.
    Frame {
        /// Parsed common header
        header: KnxnetIpHeader,
        /// Frame body (after the 6-octet header)
        body: Vec<u8>,
        /// Source address of the datagram, or the stream peer
        source: SocketAddr,
    },
    /// The underlying transport is gone (stream closed or reader failed).
    Closed,
}

/// The transport variant a connection sends through.
#[derive(Debug, Clone)]
pub enum LinkTransport {
    /// Owned datagram socket; receiver task reads one frame per datagram.
    Udp(Arc<UdpSocket>),
    /// Shared stream connection; frames are demultiplexed by channel ID.
    Tcp(Arc<TcpConnection>),
    /// Recording transport for tests.
    Mock(MockTransport),
}

impl LinkTransport {
    /// Whether this transport has stream semantics (no service acks on the
    /// wire, route-back HPAIs).
    pub fn is_stream(&self) -> bool {
        matches!(self, Self::Tcp(_))
    }

    /// Send a pre-framed packet.
    ///
    /// UDP requires an explicit destination; the stream transport ignores it.
    pub async fn send(&self, packet: &[u8], destination: Option<SocketAddr>) -> io::Result<()> {
        match self {
            Self::Udp(socket) => {
                let dst = destination.ok_or_else(|| {
                    io::Error::new(io::ErrorKind::InvalidInput, "datagram send needs a destination")
                })?;
                socket.send_to(packet, dst).await?;
                Ok(())
            }
            Self::Tcp(conn) => conn.send(packet).await,
            Self::Mock(mock) => {
                mock.record(packet, destination);
                Ok(())
            }
        }
    }

    /// Local endpoint of the transport.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        match self {
            Self::Udp(socket) => socket.local_addr(),
            Self::Tcp(conn) => Ok(conn.local_endpoint()),
            Self::Mock(mock) => Ok(mock.local_addr()),
        }
    }
}
