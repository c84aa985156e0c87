//! Network transports for KNXnet/IP communication.
//!
//! The engine speaks through [`transport::LinkTransport`]: an owned UDP
//! socket, a shared TCP stream ([`tcp::TcpConnection`]), or a recording mock
//! for tests.

pub mod mock;
pub mod tcp;
pub mod transport;

pub use tcp::TcpConnection;
pub use transport::{FrameEvent, LinkTransport};
