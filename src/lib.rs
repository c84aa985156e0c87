//! # knx-link
//!
//! Client-side KNXnet/IP connection engine.
//!
//! This crate establishes, maintains, and tears down a logical communication
//! channel to a KNX IP server over UDP or TCP, and reliably exchanges KNX
//! service frames over that channel. It covers the wire-level framing of
//! KNXnet/IP headers and service types, the connection state machine with its
//! acknowledgment-and-confirmation discipline, a heartbeat monitor, and
//! retransmission.
//!
//! ## Features
//!
//! - KNXnet/IP tunneling and device-management connections
//! - UDP (owned socket) and TCP (shared stream) transports
//! - Heartbeat / keep-alive with automatic close on persistent failure
//! - Reliable delivery with service acknowledgments and cEMI confirmations
//! - Zero-copy frame parsing
//!
//! ## Example
//!
//! ```rust,no_run
//! use knx_link::{ConnectOptions, Connection};
//!
//! # async fn run() -> knx_link::Result<()> {
//! let options = ConnectOptions::tunneling(
//!     "0.0.0.0:0".parse().unwrap(),
//!     "192.168.1.10:3671".parse().unwrap(),
//! );
//! let (connection, _events) = Connection::open(options).await?;
//!
//! // Send a cEMI frame through the tunnel
//! connection.send(&[0x11, 0x00, 0xBC, 0xE0]).await?;
//!
//! connection.close().await?;
//! # Ok(())
//! # }
//! ```

pub mod addressing;
pub mod connection;
pub mod error;
pub mod net;
pub mod protocol;

// Re-export commonly used types
#[doc(inline)]
pub use addressing::IndividualAddress;
#[doc(inline)]
pub use connection::{
    CloseInitiator, ConnState, ConnectOptions, Connection, ConnectionEvent, ConnectionProfile,
};
#[doc(inline)]
pub use error::{KnxError, Result};
#[doc(inline)]
pub use net::TcpConnection;
