//! KNXnet/IP frame parsing and encoding.
//!
//! This module provides zero-copy parsing and building of KNXnet/IP frames:
//! the common header, the frame view over a received buffer, and the HPAI
//! (host protocol address information) structure exchanged in the handshake.
//!
//! ## Frame Structure
//!
//! All KNXnet/IP frames follow this structure:
//!
//! ```text
//! ┌─────────────────────────────┐
//! │  Header (6 bytes)           │
//! │  - Header Length: 0x06      │
//! │  - Protocol Version: 0x10   │
//! │  - Service Type: 2 bytes    │
//! │  - Total Length: 2 bytes    │
//! ├─────────────────────────────┤
//! │  Body (variable)            │
//! │  - Service-specific data    │
//! └─────────────────────────────┘
//! ```
//!
//! All multi-byte fields are big-endian. Header parsing accepts any protocol
//! version byte; the connection engine enforces the negotiated version and
//! closes the channel on a change.

use std::net::{SocketAddr, SocketAddrV4};

use crate::error::{FormatError, KnxError, Result};
use crate::protocol::constants::{HEADER_SIZE_10, IPV4_TCP, IPV4_UDP};

/// KNXnet/IP frame header (6 bytes)
///
/// ```text
/// ┌──────────────┬──────────────┬─────────────────────┐
/// │ Header Len   │ Protocol Ver │  Service Type ID    │
/// │   (1 byte)   │   (1 byte)   │     (2 bytes)       │
/// ├──────────────┴──────────────┴─────────────────────┤
/// │           Total Length (2 bytes)                   │
/// └────────────────────────────────────────────────────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KnxnetIpHeader {
    /// Header length (0x06)
    pub header_length: u8,
    /// Protocol version (0x10 for v1.0)
    pub protocol_version: u8,
    /// Service type identifier, kept raw so unknown services stay decodable
    pub service_type: u16,
    /// Total length of frame (header + body)
    pub total_length: u16,
}

impl KnxnetIpHeader {
    /// Size of the header in bytes
    pub const SIZE: usize = 6;

    /// Create a new header for the given service and body length.
    pub const fn new(service_type: u16, protocol_version: u8, body_length: u16) -> Self {
        Self {
            header_length: HEADER_SIZE_10,
            protocol_version,
            service_type,
            total_length: Self::SIZE as u16 + body_length,
        }
    }

    /// Parse a header from a byte slice.
    ///
    /// # Errors
    ///
    /// Returns a [`FormatError`] if the buffer is too small or the structure
    /// length octet is invalid. The version byte is carried through for the
    /// connection-level version check.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < Self::SIZE {
            return Err(FormatError::TooShort { expected: Self::SIZE, actual: data.len() }.into());
        }

        let header_length = data[0];
        if header_length != HEADER_SIZE_10 {
            return Err(FormatError::InvalidHeaderLength(header_length).into());
        }

        Ok(Self {
            header_length,
            protocol_version: data[1],
            service_type: u16::from_be_bytes([data[2], data[3]]),
            total_length: u16::from_be_bytes([data[4], data[5]]),
        })
    }

    /// Append the encoded header to a packet buffer.
    pub fn write_to(&self, buf: &mut Vec<u8>) {
        buf.push(self.header_length);
        buf.push(self.protocol_version);
        buf.extend_from_slice(&self.service_type.to_be_bytes());
        buf.extend_from_slice(&self.total_length.to_be_bytes());
    }

    /// Expected body length according to the header.
    pub const fn body_length(&self) -> u16 {
        self.total_length.saturating_sub(Self::SIZE as u16)
    }
}

/// Zero-copy view of a KNXnet/IP frame.
///
/// References the underlying receive buffer; no allocation happens during
/// parsing.
#[derive(Debug)]
pub struct KnxnetIpFrame<'a> {
    data: &'a [u8],
    header: KnxnetIpHeader,
}

impl<'a> KnxnetIpFrame<'a> {
    /// Parse a KNXnet/IP frame from a byte slice.
    ///
    /// # Errors
    ///
    /// Returns a [`FormatError`] if the header is invalid or the declared
    /// total length exceeds the received data.
    pub fn parse(data: &'a [u8]) -> Result<Self> {
        let header = KnxnetIpHeader::parse(data)?;
        let declared = header.total_length as usize;
        if declared < KnxnetIpHeader::SIZE || data.len() < declared {
            return Err(FormatError::LengthMismatch { declared, actual: data.len() }.into());
        }
        Ok(Self { data, header })
    }

    /// Get the frame header.
    pub const fn header(&self) -> &KnxnetIpHeader {
        &self.header
    }

    /// Get the raw service type.
    pub const fn service_type(&self) -> u16 {
        self.header.service_type
    }

    /// Get the frame body (payload after header).
    pub fn body(&self) -> &'a [u8] {
        &self.data[KnxnetIpHeader::SIZE..self.header.total_length as usize]
    }

    /// Get the complete frame data, excluding any trailing bytes.
    pub fn data(&self) -> &'a [u8] {
        &self.data[..self.header.total_length as usize]
    }
}

/// Assemble a complete packet from service type, protocol version, and body.
pub fn to_packet(service_type: u16, protocol_version: u8, body: &[u8]) -> Vec<u8> {
    let header = KnxnetIpHeader::new(service_type, protocol_version, body.len() as u16);
    let mut buf = Vec::with_capacity(KnxnetIpHeader::SIZE + body.len());
    header.write_to(&mut buf);
    buf.extend_from_slice(body);
    buf
}

/// Host Protocol Address Information (HPAI)
///
/// Endpoint descriptor exchanged in the handshake.
///
/// ```text
/// ┌──────────────┬──────────────┬─────────────────────┐
/// │ Structure Len│ Host Protocol│   IP Address        │
/// │   (1 byte)   │   (1 byte)   │   (4 bytes IPv4)    │
/// ├──────────────┴──────────────┴─────────────────────┤
/// │                Port (2 bytes)                      │
/// └────────────────────────────────────────────────────┘
/// ```
///
/// TCP HPAIs are "route-back": address and port are zero, the peer is implied
/// by the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hpai {
    /// Host protocol code (`IPV4_UDP` or `IPV4_TCP`)
    pub host_protocol: u8,
    /// IPv4 address (4 bytes)
    pub ip_address: [u8; 4],
    /// Port number
    pub port: u16,
}

impl Hpai {
    /// Size of the HPAI structure for IPv4
    pub const SIZE: usize = 8;

    /// Route-back HPAI used over TCP
    pub const TCP: Self = Self { host_protocol: IPV4_TCP, ip_address: [0; 4], port: 0 };

    /// Create a new HPAI for IPv4 UDP.
    pub const fn new(ip_address: [u8; 4], port: u16) -> Self {
        Self { host_protocol: IPV4_UDP, ip_address, port }
    }

    /// Create a UDP HPAI from a socket address.
    ///
    /// # Errors
    ///
    /// IPv6 endpoints are rejected; KNXnet/IP 1.0 carries IPv4 only.
    pub fn from_endpoint(addr: SocketAddr) -> Result<Self> {
        match addr {
            SocketAddr::V4(v4) => Ok(Self::new(v4.ip().octets(), v4.port())),
            SocketAddr::V6(_) => {
                Err(KnxError::InvalidArgument(format!("IPv6 endpoint not supported: {addr}")))
            }
        }
    }

    /// Parse HPAI from bytes.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < Self::SIZE {
            return Err(FormatError::TooShort { expected: Self::SIZE, actual: data.len() }.into());
        }
        if data[0] != Self::SIZE as u8 {
            return Err(FormatError::InvalidStructure("HPAI structure length").into());
        }

        Ok(Self {
            host_protocol: data[1],
            ip_address: [data[2], data[3], data[4], data[5]],
            port: u16::from_be_bytes([data[6], data[7]]),
        })
    }

    /// Append the encoded HPAI to a packet buffer.
    pub fn write_to(&self, buf: &mut Vec<u8>) {
        buf.push(Self::SIZE as u8);
        buf.push(self.host_protocol);
        buf.extend_from_slice(&self.ip_address);
        buf.extend_from_slice(&self.port.to_be_bytes());
    }

    /// Whether address and port are zero, i.e. the peer is implied by the
    /// stream.
    pub const fn is_route_back(&self) -> bool {
        self.ip_address[0] == 0
            && self.ip_address[1] == 0
            && self.ip_address[2] == 0
            && self.ip_address[3] == 0
            && self.port == 0
    }

    /// Whether the address is the IPv4 any-address.
    pub const fn is_unspecified(&self) -> bool {
        self.ip_address[0] == 0
            && self.ip_address[1] == 0
            && self.ip_address[2] == 0
            && self.ip_address[3] == 0
    }

    /// The carried endpoint as a socket address.
    pub fn endpoint(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(self.ip_address.into(), self.port))
    }
}

impl Default for Hpai {
    fn default() -> Self {
        Self::new([0; 4], 0)
    }
}
