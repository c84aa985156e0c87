//! KNXnet/IP service structures.
//!
//! Builders and parsers for the service frames a client connection exchanges:
//!
//! - **CONNECT** - establish the communication channel
//! - **CONNECTIONSTATE** - heartbeat / keep-alive probes
//! - **DISCONNECT** - channel teardown
//! - **service request / service ack** - the sequenced data frames of the
//!   concrete connection kind (tunneling or device management)
//!
//! Builders produce the frame body and assemble the full packet through
//! [`frame::to_packet`]; parsers take the frame body (everything after the
//! 6-octet header).
//!
//! ## Protocol Flow
//!
//! ```text
//! Client                          Server
//!   |                                |
//!   |------- CONNECT_REQUEST ------->|
//!   |<------ CONNECT_RESPONSE -------|
//!   |                                |
//!   |------- service request ------->|
//!   |<------ service ack ------------|   (UDP only)
//!   |<------ service request --------|   (cEMI confirmation)
//!   |------- service ack ----------->|   (UDP only)
//!   |                                |
//!   |--- CONNECTIONSTATE_REQUEST --->|   (every 60s)
//!   |<-- CONNECTIONSTATE_RESPONSE ---|
//!   |                                |
//!   |------ DISCONNECT_REQUEST ----->|
//!   |<----- DISCONNECT_RESPONSE -----|
//! ```

use crate::addressing::IndividualAddress;
use crate::error::{FormatError, Result};
use crate::protocol::constants::{
    SERVICE_CONNECTIONSTATE_REQUEST, SERVICE_CONNECTIONSTATE_RESPONSE, SERVICE_CONNECT_REQUEST,
    SERVICE_CONNECT_RESPONSE, SERVICE_DISCONNECT_REQUEST, SERVICE_DISCONNECT_RESPONSE,
    DEVICE_MGMT_CONNECTION, E_NO_ERROR, TUNNEL_CONNECTION, TUNNEL_LINKLAYER,
};
use crate::protocol::frame::{self, Hpai};

/// Connection Request Information (CRI)
///
/// Tagged record keyed by the connection-type octet, parameterizing the
/// requested connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cri {
    /// Connection type code
    pub connection_type: u8,
    /// Type-specific payload
    pub payload: Vec<u8>,
}

impl Cri {
    /// CRI for a link-layer tunneling connection.
    pub fn tunnel_link_layer() -> Self {
        Self { connection_type: TUNNEL_CONNECTION, payload: vec![TUNNEL_LINKLAYER, 0x00] }
    }

    /// CRI for a device-management connection.
    pub fn device_management() -> Self {
        Self { connection_type: DEVICE_MGMT_CONNECTION, payload: Vec::new() }
    }

    /// Append the encoded CRI to a packet buffer.
    pub fn write_to(&self, buf: &mut Vec<u8>) {
        buf.push(2 + self.payload.len() as u8);
        buf.push(self.connection_type);
        buf.extend_from_slice(&self.payload);
    }

    /// Parse a CRI from bytes; returns the structure and its encoded length.
    pub fn parse(data: &[u8]) -> Result<(Self, usize)> {
        let (connection_type, payload, len) = parse_tagged(data)?;
        Ok((Self { connection_type, payload }, len))
    }
}

/// Connection Response Data (CRD)
///
/// Mirror of [`Cri`] on the response side. A tunnel CRD carries the
/// individual KNX address the server assigned for the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Crd {
    /// Connection type code
    pub connection_type: u8,
    /// Type-specific payload
    pub payload: Vec<u8>,
}

impl Crd {
    /// CRD for a tunneling connection with the assigned address.
    pub fn tunnel(address: IndividualAddress) -> Self {
        Self { connection_type: TUNNEL_CONNECTION, payload: address.raw().to_be_bytes().to_vec() }
    }

    /// Assigned tunneling address, present for tunnel CRDs only.
    pub fn tunneling_address(&self) -> Option<IndividualAddress> {
        if self.connection_type == TUNNEL_CONNECTION && self.payload.len() >= 2 {
            Some(IndividualAddress::from(u16::from_be_bytes([self.payload[0], self.payload[1]])))
        } else {
            None
        }
    }

    /// Append the encoded CRD to a packet buffer.
    pub fn write_to(&self, buf: &mut Vec<u8>) {
        buf.push(2 + self.payload.len() as u8);
        buf.push(self.connection_type);
        buf.extend_from_slice(&self.payload);
    }

    /// Parse a CRD from bytes.
    pub fn parse(data: &[u8]) -> Result<Self> {
        let (connection_type, payload, _) = parse_tagged(data)?;
        Ok(Self { connection_type, payload })
    }
}

// CRI and CRD share the length-tagged layout `<len:u8> <conn_type:u8> <payload…>`.
fn parse_tagged(data: &[u8]) -> Result<(u8, Vec<u8>, usize)> {
    if data.len() < 2 {
        return Err(FormatError::TooShort { expected: 2, actual: data.len() }.into());
    }
    let len = data[0] as usize;
    if len < 2 || len > data.len() {
        return Err(FormatError::InvalidStructure("CRI/CRD structure length").into());
    }
    Ok((data[1], data[2..len].to_vec(), len))
}

/// `CONNECT_REQUEST` service (0x0205)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    /// Control endpoint (connection management)
    pub control_endpoint: Hpai,
    /// Data endpoint (sequenced data frames)
    pub data_endpoint: Hpai,
    /// Connection request information
    pub cri: Cri,
}

impl ConnectRequest {
    /// Create a new `CONNECT_REQUEST`.
    pub fn new(cri: Cri, control_endpoint: Hpai, data_endpoint: Hpai) -> Self {
        Self { control_endpoint, data_endpoint, cri }
    }

    /// Assemble the complete packet.
    pub fn to_packet(&self, protocol_version: u8) -> Vec<u8> {
        let mut body = Vec::with_capacity(2 * Hpai::SIZE + 2 + self.cri.payload.len());
        self.control_endpoint.write_to(&mut body);
        self.data_endpoint.write_to(&mut body);
        self.cri.write_to(&mut body);
        frame::to_packet(SERVICE_CONNECT_REQUEST, protocol_version, &body)
    }

    /// Parse from frame body.
    pub fn parse(body: &[u8]) -> Result<Self> {
        if body.len() < 2 * Hpai::SIZE + 2 {
            return Err(
                FormatError::TooShort { expected: 2 * Hpai::SIZE + 2, actual: body.len() }.into()
            );
        }
        let control_endpoint = Hpai::parse(&body[..Hpai::SIZE])?;
        let data_endpoint = Hpai::parse(&body[Hpai::SIZE..2 * Hpai::SIZE])?;
        let (cri, _) = Cri::parse(&body[2 * Hpai::SIZE..])?;
        Ok(Self { control_endpoint, data_endpoint, cri })
    }
}

/// `CONNECT_RESPONSE` service (0x0206)
///
/// Data endpoint and CRD are only present when the status indicates no error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectResponse {
    /// Communication channel ID assigned by the server
    pub channel_id: u8,
    /// Status code (0 = OK)
    pub status: u8,
    /// Data endpoint assigned by the server
    pub data_endpoint: Option<Hpai>,
    /// Connection response data
    pub crd: Option<Crd>,
}

impl ConnectResponse {
    /// Create a successful response.
    pub fn new(channel_id: u8, data_endpoint: Hpai, crd: Crd) -> Self {
        Self { channel_id, status: E_NO_ERROR, data_endpoint: Some(data_endpoint), crd: Some(crd) }
    }

    /// Create an error response.
    pub fn error(status: u8) -> Self {
        Self { channel_id: 0, status, data_endpoint: None, crd: None }
    }

    /// Assemble the complete packet.
    pub fn to_packet(&self, protocol_version: u8) -> Vec<u8> {
        let mut body = vec![self.channel_id, self.status];
        if let Some(ep) = &self.data_endpoint {
            ep.write_to(&mut body);
        }
        if let Some(crd) = &self.crd {
            crd.write_to(&mut body);
        }
        frame::to_packet(SERVICE_CONNECT_RESPONSE, protocol_version, &body)
    }

    /// Parse from frame body.
    pub fn parse(body: &[u8]) -> Result<Self> {
        if body.len() < 2 {
            return Err(FormatError::TooShort { expected: 2, actual: body.len() }.into());
        }
        let channel_id = body[0];
        let status = body[1];
        if status != E_NO_ERROR || body.len() < 2 + Hpai::SIZE + 2 {
            return Ok(Self { channel_id, status, data_endpoint: None, crd: None });
        }
        let data_endpoint = Hpai::parse(&body[2..2 + Hpai::SIZE])?;
        let crd = Crd::parse(&body[2 + Hpai::SIZE..])?;
        Ok(Self { channel_id, status, data_endpoint: Some(data_endpoint), crd: Some(crd) })
    }

    /// Check if the connection was accepted.
    pub const fn is_ok(&self) -> bool {
        self.status == E_NO_ERROR
    }
}

/// `CONNECTIONSTATE_REQUEST` service (0x0207)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionStateRequest {
    /// Communication channel ID
    pub channel_id: u8,
    /// Control endpoint
    pub control_endpoint: Hpai,
}

impl ConnectionStateRequest {
    /// Create a new `CONNECTIONSTATE_REQUEST`.
    pub const fn new(channel_id: u8, control_endpoint: Hpai) -> Self {
        Self { channel_id, control_endpoint }
    }

    /// Assemble the complete packet.
    pub fn to_packet(&self, protocol_version: u8) -> Vec<u8> {
        let mut body = vec![self.channel_id, 0x00];
        self.control_endpoint.write_to(&mut body);
        frame::to_packet(SERVICE_CONNECTIONSTATE_REQUEST, protocol_version, &body)
    }

    /// Parse from frame body.
    pub fn parse(body: &[u8]) -> Result<Self> {
        if body.len() < 2 + Hpai::SIZE {
            return Err(FormatError::TooShort { expected: 2 + Hpai::SIZE, actual: body.len() }.into());
        }
        Ok(Self { channel_id: body[0], control_endpoint: Hpai::parse(&body[2..])? })
    }
}

/// `CONNECTIONSTATE_RESPONSE` service (0x0208)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionStateResponse {
    /// Communication channel ID
    pub channel_id: u8,
    /// Status code (0 = connection alive)
    pub status: u8,
}

impl ConnectionStateResponse {
    /// Create a new `CONNECTIONSTATE_RESPONSE`.
    pub const fn new(channel_id: u8, status: u8) -> Self {
        Self { channel_id, status }
    }

    /// Assemble the complete packet.
    pub fn to_packet(&self, protocol_version: u8) -> Vec<u8> {
        frame::to_packet(SERVICE_CONNECTIONSTATE_RESPONSE, protocol_version, &[self.channel_id, self.status])
    }

    /// Parse from frame body.
    pub fn parse(body: &[u8]) -> Result<Self> {
        if body.len() < 2 {
            return Err(FormatError::TooShort { expected: 2, actual: body.len() }.into());
        }
        Ok(Self { channel_id: body[0], status: body[1] })
    }

    /// Check if the connection is still alive.
    pub const fn is_ok(&self) -> bool {
        self.status == E_NO_ERROR
    }
}

/// `DISCONNECT_REQUEST` service (0x0209)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisconnectRequest {
    /// Communication channel ID
    pub channel_id: u8,
    /// Control endpoint
    pub control_endpoint: Hpai,
}

impl DisconnectRequest {
    /// Create a new `DISCONNECT_REQUEST`.
    pub const fn new(channel_id: u8, control_endpoint: Hpai) -> Self {
        Self { channel_id, control_endpoint }
    }

    /// Assemble the complete packet.
    pub fn to_packet(&self, protocol_version: u8) -> Vec<u8> {
        let mut body = vec![self.channel_id, 0x00];
        self.control_endpoint.write_to(&mut body);
        frame::to_packet(SERVICE_DISCONNECT_REQUEST, protocol_version, &body)
    }

    /// Parse from frame body.
    pub fn parse(body: &[u8]) -> Result<Self> {
        if body.len() < 2 + Hpai::SIZE {
            return Err(FormatError::TooShort { expected: 2 + Hpai::SIZE, actual: body.len() }.into());
        }
        Ok(Self { channel_id: body[0], control_endpoint: Hpai::parse(&body[2..])? })
    }
}

/// `DISCONNECT_RESPONSE` service (0x020A)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisconnectResponse {
    /// Communication channel ID
    pub channel_id: u8,
    /// Status code
    pub status: u8,
}

impl DisconnectResponse {
    /// Create a new `DISCONNECT_RESPONSE`.
    pub const fn new(channel_id: u8, status: u8) -> Self {
        Self { channel_id, status }
    }

    /// Assemble the complete packet.
    pub fn to_packet(&self, protocol_version: u8) -> Vec<u8> {
        frame::to_packet(SERVICE_DISCONNECT_RESPONSE, protocol_version, &[self.channel_id, self.status])
    }

    /// Parse from frame body.
    pub fn parse(body: &[u8]) -> Result<Self> {
        if body.len() < 2 {
            return Err(FormatError::TooShort { expected: 2, actual: body.len() }.into());
        }
        Ok(Self { channel_id: body[0], status: body[1] })
    }
}

/// Connection header prefixed to sequenced data frames
///
/// `<len:4> <channel:u8> <seq:u8> <reserved:u8>`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionHeader {
    /// Communication channel ID
    pub channel_id: u8,
    /// Sequence counter
    pub sequence: u8,
}

impl ConnectionHeader {
    /// Size of the connection header in bytes
    pub const SIZE: usize = 4;

    /// Create a new connection header.
    pub const fn new(channel_id: u8, sequence: u8) -> Self {
        Self { channel_id, sequence }
    }

    /// Append the encoded header to a packet buffer.
    pub fn write_to(&self, buf: &mut Vec<u8>) {
        buf.push(Self::SIZE as u8);
        buf.push(self.channel_id);
        buf.push(self.sequence);
        buf.push(0x00);
    }

    /// Decode from bytes.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < Self::SIZE {
            return Err(FormatError::TooShort { expected: Self::SIZE, actual: data.len() }.into());
        }
        if (data[0] as usize) < Self::SIZE {
            return Err(FormatError::InvalidStructure("connection header length").into());
        }
        Ok(Self { channel_id: data[1], sequence: data[2] })
    }
}

/// Sequenced service request carrying a cEMI payload
///
/// The service type identifier is a parameter of the connection kind
/// (tunneling request 0x0420, device configuration request 0x0310).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceRequest<'a> {
    /// Service type identifier of this connection kind
    pub service_type: u16,
    /// Connection header (channel + sequence)
    pub connection_header: ConnectionHeader,
    /// cEMI frame data
    pub cemi: &'a [u8],
}

impl<'a> ServiceRequest<'a> {
    /// Create a new service request.
    pub const fn new(service_type: u16, channel_id: u8, sequence: u8, cemi: &'a [u8]) -> Self {
        Self { service_type, connection_header: ConnectionHeader::new(channel_id, sequence), cemi }
    }

    /// Assemble the complete packet.
    pub fn to_packet(&self, protocol_version: u8) -> Vec<u8> {
        let mut body = Vec::with_capacity(ConnectionHeader::SIZE + self.cemi.len());
        self.connection_header.write_to(&mut body);
        body.extend_from_slice(self.cemi);
        frame::to_packet(self.service_type, protocol_version, &body)
    }

    /// Parse from frame body.
    pub fn parse(service_type: u16, body: &'a [u8]) -> Result<Self> {
        let connection_header = ConnectionHeader::parse(body)?;
        Ok(Self { service_type, connection_header, cemi: &body[ConnectionHeader::SIZE..] })
    }
}

/// Service acknowledgment for a sequenced request
///
/// `<conn header with status in the reserved octet>` - channel, sequence, and
/// status share the 4-octet connection header layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceAck {
    /// Service type identifier of this connection kind
    pub service_type: u16,
    /// Communication channel ID
    pub channel_id: u8,
    /// Acknowledged sequence number
    pub sequence: u8,
    /// Status code (0 = OK)
    pub status: u8,
}

impl ServiceAck {
    /// Create a new service ack.
    pub const fn new(service_type: u16, channel_id: u8, sequence: u8, status: u8) -> Self {
        Self { service_type, channel_id, sequence, status }
    }

    /// Assemble the complete packet.
    pub fn to_packet(&self, protocol_version: u8) -> Vec<u8> {
        let body = [ConnectionHeader::SIZE as u8, self.channel_id, self.sequence, self.status];
        frame::to_packet(self.service_type, protocol_version, &body)
    }

    /// Parse from frame body.
    pub fn parse(service_type: u16, body: &[u8]) -> Result<Self> {
        if body.len() < ConnectionHeader::SIZE {
            return Err(
                FormatError::TooShort { expected: ConnectionHeader::SIZE, actual: body.len() }.into()
            );
        }
        Ok(Self { service_type, channel_id: body[1], sequence: body[2], status: body[3] })
    }

    /// Check if the request was acknowledged successfully.
    pub const fn is_ok(&self) -> bool {
        self.status == E_NO_ERROR
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::constants::{IPV4_UDP, SERVICE_TUNNELING_ACK, SERVICE_TUNNELING_REQUEST};
    use crate::protocol::frame::KnxnetIpFrame;

    #[test]
    fn connect_request_roundtrip() {
        let hpai = Hpai::new([192, 0, 2, 1], 3671);
        let request = ConnectRequest::new(Cri::tunnel_link_layer(), hpai, hpai);

        let packet = request.to_packet(0x10);
        assert_eq!(packet.len(), 26);
        assert_eq!(&packet[..2], &[0x06, 0x10]);
        assert_eq!(u16::from_be_bytes([packet[2], packet[3]]), SERVICE_CONNECT_REQUEST);

        let frame = KnxnetIpFrame::parse(&packet).unwrap();
        let decoded = ConnectRequest::parse(frame.body()).unwrap();
        assert_eq!(decoded, request);
        assert_eq!(decoded.control_endpoint.host_protocol, IPV4_UDP);
        assert_eq!(decoded.cri.connection_type, TUNNEL_CONNECTION);
    }

    #[test]
    fn connect_response_roundtrip() {
        let address = IndividualAddress::new(1, 1, 5).unwrap();
        let response =
            ConnectResponse::new(42, Hpai::new([192, 0, 2, 1], 3671), Crd::tunnel(address));

        let packet = response.to_packet(0x10);
        let frame = KnxnetIpFrame::parse(&packet).unwrap();
        let decoded = ConnectResponse::parse(frame.body()).unwrap();

        assert_eq!(decoded.channel_id, 42);
        assert!(decoded.is_ok());
        assert_eq!(decoded.data_endpoint.unwrap().port, 3671);
        assert_eq!(decoded.crd.unwrap().tunneling_address(), Some(address));
    }

    #[test]
    fn connect_response_error_has_no_endpoint() {
        let packet = ConnectResponse::error(0x24).to_packet(0x10);
        let frame = KnxnetIpFrame::parse(&packet).unwrap();
        let decoded = ConnectResponse::parse(frame.body()).unwrap();

        assert_eq!(decoded.status, 0x24);
        assert!(decoded.data_endpoint.is_none());
        assert!(decoded.crd.is_none());
    }

    #[test]
    fn service_ack_roundtrip() {
        let ack = ServiceAck::new(SERVICE_TUNNELING_ACK, 7, 42, 0);
        let packet = ack.to_packet(0x10);
        assert_eq!(packet.len(), 10);

        let frame = KnxnetIpFrame::parse(&packet).unwrap();
        assert_eq!(frame.service_type(), SERVICE_TUNNELING_ACK);
        let decoded = ServiceAck::parse(frame.service_type(), frame.body()).unwrap();
        assert_eq!(decoded.channel_id, 7);
        assert_eq!(decoded.sequence, 42);
        assert_eq!(decoded.status, 0);
        assert!(decoded.is_ok());
    }

    #[test]
    fn service_request_roundtrip() {
        let cemi = [0x29, 0x00, 0xBC, 0xE0];
        let request = ServiceRequest::new(SERVICE_TUNNELING_REQUEST, 5, 3, &cemi);
        let packet = request.to_packet(0x10);

        let frame = KnxnetIpFrame::parse(&packet).unwrap();
        let decoded = ServiceRequest::parse(frame.service_type(), frame.body()).unwrap();
        assert_eq!(decoded.connection_header.channel_id, 5);
        assert_eq!(decoded.connection_header.sequence, 3);
        assert_eq!(decoded.cemi, &cemi);
    }

    #[test]
    fn connectionstate_and_disconnect_roundtrip() {
        let hpai = Hpai::new([192, 0, 2, 2], 50000);

        let csr = ConnectionStateRequest::new(9, hpai);
        let frame_bytes = csr.to_packet(0x10);
        let frame = KnxnetIpFrame::parse(&frame_bytes).unwrap();
        assert_eq!(ConnectionStateRequest::parse(frame.body()).unwrap(), csr);

        let dr = DisconnectRequest::new(9, hpai);
        let frame_bytes = dr.to_packet(0x10);
        let frame = KnxnetIpFrame::parse(&frame_bytes).unwrap();
        assert_eq!(DisconnectRequest::parse(frame.body()).unwrap(), dr);

        let dres = DisconnectResponse::new(9, 0);
        let frame_bytes = dres.to_packet(0x10);
        let frame = KnxnetIpFrame::parse(&frame_bytes).unwrap();
        assert_eq!(DisconnectResponse::parse(frame.body()).unwrap(), dres);
    }

    #[test]
    fn crd_of_other_connection_type_has_no_address() {
        let crd = Crd { connection_type: DEVICE_MGMT_CONNECTION, payload: vec![0x11, 0x05] };
        assert_eq!(crd.tunneling_address(), None);
    }

    #[test]
    fn truncated_structures_fail_cleanly() {
        assert!(ConnectResponse::parse(&[0x01]).is_err());
        assert!(ConnectionHeader::parse(&[0x04, 0x01]).is_err());
        assert!(ServiceAck::parse(SERVICE_TUNNELING_ACK, &[0x04, 0x01, 0x00]).is_err());
        assert!(Cri::parse(&[0x09, 0x04]).is_err());
    }
}
