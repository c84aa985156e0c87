//! KNXnet/IP protocol constants and service type identifiers.

/// KNXnet/IP protocol version 1.0
pub const KNXNETIP_VERSION_10: u8 = 0x10;

/// Standard KNXnet/IP header length (6 bytes)
pub const HEADER_SIZE_10: u8 = 0x06;

/// Standard UDP port for KNXnet/IP communication
pub const KNXNETIP_DEFAULT_PORT: u16 = 3671;

/// Maximum size of a KNXnet/IP frame handled by this engine
pub const MAX_FRAME_SIZE: usize = 512;

// =============================================================================
// Service Type Identifiers
// =============================================================================

/// Service type constant for CONNECT_REQUEST (0x0205)
pub const SERVICE_CONNECT_REQUEST: u16 = 0x0205;
/// Service type constant for CONNECT_RESPONSE (0x0206)
pub const SERVICE_CONNECT_RESPONSE: u16 = 0x0206;
/// Service type constant for CONNECTIONSTATE_REQUEST (0x0207)
pub const SERVICE_CONNECTIONSTATE_REQUEST: u16 = 0x0207;
/// Service type constant for CONNECTIONSTATE_RESPONSE (0x0208)
pub const SERVICE_CONNECTIONSTATE_RESPONSE: u16 = 0x0208;
/// Service type constant for DISCONNECT_REQUEST (0x0209)
pub const SERVICE_DISCONNECT_REQUEST: u16 = 0x0209;
/// Service type constant for DISCONNECT_RESPONSE (0x020A)
pub const SERVICE_DISCONNECT_RESPONSE: u16 = 0x020A;
/// Service type constant for DEVICE_CONFIGURATION_REQUEST (0x0310)
pub const SERVICE_DEVICE_CONFIGURATION_REQUEST: u16 = 0x0310;
/// Service type constant for DEVICE_CONFIGURATION_ACK (0x0311)
pub const SERVICE_DEVICE_CONFIGURATION_ACK: u16 = 0x0311;
/// Service type constant for TUNNELING_REQUEST (0x0420)
pub const SERVICE_TUNNELING_REQUEST: u16 = 0x0420;
/// Service type constant for TUNNELING_ACK (0x0421)
pub const SERVICE_TUNNELING_ACK: u16 = 0x0421;

/// KNXnet/IP service type identifiers known to this engine.
///
/// Frames with a service type outside this set still decode to an opaque
/// frame; the enum exists for dispatch and readable diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ServiceType {
    /// `CONNECT_REQUEST` - Connection request
    ConnectRequest = 0x0205,
    /// `CONNECT_RESPONSE` - Connection response
    ConnectResponse = 0x0206,
    /// `CONNECTIONSTATE_REQUEST` - Connection state request (heartbeat)
    ConnectionstateRequest = 0x0207,
    /// `CONNECTIONSTATE_RESPONSE` - Connection state response
    ConnectionstateResponse = 0x0208,
    /// `DISCONNECT_REQUEST` - Disconnect request
    DisconnectRequest = 0x0209,
    /// `DISCONNECT_RESPONSE` - Disconnect response
    DisconnectResponse = 0x020A,
    /// `DEVICE_CONFIGURATION_REQUEST`
    DeviceConfigurationRequest = 0x0310,
    /// `DEVICE_CONFIGURATION_ACK`
    DeviceConfigurationAck = 0x0311,
    /// `TUNNELLING_REQUEST` - Tunnelling data request
    TunnellingRequest = 0x0420,
    /// `TUNNELLING_ACK` - Tunnelling acknowledgement
    TunnellingAck = 0x0421,
    /// `ROUTING_INDICATION` - Routing indication (multicast)
    RoutingIndication = 0x0530,
    /// `ROUTING_LOST_MESSAGE` - Routing lost message indication
    RoutingLostMessage = 0x0531,
    /// `ROUTING_BUSY` - Routing busy indication
    RoutingBusy = 0x0532,
}

impl ServiceType {
    /// Convert a u16 to `ServiceType`
    pub const fn from_u16(value: u16) -> Option<Self> {
        match value {
            0x0205 => Some(Self::ConnectRequest),
            0x0206 => Some(Self::ConnectResponse),
            0x0207 => Some(Self::ConnectionstateRequest),
            0x0208 => Some(Self::ConnectionstateResponse),
            0x0209 => Some(Self::DisconnectRequest),
            0x020A => Some(Self::DisconnectResponse),
            0x0310 => Some(Self::DeviceConfigurationRequest),
            0x0311 => Some(Self::DeviceConfigurationAck),
            0x0420 => Some(Self::TunnellingRequest),
            0x0421 => Some(Self::TunnellingAck),
            0x0530 => Some(Self::RoutingIndication),
            0x0531 => Some(Self::RoutingLostMessage),
            0x0532 => Some(Self::RoutingBusy),
            _ => None,
        }
    }

    /// Convert `ServiceType` to u16
    pub const fn to_u16(self) -> u16 {
        self as u16
    }
}

// =============================================================================
// Connection Type Codes
// =============================================================================

/// Connection type for `DEVICE_MGMT_CONNECTION`
pub const DEVICE_MGMT_CONNECTION: u8 = 0x03;

/// Connection type for `TUNNEL_CONNECTION`
pub const TUNNEL_CONNECTION: u8 = 0x04;

/// KNX tunneling on link layer
pub const TUNNEL_LINKLAYER: u8 = 0x02;

// =============================================================================
// Host Protocol Codes
// =============================================================================

/// IPv4 UDP protocol
pub const IPV4_UDP: u8 = 0x01;

/// IPv4 TCP protocol
pub const IPV4_TCP: u8 = 0x02;

// =============================================================================
// Status Codes
// =============================================================================

/// Status code for successful operation
pub const E_NO_ERROR: u8 = 0x00;

/// Requested host protocol not supported
pub const E_HOST_PROTOCOL_TYPE: u8 = 0x01;

/// Requested protocol version not supported
pub const E_VERSION_NOT_SUPPORTED: u8 = 0x02;

/// Received sequence number out of order
pub const E_SEQUENCE_NUMBER: u8 = 0x04;

/// Server could not find an active connection for the channel ID
pub const E_CONNECTION_ID: u8 = 0x21;

/// Requested connection type not supported
pub const E_CONNECTION_TYPE: u8 = 0x22;

/// Requested connection option not supported
pub const E_CONNECTION_OPTION: u8 = 0x23;

/// Server cannot accept a new connection
pub const E_NO_MORE_CONNECTIONS: u8 = 0x24;

/// Server detected an error concerning the data connection
pub const E_DATA_CONNECTION: u8 = 0x26;

/// Server detected an error concerning the KNX connection
pub const E_KNX_CONNECTION: u8 = 0x27;

/// Requested tunneling layer not supported
pub const E_TUNNELLING_LAYER: u8 = 0x29;

/// Human-readable message for a KNXnet/IP status code.
///
/// Unknown codes yield a generic message containing the code, so peer status
/// is always representable in logs and errors.
pub fn status_message(status: u8) -> String {
    match status {
        E_NO_ERROR => "no error".into(),
        E_HOST_PROTOCOL_TYPE => "host protocol type not supported".into(),
        E_VERSION_NOT_SUPPORTED => "protocol version not supported".into(),
        E_SEQUENCE_NUMBER => "sequence number out of order".into(),
        E_CONNECTION_ID => "no active data connection with that ID".into(),
        E_CONNECTION_TYPE => "connection type not supported".into(),
        E_CONNECTION_OPTION => "connection option not supported".into(),
        E_NO_MORE_CONNECTIONS => "server cannot accept new connections".into(),
        E_DATA_CONNECTION => "error concerning the data connection".into(),
        E_KNX_CONNECTION => "error concerning the KNX connection".into(),
        E_TUNNELLING_LAYER => "tunneling layer not supported".into(),
        code => format!("unknown status 0x{code:02x}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_type_roundtrip() {
        for raw in [0x0205u16, 0x0208, 0x020A, 0x0311, 0x0420, 0x0530] {
            let svc = ServiceType::from_u16(raw).unwrap();
            assert_eq!(svc.to_u16(), raw);
        }
        assert!(ServiceType::from_u16(0x0950).is_none());
    }

    #[test]
    fn status_messages() {
        assert_eq!(status_message(E_NO_ERROR), "no error");
        assert_eq!(status_message(E_NO_MORE_CONNECTIONS), "server cannot accept new connections");
        assert!(status_message(0x77).contains("0x77"));
    }
}
