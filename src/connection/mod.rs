//! Client connection engine.
//!
//! Establishes, maintains, and tears down one logical KNXnet/IP channel.
//! Everything connection-kind specific (tunneling vs. device management) is
//! carried by a [`ConnectionProfile`]: the service request/ack pair, the
//! retransmission ceiling, the per-attempt ack timeout, and the protocol
//! version.
//!
//! Three concurrent roles cooperate per connection: caller tasks invoking
//! [`Connection::send`] and [`Connection::close`], a receiver feeding inbound
//! frames into [`ConnectionInner::handle_frame`] (a socket reader task for
//! UDP, the shared stream demultiplexer for TCP), and the heartbeat actor.
//! The receiver never mutates connection state directly; every transition
//! goes through the state cell, which notifies all waiters.

pub mod heartbeat;
pub mod state;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, trace, warn};

use crate::addressing::IndividualAddress;
use crate::error::{KnxError, Result};
use crate::net::tcp::TcpConnection;
use crate::net::transport::{FrameEvent, LinkTransport};
use crate::protocol::constants::{
    status_message, ServiceType, E_NO_ERROR, IPV4_TCP, IPV4_UDP, KNXNETIP_VERSION_10,
    MAX_FRAME_SIZE, SERVICE_CONNECTIONSTATE_REQUEST, SERVICE_CONNECTIONSTATE_RESPONSE,
    SERVICE_CONNECT_REQUEST, SERVICE_CONNECT_RESPONSE, SERVICE_DEVICE_CONFIGURATION_ACK,
    SERVICE_DEVICE_CONFIGURATION_REQUEST, SERVICE_DISCONNECT_REQUEST, SERVICE_DISCONNECT_RESPONSE,
    SERVICE_TUNNELING_ACK, SERVICE_TUNNELING_REQUEST,
};
use crate::protocol::frame::{Hpai, KnxnetIpFrame, KnxnetIpHeader};
use crate::protocol::services::{
    ConnectRequest, ConnectResponse, ConnectionStateResponse, Cri, DisconnectRequest,
    DisconnectResponse, ServiceAck, ServiceRequest,
};

pub use heartbeat::HeartbeatConfig;
pub use state::ConnState;
use heartbeat::HeartbeatSignal;
use state::StateCell;

/// Bounded wait for the connect response, and for the disconnect response on
/// close.
const CONNECT_REQ_TIMEOUT: Duration = Duration::from_secs(10);

/// Bounded wait for the cEMI confirmation after a successful acknowledgment.
const CONFIRMATION_TIMEOUT: Duration = Duration::from_secs(3);

/// Per-kind parameters of a client connection.
///
/// The engine itself is connection-kind agnostic; the profile tells it which
/// sequenced service pair to speak and how persistently to retransmit.
#[derive(Debug, Clone)]
pub struct ConnectionProfile {
    /// Outbound service type for sequenced data frames.
    pub service_request: u16,
    /// Expected acknowledgment service type (evaluated over UDP only).
    pub service_ack: u16,
    /// Total attempts for a single request (first send + retransmissions).
    pub max_send_attempts: u32,
    /// Per-attempt wait for the service acknowledgment.
    pub response_timeout: Duration,
    /// Negotiated protocol version; any other version on an inbound header
    /// closes the connection.
    pub protocol_version: u8,
}

impl ConnectionProfile {
    /// Profile for KNX tunneling (link layer).
    pub fn tunneling() -> Self {
        Self {
            service_request: SERVICE_TUNNELING_REQUEST,
            service_ack: SERVICE_TUNNELING_ACK,
            max_send_attempts: 2,
            response_timeout: Duration::from_secs(1),
            protocol_version: KNXNETIP_VERSION_10,
        }
    }

    /// Profile for KNXnet/IP device management.
    pub fn device_management() -> Self {
        Self {
            service_request: SERVICE_DEVICE_CONFIGURATION_REQUEST,
            service_ack: SERVICE_DEVICE_CONFIGURATION_ACK,
            max_send_attempts: 4,
            response_timeout: Duration::from_secs(10),
            protocol_version: KNXNETIP_VERSION_10,
        }
    }
}

/// Options for establishing a connection.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// Local bind endpoint for UDP; ignored for TCP.
    pub local_endpoint: SocketAddr,
    /// Server control endpoint; must not be a multicast address.
    pub server: SocketAddr,
    /// Connect request information (connection type + parameters).
    pub cri: Cri,
    /// NAT-aware mode: advertise a wildcard endpoint and adopt the observed
    /// source of the connect response as data endpoint.
    pub nat_aware: bool,
    /// Connection-kind parameters.
    pub profile: ConnectionProfile,
    /// Heartbeat timing.
    pub heartbeat: HeartbeatConfig,
}

impl ConnectOptions {
    /// Options for a link-layer tunneling connection.
    pub fn tunneling(local_endpoint: SocketAddr, server: SocketAddr) -> Self {
        Self {
            local_endpoint,
            server,
            cri: Cri::tunnel_link_layer(),
            nat_aware: false,
            profile: ConnectionProfile::tunneling(),
            heartbeat: HeartbeatConfig::default(),
        }
    }

    /// Options for a device-management connection.
    pub fn device_management(local_endpoint: SocketAddr, server: SocketAddr) -> Self {
        Self {
            local_endpoint,
            server,
            cri: Cri::device_management(),
            nat_aware: false,
            profile: ConnectionProfile::device_management(),
            heartbeat: HeartbeatConfig::default(),
        }
    }

    /// Enable or disable NAT-aware mode.
    pub fn nat_aware(mut self, nat_aware: bool) -> Self {
        self.nat_aware = nat_aware;
        self
    }
}

/// Who initiated the close of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseInitiator {
    /// Local user request.
    User,
    /// Server-sent disconnect request.
    Server,
    /// Engine-internal cause (heartbeat exhaustion, transport error, ...).
    Internal,
}

/// Events delivered to the application.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// cEMI payload of an inbound service request, delivered in arrival order.
    Frame(Vec<u8>),
    /// The connection reached its terminal state.
    Closed {
        /// Who initiated the close.
        initiator: CloseInitiator,
        /// Close reason, e.g. "server request" or "no heartbeat response".
        reason: String,
    },
}

/// Log level for the close message.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Severity {
    Info,
    Warn,
    Error,
}

/// A client connection to a KNXnet/IP server.
///
/// Cheap to clone via its internal `Arc`; dropped handles do not close the
/// channel, call [`Connection::close`] for an orderly shutdown.
#[derive(Debug, Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

#[derive(Debug)]
pub(crate) struct ConnectionInner {
    pub(crate) profile: ConnectionProfile,
    pub(crate) heartbeat_cfg: HeartbeatConfig,
    pub(crate) transport: LinkTransport,
    /// Server control endpoint; disconnects and heartbeats go here, and
    /// disconnect requests are only honored from here.
    pub(crate) ctrl_endpoint: SocketAddr,
    /// Local HPAI advertised in handshake and heartbeat (route-back for TCP,
    /// wildcard in NAT mode).
    pub(crate) local_hpai: Hpai,
    nat_aware: bool,
    pub(crate) cell: StateCell,
    pub(crate) heartbeat: HeartbeatSignal,
    /// Cooperative stop signal for receiver and heartbeat tasks.
    pub(crate) stop: watch::Sender<bool>,
    /// One-shot cleanup guard.
    cleaned: AtomicBool,
    /// Serializes callers so at most one request is in flight.
    send_gate: tokio::sync::Mutex<()>,
    events: mpsc::UnboundedSender<ConnectionEvent>,
}

impl Connection {
    /// Open a UDP connection: bind the local endpoint, perform the connect
    /// handshake, and start receiver and heartbeat.
    ///
    /// On any failure the state is CLOSED and the socket released before the
    /// error is returned.
    pub async fn open(
        options: ConnectOptions,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ConnectionEvent>)> {
        validate_server(options.server)?;

        let socket = Arc::new(UdpSocket::bind(options.local_endpoint).await?);
        let local = resolve_local(socket.local_addr()?, options.server, options.nat_aware).await?;
        if local.ip().is_loopback() {
            warn!(
                "local endpoint uses loopback address ({}), try a different IP address",
                local.ip()
            );
        }

        let local_hpai = if options.nat_aware {
            Hpai::new([0; 4], 0)
        } else {
            Hpai::from_endpoint(local)?
        };

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(ConnectionInner {
            profile: options.profile,
            heartbeat_cfg: options.heartbeat,
            transport: LinkTransport::Udp(Arc::clone(&socket)),
            ctrl_endpoint: options.server,
            local_hpai,
            nat_aware: options.nat_aware,
            cell: StateCell::new(),
            heartbeat: HeartbeatSignal::default(),
            stop: watch::channel(false).0,
            cleaned: AtomicBool::new(false),
            send_gate: tokio::sync::Mutex::new(()),
            events: events_tx,
        });

        // receiver must run before the request leaves
        tokio::spawn(receiver_loop(Arc::clone(&inner), socket));

        let guard = ConnectGuard::new(&inner);
        inner.establish(options.cri).await?;
        guard.disarm();
        Ok((Self { inner }, events_rx))
    }

    /// Open a connection over a shared TCP stream.
    ///
    /// The stream outlives the connection: this registers interest for the
    /// duration of the channel and unregisters on cleanup, it never closes
    /// the stream.
    pub async fn open_tcp(
        tcp: Arc<TcpConnection>,
        options: ConnectOptions,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ConnectionEvent>)> {
        let server = tcp.server();
        validate_server(server)?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(ConnectionInner {
            profile: options.profile,
            heartbeat_cfg: options.heartbeat,
            transport: LinkTransport::Tcp(Arc::clone(&tcp)),
            ctrl_endpoint: server,
            local_hpai: Hpai::TCP,
            nat_aware: false,
            cell: StateCell::new(),
            heartbeat: HeartbeatSignal::default(),
            stop: watch::channel(false).0,
            cleaned: AtomicBool::new(false),
            send_gate: tokio::sync::Mutex::new(()),
            events: events_tx,
        });

        let token = tcp.register_connect(frames_tx.clone());
        tokio::spawn(feed_loop(Arc::clone(&inner), frames_rx));

        let guard = ConnectGuard::new(&inner);
        let result = inner.establish(options.cri).await;
        tcp.unregister_connect(token);
        result?;
        guard.disarm();

        let channel_id = inner.cell.snapshot().channel_id;
        tcp.register_channel(channel_id, frames_tx);
        Ok((Self { inner }, events_rx))
    }

    /// Send a cEMI frame as a sequenced service request and wait for the
    /// acknowledgment (UDP) and the cEMI confirmation.
    ///
    /// Sends are serialized; at most one request is in flight. A failed send
    /// (ack timeout, peer-reported ack error, confirmation timeout) leaves
    /// the connection OK and does not advance the sequence counter; only
    /// transport errors close the connection.
    pub async fn send(&self, cemi: &[u8]) -> Result<()> {
        let inner = &self.inner;
        let _gate = inner.send_gate.lock().await;

        let snapshot = inner.cell.snapshot();
        match snapshot.state {
            ConnState::Ok => {}
            ConnState::Closed | ConnState::Closing => return Err(inner.closed_error()),
            other => {
                debug!("send rejected in state '{}'", other.describe());
                return Err(KnxError::IllegalState("connection not ready to send"));
            }
        }

        let sequence = snapshot.seq_send;
        let request = ServiceRequest::new(
            inner.profile.service_request,
            snapshot.channel_id,
            sequence,
            cemi,
        )
        .to_packet(inner.profile.protocol_version);
        let destination = snapshot.data_endpoint;

        if inner.transport.is_stream() {
            // no service acks over a stream: the ack wait is bypassed. The
            // pending state is entered before the request leaves so a fast
            // confirmation cannot be missed.
            inner.cell.modify(|s| s.state = ConnState::CemiConPending);
            if let Err(e) = inner.transport.send(&request, None).await {
                inner.cleanup(CloseInitiator::Internal, "communication failure", Severity::Error);
                return Err(e.into());
            }
        } else {
            inner.cell.modify(|s| s.state = ConnState::AckPending);
            let mut attempt = 0;
            let acked = loop {
                attempt += 1;
                trace!("sending service request seq {sequence}, attempt {attempt}");
                if let Err(e) = inner.transport.send(&request, destination).await {
                    inner.cleanup(
                        CloseInitiator::Internal,
                        "communication failure",
                        Severity::Error,
                    );
                    return Err(e.into());
                }
                if inner.cell.wait_while(ConnState::AckPending, inner.profile.response_timeout).await
                {
                    break true;
                }
                if attempt >= inner.profile.max_send_attempts {
                    break false;
                }
            };

            if !acked {
                inner.cell.modify(|s| {
                    if s.state == ConnState::AckPending {
                        s.state = ConnState::Ok;
                    }
                });
                return Err(KnxError::timeout(format!(
                    "no acknowledgment from {} after {} attempts",
                    inner.ctrl_endpoint, inner.profile.max_send_attempts
                )));
            }

            let after = inner.cell.snapshot();
            match after.state {
                // Ok here means the confirmation already overtook this task
                ConnState::CemiConPending | ConnState::Ok => {}
                ConnState::AckError => {
                    inner.cell.modify(|s| {
                        if s.state == ConnState::AckError {
                            s.state = ConnState::Ok;
                        }
                    });
                    return Err(KnxError::remote(inner.ctrl_endpoint, after.status));
                }
                ConnState::Closed | ConnState::Closing => return Err(inner.closed_error()),
                other => {
                    debug!("unexpected state '{}' after acknowledgment", other.describe());
                    return Err(KnxError::IllegalState("unexpected state after acknowledgment"));
                }
            }
        }

        // blocking mode is wait for .con
        if !inner.cell.wait_while(ConnState::CemiConPending, CONFIRMATION_TIMEOUT).await {
            inner.cell.modify(|s| {
                if s.state == ConnState::CemiConPending {
                    s.state = ConnState::Ok;
                }
            });
            warn!("response timeout waiting for confirmation");
            return Err(KnxError::timeout(format!(
                "no confirmation from {} within {} s",
                inner.ctrl_endpoint,
                CONFIRMATION_TIMEOUT.as_secs()
            )));
        }

        match inner.cell.state() {
            ConnState::Closed => Err(inner.closed_error()),
            _ => Ok(()),
        }
    }

    /// Orderly close: send a disconnect request, wait a bounded time for the
    /// response, then clean up. Idempotent.
    pub async fn close(&self) -> Result<()> {
        self.inner.close_connection(CloseInitiator::User, "user request", Severity::Info).await;
        Ok(())
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnState {
        self.inner.cell.state()
    }

    /// Server-assigned channel ID; 0 when unassigned or closed.
    pub fn channel_id(&self) -> u8 {
        self.inner.cell.snapshot().channel_id
    }

    /// Individual address assigned by a tunneling server, if any.
    pub fn tunneling_address(&self) -> Option<IndividualAddress> {
        self.inner.cell.snapshot().tunneling_address
    }

    /// Server control endpoint.
    pub fn server(&self) -> SocketAddr {
        self.inner.ctrl_endpoint
    }
}

impl ConnectionInner {
    /// Drive the connect handshake: CLOSED → CONNECTING → OK, or fail with
    /// everything cleaned up.
    async fn establish(self: &Arc<Self>, cri: Cri) -> Result<()> {
        if self.cell.state() != ConnState::Closed {
            return Err(KnxError::IllegalState("open connection"));
        }
        self.cell.modify(|s| s.state = ConnState::Connecting);

        let stream = self.transport.is_stream();
        let local = self
            .transport
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "?".into());
        debug!(
            "establish connection from {local} to {} ({})",
            self.ctrl_endpoint,
            if stream { "tcp" } else { "udp" }
        );

        let request = ConnectRequest::new(cri, self.local_hpai, self.local_hpai)
            .to_packet(self.profile.protocol_version);
        if let Err(e) = self.transport.send(&request, Some(self.ctrl_endpoint)).await {
            let msg = format!("connecting from {local} to {}: {e}", self.ctrl_endpoint);
            self.connect_cleanup(&msg);
            return Err(e.into());
        }

        debug!("wait for connect response from {} ...", self.ctrl_endpoint);
        let changed = self.cell.wait_while(ConnState::Connecting, CONNECT_REQ_TIMEOUT).await;
        let snapshot = self.cell.snapshot();
        if snapshot.state == ConnState::Ok {
            tokio::spawn(heartbeat::run(Arc::clone(self)));
            let endpoint = snapshot
                .data_endpoint
                .map(|ep| ep.to_string())
                .unwrap_or_else(|| "?".into());
            let tunneling = snapshot
                .tunneling_address
                .map(|addr| format!(", tunneling address {addr}"))
                .unwrap_or_default();
            info!(
                "connection established (data endpoint {endpoint}, channel {}{tunneling})",
                snapshot.channel_id
            );
            return Ok(());
        }

        let err = if !changed {
            KnxError::timeout(format!("connecting to control endpoint {}", self.ctrl_endpoint))
        } else if snapshot.state == ConnState::AckError {
            KnxError::remote(self.ctrl_endpoint, snapshot.status)
        } else {
            let details = if snapshot.status.is_empty() {
                "unexpected connect response".into()
            } else {
                snapshot.status
            };
            KnxError::invalid_response(self.ctrl_endpoint, details)
        };
        self.connect_cleanup(&err.to_string());
        Err(err)
    }

    /// Failure path of [`Self::establish`]: stop the receiver, release the
    /// socket, reach CLOSED.
    fn connect_cleanup(&self, message: &str) {
        if self.cleaned.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.stop.send(true);
        if let LinkTransport::Tcp(conn) = &self.transport {
            let channel_id = self.cell.snapshot().channel_id;
            if channel_id != 0 {
                conn.unregister_channel(channel_id);
            }
        }
        self.cell.modify(|s| {
            s.state = ConnState::Closed;
            s.channel_id = 0;
        });
        error!("establishing connection failed, {message}");
    }

    /// One-shot teardown: stop heartbeat and receiver, release the transport
    /// registration, reach CLOSED, notify the application.
    ///
    /// Concurrent invocations collapse to the first. The UDP socket is
    /// released when the stopped receiver drops its handle, which also
    /// unblocks any in-flight socket read.
    pub(crate) fn cleanup(&self, initiator: CloseInitiator, reason: &str, severity: Severity) {
        if self.cleaned.swap(true, Ordering::SeqCst) {
            return;
        }
        match severity {
            Severity::Info => info!("close connection - {reason}"),
            Severity::Warn => warn!("close connection - {reason}"),
            Severity::Error => error!("close connection - {reason}"),
        }

        let _ = self.stop.send(true);
        if let LinkTransport::Tcp(conn) = &self.transport {
            let channel_id = self.cell.snapshot().channel_id;
            if channel_id != 0 {
                conn.unregister_channel(channel_id);
            }
        }
        self.cell.modify(|s| {
            s.state = ConnState::Closed;
            s.channel_id = 0;
        });
        let _ = self
            .events
            .send(ConnectionEvent::Closed { initiator, reason: reason.to_string() });
    }

    pub(crate) async fn close_connection(
        &self,
        initiator: CloseInitiator,
        reason: &str,
        severity: Severity,
    ) {
        let proceed = self.cell.modify(|s| {
            if s.state == ConnState::Closed || s.closing != 0 {
                false
            } else {
                s.closing = 1;
                s.state = ConnState::Closing;
                true
            }
        });
        if !proceed {
            return;
        }

        let channel_id = self.cell.snapshot().channel_id;
        let request = DisconnectRequest::new(channel_id, self.local_hpai)
            .to_packet(self.profile.protocol_version);
        if let Err(e) = self.transport.send(&request, Some(self.ctrl_endpoint)).await {
            warn!("sending disconnect request failed: {e}");
        }

        if !self.cell.wait_while(ConnState::Closing, CONNECT_REQ_TIMEOUT).await {
            debug!("no disconnect response from {} - closing anyway", self.ctrl_endpoint);
        }
        self.cleanup(initiator, reason, severity);
    }

    fn closed_error(&self) -> KnxError {
        let status = self.cell.snapshot().status;
        KnxError::ConnectionClosed {
            reason: if status.is_empty() { "connection closed".into() } else { status },
        }
    }

    /// Service dispatch for one inbound frame. Returns whether the frame was
    /// handled; unknown services are left to the caller to log.
    pub(crate) async fn handle_frame(
        &self,
        header: KnxnetIpHeader,
        body: &[u8],
        source: SocketAddr,
    ) -> bool {
        if header.protocol_version != self.profile.protocol_version {
            self.cell.modify(|s| s.status = "protocol version changed".into());
            self.cleanup(CloseInitiator::Internal, "protocol version changed", Severity::Error);
            return true;
        }

        let svc = header.service_type;
        if svc == SERVICE_CONNECT_REQUEST {
            warn!("received connect request - ignored");
        } else if svc == SERVICE_CONNECT_RESPONSE {
            self.on_connect_response(body, source);
        } else if svc == SERVICE_CONNECTIONSTATE_REQUEST {
            warn!("received connection state request - ignored");
        } else if svc == SERVICE_CONNECTIONSTATE_RESPONSE {
            match ConnectionStateResponse::parse(body) {
                Ok(response) => self.heartbeat.set_response(&response),
                Err(e) => warn!("invalid connection state response: {e} - dropped"),
            }
        } else if svc == SERVICE_DISCONNECT_REQUEST {
            if source == self.ctrl_endpoint {
                self.on_disconnect_request(body).await;
            } else {
                warn!("disconnect request from foreign endpoint {source} - ignored");
            }
        } else if svc == SERVICE_DISCONNECT_RESPONSE {
            self.on_disconnect_response(body);
        } else if svc == self.profile.service_ack {
            // over a stream, service acks are neither expected nor evaluated
            if !self.transport.is_stream() {
                self.on_service_ack(body);
            }
        } else if svc == self.profile.service_request {
            self.on_service_request(body).await;
        } else {
            return false;
        }
        true
    }

    fn on_connect_response(&self, body: &[u8], source: SocketAddr) {
        if self.cell.state() != ConnState::Connecting {
            debug!("connect response from {source} outside establishment - ignored");
            return;
        }

        let response = match ConnectResponse::parse(body) {
            Ok(response) => response,
            Err(e) => {
                self.cell.modify(|s| {
                    s.status = format!("invalid connect response ({e})");
                    s.state = ConnState::UnknownError;
                });
                return;
            }
        };

        let stream = self.transport.is_stream();
        let expected_protocol = if stream { IPV4_TCP } else { IPV4_UDP };
        if response.status == E_NO_ERROR {
            if let Some(endpoint) = response
                .data_endpoint
                .filter(|ep| ep.host_protocol == expected_protocol)
            {
                let data_endpoint = if stream {
                    if !endpoint.is_route_back() {
                        let msg = format!(
                            "connect response from {source} does not contain route-back data endpoint"
                        );
                        self.cell.modify(|s| s.status.clone_from(&msg));
                        self.cleanup(CloseInitiator::Internal, &msg, Severity::Error);
                        return;
                    }
                    source
                } else if self.nat_aware && (endpoint.is_unspecified() || endpoint.port == 0) {
                    // NAT aware mode: an incomplete data endpoint falls back
                    // to the observed sender
                    source
                } else {
                    endpoint.endpoint()
                };

                let tunneling_address =
                    response.crd.as_ref().and_then(|crd| crd.tunneling_address());
                self.cell.modify(|s| {
                    s.channel_id = response.channel_id;
                    s.data_endpoint = Some(data_endpoint);
                    s.tunneling_address = tunneling_address;
                    s.state = ConnState::Ok;
                });
                return;
            }
        }

        let status = match response.data_endpoint {
            Some(ep) if !stream && ep.host_protocol != IPV4_UDP => {
                "server does not agree with UDP/IP".to_string()
            }
            Some(ep) if stream && ep.host_protocol != IPV4_TCP => {
                "server does not agree with TCP/IP".to_string()
            }
            None if response.status == E_NO_ERROR => {
                "connect response without data endpoint".to_string()
            }
            _ => status_message(response.status),
        };
        self.cell.modify(|s| {
            s.status = status;
            s.state = ConnState::AckError;
        });
    }

    fn on_service_ack(&self, body: &[u8]) {
        let ack = match ServiceAck::parse(self.profile.service_ack, body) {
            Ok(ack) => ack,
            Err(e) => {
                warn!("invalid service acknowledgment: {e} - dropped");
                return;
            }
        };

        let snapshot = self.cell.snapshot();
        if ack.channel_id != snapshot.channel_id {
            warn!(
                "acknowledgment for wrong channel {} (expected {}) - ignored",
                ack.channel_id, snapshot.channel_id
            );
            return;
        }
        if snapshot.state != ConnState::AckPending {
            debug!("service acknowledgment (seq {}) with no request pending - ignored", ack.sequence);
            return;
        }
        if ack.sequence != snapshot.seq_send {
            warn!(
                "received service acknowledgment with wrong send sequence {}, expected {} - ignored",
                ack.sequence, snapshot.seq_send
            );
            return;
        }

        self.cell.modify(|s| {
            if ack.status == E_NO_ERROR {
                s.seq_send = s.seq_send.wrapping_add(1);
                s.state = ConnState::CemiConPending;
            } else {
                s.status = status_message(ack.status);
                s.state = ConnState::AckError;
            }
        });
        trace!(
            "received service ack {} from {} (channel {})",
            ack.sequence,
            self.ctrl_endpoint,
            snapshot.channel_id
        );
        if ack.status != E_NO_ERROR {
            warn!("received service acknowledgment status {}", status_message(ack.status));
        }
    }

    async fn on_service_request(&self, body: &[u8]) {
        let request = match ServiceRequest::parse(self.profile.service_request, body) {
            Ok(request) => request,
            Err(e) => {
                warn!("invalid service request: {e} - dropped");
                return;
            }
        };

        let snapshot = self.cell.snapshot();
        if request.connection_header.channel_id != snapshot.channel_id {
            warn!(
                "service request for wrong channel {} (expected {}) - ignored",
                request.connection_header.channel_id, snapshot.channel_id
            );
            return;
        }

        let sequence = request.connection_header.sequence;
        if sequence == snapshot.seq_rcv {
            self.cell.modify(|s| s.seq_rcv = s.seq_rcv.wrapping_add(1));
            // acknowledge before delivery, so ordering towards the peer holds
            self.send_ack(sequence).await;
            let confirmed = self.cell.modify(|s| {
                if s.state == ConnState::CemiConPending {
                    s.state = ConnState::Ok;
                    true
                } else {
                    false
                }
            });
            if confirmed {
                trace!("received cEMI confirmation (seq {sequence})");
            }
            let _ = self.events.send(ConnectionEvent::Frame(request.cemi.to_vec()));
        } else if sequence == snapshot.seq_rcv.wrapping_sub(1) {
            // re-sent frame: acknowledge again, do not re-deliver
            debug!("duplicate service request (seq {sequence}) - acknowledged, not delivered");
            self.send_ack(sequence).await;
        } else {
            warn!(
                "service request with wrong receive sequence {sequence}, expected {} - ignored",
                snapshot.seq_rcv
            );
        }
    }

    async fn send_ack(&self, sequence: u8) {
        if self.transport.is_stream() {
            return;
        }
        let snapshot = self.cell.snapshot();
        let ack = ServiceAck::new(self.profile.service_ack, snapshot.channel_id, sequence, E_NO_ERROR)
            .to_packet(self.profile.protocol_version);
        let destination = snapshot.data_endpoint.unwrap_or(self.ctrl_endpoint);
        if let Err(e) = self.transport.send(&ack, Some(destination)).await {
            warn!("communication failure sending acknowledgment: {e}");
            self.cleanup(CloseInitiator::Internal, "communication failure", Severity::Error);
        }
    }

    async fn on_disconnect_request(&self, body: &[u8]) {
        let request = match DisconnectRequest::parse(body) {
            Ok(request) => request,
            Err(e) => {
                warn!("invalid disconnect request: {e} - dropped");
                return;
            }
        };

        // requests with wrong channel ID are ignored, conforming to the protocol
        let channel_id = self.cell.snapshot().channel_id;
        if request.channel_id != channel_id {
            return;
        }

        let response = DisconnectResponse::new(channel_id, E_NO_ERROR)
            .to_packet(self.profile.protocol_version);
        if let Err(e) = self.transport.send(&response, Some(self.ctrl_endpoint)).await {
            warn!("communication failure: {e}");
        }
        self.cleanup(CloseInitiator::Server, "server request", Severity::Info);
    }

    fn on_disconnect_response(&self, body: &[u8]) {
        match DisconnectResponse::parse(body) {
            Ok(response) if response.status != E_NO_ERROR => {
                warn!(
                    "received disconnect response status 0x{:02x} ({})",
                    response.status,
                    status_message(response.status)
                );
            }
            Ok(_) => {}
            Err(e) => warn!("invalid disconnect response: {e} - dropped"),
        }
        // finalize a locally initiated close
        self.cell.modify(|s| {
            if s.closing == 1 {
                s.closing = 2;
                s.state = ConnState::Closed;
            }
        });
    }

    /// Decode one datagram (exactly one frame) and dispatch it.
    pub(crate) async fn process_datagram(&self, data: &[u8], source: SocketAddr) {
        let frame = match KnxnetIpFrame::parse(data) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("malformed frame from {source}: {e} - dropped");
                return;
            }
        };
        if frame.data().len() < data.len() {
            debug!("datagram from {source} carries trailing bytes - ignored");
        }

        let header = *frame.header();
        if !self.handle_frame(header, frame.body(), source).await {
            debug!(
                "unhandled service type 0x{:04x} ({:?}) from {source}",
                header.service_type,
                ServiceType::from_u16(header.service_type)
            );
        }
    }
}

/// Drop guard covering the connect handshake: if the `open` future is
/// cancelled mid-wait, the receiver is still stopped, the socket released,
/// and the terminal state reached. Cancelling a blocked connect by tearing
/// down its transport is the engine's cancellation mechanism throughout.
struct ConnectGuard<'a> {
    inner: &'a Arc<ConnectionInner>,
    armed: bool,
}

impl<'a> ConnectGuard<'a> {
    fn new(inner: &'a Arc<ConnectionInner>) -> Self {
        Self { inner, armed: true }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for ConnectGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.inner.connect_cleanup("connect cancelled");
        }
    }
}

/// Substitute a wildcard bind address with the interface address the OS
/// routes towards the server, so the advertised HPAI is reachable. In NAT
/// mode the wildcard is advertised as-is.
async fn resolve_local(
    local: SocketAddr,
    server: SocketAddr,
    nat_aware: bool,
) -> Result<SocketAddr> {
    if nat_aware || !local.ip().is_unspecified() {
        return Ok(local);
    }
    let probe = UdpSocket::bind(SocketAddr::new(local.ip(), 0)).await?;
    probe.connect(server).await?;
    Ok(SocketAddr::new(probe.local_addr()?.ip(), local.port()))
}

fn validate_server(server: SocketAddr) -> Result<()> {
    if server.ip().is_multicast() {
        return Err(KnxError::InvalidArgument(format!(
            "server control endpoint cannot be a multicast address ({})",
            server.ip()
        )));
    }
    if server.port() == 0 {
        return Err(KnxError::InvalidArgument(format!(
            "server control endpoint has no port: {server}"
        )));
    }
    Ok(())
}

/// UDP receiver: one frame per datagram, in arrival order.
///
/// Stopping is cooperative; once the stop signal is set, a socket error is a
/// normal shutdown rather than a failure.
async fn receiver_loop(inner: Arc<ConnectionInner>, socket: Arc<UdpSocket>) {
    let mut stop = inner.stop.subscribe();
    let mut buf = [0u8; MAX_FRAME_SIZE];
    loop {
        tokio::select! {
            _ = async { stop.wait_for(|stopped| *stopped).await.is_ok() } => break,
            result = socket.recv_from(&mut buf) => match result {
                Ok((len, source)) => inner.process_datagram(&buf[..len], source).await,
                Err(e) => {
                    if *inner.stop.borrow() {
                        break;
                    }
                    warn!("receive failed: {e}");
                    inner.cleanup(CloseInitiator::Internal, "communication failure", Severity::Error);
                    break;
                }
            }
        }
    }
}

/// Inbound pump for the shared-stream transport.
async fn feed_loop(
    inner: Arc<ConnectionInner>,
    mut frames: mpsc::UnboundedReceiver<FrameEvent>,
) {
    let mut stop = inner.stop.subscribe();
    loop {
        tokio::select! {
            _ = async { stop.wait_for(|stopped| *stopped).await.is_ok() } => break,
            event = frames.recv() => match event {
                Some(FrameEvent::Frame { header, body, source }) => {
                    if !inner.handle_frame(header, &body, source).await {
                        debug!(
                            "unhandled service type 0x{:04x} ({:?}) from {source}",
                            header.service_type,
                            ServiceType::from_u16(header.service_type)
                        );
                    }
                }
                Some(FrameEvent::Closed) | None => {
                    inner.cleanup(
                        CloseInitiator::Internal,
                        "stream connection closed",
                        Severity::Error,
                    );
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::mock::MockTransport;
    use crate::protocol::frame::KnxnetIpFrame;
    use crate::protocol::services::{ConnectionStateRequest, Crd};

    const CHANNEL: u8 = 42;

    fn server() -> SocketAddr {
        "192.0.2.1:3671".parse().expect("static address")
    }

    fn fast_profile() -> ConnectionProfile {
        ConnectionProfile {
            response_timeout: Duration::from_millis(100),
            ..ConnectionProfile::tunneling()
        }
    }

    /// Connection in OK state over a mock transport, bypassing the handshake.
    fn established(
        profile: ConnectionProfile,
    ) -> (Connection, MockTransport, mpsc::UnboundedReceiver<ConnectionEvent>) {
        let mock = MockTransport::new();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(ConnectionInner {
            profile,
            heartbeat_cfg: HeartbeatConfig::default(),
            transport: LinkTransport::Mock(mock.clone()),
            ctrl_endpoint: server(),
            local_hpai: Hpai::new([192, 0, 2, 2], 50000),
            nat_aware: false,
            cell: StateCell::new(),
            heartbeat: HeartbeatSignal::default(),
            stop: watch::channel(false).0,
            cleaned: AtomicBool::new(false),
            send_gate: tokio::sync::Mutex::new(()),
            events: events_tx,
        });
        inner.cell.modify(|s| {
            s.state = ConnState::Ok;
            s.channel_id = CHANNEL;
            s.data_endpoint = Some(server());
        });
        (Connection { inner }, mock, events_rx)
    }

    fn header_for(packet: &[u8]) -> (KnxnetIpHeader, Vec<u8>) {
        let frame = KnxnetIpFrame::parse(packet).expect("valid test frame");
        (*frame.header(), frame.body().to_vec())
    }

    async fn feed(conn: &Connection, packet: &[u8], source: SocketAddr) -> bool {
        let (header, body) = header_for(packet);
        conn.inner.handle_frame(header, &body, source).await
    }

    #[tokio::test]
    async fn ack_advances_sequence_and_state() {
        let (conn, _mock, _events) = established(fast_profile());
        conn.inner.cell.modify(|s| s.state = ConnState::AckPending);

        let ack = ServiceAck::new(SERVICE_TUNNELING_ACK, CHANNEL, 0, 0).to_packet(0x10);
        assert!(feed(&conn, &ack, server()).await);

        let shared = conn.inner.cell.snapshot();
        assert_eq!(shared.state, ConnState::CemiConPending);
        assert_eq!(shared.seq_send, 1);
    }

    #[tokio::test]
    async fn ack_with_wrong_sequence_is_ignored() {
        let (conn, _mock, _events) = established(fast_profile());
        conn.inner.cell.modify(|s| s.state = ConnState::AckPending);

        let ack = ServiceAck::new(SERVICE_TUNNELING_ACK, CHANNEL, 5, 0).to_packet(0x10);
        feed(&conn, &ack, server()).await;

        let shared = conn.inner.cell.snapshot();
        assert_eq!(shared.state, ConnState::AckPending);
        assert_eq!(shared.seq_send, 0);
    }

    #[tokio::test]
    async fn ack_with_wrong_channel_is_ignored() {
        let (conn, _mock, _events) = established(fast_profile());
        conn.inner.cell.modify(|s| s.state = ConnState::AckPending);

        let ack = ServiceAck::new(SERVICE_TUNNELING_ACK, CHANNEL + 1, 0, 0).to_packet(0x10);
        feed(&conn, &ack, server()).await;

        assert_eq!(conn.inner.cell.state(), ConnState::AckPending);
    }

    #[tokio::test]
    async fn ack_error_keeps_counter() {
        let (conn, _mock, _events) = established(fast_profile());
        conn.inner.cell.modify(|s| s.state = ConnState::AckPending);

        let ack = ServiceAck::new(SERVICE_TUNNELING_ACK, CHANNEL, 0, 0x21).to_packet(0x10);
        feed(&conn, &ack, server()).await;

        let shared = conn.inner.cell.snapshot();
        assert_eq!(shared.state, ConnState::AckError);
        assert_eq!(shared.seq_send, 0);
        assert!(shared.status.contains("no active data connection"));
    }

    #[tokio::test]
    async fn sequence_wraps_at_256() {
        let (conn, _mock, _events) = established(fast_profile());
        conn.inner.cell.modify(|s| {
            s.state = ConnState::AckPending;
            s.seq_send = 255;
        });

        let ack = ServiceAck::new(SERVICE_TUNNELING_ACK, CHANNEL, 255, 0).to_packet(0x10);
        feed(&conn, &ack, server()).await;

        assert_eq!(conn.inner.cell.snapshot().seq_send, 0);
    }

    #[tokio::test]
    async fn inbound_request_is_acked_then_delivered() {
        let (conn, mock, mut events) = established(fast_profile());

        let cemi = [0x29, 0x00, 0xBC, 0xE0];
        let request = ServiceRequest::new(SERVICE_TUNNELING_REQUEST, CHANNEL, 0, &cemi)
            .to_packet(0x10);
        feed(&conn, &request, server()).await;

        let sent = mock.sent_packets();
        assert_eq!(sent.len(), 1);
        let ack_frame = KnxnetIpFrame::parse(&sent[0].0).unwrap();
        assert_eq!(ack_frame.service_type(), SERVICE_TUNNELING_ACK);
        let ack = ServiceAck::parse(SERVICE_TUNNELING_ACK, ack_frame.body()).unwrap();
        assert_eq!(ack.channel_id, CHANNEL);
        assert_eq!(ack.sequence, 0);
        assert_eq!(ack.status, 0);

        match events.recv().await {
            Some(ConnectionEvent::Frame(payload)) => assert_eq!(payload, cemi),
            other => panic!("expected frame event, got {other:?}"),
        }
        assert_eq!(conn.inner.cell.snapshot().seq_rcv, 1);
    }

    #[tokio::test]
    async fn duplicate_inbound_request_reacked_not_redelivered() {
        let (conn, mock, mut events) = established(fast_profile());

        let cemi = [0x29, 0x00];
        let request = ServiceRequest::new(SERVICE_TUNNELING_REQUEST, CHANNEL, 0, &cemi)
            .to_packet(0x10);
        feed(&conn, &request, server()).await;
        feed(&conn, &request, server()).await; // re-sent frame

        assert_eq!(mock.sent_packets().len(), 2); // two acks
        assert_eq!(conn.inner.cell.snapshot().seq_rcv, 1);

        assert!(matches!(events.recv().await, Some(ConnectionEvent::Frame(_))));
        assert!(events.try_recv().is_err(), "duplicate must not be re-delivered");
    }

    #[tokio::test]
    async fn inbound_request_confirms_pending_send() {
        let (conn, _mock, _events) = established(fast_profile());
        conn.inner.cell.modify(|s| s.state = ConnState::CemiConPending);

        let request = ServiceRequest::new(SERVICE_TUNNELING_REQUEST, CHANNEL, 0, &[0x2E, 0x00])
            .to_packet(0x10);
        feed(&conn, &request, server()).await;

        assert_eq!(conn.inner.cell.state(), ConnState::Ok);
    }

    #[tokio::test]
    async fn send_times_out_after_max_attempts() {
        let (conn, mock, _events) = established(fast_profile());

        let err = conn.send(&[0x11, 0x00]).await.unwrap_err();
        assert!(err.is_timeout(), "expected timeout, got {err}");

        // first send plus one retransmission
        assert_eq!(mock.sent_packets().len(), 2);
        assert_eq!(conn.inner.cell.state(), ConnState::Ok);
        assert_eq!(conn.inner.cell.snapshot().seq_send, 0);
    }

    #[tokio::test]
    async fn send_success_with_ack_and_confirmation() {
        let (conn, mock, _events) = established(ConnectionProfile {
            response_timeout: Duration::from_millis(500),
            ..ConnectionProfile::tunneling()
        });

        let sender = {
            let conn = conn.clone();
            tokio::spawn(async move { conn.send(&[0x11, 0x00, 0xBC, 0xE0]).await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(mock.sent_packets().len(), 1);

        let ack = ServiceAck::new(SERVICE_TUNNELING_ACK, CHANNEL, 0, 0).to_packet(0x10);
        feed(&conn, &ack, server()).await;
        // echoed service request serves as the cEMI confirmation
        let confirmation =
            ServiceRequest::new(SERVICE_TUNNELING_REQUEST, CHANNEL, 0, &[0x2E, 0x00])
                .to_packet(0x10);
        feed(&conn, &confirmation, server()).await;

        sender.await.unwrap().unwrap();
        let shared = conn.inner.cell.snapshot();
        assert_eq!(shared.state, ConnState::Ok);
        assert_eq!(shared.seq_send, 1);
    }

    #[tokio::test]
    async fn send_surfaces_remote_ack_error() {
        let (conn, _mock, _events) = established(fast_profile());

        let sender = {
            let conn = conn.clone();
            tokio::spawn(async move { conn.send(&[0x11, 0x00]).await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;

        let ack = ServiceAck::new(SERVICE_TUNNELING_ACK, CHANNEL, 0, 0x26).to_packet(0x10);
        feed(&conn, &ack, server()).await;

        let err = sender.await.unwrap().unwrap_err();
        assert!(err.is_remote(), "expected remote error, got {err}");
        let shared = conn.inner.cell.snapshot();
        assert_eq!(shared.state, ConnState::Ok);
        assert_eq!(shared.seq_send, 0);
    }

    #[tokio::test]
    async fn send_rejected_when_closed() {
        let (conn, _mock, _events) = established(fast_profile());
        conn.inner.cleanup(CloseInitiator::Internal, "test close", Severity::Info);

        let err = conn.send(&[0x11]).await.unwrap_err();
        assert!(matches!(err, KnxError::ConnectionClosed { .. }));
    }

    #[tokio::test]
    async fn server_disconnect_is_answered_and_closes() {
        let (conn, mock, mut events) = established(fast_profile());

        let request =
            DisconnectRequest::new(CHANNEL, Hpai::new([192, 0, 2, 1], 3671)).to_packet(0x10);
        feed(&conn, &request, server()).await;

        let sent = mock.sent_packets();
        assert_eq!(sent.len(), 1);
        let frame = KnxnetIpFrame::parse(&sent[0].0).unwrap();
        assert_eq!(frame.service_type(), SERVICE_DISCONNECT_RESPONSE);
        let response = DisconnectResponse::parse(frame.body()).unwrap();
        assert_eq!(response.status, E_NO_ERROR);

        assert_eq!(conn.state(), ConnState::Closed);
        assert_eq!(conn.channel_id(), 0);
        match events.recv().await {
            Some(ConnectionEvent::Closed { initiator, reason }) => {
                assert_eq!(initiator, CloseInitiator::Server);
                assert_eq!(reason, "server request");
            }
            other => panic!("expected closed event, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn disconnect_from_foreign_source_is_ignored() {
        let (conn, mock, _events) = established(fast_profile());

        let request =
            DisconnectRequest::new(CHANNEL, Hpai::new([192, 0, 2, 9], 3671)).to_packet(0x10);
        let foreign: SocketAddr = "192.0.2.9:3671".parse().unwrap();
        feed(&conn, &request, foreign).await;

        assert!(mock.sent_packets().is_empty());
        assert_eq!(conn.state(), ConnState::Ok);
    }

    #[tokio::test]
    async fn disconnect_with_wrong_channel_is_ignored() {
        let (conn, mock, _events) = established(fast_profile());

        let request =
            DisconnectRequest::new(CHANNEL + 1, Hpai::new([192, 0, 2, 1], 3671)).to_packet(0x10);
        feed(&conn, &request, server()).await;

        assert!(mock.sent_packets().is_empty());
        assert_eq!(conn.state(), ConnState::Ok);
    }

    #[tokio::test]
    async fn protocol_version_change_closes() {
        let (conn, _mock, mut events) = established(fast_profile());

        let mut packet =
            ServiceRequest::new(SERVICE_TUNNELING_REQUEST, CHANNEL, 0, &[0x29]).to_packet(0x10);
        packet[1] = 0x20; // foreign protocol version
        let frame = KnxnetIpFrame::parse(&packet).unwrap();
        conn.inner.handle_frame(*frame.header(), frame.body(), server()).await;

        assert_eq!(conn.state(), ConnState::Closed);
        match events.recv().await {
            Some(ConnectionEvent::Closed { reason, .. }) => {
                assert_eq!(reason, "protocol version changed");
            }
            other => panic!("expected closed event, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn cleanup_runs_once() {
        let (conn, _mock, mut events) = established(fast_profile());

        conn.inner.cleanup(CloseInitiator::Internal, "first", Severity::Info);
        conn.inner.cleanup(CloseInitiator::Internal, "second", Severity::Info);

        assert!(matches!(
            events.recv().await,
            Some(ConnectionEvent::Closed { reason, .. }) if reason == "first"
        ));
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn heartbeat_exhaustion_closes_connection() {
        let (conn, mock, mut events) = established(fast_profile());
        let inner = Arc::clone(&conn.inner);
        let inner = Arc::new(ConnectionInner {
            heartbeat_cfg: HeartbeatConfig {
                interval: Duration::from_millis(40),
                response_timeout: Duration::from_millis(40),
                max_attempts: 4,
            },
            profile: inner.profile.clone(),
            transport: inner.transport.clone(),
            ctrl_endpoint: inner.ctrl_endpoint,
            local_hpai: inner.local_hpai,
            nat_aware: false,
            cell: StateCell::new(),
            heartbeat: HeartbeatSignal::default(),
            stop: watch::channel(false).0,
            cleaned: AtomicBool::new(false),
            send_gate: tokio::sync::Mutex::new(()),
            events: inner.events.clone(),
        });
        inner.cell.modify(|s| {
            s.state = ConnState::Ok;
            s.channel_id = CHANNEL;
        });

        tokio::spawn(heartbeat::run(Arc::clone(&inner)));
        tokio::time::sleep(Duration::from_millis(400)).await;

        let probes: Vec<_> = mock
            .sent_packets()
            .into_iter()
            .filter(|(packet, _)| {
                KnxnetIpFrame::parse(packet)
                    .map(|f| f.service_type() == SERVICE_CONNECTIONSTATE_REQUEST)
                    .unwrap_or(false)
            })
            .collect();
        assert_eq!(probes.len(), 4);
        let probe = KnxnetIpFrame::parse(&probes[0].0).unwrap();
        let request = ConnectionStateRequest::parse(probe.body()).unwrap();
        assert_eq!(request.channel_id, CHANNEL);

        assert_eq!(inner.cell.state(), ConnState::Closed);
        match events.recv().await {
            Some(ConnectionEvent::Closed { reason, .. }) => {
                assert_eq!(reason, "no heartbeat response");
            }
            other => panic!("expected closed event, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn heartbeat_response_keeps_connection_alive() {
        let (conn, mock, _events) = established(fast_profile());
        let inner = Arc::new(ConnectionInner {
            heartbeat_cfg: HeartbeatConfig {
                interval: Duration::from_millis(30),
                response_timeout: Duration::from_millis(100),
                max_attempts: 4,
            },
            profile: conn.inner.profile.clone(),
            transport: conn.inner.transport.clone(),
            ctrl_endpoint: conn.inner.ctrl_endpoint,
            local_hpai: conn.inner.local_hpai,
            nat_aware: false,
            cell: StateCell::new(),
            heartbeat: HeartbeatSignal::default(),
            stop: watch::channel(false).0,
            cleaned: AtomicBool::new(false),
            send_gate: tokio::sync::Mutex::new(()),
            events: conn.inner.events.clone(),
        });
        inner.cell.modify(|s| {
            s.state = ConnState::Ok;
            s.channel_id = CHANNEL;
        });

        tokio::spawn(heartbeat::run(Arc::clone(&inner)));

        // answer every probe as it appears
        let responder = {
            let inner = Arc::clone(&inner);
            let mock = mock.clone();
            tokio::spawn(async move {
                let mut answered = 0;
                while answered < 3 {
                    let probes = mock
                        .sent_packets()
                        .into_iter()
                        .filter(|(packet, _)| {
                            KnxnetIpFrame::parse(packet)
                                .map(|f| f.service_type() == SERVICE_CONNECTIONSTATE_REQUEST)
                                .unwrap_or(false)
                        })
                        .count();
                    if probes > answered {
                        answered = probes;
                        inner
                            .heartbeat
                            .set_response(&ConnectionStateResponse::new(CHANNEL, E_NO_ERROR));
                    }
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            })
        };

        responder.await.unwrap();
        let _ = inner.stop.send(true);
        assert_eq!(inner.cell.state(), ConnState::Ok);
    }

    #[tokio::test]
    async fn connect_response_with_tunnel_crd_yields_address() {
        let mock = MockTransport::new();
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(ConnectionInner {
            profile: fast_profile(),
            heartbeat_cfg: HeartbeatConfig::default(),
            transport: LinkTransport::Mock(mock.clone()),
            ctrl_endpoint: server(),
            local_hpai: Hpai::new([192, 0, 2, 2], 50000),
            nat_aware: false,
            cell: StateCell::new(),
            heartbeat: HeartbeatSignal::default(),
            stop: watch::channel(false).0,
            cleaned: AtomicBool::new(false),
            send_gate: tokio::sync::Mutex::new(()),
            events: events_tx,
        });
        inner.cell.modify(|s| s.state = ConnState::Connecting);

        let address = IndividualAddress::new(1, 1, 5).unwrap();
        let response = ConnectResponse::new(7, Hpai::new([192, 0, 2, 1], 3671), Crd::tunnel(address))
            .to_packet(0x10);
        let frame = KnxnetIpFrame::parse(&response).unwrap();
        inner.handle_frame(*frame.header(), frame.body(), server()).await;

        let shared = inner.cell.snapshot();
        assert_eq!(shared.state, ConnState::Ok);
        assert_eq!(shared.channel_id, 7);
        assert_eq!(shared.tunneling_address, Some(address));
        assert_eq!(shared.data_endpoint, Some(server()));
    }

    #[tokio::test]
    async fn nat_mode_adopts_observed_source() {
        let mock = MockTransport::new();
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(ConnectionInner {
            profile: fast_profile(),
            heartbeat_cfg: HeartbeatConfig::default(),
            transport: LinkTransport::Mock(mock.clone()),
            ctrl_endpoint: server(),
            local_hpai: Hpai::new([0, 0, 0, 0], 0),
            nat_aware: true,
            cell: StateCell::new(),
            heartbeat: HeartbeatSignal::default(),
            stop: watch::channel(false).0,
            cleaned: AtomicBool::new(false),
            send_gate: tokio::sync::Mutex::new(()),
            events: events_tx,
        });
        inner.cell.modify(|s| s.state = ConnState::Connecting);

        // data endpoint left empty by the server
        let response = ConnectResponse::new(
            7,
            Hpai::new([0, 0, 0, 0], 0),
            Crd::tunnel(IndividualAddress::new(1, 1, 1).unwrap()),
        )
        .to_packet(0x10);
        let observed: SocketAddr = "198.51.100.7:1234".parse().unwrap();
        let frame = KnxnetIpFrame::parse(&response).unwrap();
        inner.handle_frame(*frame.header(), frame.body(), observed).await;

        assert_eq!(inner.cell.snapshot().data_endpoint, Some(observed));
    }
}
