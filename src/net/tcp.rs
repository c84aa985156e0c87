//! Shared TCP stream connection.
//!
//! One [`TcpConnection`] carries any number of logical KNXnet/IP channels to
//! the same server. Client connections do not own the stream: they register
//! interest (first for their connect response, then for their channel ID) and
//! unregister on cleanup. A reader task parses the byte stream into frames
//! and routes each one to the registered client; writes go through a shared
//! write half.
//!
//! The stream itself is closed by dropping the last handle, never by an
//! individual client connection.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use tokio::io::AsyncReadExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::net::transport::FrameEvent;
use crate::protocol::constants::{
    SERVICE_CONNECTIONSTATE_REQUEST, SERVICE_CONNECTIONSTATE_RESPONSE, SERVICE_CONNECT_REQUEST,
    SERVICE_CONNECT_RESPONSE, SERVICE_DISCONNECT_REQUEST, SERVICE_DISCONNECT_RESPONSE,
};
use crate::protocol::frame::KnxnetIpHeader;

/// A TCP stream to a KNXnet/IP server, shared between client connections.
#[derive(Debug)]
pub struct TcpConnection {
    server: SocketAddr,
    local: SocketAddr,
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
    registry: Mutex<Registry>,
}

#[derive(Debug, Default)]
struct Registry {
    next_token: u64,
    /// Clients waiting for a connect response (no channel ID assigned yet).
    connect_waiters: HashMap<u64, mpsc::UnboundedSender<FrameEvent>>,
    /// Established clients, keyed by channel ID.
    channels: HashMap<u8, mpsc::UnboundedSender<FrameEvent>>,
}

impl TcpConnection {
    /// Open a stream to the server and start the frame reader.
    pub async fn connect(server: SocketAddr) -> io::Result<Arc<Self>> {
        let stream = TcpStream::connect(server).await?;
        let local = stream.local_addr()?;
        let (read_half, write_half) = stream.into_split();

        let conn = Arc::new(Self {
            server,
            local,
            writer: tokio::sync::Mutex::new(write_half),
            registry: Mutex::new(Registry::default()),
        });

        tokio::spawn(reader_loop(Arc::clone(&conn), read_half));
        Ok(conn)
    }

    /// Local endpoint of the stream.
    pub fn local_endpoint(&self) -> SocketAddr {
        self.local
    }

    /// Server endpoint of the stream.
    pub fn server(&self) -> SocketAddr {
        self.server
    }

    /// Write a pre-framed packet to the stream.
    pub(crate) async fn send(&self, packet: &[u8]) -> io::Result<()> {
        use tokio::io::AsyncWriteExt;
        let mut writer = self.writer.lock().await;
        writer.write_all(packet).await
    }

    /// Register interest in connect responses. Returns a token for
    /// [`Self::unregister_connect`].
    pub(crate) fn register_connect(&self, sink: mpsc::UnboundedSender<FrameEvent>) -> u64 {
        let mut reg = self.registry.lock().expect("registry lock");
        let token = reg.next_token;
        reg.next_token += 1;
        reg.connect_waiters.insert(token, sink);
        token
    }

    pub(crate) fn unregister_connect(&self, token: u64) {
        self.registry.lock().expect("registry lock").connect_waiters.remove(&token);
    }

    /// Register an established channel for frame delivery.
    pub(crate) fn register_channel(&self, channel_id: u8, sink: mpsc::UnboundedSender<FrameEvent>) {
        self.registry.lock().expect("registry lock").channels.insert(channel_id, sink);
    }

    pub(crate) fn unregister_channel(&self, channel_id: u8) {
        self.registry.lock().expect("registry lock").channels.remove(&channel_id);
    }

    fn route(&self, header: KnxnetIpHeader, body: Vec<u8>) {
        let svc = header.service_type;
        let mut reg = self.registry.lock().expect("registry lock");

        if svc == SERVICE_CONNECT_RESPONSE {
            // prune registrations whose client is gone
            reg.connect_waiters.retain(|_, sink| {
                sink.send(FrameEvent::Frame { header, body: body.clone(), source: self.server })
                    .is_ok()
            });
            return;
        }

        let Some(channel) = channel_id_of(svc, &body) else {
            debug!("cannot attribute service 0x{svc:04x} to a channel - dropped");
            return;
        };
        let delivered = match reg.channels.get(&channel) {
            Some(sink) => {
                sink.send(FrameEvent::Frame { header, body, source: self.server }).is_ok()
            }
            None => {
                debug!("no client registered for channel {channel} (service 0x{svc:04x}) - dropped");
                true
            }
        };
        if !delivered {
            reg.channels.remove(&channel);
        }
    }

    fn close_registrants(&self) {
        let mut reg = self.registry.lock().expect("registry lock");
        for sink in reg.connect_waiters.values().chain(reg.channels.values()) {
            let _ = sink.send(FrameEvent::Closed);
        }
        reg.connect_waiters.clear();
        reg.channels.clear();
    }
}

/// Position of the channel ID within the frame body, by service type.
fn channel_id_of(service_type: u16, body: &[u8]) -> Option<u8> {
    match service_type {
        // channel ID directly after the header
        SERVICE_CONNECTIONSTATE_REQUEST
        | SERVICE_CONNECTIONSTATE_RESPONSE
        | SERVICE_DISCONNECT_REQUEST
        | SERVICE_DISCONNECT_RESPONSE => body.first().copied(),
        SERVICE_CONNECT_REQUEST | SERVICE_CONNECT_RESPONSE => None,
        // sequenced data frames carry a connection header: <len> <channel> ...
        _ => body.get(1).copied(),
    }
}

async fn reader_loop(conn: Arc<TcpConnection>, mut read: OwnedReadHalf) {
    let mut header_buf = [0u8; KnxnetIpHeader::SIZE];
    loop {
        if read.read_exact(&mut header_buf).await.is_err() {
            // EOF or I/O error; either way the stream is unusable
            break;
        }
        let header = match KnxnetIpHeader::parse(&header_buf) {
            Ok(header) => header,
            Err(e) => {
                // framing is lost on a stream, nothing left to resynchronize on
                warn!("unrecoverable framing error on stream from {}: {e}", conn.server);
                break;
            }
        };
        let mut body = vec![0u8; header.body_length() as usize];
        if read.read_exact(&mut body).await.is_err() {
            break;
        }
        conn.route(header, body);
    }
    debug!("stream to {} ended", conn.server);
    conn.close_registrants();
}
