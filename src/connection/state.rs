//! Connection state tracking.
//!
//! The connection record (state, sequence counters, channel ID, endpoints,
//! textual status) lives in a single [`watch`] cell. Every mutation goes
//! through [`StateCell::modify`], which notifies waiters atomically with the
//! change; every bounded wait is a [`watch::Receiver::wait_for`] under a
//! timeout. The cell thereby serves as both the state mutex and the condition
//! variable of the engine.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::timeout;

use crate::addressing::IndividualAddress;

/// Lifecycle state of a client connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Terminal state; no further sends succeed. Also the initial state.
    Closed,
    /// Connect request sent, awaiting the connect response.
    Connecting,
    /// Channel established, idle, ready to send.
    Ok,
    /// Service request sent, awaiting the service acknowledgment (UDP only).
    AckPending,
    /// Acknowledgment received, awaiting the cEMI confirmation.
    CemiConPending,
    /// Peer reported a non-zero status on connect or acknowledgment.
    AckError,
    /// Unclassified protocol fault; no send possible.
    UnknownError,
    /// Disconnect request sent, awaiting the disconnect response.
    Closing,
}

impl ConnState {
    /// Human-readable state description for logs and errors.
    pub const fn describe(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Connecting => "connecting",
            Self::Ok => "ok (idle)",
            Self::AckPending => "waiting for acknowledgment",
            Self::CemiConPending => "cEMI.con pending",
            Self::AckError => "acknowledgment error",
            Self::UnknownError => "unknown error",
            Self::Closing => "closing",
        }
    }
}

/// The guarded connection record.
#[derive(Debug, Clone)]
pub(crate) struct Shared {
    pub state: ConnState,
    /// Server-assigned channel ID; 0 while unassigned.
    pub channel_id: u8,
    /// Outbound sequence counter (mod 256).
    pub seq_send: u8,
    /// Inbound sequence counter (mod 256).
    pub seq_rcv: u8,
    /// Data endpoint negotiated during connect.
    pub data_endpoint: Option<SocketAddr>,
    /// Last textual status reported by the peer or the engine.
    pub status: String,
    /// Individual address assigned by a tunneling server.
    pub tunneling_address: Option<IndividualAddress>,
    /// Disconnect progress: 0 = none, 1 = request sent, 2 = response seen.
    pub closing: u8,
}

impl Shared {
    fn new() -> Self {
        Self {
            state: ConnState::Closed,
            channel_id: 0,
            seq_send: 0,
            seq_rcv: 0,
            data_endpoint: None,
            status: String::new(),
            tunneling_address: None,
            closing: 0,
        }
    }
}

/// Watch cell holding the connection record.
#[derive(Debug)]
pub(crate) struct StateCell {
    tx: watch::Sender<Shared>,
}

impl StateCell {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(Shared::new());
        Self { tx }
    }

    /// Clone of the current record.
    pub fn snapshot(&self) -> Shared {
        self.tx.borrow().clone()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnState {
        self.tx.borrow().state
    }

    /// Mutate the record and notify all state waiters.
    pub fn modify<R>(&self, f: impl FnOnce(&mut Shared) -> R) -> R {
        let mut result = None;
        self.tx.send_modify(|shared| result = Some(f(shared)));
        result.expect("modify closure always runs")
    }

    /// Wait until the state differs from `state`, bounded by `duration`.
    ///
    /// Returns `true` if the state changed (including having already changed
    /// when called), `false` on timeout.
    pub async fn wait_while(&self, state: ConnState, duration: Duration) -> bool {
        let mut rx = self.tx.subscribe();
        let result = timeout(duration, rx.wait_for(|s| s.state != state)).await;
        matches!(result, Ok(Ok(_)))
    }
}
