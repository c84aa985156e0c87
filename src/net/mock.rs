//! Recording transport for tests.
//!
//! Stands in for a real socket so protocol logic can be exercised without
//! network hardware: sends are recorded for inspection, inbound frames are
//! fed to the engine directly by the test.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

/// Mock transport recording every packet handed to it.
///
/// Cloning yields a handle to the same recording.
#[derive(Debug, Clone, Default)]
pub struct MockTransport {
    sent: Arc<Mutex<Vec<(Vec<u8>, Option<SocketAddr>)>>>,
}

impl MockTransport {
    /// Create a new mock transport.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record(&self, packet: &[u8], destination: Option<SocketAddr>) {
        self.sent.lock().expect("mock lock").push((packet.to_vec(), destination));
    }

    /// All packets sent so far, as `(data, destination)` pairs.
    pub fn sent_packets(&self) -> Vec<(Vec<u8>, Option<SocketAddr>)> {
        self.sent.lock().expect("mock lock").clone()
    }

    /// The last packet sent, if any.
    pub fn last_sent(&self) -> Option<(Vec<u8>, Option<SocketAddr>)> {
        self.sent.lock().expect("mock lock").last().cloned()
    }

    /// Drop the recorded history.
    pub fn clear(&self) {
        self.sent.lock().expect("mock lock").clear();
    }

    /// Fixed local address reported by the mock.
    pub fn local_addr(&self) -> SocketAddr {
        "192.0.2.2:50000".parse().expect("static address")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_in_order() {
        let mock = MockTransport::new();
        mock.record(&[0x01], None);
        mock.record(&[0x02], None);

        let sent = mock.sent_packets();
        assert_eq!(sent[0].0, vec![0x01]);
        assert_eq!(sent[1].0, vec![0x02]);

        mock.clear();
        assert!(mock.sent_packets().is_empty());
        assert!(mock.last_sent().is_none());
    }
}
