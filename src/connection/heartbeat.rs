//! Communication heartbeat monitor.
//!
//! A single task per connection, started on entry to the OK state. Each cycle
//! it sleeps for the heartbeat interval, then probes the server with
//! connection-state requests; after `max_attempts` unanswered probes it closes
//! the connection.
//!
//! Signalling is edge-triggered: [`HeartbeatSignal::set_response`] wakes only
//! probes that are already waiting, a response arriving outside a probe window
//! is lost and the running cycle times out on its own. To keep the window
//! gap-free, the probe sender arms its wait *before* the request leaves, so a
//! response cannot slip between send and wait.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::{sleep, timeout};
use tracing::{trace, warn};

use crate::connection::{CloseInitiator, ConnectionInner, Severity};
use crate::protocol::constants::{status_message, E_NO_ERROR};
use crate::protocol::services::{ConnectionStateRequest, ConnectionStateResponse};

/// Heartbeat timing parameters.
///
/// The defaults follow the KNXnet/IP specification; tests compress them.
#[derive(Debug, Clone, Copy)]
pub struct HeartbeatConfig {
    /// Pause between probe cycles.
    pub interval: Duration,
    /// How long a single probe waits for a connection-state response.
    pub response_timeout: Duration,
    /// Consecutive unanswered probes before the connection is closed.
    pub max_attempts: u32,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            response_timeout: Duration::from_secs(10),
            max_attempts: 4,
        }
    }
}

/// Wake-up channel between service dispatch and the probe sender.
#[derive(Debug, Default)]
pub(crate) struct HeartbeatSignal {
    responded: Notify,
}

impl HeartbeatSignal {
    /// Deliver a connection-state response to a waiting probe.
    ///
    /// Only status `E_NO_ERROR` counts as success; error responses are logged
    /// and the probe keeps waiting.
    pub(crate) fn set_response(&self, response: &ConnectionStateResponse) {
        if response.status == E_NO_ERROR {
            self.responded.notify_waiters();
        } else {
            warn!(
                "connection state response: {} (channel {})",
                status_message(response.status),
                response.channel_id
            );
        }
    }
}

/// Heartbeat actor body; joined cooperatively through the connection's stop
/// signal.
pub(crate) async fn run(inner: Arc<ConnectionInner>) {
    let cfg = inner.heartbeat_cfg;
    let channel_id = inner.cell.snapshot().channel_id;
    let request = ConnectionStateRequest::new(channel_id, inner.local_hpai)
        .to_packet(inner.profile.protocol_version);
    let mut stop = inner.stop.subscribe();

    loop {
        tokio::select! {
            _ = stop.wait_for(|stopped| *stopped) => return,
            _ = sleep(cfg.interval) => {}
        }

        let mut answered = false;
        for attempt in 1..=cfg.max_attempts {
            trace!("sending connection state request, attempt {attempt}");

            let notified = inner.heartbeat.responded.notified();
            tokio::pin!(notified);
            // arm before the probe leaves so the response cannot slip between
            // send and wait
            notified.as_mut().enable();

            if let Err(e) = inner.transport.send(&request, Some(inner.ctrl_endpoint)).await {
                warn!("heartbeat send failed: {e}");
                inner.cleanup(
                    CloseInitiator::Internal,
                    "heartbeat communication failure",
                    Severity::Error,
                );
                return;
            }

            tokio::select! {
                _ = stop.wait_for(|stopped| *stopped) => return,
                result = timeout(cfg.response_timeout, notified) => {
                    if result.is_ok() {
                        answered = true;
                    }
                }
            }
            if answered {
                break;
            }
        }

        // disconnect on no reply
        if !answered {
            inner.cleanup(CloseInitiator::Internal, "no heartbeat response", Severity::Warn);
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::timeout as tokio_timeout;

    #[test]
    fn default_config_follows_the_standard() {
        let cfg = HeartbeatConfig::default();
        assert_eq!(cfg.interval, Duration::from_secs(60));
        assert_eq!(cfg.response_timeout, Duration::from_secs(10));
        assert_eq!(cfg.max_attempts, 4);
    }

    #[tokio::test]
    async fn error_status_does_not_signal() {
        let signal = HeartbeatSignal::default();
        signal.set_response(&ConnectionStateResponse::new(1, 0x21));

        let woken =
            tokio_timeout(Duration::from_millis(20), signal.responded.notified()).await.is_ok();
        assert!(!woken);
    }

    #[tokio::test]
    async fn signal_is_edge_triggered() {
        let signal = Arc::new(HeartbeatSignal::default());

        // a response with no probe waiting is lost
        signal.set_response(&ConnectionStateResponse::new(1, 0));
        let woken =
            tokio_timeout(Duration::from_millis(20), signal.responded.notified()).await.is_ok();
        assert!(!woken);

        // an armed probe sees the response
        let waiter = {
            let signal = signal.clone();
            tokio::spawn(async move {
                tokio_timeout(Duration::from_millis(500), signal.responded.notified()).await.is_ok()
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        signal.set_response(&ConnectionStateResponse::new(1, 0));
        assert!(waiter.await.unwrap());
    }
}
