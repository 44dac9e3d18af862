//! Relay session seams
//!
//! The link layer talks to the relay only through these traits, so the
//! WebSocket client and the in-process relay are interchangeable.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use peerlink_core::ConnectionId;

use crate::error::SignalingError;
use crate::messages::{SignalingEnvelope, SignalingNotification};

/// One subscription to a session's notifications
pub type NotificationStream = mpsc::UnboundedReceiver<SignalingNotification>;

/// Send side of a relay session
#[async_trait]
pub trait EnvelopeSink: Send + Sync {
    /// Transmit an envelope without waiting for the relay's confirmation
    async fn send_envelope(&self, envelope: &SignalingEnvelope) -> Result<(), SignalingError>;
}

/// A connection to the relay for one connection id
#[async_trait]
pub trait RelaySession: EnvelopeSink {
    fn connection_id(&self) -> &ConnectionId;

    /// Fresh subscription; every subscriber sees every later notification
    fn notifications(&self) -> NotificationStream;

    /// Close the relay connection and end all subscriptions
    async fn disconnect(&self);
}

/// Opens relay sessions
#[async_trait]
pub trait RelayConnector: Send + Sync {
    async fn connect(
        &self,
        connection_id: &ConnectionId,
    ) -> Result<Arc<dyn RelaySession>, SignalingError>;
}

/// Notifications held while nobody is subscribed
const BACKLOG_LIMIT: usize = 256;

#[derive(Debug, Default)]
struct FanoutState {
    subscribers: Vec<mpsc::UnboundedSender<SignalingNotification>>,
    backlog: VecDeque<SignalingNotification>,
}

/// Multi-consumer broadcast of notifications over unbounded channels
///
/// Notifications published while there are no subscribers are kept (up to a
/// limit) and handed to the next subscriber, so nothing the relay sends right
/// after connecting is lost.
#[derive(Debug, Default)]
pub struct NotificationFanout {
    state: Mutex<FanoutState>,
}

impl NotificationFanout {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> NotificationStream {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state.lock();
        for notification in state.backlog.drain(..) {
            let _ = tx.send(notification);
        }
        state.subscribers.push(tx);
        rx
    }

    /// Deliver to every live subscriber, dropping the ones that went away
    pub fn publish(&self, notification: SignalingNotification) {
        let mut state = self.state.lock();
        state
            .subscribers
            .retain(|tx| tx.send(notification.clone()).is_ok());

        if state.subscribers.is_empty() {
            if state.backlog.len() >= BACKLOG_LIMIT {
                state.backlog.pop_front();
            }
            state.backlog.push_back(notification);
        }
    }

    /// End every current subscription
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.subscribers.clear();
        state.backlog.clear();
    }

    pub fn subscriber_count(&self) -> usize {
        self.state.lock().subscribers.len()
    }
}
