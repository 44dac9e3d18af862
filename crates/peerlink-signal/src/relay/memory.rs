//! In-process relay sessions
//!
//! Sessions attach directly to a shared [`RelayHub`] and go through the same
//! JSON encoding as the socket path, so link tests run without a network.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::debug;

use peerlink_core::{ClientSource, ConnectionId, RemoteClientId};

use crate::error::SignalingError;
use crate::messages::SignalingEnvelope;
use crate::relay::hub::RelayHub;
use crate::session::{EnvelopeSink, NotificationFanout, NotificationStream, RelayConnector, RelaySession};

/// Opens sessions on an in-process hub
pub struct MemoryConnector {
    hub: Arc<RelayHub>,
    source: ClientSource,
    target: ClientSource,
}

impl MemoryConnector {
    pub fn new(hub: Arc<RelayHub>, source: ClientSource) -> Self {
        Self {
            hub,
            source,
            target: source.counterpart(),
        }
    }

    pub fn hub(&self) -> &Arc<RelayHub> {
        &self.hub
    }

    /// Open a session with its concrete type
    pub fn open(&self, connection_id: &ConnectionId) -> Result<Arc<MemorySession>, SignalingError> {
        let (client_id, mut outbox) = self
            .hub
            .join(connection_id, self.source, self.target)
            .map_err(|e| SignalingError::Connect(e.to_string()))?;

        let fanout = Arc::new(NotificationFanout::new());
        let pump_fanout = fanout.clone();
        let pump = tokio::spawn(async move {
            while let Some(notification) = outbox.recv().await {
                pump_fanout.publish(notification);
            }
            pump_fanout.close();
        });

        Ok(Arc::new(MemorySession {
            hub: self.hub.clone(),
            connection_id: connection_id.clone(),
            client_id,
            fanout,
            pump: Mutex::new(Some(pump)),
            closed: AtomicBool::new(false),
        }))
    }
}

#[async_trait]
impl RelayConnector for MemoryConnector {
    async fn connect(
        &self,
        connection_id: &ConnectionId,
    ) -> Result<Arc<dyn RelaySession>, SignalingError> {
        let session: Arc<dyn RelaySession> = self.open(connection_id)?;
        Ok(session)
    }
}

/// A client attached to an in-process hub
pub struct MemorySession {
    hub: Arc<RelayHub>,
    connection_id: ConnectionId,
    client_id: RemoteClientId,
    fanout: Arc<NotificationFanout>,
    pump: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl MemorySession {
    /// Id the hub assigned to this session
    pub fn client_id(&self) -> &RemoteClientId {
        &self.client_id
    }

    /// Hand raw text to the hub, bypassing envelope encoding
    pub fn send_text(&self, text: &str) -> Result<(), SignalingError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SignalingError::NotConnected);
        }
        self.hub.handle_message(&self.connection_id, &self.client_id, text);
        Ok(())
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.hub.leave(&self.connection_id, &self.client_id);
        if let Some(pump) = self.pump.lock().take() {
            pump.abort();
        }
        self.fanout.close();
        debug!("Memory session {} closed", self.client_id);
    }
}

#[async_trait]
impl EnvelopeSink for MemorySession {
    async fn send_envelope(&self, envelope: &SignalingEnvelope) -> Result<(), SignalingError> {
        let json = envelope
            .to_json()
            .map_err(|e| SignalingError::Encode(e.to_string()))?;
        self.send_text(&json)
    }
}

#[async_trait]
impl RelaySession for MemorySession {
    fn connection_id(&self) -> &ConnectionId {
        &self.connection_id
    }

    fn notifications(&self) -> NotificationStream {
        self.fanout.subscribe()
    }

    async fn disconnect(&self) {
        self.close();
    }
}

impl Drop for MemorySession {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{SignalingMethod, SignalingNotification};
    use std::time::Duration;

    async fn next(rx: &mut NotificationStream) -> SignalingNotification {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for notification")
            .expect("notification stream ended")
    }

    #[tokio::test]
    async fn test_memory_sessions_exchange_envelopes() {
        let hub = Arc::new(RelayHub::default());
        let cid = ConnectionId::new("cid");
        let wallet = MemoryConnector::new(hub.clone(), ClientSource::Wallet);
        let extension = MemoryConnector::new(hub.clone(), ClientSource::Extension);

        let wallet_session = wallet.connect(&cid).await.unwrap();
        let mut wallet_rx = wallet_session.notifications();
        let ext_session = extension.open(&cid).unwrap();
        let mut ext_rx = ext_session.notifications();

        assert_eq!(
            next(&mut wallet_rx).await,
            SignalingNotification::RemoteClientConnected {
                remote_client_id: ext_session.client_id().clone(),
                already_connected: false,
            }
        );
        assert!(matches!(
            next(&mut ext_rx).await,
            SignalingNotification::RemoteClientConnected {
                already_connected: true,
                ..
            }
        ));

        let offer = SignalingEnvelope::new(
            SignalingMethod::Offer,
            ClientSource::Extension,
            cid.clone(),
            "abcd".into(),
            None,
        )
        .unwrap();
        ext_session.send_envelope(&offer).await.unwrap();

        assert!(matches!(
            next(&mut wallet_rx).await,
            SignalingNotification::RemoteData { envelope, .. } if envelope == offer
        ));
        assert!(matches!(
            next(&mut ext_rx).await,
            SignalingNotification::Confirmation { .. }
        ));
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent_and_notifies() {
        let hub = Arc::new(RelayHub::default());
        let cid = ConnectionId::new("cid");
        let wallet = MemoryConnector::new(hub.clone(), ClientSource::Wallet).open(&cid).unwrap();
        let mut wallet_rx = wallet.notifications();
        let ext = MemoryConnector::new(hub.clone(), ClientSource::Extension).open(&cid).unwrap();
        let mut ext_rx = ext.notifications();
        let _ = next(&mut wallet_rx).await;

        ext.disconnect().await;
        ext.disconnect().await;

        assert_eq!(
            next(&mut wallet_rx).await,
            SignalingNotification::RemoteClientDisconnected {
                remote_client_id: ext.client_id().clone()
            }
        );
        assert!(ext.send_text("{}").is_err());
        assert_eq!(hub.client_count(), 1);

        // The extension's own subscription has ended (after any queued items)
        while ext_rx.recv().await.is_some() {}
    }
}
