//! One-shot linking of a new remote client
//!
//! Linking opens a temporary link for a fresh secret, waits for the first
//! remote client to connect, hands it a [`LinkClientInteraction`] and tears
//! the link down again once the remote side confirmed the message.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use peerlink_core::{ConnectionId, ConnectionSecret, RemoteClientId};

use crate::error::LinkError;
use crate::event::{LinkEvent, LinkState};
use crate::manager::LinkManager;

/// Discriminator of the linking message
pub const LINK_CLIENT_DISCRIMINATOR: &str = "linkClient";

/// Pause between the channel opening and the linking message, so the remote
/// side has started reading its data channel
const SETTLE_DELAY: Duration = Duration::from_millis(500);

/// Message that introduces this client to a newly linked remote client
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkClientInteraction {
    pub discriminator: String,
    /// Hex encoded public key of this client
    pub public_key: String,
    /// Hex encoded signature over the linking challenge
    pub signature: String,
}

impl LinkClientInteraction {
    pub fn new(public_key: impl Into<String>, signature: impl Into<String>) -> Self {
        Self {
            discriminator: LINK_CLIENT_DISCRIMINATOR.to_string(),
            public_key: public_key.into(),
            signature: signature.into(),
        }
    }
}

impl LinkManager {
    /// Run the linking handshake for a new secret
    ///
    /// Fails with [`LinkError::LinkExists`] if the secret is already linked.
    /// The temporary link is removed whatever the outcome. Returns the remote
    /// client that accepted the interaction.
    pub async fn link_client(
        &self,
        secret: ConnectionSecret,
        interaction: &LinkClientInteraction,
        timeout: Duration,
    ) -> Result<RemoteClientId, LinkError> {
        let connection_id = secret.connection_id();
        let exists = self
            .links()
            .await
            .iter()
            .any(|link| link.connection_id == connection_id);
        if exists {
            return Err(LinkError::LinkExists(connection_id));
        }

        // Subscribe first so the Connected event cannot slip past
        let mut events = self.subscribe();
        self.add_link(secret.clone()).await?;
        info!("Linking started on {}", connection_id);

        let outcome = tokio::time::timeout(
            timeout,
            self.hand_off(&secret, &connection_id, interaction, &mut events),
        )
        .await
        .unwrap_or_else(|_| Err(LinkError::LinkingTimedOut(connection_id.clone())));

        if let Err(e) = self.remove_link(&secret).await {
            debug!("Linking link {} already gone: {}", connection_id, e);
        }

        match &outcome {
            Ok(remote_client_id) => info!("Linked {} on {}", remote_client_id, connection_id),
            Err(e) => warn!("Linking on {} failed: {}", connection_id, e),
        }
        outcome
    }

    async fn hand_off(
        &self,
        secret: &ConnectionSecret,
        connection_id: &ConnectionId,
        interaction: &LinkClientInteraction,
        events: &mut broadcast::Receiver<LinkEvent>,
    ) -> Result<RemoteClientId, LinkError> {
        let remote_client_id = self.first_connected(secret, connection_id, events).await?;
        tokio::time::sleep(SETTLE_DELAY).await;

        let payload = serde_json::to_vec(interaction)
            .map_err(|e| LinkError::InvalidPayload(e.to_string()))?;
        let message_id = self.send_to(secret, &remote_client_id, payload).await?;
        debug!("Linking message {} sent to {}", message_id, remote_client_id);

        loop {
            match events.recv().await {
                Ok(LinkEvent::DeliveryConfirmed { message_id: id, .. }) if id == message_id => {
                    return Ok(remote_client_id);
                }
                Ok(LinkEvent::DeliveryFailed {
                    message_id: id,
                    error,
                    ..
                }) if id == message_id => return Err(LinkError::LinkingFailed(error)),
                Ok(LinkEvent::StateChanged {
                    connection_id: cid,
                    remote_client_id: rid,
                    state: LinkState::Disconnected | LinkState::Terminated,
                }) if &cid == connection_id && rid == remote_client_id => {
                    return Err(LinkError::LinkingFailed(
                        "connection dropped before confirmation".into(),
                    ));
                }
                Ok(LinkEvent::RelayDisconnected { connection_id: cid }) if &cid == connection_id => {
                    return Err(LinkError::LinkingFailed("relay session ended".into()));
                }
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => return Err(LinkError::Terminated),
            }
        }
    }

    async fn first_connected(
        &self,
        secret: &ConnectionSecret,
        connection_id: &ConnectionId,
        events: &mut broadcast::Receiver<LinkEvent>,
    ) -> Result<RemoteClientId, LinkError> {
        loop {
            match events.recv().await {
                Ok(LinkEvent::StateChanged {
                    connection_id: cid,
                    remote_client_id,
                    state: LinkState::Connected,
                }) if &cid == connection_id => return Ok(remote_client_id),
                Ok(LinkEvent::RelayDisconnected { connection_id: cid }) if &cid == connection_id => {
                    return Err(LinkError::LinkingFailed("relay session ended".into()));
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => {
                    if let Some(peer) = self.connected_peers(secret).await.into_iter().next() {
                        return Ok(peer);
                    }
                }
                Err(broadcast::error::RecvError::Closed) => return Err(LinkError::Terminated),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::manager::LinkManagerConfig;
    use crate::testing::{MockNetwork, ScriptedConnector, XorCipher};
    use peerlink_core::{ClientSource, Config};
    use peerlink_signal::{MemoryConnector, RelayHub};

    fn secret() -> ConnectionSecret {
        ConnectionSecret::from_bytes([9u8; 32])
    }

    fn manager(
        connector: Arc<dyn peerlink_signal::RelayConnector>,
        net: &MockNetwork,
        source: ClientSource,
    ) -> LinkManager {
        let mut config = Config::default();
        config.signaling.source = source;
        config.signaling.target = source.counterpart();
        LinkManager::new(
            LinkManagerConfig::from(&config),
            connector,
            Arc::new(net.clone()),
            Arc::new(XorCipher),
        )
    }

    #[test]
    fn test_interaction_wire_format() {
        let interaction = LinkClientInteraction::new("02ab", "cd01");
        let json = serde_json::to_value(&interaction).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "discriminator": "linkClient",
                "publicKey": "02ab",
                "signature": "cd01",
            })
        );
    }

    #[tokio::test]
    async fn test_link_client_hands_off_and_tears_down() {
        let hub = Arc::new(RelayHub::default());
        let net = MockNetwork::new();
        let wallet = manager(
            Arc::new(MemoryConnector::new(hub.clone(), ClientSource::Wallet)),
            &net,
            ClientSource::Wallet,
        );
        let extension = manager(
            Arc::new(MemoryConnector::new(hub.clone(), ClientSource::Extension)),
            &net,
            ClientSource::Extension,
        );
        let mut ext_rx = extension.incoming_messages().unwrap();
        extension.add_link(secret()).await.unwrap();

        let interaction = LinkClientInteraction::new("02ab", "cd01");
        let linked = wallet
            .link_client(secret(), &interaction, Duration::from_secs(10))
            .await
            .unwrap();

        let received = tokio::time::timeout(Duration::from_secs(2), ext_rx.recv())
            .await
            .unwrap()
            .unwrap();
        let decoded: LinkClientInteraction = serde_json::from_slice(&received.payload).unwrap();
        assert_eq!(decoded, interaction);
        assert_eq!(decoded.discriminator, LINK_CLIENT_DISCRIMINATOR);
        assert_eq!(received.connection_id, secret().connection_id());

        // The temporary link is gone and the extension was told about it
        assert!(wallet.links().await.is_empty());
        assert!(!linked.as_str().is_empty());
        for _ in 0..200 {
            if extension.connected_peers(&secret()).await.is_empty() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("extension still sees the wallet after linking");
    }

    #[tokio::test]
    async fn test_link_client_times_out_without_remote() {
        let net = MockNetwork::new();
        let wallet = manager(
            Arc::new(ScriptedConnector::default()),
            &net,
            ClientSource::Wallet,
        );

        let result = wallet
            .link_client(
                secret(),
                &LinkClientInteraction::new("02ab", "cd01"),
                Duration::from_millis(100),
            )
            .await;
        assert_eq!(
            result,
            Err(LinkError::LinkingTimedOut(secret().connection_id()))
        );
        assert!(wallet.links().await.is_empty());
    }

    #[tokio::test]
    async fn test_link_client_refuses_existing_link() {
        let net = MockNetwork::new();
        let wallet = manager(
            Arc::new(ScriptedConnector::default()),
            &net,
            ClientSource::Wallet,
        );
        wallet.add_link(secret()).await.unwrap();

        let result = wallet
            .link_client(
                secret(),
                &LinkClientInteraction::new("02ab", "cd01"),
                Duration::from_secs(1),
            )
            .await;
        assert_eq!(result, Err(LinkError::LinkExists(secret().connection_id())));
        assert_eq!(wallet.links().await.len(), 1);
    }
}
