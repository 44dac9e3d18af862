//! Room management and routing for the relay
//!
//! A room is keyed by connection id. Every client in it is tagged with the
//! side it speaks for; envelopes are only ever routed to counterparts.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, info};

use peerlink_core::crypto::random_hex;
use peerlink_core::{ClientSource, ConnectionId, RelayConfig, RemoteClientId};

use crate::error::RelayError;
use crate::messages::{SignalingEnvelope, SignalingNotification};
use crate::session::NotificationStream;

/// A client attached to a room
struct RoomClient {
    source: ClientSource,
    target: ClientSource,
    outbox: mpsc::UnboundedSender<SignalingNotification>,
}

impl RoomClient {
    fn deliver(&self, notification: SignalingNotification) {
        // The socket task may already be gone; nothing to do then
        let _ = self.outbox.send(notification);
    }

    fn talks_to(&self, other: &RoomClient) -> bool {
        self.target == other.source && other.target == self.source
    }
}

/// Clients sharing one connection id
pub struct Room {
    pub connection_id: ConnectionId,
    clients: HashMap<RemoteClientId, RoomClient>,
    last_activity: Instant,
}

impl Room {
    fn new(connection_id: ConnectionId) -> Self {
        Self {
            connection_id,
            clients: HashMap::new(),
            last_activity: Instant::now(),
        }
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// Check if the room has been idle for too long
    pub fn is_idle(&self, timeout: Duration) -> bool {
        self.last_activity.elapsed() > timeout
    }

    fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    fn counterparts<'a>(
        &'a self,
        client: &'a RoomClient,
    ) -> impl Iterator<Item = (&'a RemoteClientId, &'a RoomClient)> + 'a {
        self.clients.iter().filter(move |(_, other)| client.talks_to(other))
    }
}

/// In-process relay state
pub struct RelayHub {
    rooms: DashMap<ConnectionId, Room>,
    max_clients_per_room: usize,
    room_idle_timeout: Duration,
}

impl RelayHub {
    pub fn new(config: &RelayConfig) -> Self {
        Self {
            rooms: DashMap::new(),
            max_clients_per_room: config.max_clients_per_room,
            room_idle_timeout: Duration::from_secs(config.room_idle_timeout_secs),
        }
    }

    /// Attach a client to the room for `connection_id`
    ///
    /// Counterparts already present are announced to the newcomer with
    /// `remoteClientIsAlreadyConnected`; the newcomer is announced to them
    /// with `remoteClientJustConnected`.
    pub fn join(
        &self,
        connection_id: &ConnectionId,
        source: ClientSource,
        target: ClientSource,
    ) -> Result<(RemoteClientId, NotificationStream), RelayError> {
        let mut room = self
            .rooms
            .entry(connection_id.clone())
            .or_insert_with(|| Room::new(connection_id.clone()));

        if room.clients.len() >= self.max_clients_per_room {
            return Err(RelayError::RoomFull);
        }

        let client_id = RemoteClientId::new(random_hex(8).map_err(|_| RelayError::Rng)?);
        let (outbox, rx) = mpsc::unbounded_channel();
        let client = RoomClient {
            source,
            target,
            outbox,
        };

        for (other_id, other) in room.counterparts(&client) {
            client.deliver(SignalingNotification::RemoteClientConnected {
                remote_client_id: other_id.clone(),
                already_connected: true,
            });
            other.deliver(SignalingNotification::RemoteClientConnected {
                remote_client_id: client_id.clone(),
                already_connected: false,
            });
        }

        room.clients.insert(client_id.clone(), client);
        room.touch();

        info!(
            "Client {} ({}) joined room {}",
            client_id, source, connection_id
        );
        Ok((client_id, rx))
    }

    /// Route one text frame sent by `client_id`
    pub fn handle_message(&self, connection_id: &ConnectionId, client_id: &RemoteClientId, text: &str) {
        let Some(mut room) = self.rooms.get_mut(connection_id) else {
            debug!("Message for missing room {}", connection_id);
            return;
        };
        room.touch();

        let Some(sender) = room.clients.get(client_id) else {
            debug!("Message from unknown client {} in room {}", client_id, connection_id);
            return;
        };

        let envelope = match SignalingEnvelope::from_json(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                sender.deliver(SignalingNotification::InvalidMessage {
                    error: e.to_string(),
                });
                return;
            }
        };

        if let Some(errors) = validate(&envelope, &room.connection_id, sender) {
            sender.deliver(SignalingNotification::ValidationError {
                request_id: Some(envelope.request_id.clone()),
                errors,
            });
            return;
        }

        let targets: Vec<&RoomClient> = room
            .counterparts(sender)
            .filter(|(id, _)| {
                envelope
                    .target_client_id
                    .as_ref()
                    .map_or(true, |target| target == *id)
            })
            .map(|(_, client)| client)
            .collect();

        if targets.is_empty() {
            sender.deliver(SignalingNotification::MissingRemoteClient {
                request_id: envelope.request_id.clone(),
            });
            return;
        }

        for target in &targets {
            target.deliver(SignalingNotification::RemoteData {
                request_id: envelope.request_id.clone(),
                remote_client_id: client_id.clone(),
                envelope: envelope.clone(),
            });
        }
        sender.deliver(SignalingNotification::Confirmation {
            request_id: envelope.request_id.clone(),
        });

        debug!(
            "Relayed {:?} from {} to {} client(s) in room {}",
            envelope.method,
            client_id,
            targets.len(),
            connection_id
        );
    }

    /// Detach a client and tell its counterparts
    pub fn leave(&self, connection_id: &ConnectionId, client_id: &RemoteClientId) {
        let Some(mut room) = self.rooms.get_mut(connection_id) else {
            return;
        };

        if let Some(client) = room.clients.remove(client_id) {
            for (_, other) in room.counterparts(&client) {
                other.deliver(SignalingNotification::RemoteClientDisconnected {
                    remote_client_id: client_id.clone(),
                });
            }
            room.touch();
            info!("Client {} left room {}", client_id, connection_id);
        }

        if room.is_empty() {
            drop(room);
            self.rooms.remove_if(connection_id, |_, room| room.is_empty());
            debug!("Room {} removed (empty)", connection_id);
        }
    }

    /// Remove empty rooms idle past the configured timeout
    ///
    /// Rooms with attached clients stay; they go away through `leave` when
    /// their last socket closes.
    pub fn cleanup_idle_rooms(&self) -> usize {
        let timeout = self.room_idle_timeout;
        let candidates: Vec<ConnectionId> = self
            .rooms
            .iter()
            .filter(|r| r.is_empty() && r.is_idle(timeout))
            .map(|r| r.connection_id.clone())
            .collect();

        let mut removed = 0;
        for id in &candidates {
            if self
                .rooms
                .remove_if(id, |_, room| room.is_empty() && room.is_idle(timeout))
                .is_some()
            {
                info!("Room {} removed (idle timeout)", id);
                removed += 1;
            }
        }
        removed
    }

    /// Get room count (for monitoring)
    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    /// Get client count across all rooms (for monitoring)
    pub fn client_count(&self) -> usize {
        self.rooms.iter().map(|r| r.client_count()).sum()
    }
}

impl Default for RelayHub {
    fn default() -> Self {
        Self::new(&RelayConfig::default())
    }
}

fn validate(envelope: &SignalingEnvelope, connection_id: &ConnectionId, sender: &RoomClient) -> Option<String> {
    if &envelope.connection_id != connection_id {
        return Some(format!(
            "connectionId {} does not match the socket's {}",
            envelope.connection_id, connection_id
        ));
    }
    if envelope.source != sender.source {
        return Some(format!(
            "source {} does not match the socket's {}",
            envelope.source, sender.source
        ));
    }
    if envelope.encrypted_payload.is_empty() {
        return Some("encryptedPayload is empty".to_string());
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{RequestId, SignalingMethod};

    fn cid() -> ConnectionId {
        ConnectionId::new("room-1")
    }

    fn envelope(source: ClientSource, target: Option<&RemoteClientId>) -> SignalingEnvelope {
        SignalingEnvelope {
            request_id: RequestId::new("req"),
            method: SignalingMethod::Offer,
            source,
            connection_id: cid(),
            encrypted_payload: "00ff".into(),
            target_client_id: target.cloned(),
        }
    }

    fn join_wallet(hub: &RelayHub) -> (RemoteClientId, NotificationStream) {
        hub.join(&cid(), ClientSource::Wallet, ClientSource::Extension).unwrap()
    }

    fn join_extension(hub: &RelayHub) -> (RemoteClientId, NotificationStream) {
        hub.join(&cid(), ClientSource::Extension, ClientSource::Wallet).unwrap()
    }

    #[test]
    fn test_join_announces_counterparts() {
        let hub = RelayHub::default();
        let (wallet_id, mut wallet_rx) = join_wallet(&hub);
        let (ext_id, mut ext_rx) = join_extension(&hub);

        assert_eq!(
            wallet_rx.try_recv().unwrap(),
            SignalingNotification::RemoteClientConnected {
                remote_client_id: ext_id,
                already_connected: false
            }
        );
        assert_eq!(
            ext_rx.try_recv().unwrap(),
            SignalingNotification::RemoteClientConnected {
                remote_client_id: wallet_id,
                already_connected: true
            }
        );
        assert_eq!(hub.room_count(), 1);
        assert_eq!(hub.client_count(), 2);
    }

    #[test]
    fn test_same_side_clients_are_not_announced() {
        let hub = RelayHub::default();
        let (_, mut a) = join_wallet(&hub);
        let (_, mut b) = join_wallet(&hub);
        assert!(a.try_recv().is_err());
        assert!(b.try_recv().is_err());
    }

    #[test]
    fn test_envelope_forwarded_and_confirmed() {
        let hub = RelayHub::default();
        let (_, mut wallet_rx) = join_wallet(&hub);
        let (ext_id, mut ext_rx) = join_extension(&hub);
        let _ = wallet_rx.try_recv();
        let _ = ext_rx.try_recv();

        let sent = envelope(ClientSource::Extension, None);
        hub.handle_message(&cid(), &ext_id, &sent.to_json().unwrap());

        assert_eq!(
            wallet_rx.try_recv().unwrap(),
            SignalingNotification::RemoteData {
                request_id: RequestId::new("req"),
                remote_client_id: ext_id.clone(),
                envelope: sent,
            }
        );
        assert_eq!(
            ext_rx.try_recv().unwrap(),
            SignalingNotification::Confirmation {
                request_id: RequestId::new("req")
            }
        );
        assert!(wallet_rx.try_recv().is_err());
    }

    #[test]
    fn test_targeted_envelope_reaches_only_target() {
        let hub = RelayHub::default();
        let (_, mut w1) = join_wallet(&hub);
        let (w2_id, mut w2) = join_wallet(&hub);
        let (ext_id, _ext_rx) = join_extension(&hub);
        let _ = w1.try_recv();
        let _ = w2.try_recv();

        let sent = envelope(ClientSource::Extension, Some(&w2_id));
        hub.handle_message(&cid(), &ext_id, &sent.to_json().unwrap());

        assert!(matches!(w2.try_recv(), Ok(SignalingNotification::RemoteData { .. })));
        assert!(w1.try_recv().is_err());
    }

    #[test]
    fn test_missing_remote_client() {
        let hub = RelayHub::default();
        let (ext_id, mut ext_rx) = join_extension(&hub);

        let sent = envelope(ClientSource::Extension, None);
        hub.handle_message(&cid(), &ext_id, &sent.to_json().unwrap());

        assert_eq!(
            ext_rx.try_recv().unwrap(),
            SignalingNotification::MissingRemoteClient {
                request_id: RequestId::new("req")
            }
        );
    }

    #[test]
    fn test_invalid_and_rejected_messages() {
        let hub = RelayHub::default();
        let (ext_id, mut ext_rx) = join_extension(&hub);

        hub.handle_message(&cid(), &ext_id, "{not json");
        assert!(matches!(
            ext_rx.try_recv(),
            Ok(SignalingNotification::InvalidMessage { .. })
        ));

        let mut wrong_room = envelope(ClientSource::Extension, None);
        wrong_room.connection_id = ConnectionId::new("other");
        hub.handle_message(&cid(), &ext_id, &wrong_room.to_json().unwrap());
        assert!(matches!(
            ext_rx.try_recv(),
            Ok(SignalingNotification::ValidationError { .. })
        ));

        let spoofed = envelope(ClientSource::Wallet, None);
        hub.handle_message(&cid(), &ext_id, &spoofed.to_json().unwrap());
        assert!(matches!(
            ext_rx.try_recv(),
            Ok(SignalingNotification::ValidationError { .. })
        ));
    }

    #[test]
    fn test_leave_notifies_and_removes_empty_room() {
        let hub = RelayHub::default();
        let (wallet_id, mut wallet_rx) = join_wallet(&hub);
        let (ext_id, _ext_rx) = join_extension(&hub);
        let _ = wallet_rx.try_recv();

        hub.leave(&cid(), &ext_id);
        assert_eq!(
            wallet_rx.try_recv().unwrap(),
            SignalingNotification::RemoteClientDisconnected {
                remote_client_id: ext_id
            }
        );

        hub.leave(&cid(), &wallet_id);
        assert_eq!(hub.room_count(), 0);
    }

    #[test]
    fn test_room_full() {
        let config = RelayConfig {
            max_clients_per_room: 2,
            ..Default::default()
        };
        let hub = RelayHub::new(&config);
        join_wallet(&hub);
        join_extension(&hub);
        assert!(matches!(
            hub.join(&cid(), ClientSource::Wallet, ClientSource::Extension),
            Err(RelayError::RoomFull)
        ));
    }

    #[test]
    fn test_idle_rooms_with_clients_are_kept() {
        let config = RelayConfig {
            room_idle_timeout_secs: 0,
            ..Default::default()
        };
        let hub = RelayHub::new(&config);
        let (wallet_id, mut wallet_rx) = join_wallet(&hub);
        let (ext_id, _ext_rx) = join_extension(&hub);
        let _ = wallet_rx.try_recv();
        std::thread::sleep(Duration::from_millis(5));

        assert_eq!(hub.cleanup_idle_rooms(), 0);
        assert_eq!(hub.room_count(), 1);

        // The clients can still talk through the room
        let sent = envelope(ClientSource::Extension, None);
        hub.handle_message(&cid(), &ext_id, &sent.to_json().unwrap());
        assert!(matches!(
            wallet_rx.try_recv(),
            Ok(SignalingNotification::RemoteData { .. })
        ));

        hub.leave(&cid(), &ext_id);
        hub.leave(&cid(), &wallet_id);
        assert_eq!(hub.room_count(), 0);
    }

    #[test]
    fn test_idle_empty_rooms_cleaned_up() {
        let config = RelayConfig {
            room_idle_timeout_secs: 0,
            max_clients_per_room: 0,
            ..Default::default()
        };
        let hub = RelayHub::new(&config);
        // A rejected join leaves an empty room behind
        assert!(matches!(
            hub.join(&cid(), ClientSource::Wallet, ClientSource::Extension),
            Err(RelayError::RoomFull)
        ));
        assert_eq!(hub.room_count(), 1);
        std::thread::sleep(Duration::from_millis(5));

        assert_eq!(hub.cleanup_idle_rooms(), 1);
        assert_eq!(hub.room_count(), 0);
    }
}
