//! Test doubles: an in-memory peer network, a toy cipher, and scripted relay sessions

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;

use peerlink_core::{CipherError, ClientSource, ConnectionId, ConnectionSecret, PayloadCipher};
use peerlink_signal::{
    EnvelopeSink, NotificationFanout, NotificationStream, RelayConnector, RelaySession,
    SignalingEnvelope, SignalingError, SignalingMethod, SignalingNotification,
};

use crate::error::TransportError;
use crate::transport::{
    ChannelState, IceCandidate, IceConfig, PeerChannel, PeerTransport, TransportEvent,
};

/// XOR with the secret bytes; symmetric
pub(crate) struct XorCipher;

impl PayloadCipher for XorCipher {
    fn encrypt(&self, plaintext: &[u8], secret: &ConnectionSecret) -> Result<Vec<u8>, CipherError> {
        let key = secret.as_bytes();
        Ok(plaintext
            .iter()
            .enumerate()
            .map(|(i, b)| b ^ key[i % key.len()])
            .collect())
    }

    fn decrypt(&self, ciphertext: &[u8], secret: &ConnectionSecret) -> Result<Vec<u8>, CipherError> {
        self.encrypt(ciphertext, secret)
    }
}

/// Build an envelope the way a remote client would
pub(crate) fn seal<T: Serialize>(
    method: SignalingMethod,
    secret: &ConnectionSecret,
    payload: &T,
) -> SignalingEnvelope {
    let plaintext = serde_json::to_vec(payload).unwrap();
    let ciphertext = XorCipher.encrypt(&plaintext, secret).unwrap();
    SignalingEnvelope::new(
        method,
        ClientSource::Extension,
        secret.connection_id(),
        hex::encode(ciphertext),
        None,
    )
    .unwrap()
}

/// Envelope sink that hands everything to the test
pub(crate) struct RecordingSink {
    tx: mpsc::UnboundedSender<SignalingEnvelope>,
}

impl RecordingSink {
    pub(crate) fn new() -> (Self, mpsc::UnboundedReceiver<SignalingEnvelope>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl EnvelopeSink for RecordingSink {
    async fn send_envelope(&self, envelope: &SignalingEnvelope) -> Result<(), SignalingError> {
        self.tx
            .send(envelope.clone())
            .map_err(|_| SignalingError::NotConnected)
    }
}

/// Relay session whose notifications are pushed by the test
pub(crate) struct ScriptedSession {
    connection_id: ConnectionId,
    fanout: NotificationFanout,
    sent: Mutex<Vec<SignalingEnvelope>>,
}

impl ScriptedSession {
    pub(crate) fn push(&self, notification: SignalingNotification) {
        self.fanout.publish(notification);
    }

    pub(crate) fn sent(&self) -> Vec<SignalingEnvelope> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl EnvelopeSink for ScriptedSession {
    async fn send_envelope(&self, envelope: &SignalingEnvelope) -> Result<(), SignalingError> {
        self.sent.lock().push(envelope.clone());
        Ok(())
    }
}

#[async_trait]
impl RelaySession for ScriptedSession {
    fn connection_id(&self) -> &ConnectionId {
        &self.connection_id
    }

    fn notifications(&self) -> NotificationStream {
        self.fanout.subscribe()
    }

    async fn disconnect(&self) {
        self.fanout.close();
    }
}

/// Hands out scripted sessions and remembers them
#[derive(Default)]
pub(crate) struct ScriptedConnector {
    sessions: Mutex<HashMap<ConnectionId, Arc<ScriptedSession>>>,
}

impl ScriptedConnector {
    pub(crate) fn session(&self, connection_id: &ConnectionId) -> Arc<ScriptedSession> {
        self.sessions
            .lock()
            .get(connection_id)
            .cloned()
            .expect("no session for connection id")
    }
}

#[async_trait]
impl RelayConnector for ScriptedConnector {
    async fn connect(
        &self,
        connection_id: &ConnectionId,
    ) -> Result<Arc<dyn RelaySession>, SignalingError> {
        let session = Arc::new(ScriptedSession {
            connection_id: connection_id.clone(),
            fanout: NotificationFanout::new(),
            sent: Mutex::new(Vec::new()),
        });
        self.sessions
            .lock()
            .insert(connection_id.clone(), session.clone());
        Ok(session)
    }
}

struct Endpoint {
    events: mpsc::Sender<TransportEvent>,
    peer: Option<u64>,
    closed: bool,
}

#[derive(Default)]
struct NetworkState {
    next_id: u64,
    endpoints: HashMap<u64, Endpoint>,
    applied_candidates: usize,
    stalled: bool,
}

/// In-memory peer network
///
/// Offers and answers name the endpoint that made them (`mock-offer:<id>`),
/// so any two channels opened on the same network can pair up.
#[derive(Clone, Default)]
pub(crate) struct MockNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl MockNetwork {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn applied_candidates(&self) -> usize {
        self.state.lock().applied_candidates
    }

    pub(crate) fn channels_opened(&self) -> usize {
        self.state.lock().next_id as usize
    }

    /// Fail every open channel
    pub(crate) fn fail_all(&self) {
        let mut state = self.state.lock();
        for endpoint in state.endpoints.values_mut().filter(|e| !e.closed) {
            endpoint.closed = true;
            let _ = endpoint
                .events
                .try_send(TransportEvent::StateChanged(ChannelState::Failed));
        }
    }

    /// Make every later send hang forever
    pub(crate) fn stall_sends(&self) {
        self.state.lock().stalled = true;
    }

    /// Deliver raw bytes to an endpoint as if its peer sent them
    pub(crate) async fn inject(&self, endpoint_id: u64, data: Vec<u8>) {
        let events = self
            .state
            .lock()
            .endpoints
            .get(&endpoint_id)
            .map(|e| e.events.clone())
            .expect("unknown endpoint");
        let _ = events.send(TransportEvent::Received(data)).await;
    }
}

fn parse_endpoint(sdp: &str, prefix: &str) -> Result<u64, TransportError> {
    sdp.strip_prefix(prefix)
        .and_then(|id| id.parse().ok())
        .ok_or_else(|| TransportError::Negotiation(format!("unexpected sdp {:?}", sdp)))
}

fn local_candidate(id: u64) -> TransportEvent {
    TransportEvent::LocalIceCandidate(IceCandidate {
        candidate: format!("candidate:mock {}", id),
        sdp_mid: Some("0".into()),
        sdp_m_line_index: Some(0),
    })
}

#[async_trait]
impl PeerTransport for MockNetwork {
    async fn open(
        &self,
        _ice: &IceConfig,
        events: mpsc::Sender<TransportEvent>,
    ) -> Result<Box<dyn PeerChannel>, TransportError> {
        let mut state = self.state.lock();
        let id = state.next_id;
        state.next_id += 1;
        state.endpoints.insert(
            id,
            Endpoint {
                events,
                peer: None,
                closed: false,
            },
        );
        Ok(Box::new(MockChannel {
            id,
            state: self.state.clone(),
        }))
    }
}

struct MockChannel {
    id: u64,
    state: Arc<Mutex<NetworkState>>,
}

#[async_trait]
impl PeerChannel for MockChannel {
    async fn create_offer(&self) -> Result<String, TransportError> {
        let state = self.state.lock();
        if let Some(me) = state.endpoints.get(&self.id) {
            let _ = me.events.try_send(local_candidate(self.id));
        }
        Ok(format!("mock-offer:{}", self.id))
    }

    async fn accept_offer(&self, sdp: &str) -> Result<String, TransportError> {
        let offerer = parse_endpoint(sdp, "mock-offer:")?;
        let mut state = self.state.lock();
        match state.endpoints.get_mut(&offerer) {
            Some(endpoint) if !endpoint.closed => endpoint.peer = Some(self.id),
            _ => return Err(TransportError::Negotiation("offerer is gone".into())),
        }
        if let Some(me) = state.endpoints.get_mut(&self.id) {
            me.peer = Some(offerer);
            let _ = me.events.try_send(local_candidate(self.id));
        }
        Ok(format!("mock-answer:{}", self.id))
    }

    async fn accept_answer(&self, sdp: &str) -> Result<(), TransportError> {
        let answerer = parse_endpoint(sdp, "mock-answer:")?;
        let state = self.state.lock();
        let paired = state
            .endpoints
            .get(&answerer)
            .is_some_and(|e| e.peer == Some(self.id) && !e.closed);
        if !paired {
            return Err(TransportError::Negotiation("answer does not match offer".into()));
        }
        for id in [self.id, answerer] {
            if let Some(endpoint) = state.endpoints.get(&id) {
                let _ = endpoint
                    .events
                    .try_send(TransportEvent::StateChanged(ChannelState::Open));
            }
        }
        Ok(())
    }

    async fn add_ice_candidate(&self, _candidate: &IceCandidate) -> Result<(), TransportError> {
        self.state.lock().applied_candidates += 1;
        Ok(())
    }

    async fn send(&self, data: &[u8]) -> Result<(), TransportError> {
        let (events, stalled) = {
            let state = self.state.lock();
            let me = state.endpoints.get(&self.id).ok_or(TransportError::Closed)?;
            if me.closed {
                return Err(TransportError::Closed);
            }
            let peer = me
                .peer
                .and_then(|id| state.endpoints.get(&id))
                .filter(|peer| !peer.closed)
                .ok_or(TransportError::Closed)?;
            (peer.events.clone(), state.stalled)
        };
        if stalled {
            std::future::pending::<()>().await;
        }
        events
            .send(TransportEvent::Received(data.to_vec()))
            .await
            .map_err(|_| TransportError::Closed)
    }

    async fn close(&self) {
        let mut state = self.state.lock();
        let peer = match state.endpoints.get_mut(&self.id) {
            Some(me) if !me.closed => {
                me.closed = true;
                me.peer
            }
            _ => None,
        };
        if let Some(peer) = peer.and_then(|id| state.endpoints.get(&id)) {
            if !peer.closed {
                let _ = peer
                    .events
                    .try_send(TransportEvent::StateChanged(ChannelState::Closed));
            }
        }
    }
}
