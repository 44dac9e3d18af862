//! Link connection
//!
//! One connection per remote client. Each runs as its own task that owns the
//! peer channel, the reassembly buffers, and the negotiation state, and is
//! driven through a [`LinkConnectionHandle`].
//!
//! ```text
//! Idle -> Negotiating -> Connected
//!              |             |
//!              v             v
//!          Disconnected <----+ -> Negotiating (restart)
//!
//! any state -> Terminated
//! ```
//!
//! Termination is signalled outside the command queue, so it interrupts a
//! negotiation or send that is stuck on the channel.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use peerlink_core::{
    split, Assembler, AssemblerConfig, ClientSource, ConnectionId, ConnectionSecret, Frame,
    MessageId, PayloadCipher, ReassemblyOutcome, RemoteClientId,
};
use peerlink_signal::{EnvelopeSink, RequestId, SignalingEnvelope, SignalingMethod};

use crate::error::{LinkError, TransportError};
use crate::event::{InboundMessage, LinkEvent, LinkState};
use crate::transport::{
    ChannelState, IceCandidate, IceConfig, PeerChannel, PeerTransport, SessionDescription,
    TransportEvent,
};

/// Buffered transport events per channel
const TRANSPORT_EVENT_BUFFER: usize = 256;

/// Remote candidates held until the remote description is applied
const MAX_PENDING_CANDIDATES: usize = 64;

/// Recent request ids kept to match relay delivery failures
const RECENT_REQUEST_LIMIT: usize = 32;

/// Which side creates the offer
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Role {
    /// Waits for the remote offer
    #[default]
    Answerer,
    Offerer,
}

/// Everything a connection shares with the other connections of its link
pub struct LinkContext {
    pub secret: ConnectionSecret,
    pub connection_id: ConnectionId,
    pub source: ClientSource,
    pub signaling: Arc<dyn EnvelopeSink>,
    pub transport: Arc<dyn PeerTransport>,
    pub cipher: Arc<dyn PayloadCipher>,
    pub ice: IceConfig,
    pub chunk_size: usize,
    pub assembler: AssemblerConfig,
    pub sweep_interval: Duration,
    pub negotiation_timeout: Duration,
}

/// State report sent to the owner of a connection
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectionUpdate {
    pub connection_id: ConnectionId,
    pub remote_client_id: RemoteClientId,
    /// Distinguishes a replaced connection from its successor
    pub generation: u64,
    pub state: LinkState,
}

/// Channels a connection reports into
#[derive(Clone)]
pub struct ConnectionOutputs {
    pub updates: mpsc::UnboundedSender<ConnectionUpdate>,
    pub events: broadcast::Sender<LinkEvent>,
    pub inbound: mpsc::UnboundedSender<InboundMessage>,
}

enum Command {
    Start,
    Signal(SignalingEnvelope),
    RequestFailed(RequestId),
    RemoteDisconnected,
    Retry,
    Send {
        payload: Bytes,
        reply: oneshot::Sender<Result<MessageId, LinkError>>,
    },
}

/// Handle to a running link connection
#[derive(Clone)]
pub struct LinkConnectionHandle {
    remote_client_id: RemoteClientId,
    generation: u64,
    commands: mpsc::UnboundedSender<Command>,
    cancel: Arc<watch::Sender<bool>>,
    state: watch::Receiver<LinkState>,
}

impl LinkConnectionHandle {
    pub fn remote_client_id(&self) -> &RemoteClientId {
        &self.remote_client_id
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn state(&self) -> LinkState {
        *self.state.borrow()
    }

    /// Begin negotiating from Idle
    pub fn start(&self) {
        let _ = self.commands.send(Command::Start);
    }

    /// Deliver an envelope the relay forwarded from this remote client
    pub fn signal(&self, envelope: SignalingEnvelope) {
        let _ = self.commands.send(Command::Signal(envelope));
    }

    /// The relay could not deliver one of our envelopes
    pub fn request_failed(&self, request_id: RequestId) {
        let _ = self.commands.send(Command::RequestFailed(request_id));
    }

    pub fn remote_disconnected(&self) {
        let _ = self.commands.send(Command::RemoteDisconnected);
    }

    /// Restart negotiation from Disconnected
    pub fn retry(&self) {
        let _ = self.commands.send(Command::Retry);
    }

    /// Split and send one message; resolves once every frame was handed to the channel
    pub async fn send(&self, payload: Bytes) -> Result<MessageId, LinkError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Send { payload, reply })
            .map_err(|_| LinkError::Terminated)?;
        rx.await.map_err(|_| LinkError::Terminated)?
    }

    /// Tear the connection down; an in-flight send fails with `Terminated`
    pub fn terminate(&self) {
        self.cancel.send_replace(true);
    }

    /// Wait until the connection reaches `state`
    pub async fn wait_for_state(&self, state: LinkState) -> Result<(), LinkError> {
        let mut rx = self.state.clone();
        rx.wait_for(|current| *current == state)
            .await
            .map(|_| ())
            .map_err(|_| LinkError::Terminated)
    }
}

/// Spawns link connections
pub struct LinkConnection;

impl LinkConnection {
    /// Start the connection task in Idle
    pub fn spawn(
        ctx: Arc<LinkContext>,
        remote_client_id: RemoteClientId,
        role: Role,
        generation: u64,
        outputs: ConnectionOutputs,
    ) -> LinkConnectionHandle {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (cancel, cancel_rx) = watch::channel(false);
        let (state_tx, state_rx) = watch::channel(LinkState::Idle);

        let task = ConnectionTask {
            assembler: Assembler::new(ctx.assembler.clone()),
            ctx,
            remote_client_id: remote_client_id.clone(),
            role,
            generation,
            outputs,
            state: state_tx,
            channel: None,
            transport_events: None,
            remote_description_set: false,
            pending_candidates: Vec::new(),
            recent_requests: VecDeque::new(),
            negotiation_deadline: None,
        };
        tokio::spawn(task.run(command_rx, cancel_rx));

        LinkConnectionHandle {
            remote_client_id,
            generation,
            commands,
            cancel: Arc::new(cancel),
            state: state_rx,
        }
    }
}

struct ConnectionTask {
    ctx: Arc<LinkContext>,
    remote_client_id: RemoteClientId,
    role: Role,
    generation: u64,
    outputs: ConnectionOutputs,
    state: watch::Sender<LinkState>,
    channel: Option<Box<dyn PeerChannel>>,
    transport_events: Option<mpsc::Receiver<TransportEvent>>,
    remote_description_set: bool,
    pending_candidates: Vec<IceCandidate>,
    recent_requests: VecDeque<RequestId>,
    negotiation_deadline: Option<Instant>,
    assembler: Assembler,
}

async fn next_event(events: &mut Option<mpsc::Receiver<TransportEvent>>) -> Option<TransportEvent> {
    match events {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Resolves once termination was requested or every handle is gone
async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    let _ = cancel.wait_for(|cancelled| *cancelled).await;
}

async fn expire(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

impl ConnectionTask {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut cancel: watch::Receiver<bool>,
    ) {
        let mut sweep = tokio::time::interval(self.ctx.sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = cancelled(&mut cancel) => break,
                command = commands.recv() => {
                    let Some(command) = command else { break };
                    tokio::select! {
                        _ = self.handle_command(command) => {}
                        _ = cancelled(&mut cancel) => break,
                    }
                }
                event = next_event(&mut self.transport_events) => {
                    tokio::select! {
                        _ = self.handle_transport_event(event) => {}
                        _ = cancelled(&mut cancel) => break,
                    }
                }
                _ = expire(self.negotiation_deadline) => {
                    self.disconnect("negotiation timed out").await;
                }
                _ = sweep.tick() => self.sweep(),
            }
        }

        self.terminate().await;
    }

    fn current(&self) -> LinkState {
        *self.state.borrow()
    }

    fn set_state(&mut self, state: LinkState) {
        if self.current() == state {
            return;
        }
        debug!(
            "Link {} to {}: {} -> {}",
            self.ctx.connection_id,
            self.remote_client_id,
            self.current(),
            state
        );
        self.state.send_replace(state);
        let _ = self.outputs.updates.send(ConnectionUpdate {
            connection_id: self.ctx.connection_id.clone(),
            remote_client_id: self.remote_client_id.clone(),
            generation: self.generation,
            state,
        });
    }

    fn emit(&self, event: LinkEvent) {
        let _ = self.outputs.events.send(event);
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Start => {
                if matches!(self.current(), LinkState::Idle | LinkState::Disconnected) {
                    self.negotiate().await;
                }
            }
            Command::Retry => {
                if self.current() == LinkState::Disconnected {
                    self.negotiate().await;
                }
            }
            Command::Signal(envelope) => self.handle_signal(envelope).await,
            Command::RequestFailed(request_id) => {
                if self.current() == LinkState::Negotiating
                    && self.recent_requests.contains(&request_id)
                {
                    self.disconnect("remote client missing on relay").await;
                }
            }
            Command::RemoteDisconnected => {
                if !matches!(
                    self.current(),
                    LinkState::Disconnected | LinkState::Terminated
                ) {
                    self.disconnect("remote client left the relay").await;
                }
            }
            Command::Send { payload, reply } => {
                let result = self.send_message(&payload).await;
                let _ = reply.send(result);
            }
        }
    }

    async fn negotiate(&mut self) {
        if let Err(e) = self.try_negotiate().await {
            warn!(
                "Negotiation with {} on {} failed: {}",
                self.remote_client_id, self.ctx.connection_id, e
            );
            self.disconnect("negotiation failed").await;
        }
    }

    /// Open a fresh channel and, as offerer, send the offer
    async fn try_negotiate(&mut self) -> Result<(), LinkError> {
        self.reset_channel().await;
        self.pending_candidates.clear();

        let (tx, rx) = mpsc::channel(TRANSPORT_EVENT_BUFFER);
        let channel = self.ctx.transport.open(&self.ctx.ice, tx).await?;
        self.channel = Some(channel);
        self.transport_events = Some(rx);
        self.negotiation_deadline = Some(Instant::now() + self.ctx.negotiation_timeout);
        self.set_state(LinkState::Negotiating);

        if self.role == Role::Offerer {
            let sdp = self.channel()?.create_offer().await?;
            self.send_signal(SignalingMethod::Offer, &SessionDescription { sdp })
                .await?;
        }
        Ok(())
    }

    fn channel(&self) -> Result<&dyn PeerChannel, LinkError> {
        self.channel
            .as_deref()
            .ok_or(LinkError::Transport(TransportError::Closed))
    }

    async fn reset_channel(&mut self) {
        self.transport_events = None;
        self.remote_description_set = false;
        self.negotiation_deadline = None;
        if let Some(channel) = self.channel.take() {
            channel.close().await;
        }
    }

    async fn disconnect(&mut self, reason: &str) {
        info!(
            "Link {} to {} disconnected: {}",
            self.ctx.connection_id, self.remote_client_id, reason
        );
        self.reset_channel().await;
        self.pending_candidates.clear();
        self.assembler.clear();
        self.set_state(LinkState::Disconnected);
    }

    async fn terminate(&mut self) {
        self.reset_channel().await;
        self.pending_candidates.clear();
        self.assembler.clear();
        self.set_state(LinkState::Terminated);
    }

    async fn handle_signal(&mut self, envelope: SignalingEnvelope) {
        if self.current() == LinkState::Terminated {
            return;
        }

        let result = match envelope.method {
            SignalingMethod::Offer => self.on_offer(&envelope).await,
            SignalingMethod::Answer => self.on_answer(&envelope).await,
            SignalingMethod::IceCandidate => self.on_remote_candidate(&envelope).await,
        };

        if let Err(e) = result {
            warn!(
                "Dropping {:?} from {}: {}",
                envelope.method, self.remote_client_id, e
            );
            self.emit(LinkEvent::SignalingError {
                connection_id: self.ctx.connection_id.clone(),
                error: e.to_string(),
            });
            if matches!(e, LinkError::Transport(_) | LinkError::Signaling(_))
                && self.current() == LinkState::Negotiating
            {
                self.disconnect("negotiation failed").await;
            }
        }
    }

    async fn on_offer(&mut self, envelope: &SignalingEnvelope) -> Result<(), LinkError> {
        if self.role == Role::Offerer {
            debug!("Ignoring offer from {} while offering", self.remote_client_id);
            return Ok(());
        }
        let offer: SessionDescription = self.open_payload(envelope)?;

        // A new offer outside a fresh negotiation means the remote side restarted
        let fresh = self.current() == LinkState::Negotiating
            && self.channel.is_some()
            && !self.remote_description_set;
        if !fresh {
            self.try_negotiate().await?;
        }

        let sdp = self.channel()?.accept_offer(&offer.sdp).await?;
        self.remote_description_set = true;
        self.flush_candidates().await;
        self.send_signal(SignalingMethod::Answer, &SessionDescription { sdp })
            .await
    }

    async fn on_answer(&mut self, envelope: &SignalingEnvelope) -> Result<(), LinkError> {
        if self.role != Role::Offerer
            || self.current() != LinkState::Negotiating
            || self.remote_description_set
        {
            debug!("Ignoring unexpected answer from {}", self.remote_client_id);
            return Ok(());
        }
        let answer: SessionDescription = self.open_payload(envelope)?;

        self.channel()?.accept_answer(&answer.sdp).await?;
        self.remote_description_set = true;
        self.flush_candidates().await;
        Ok(())
    }

    async fn on_remote_candidate(&mut self, envelope: &SignalingEnvelope) -> Result<(), LinkError> {
        let candidate: IceCandidate = self.open_payload(envelope)?;

        if self.remote_description_set {
            if let Some(channel) = self.channel.as_deref() {
                if let Err(e) = channel.add_ice_candidate(&candidate).await {
                    warn!("Rejected candidate from {}: {}", self.remote_client_id, e);
                }
                return Ok(());
            }
        }

        if self.pending_candidates.len() >= MAX_PENDING_CANDIDATES {
            self.pending_candidates.remove(0);
        }
        self.pending_candidates.push(candidate);
        Ok(())
    }

    async fn flush_candidates(&mut self) {
        let pending = std::mem::take(&mut self.pending_candidates);
        let Some(channel) = self.channel.as_deref() else {
            return;
        };
        for candidate in &pending {
            if let Err(e) = channel.add_ice_candidate(candidate).await {
                warn!("Rejected candidate from {}: {}", self.remote_client_id, e);
            }
        }
    }

    /// Hex decode, decrypt and parse an envelope payload
    fn open_payload<T: DeserializeOwned>(&self, envelope: &SignalingEnvelope) -> Result<T, LinkError> {
        let ciphertext = hex::decode(&envelope.encrypted_payload)
            .map_err(|e| LinkError::InvalidPayload(e.to_string()))?;
        let plaintext = self.ctx.cipher.decrypt(&ciphertext, &self.ctx.secret)?;
        serde_json::from_slice(&plaintext).map_err(|e| LinkError::InvalidPayload(e.to_string()))
    }

    /// Serialize, encrypt and hex encode a payload, then send it to this remote client
    async fn send_signal<T: Serialize>(
        &mut self,
        method: SignalingMethod,
        payload: &T,
    ) -> Result<(), LinkError> {
        let plaintext =
            serde_json::to_vec(payload).map_err(|e| LinkError::InvalidPayload(e.to_string()))?;
        let ciphertext = self.ctx.cipher.encrypt(&plaintext, &self.ctx.secret)?;

        let envelope = SignalingEnvelope {
            request_id: RequestId::generate().map_err(|_| LinkError::Entropy)?,
            method,
            source: self.ctx.source,
            connection_id: self.ctx.connection_id.clone(),
            encrypted_payload: hex::encode(ciphertext),
            target_client_id: Some(self.remote_client_id.clone()),
        };

        if self.recent_requests.len() >= RECENT_REQUEST_LIMIT {
            self.recent_requests.pop_front();
        }
        self.recent_requests.push_back(envelope.request_id.clone());

        self.ctx.signaling.send_envelope(&envelope).await?;
        Ok(())
    }

    async fn handle_transport_event(&mut self, event: Option<TransportEvent>) {
        let Some(event) = event else {
            self.transport_events = None;
            if self.current().is_active() {
                self.disconnect("transport went away").await;
            }
            return;
        };

        match event {
            TransportEvent::LocalIceCandidate(candidate) => {
                if let Err(e) = self
                    .send_signal(SignalingMethod::IceCandidate, &candidate)
                    .await
                {
                    warn!("Failed to forward candidate to {}: {}", self.remote_client_id, e);
                }
            }
            TransportEvent::StateChanged(ChannelState::Open) => {
                if self.current() == LinkState::Negotiating {
                    self.negotiation_deadline = None;
                    info!(
                        "Link {} to {} connected",
                        self.ctx.connection_id, self.remote_client_id
                    );
                    self.set_state(LinkState::Connected);
                }
            }
            TransportEvent::StateChanged(ChannelState::Connecting) => {}
            TransportEvent::StateChanged(state @ (ChannelState::Closed | ChannelState::Failed)) => {
                if self.current().is_active() {
                    self.disconnect(&format!("channel {:?}", state)).await;
                }
            }
            TransportEvent::Received(data) => self.handle_frame(&data).await,
        }
    }

    async fn handle_frame(&mut self, data: &[u8]) {
        let frame = match Frame::from_bytes(data) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Undecodable frame from {}: {}", self.remote_client_id, e);
                return;
            }
        };

        match frame {
            Frame::Metadata(_) | Frame::Chunk(_) => match self.assembler.ingest(&frame) {
                Ok(ReassemblyOutcome::Pending) => {}
                Ok(ReassemblyOutcome::Ready {
                    message_id,
                    payload,
                }) => {
                    debug!(
                        "Received message {} ({} bytes) from {}",
                        message_id,
                        payload.len(),
                        self.remote_client_id
                    );
                    let _ = self.outputs.inbound.send(InboundMessage {
                        connection_id: self.ctx.connection_id.clone(),
                        remote_client_id: self.remote_client_id.clone(),
                        message_id: message_id.clone(),
                        payload: Bytes::from(payload),
                    });
                    self.send_frame(&Frame::confirmation(&message_id)).await;
                }
                Ok(ReassemblyOutcome::HashMismatch(message_id)) => {
                    warn!(
                        "Message {} from {} failed verification",
                        message_id, self.remote_client_id
                    );
                    self.emit(LinkEvent::MessageRejected {
                        connection_id: self.ctx.connection_id.clone(),
                        remote_client_id: self.remote_client_id.clone(),
                        message_id: message_id.clone(),
                    });
                    self.send_frame(&Frame::hash_mismatch(&message_id)).await;
                }
                Err(e) => warn!("Dropping frame from {}: {}", self.remote_client_id, e),
            },
            Frame::ReceiveConfirmation(confirmation) => {
                self.emit(LinkEvent::DeliveryConfirmed {
                    connection_id: self.ctx.connection_id.clone(),
                    remote_client_id: self.remote_client_id.clone(),
                    message_id: confirmation.message_id,
                });
            }
            Frame::ReceiveError(error) => {
                warn!(
                    "{} rejected message {}: {}",
                    self.remote_client_id, error.message_id, error.error
                );
                self.emit(LinkEvent::DeliveryFailed {
                    connection_id: self.ctx.connection_id.clone(),
                    remote_client_id: self.remote_client_id.clone(),
                    message_id: error.message_id,
                    error: error.error,
                });
            }
            Frame::Unknown => debug!("Ignoring unknown frame from {}", self.remote_client_id),
        }
    }

    /// Best-effort control frame
    async fn send_frame(&self, frame: &Frame) {
        let Some(channel) = self.channel.as_deref() else {
            return;
        };
        let result = match frame.to_bytes() {
            Ok(bytes) => channel.send(&bytes).await.map_err(LinkError::from),
            Err(e) => Err(e.into()),
        };
        if let Err(e) = result {
            warn!("Failed to send control frame to {}: {}", self.remote_client_id, e);
        }
    }

    async fn send_message(&mut self, payload: &[u8]) -> Result<MessageId, LinkError> {
        match self.current() {
            LinkState::Connected => {}
            LinkState::Terminated => return Err(LinkError::Terminated),
            _ => return Err(LinkError::PeerNotConnected(self.remote_client_id.clone())),
        }

        let message_id = MessageId::generate().map_err(|_| LinkError::Entropy)?;
        let frames = split(&message_id, payload, self.ctx.chunk_size)?;

        for frame in &frames {
            let bytes = frame.to_bytes()?;
            let sent = match self.channel.as_deref() {
                Some(channel) => channel.send(&bytes).await,
                None => Err(TransportError::Closed),
            };
            if let Err(e) = sent {
                self.disconnect(&format!("send failed: {}", e)).await;
                return Err(e.into());
            }
        }

        debug!(
            "Sent message {} to {} in {} frames",
            message_id,
            self.remote_client_id,
            frames.len()
        );
        Ok(message_id)
    }

    fn sweep(&mut self) {
        for message_id in self.assembler.evict_expired(std::time::Instant::now()) {
            debug!(
                "Dropped incomplete message {} from {}",
                message_id, self.remote_client_id
            );
        }
    }
}
