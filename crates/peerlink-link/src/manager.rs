//! Link manager
//!
//! Manages every link (one per connection secret) and the link connections
//! under it, handling:
//! - Relay sessions and notification routing
//! - Connection lifecycle (create, reject duplicates, restart, terminate)
//! - Reconnection with backoff after a channel drops
//! - Fan-out of outgoing messages and the merged inbound stream
//!
//! All bookkeeping happens on one supervisor task; [`LinkManager`] is a handle
//! that sends it commands.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use peerlink_core::{
    AssemblerConfig, ClientSource, Config, ConnectionId, ConnectionSecret, MessageId,
    PayloadCipher, ReassemblyConfig, ReconnectConfig, RemoteClientId,
};
use peerlink_signal::{
    EnvelopeSink, RelayConnector, RelaySession, SignalingEnvelope, SignalingError,
    SignalingMethod, SignalingNotification,
};

use crate::connection::{
    ConnectionOutputs, ConnectionUpdate, LinkConnection, LinkConnectionHandle, LinkContext, Role,
};
use crate::error::LinkError;
use crate::event::{InboundMessage, LinkEvent, LinkState};
use crate::transport::{IceConfig, PeerTransport};

const COMMAND_BUFFER: usize = 256;
const EVENT_BUFFER: usize = 256;

/// Link manager settings
#[derive(Clone, Debug)]
pub struct LinkManagerConfig {
    /// Side this process speaks for on the relay
    pub source: ClientSource,
    /// Whether our connections offer or answer
    pub role: Role,
    pub ice: IceConfig,
    pub chunk_size: usize,
    pub reassembly: ReassemblyConfig,
    pub reconnect: ReconnectConfig,
    pub negotiation_timeout: Duration,
}

impl From<&Config> for LinkManagerConfig {
    fn from(config: &Config) -> Self {
        // The wallet answers; the extension offers
        let role = match config.signaling.source {
            ClientSource::Wallet => Role::Answerer,
            ClientSource::Extension => Role::Offerer,
        };
        Self {
            source: config.signaling.source,
            role,
            ice: IceConfig::from(&config.transport),
            chunk_size: config.transport.chunk_size,
            reassembly: config.reassembly.clone(),
            reconnect: config.reconnect.clone(),
            negotiation_timeout: Duration::from_secs(config.transport.negotiation_timeout_secs),
        }
    }
}

impl Default for LinkManagerConfig {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

/// One remote client of a link
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerSummary {
    pub remote_client_id: RemoteClientId,
    pub state: LinkState,
}

/// One link and its connections
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LinkSummary {
    pub connection_id: ConnectionId,
    pub peers: Vec<PeerSummary>,
}

impl LinkSummary {
    pub fn any_connected(&self) -> bool {
        self.peers.iter().any(|p| p.state == LinkState::Connected)
    }
}

type Reply<T> = oneshot::Sender<T>;

enum ManagerCommand {
    AddLink {
        secret: ConnectionSecret,
        session: Arc<dyn RelaySession>,
        reply: Reply<()>,
    },
    HasLink {
        connection_id: ConnectionId,
        reply: Reply<bool>,
    },
    RemoveLink {
        connection_id: ConnectionId,
        reply: Reply<Result<(), LinkError>>,
    },
    /// Connected connections to send through
    Route {
        connection_id: ConnectionId,
        target: Option<RemoteClientId>,
        reply: Reply<Result<Vec<LinkConnectionHandle>, LinkError>>,
    },
    Notification {
        connection_id: ConnectionId,
        notification: SignalingNotification,
    },
    RelayClosed {
        connection_id: ConnectionId,
        session_generation: u64,
    },
    RetryDue {
        connection_id: ConnectionId,
        remote_client_id: RemoteClientId,
        generation: u64,
        attempt: u32,
    },
    Links {
        reply: Reply<Vec<LinkSummary>>,
    },
    Shutdown {
        reply: Reply<()>,
    },
}

/// Manages links and their connections
pub struct LinkManager {
    connector: Arc<dyn RelayConnector>,
    commands: mpsc::Sender<ManagerCommand>,
    events: broadcast::Sender<LinkEvent>,
    incoming: Mutex<Option<mpsc::UnboundedReceiver<InboundMessage>>>,
}

impl LinkManager {
    /// Create a manager and start its supervisor
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(
        config: LinkManagerConfig,
        connector: Arc<dyn RelayConnector>,
        transport: Arc<dyn PeerTransport>,
        cipher: Arc<dyn PayloadCipher>,
    ) -> Self {
        let (commands, command_rx) = mpsc::channel(COMMAND_BUFFER);
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        let (inbound, inbound_rx) = mpsc::unbounded_channel();
        let (updates, updates_rx) = mpsc::unbounded_channel();

        let supervisor = Supervisor {
            config,
            transport,
            cipher,
            commands: commands.downgrade(),
            outputs: ConnectionOutputs {
                updates,
                events: events.clone(),
                inbound,
            },
            links: HashMap::new(),
            next_generation: 0,
        };
        tokio::spawn(supervisor.run(command_rx, updates_rx));

        Self {
            connector,
            commands,
            events,
            incoming: Mutex::new(Some(inbound_rx)),
        }
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(Reply<T>) -> ManagerCommand,
    ) -> Result<T, LinkError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(make(reply))
            .await
            .map_err(|_| LinkError::Terminated)?;
        rx.await.map_err(|_| LinkError::Terminated)
    }

    /// Connect to the relay for a secret and start accepting remote clients
    ///
    /// Adding a secret that already has a link is a no-op.
    pub async fn add_link(&self, secret: ConnectionSecret) -> Result<ConnectionId, LinkError> {
        let connection_id = secret.connection_id();
        let exists = self
            .request(|reply| ManagerCommand::HasLink {
                connection_id: connection_id.clone(),
                reply,
            })
            .await?;
        if exists {
            debug!("Link {} already exists", connection_id);
            return Ok(connection_id);
        }

        let session = self.connector.connect(&connection_id).await?;
        self.request(|reply| ManagerCommand::AddLink {
            secret,
            session,
            reply,
        })
        .await?;

        info!("Added link {}", connection_id);
        Ok(connection_id)
    }

    /// Terminate every connection of a link and leave the relay
    pub async fn remove_link(&self, secret: &ConnectionSecret) -> Result<(), LinkError> {
        let connection_id = secret.connection_id();
        self.request(|reply| ManagerCommand::RemoveLink {
            connection_id,
            reply,
        })
        .await?
    }

    /// Send a message to every connected remote client of a link
    ///
    /// Returns how many remote clients accepted it.
    pub async fn send(
        &self,
        secret: &ConnectionSecret,
        payload: impl Into<Bytes>,
    ) -> Result<usize, LinkError> {
        let connection_id = secret.connection_id();
        let payload = payload.into();
        let handles = self
            .request(|reply| ManagerCommand::Route {
                connection_id: connection_id.clone(),
                target: None,
                reply,
            })
            .await??;

        let mut delivered = 0;
        for handle in handles {
            match handle.send(payload.clone()).await {
                Ok(message_id) => {
                    debug!("Sent {} to {}", message_id, handle.remote_client_id());
                    delivered += 1;
                }
                Err(e) => warn!("Send to {} failed: {}", handle.remote_client_id(), e),
            }
        }

        if delivered == 0 {
            return Err(LinkError::NoConnectedPeers(connection_id));
        }
        Ok(delivered)
    }

    /// Send a message to one remote client
    pub async fn send_to(
        &self,
        secret: &ConnectionSecret,
        remote_client_id: &RemoteClientId,
        payload: impl Into<Bytes>,
    ) -> Result<MessageId, LinkError> {
        let handles = self
            .request(|reply| ManagerCommand::Route {
                connection_id: secret.connection_id(),
                target: Some(remote_client_id.clone()),
                reply,
            })
            .await??;
        let handle = handles
            .into_iter()
            .next()
            .ok_or_else(|| LinkError::PeerNotConnected(remote_client_id.clone()))?;
        handle.send(payload.into()).await
    }

    /// Merged stream of verified messages from every link
    ///
    /// Only the first call gets the stream.
    pub fn incoming_messages(&self) -> Option<mpsc::UnboundedReceiver<InboundMessage>> {
        self.incoming.lock().take()
    }

    /// Subscribe to link events
    pub fn subscribe(&self) -> broadcast::Receiver<LinkEvent> {
        self.events.subscribe()
    }

    /// Snapshot of every link
    pub async fn links(&self) -> Vec<LinkSummary> {
        self.request(|reply| ManagerCommand::Links { reply })
            .await
            .unwrap_or_default()
    }

    /// Whether any connection of any link is Connected
    pub async fn any_connected(&self) -> bool {
        self.links().await.iter().any(LinkSummary::any_connected)
    }

    /// Remote clients of a link whose connection is Connected
    pub async fn connected_peers(&self, secret: &ConnectionSecret) -> Vec<RemoteClientId> {
        let connection_id = secret.connection_id();
        self.links()
            .await
            .into_iter()
            .filter(|link| link.connection_id == connection_id)
            .flat_map(|link| link.peers)
            .filter(|peer| peer.state == LinkState::Connected)
            .map(|peer| peer.remote_client_id)
            .collect()
    }

    /// Terminate every link and stop the supervisor
    pub async fn shutdown(&self) {
        if self
            .request(|reply| ManagerCommand::Shutdown { reply })
            .await
            .is_err()
        {
            debug!("Link manager already stopped");
        }
    }
}

/// Lets a relay session stand in as the envelope sink of its connections
struct SessionSink(Arc<dyn RelaySession>);

#[async_trait]
impl EnvelopeSink for SessionSink {
    async fn send_envelope(&self, envelope: &SignalingEnvelope) -> Result<(), SignalingError> {
        self.0.send_envelope(envelope).await
    }
}

struct ManagedConnection {
    handle: LinkConnectionHandle,
    /// Reconnection attempts since the last successful connect
    attempts: u32,
    /// Whether the relay reports the remote client as present
    remote_present: bool,
}

struct ManagedLink {
    ctx: Arc<LinkContext>,
    session: Arc<dyn RelaySession>,
    session_generation: u64,
    router: JoinHandle<()>,
    connections: HashMap<RemoteClientId, ManagedConnection>,
}

struct Supervisor {
    config: LinkManagerConfig,
    transport: Arc<dyn PeerTransport>,
    cipher: Arc<dyn PayloadCipher>,
    /// Weak so routers and timers do not keep the supervisor alive
    commands: mpsc::WeakSender<ManagerCommand>,
    outputs: ConnectionOutputs,
    links: HashMap<ConnectionId, ManagedLink>,
    next_generation: u64,
}

impl Supervisor {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<ManagerCommand>,
        mut updates: mpsc::UnboundedReceiver<ConnectionUpdate>,
    ) {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(ManagerCommand::Shutdown { reply }) => {
                        self.shutdown().await;
                        let _ = reply.send(());
                        return;
                    }
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                Some(update) = updates.recv() => self.handle_update(update),
            }
        }
        self.shutdown().await;
    }

    fn generation(&mut self) -> u64 {
        self.next_generation += 1;
        self.next_generation
    }

    fn emit(&self, event: LinkEvent) {
        let _ = self.outputs.events.send(event);
    }

    async fn handle_command(&mut self, command: ManagerCommand) {
        match command {
            ManagerCommand::AddLink {
                secret,
                session,
                reply,
            } => {
                self.add_link(secret, session).await;
                let _ = reply.send(());
            }
            ManagerCommand::HasLink {
                connection_id,
                reply,
            } => {
                let _ = reply.send(self.links.contains_key(&connection_id));
            }
            ManagerCommand::RemoveLink {
                connection_id,
                reply,
            } => {
                let result = match self.links.remove(&connection_id) {
                    Some(link) => {
                        close_link(link).await;
                        info!("Removed link {}", connection_id);
                        Ok(())
                    }
                    None => Err(LinkError::UnknownLink(connection_id)),
                };
                let _ = reply.send(result);
            }
            ManagerCommand::Route {
                connection_id,
                target,
                reply,
            } => {
                let _ = reply.send(self.route(&connection_id, target.as_ref()));
            }
            ManagerCommand::Notification {
                connection_id,
                notification,
            } => self.handle_notification(&connection_id, notification),
            ManagerCommand::RelayClosed {
                connection_id,
                session_generation,
            } => self.relay_closed(&connection_id, session_generation).await,
            ManagerCommand::RetryDue {
                connection_id,
                remote_client_id,
                generation,
                attempt,
            } => self.retry_due(&connection_id, &remote_client_id, generation, attempt),
            ManagerCommand::Links { reply } => {
                let _ = reply.send(self.summaries());
            }
            ManagerCommand::Shutdown { reply } => {
                self.shutdown().await;
                let _ = reply.send(());
            }
        }
    }

    async fn add_link(&mut self, secret: ConnectionSecret, session: Arc<dyn RelaySession>) {
        let connection_id = secret.connection_id();
        if self.links.contains_key(&connection_id) {
            // Lost a race with a concurrent add; keep the first session
            session.disconnect().await;
            return;
        }

        let session_generation = self.generation();
        let ctx = Arc::new(LinkContext {
            secret,
            connection_id: connection_id.clone(),
            source: self.config.source,
            signaling: Arc::new(SessionSink(session.clone())),
            transport: self.transport.clone(),
            cipher: self.cipher.clone(),
            ice: self.config.ice.clone(),
            chunk_size: self.config.chunk_size,
            assembler: AssemblerConfig::from(&self.config.reassembly),
            sweep_interval: Duration::from_secs(self.config.reassembly.sweep_interval_secs.max(1)),
            negotiation_timeout: self.config.negotiation_timeout,
        });

        let mut notifications = session.notifications();
        let commands = self.commands.clone();
        let router_id = connection_id.clone();
        let router = tokio::spawn(async move {
            while let Some(notification) = notifications.recv().await {
                let Some(tx) = commands.upgrade() else { return };
                let command = ManagerCommand::Notification {
                    connection_id: router_id.clone(),
                    notification,
                };
                if tx.send(command).await.is_err() {
                    return;
                }
            }
            if let Some(tx) = commands.upgrade() {
                let _ = tx
                    .send(ManagerCommand::RelayClosed {
                        connection_id: router_id,
                        session_generation,
                    })
                    .await;
            }
        });

        self.links.insert(
            connection_id,
            ManagedLink {
                ctx,
                session,
                session_generation,
                router,
                connections: HashMap::new(),
            },
        );
    }

    fn route(
        &self,
        connection_id: &ConnectionId,
        target: Option<&RemoteClientId>,
    ) -> Result<Vec<LinkConnectionHandle>, LinkError> {
        let link = self
            .links
            .get(connection_id)
            .ok_or_else(|| LinkError::UnknownLink(connection_id.clone()))?;

        if let Some(target) = target {
            return match link.connections.get(target) {
                Some(conn) if conn.handle.state() == LinkState::Connected => {
                    Ok(vec![conn.handle.clone()])
                }
                _ => Err(LinkError::PeerNotConnected(target.clone())),
            };
        }

        let handles: Vec<_> = link
            .connections
            .values()
            .filter(|conn| conn.handle.state() == LinkState::Connected)
            .map(|conn| conn.handle.clone())
            .collect();
        if handles.is_empty() {
            return Err(LinkError::NoConnectedPeers(connection_id.clone()));
        }
        Ok(handles)
    }

    /// Spawn a connection for a remote client, replacing any previous one
    fn create_connection(
        &mut self,
        connection_id: &ConnectionId,
        remote_client_id: RemoteClientId,
    ) -> Option<LinkConnectionHandle> {
        let generation = self.generation();
        let link = self.links.get_mut(connection_id)?;

        let handle = LinkConnection::spawn(
            link.ctx.clone(),
            remote_client_id.clone(),
            self.config.role,
            generation,
            self.outputs.clone(),
        );
        info!("New connection to {} on {}", remote_client_id, connection_id);

        if let Some(old) = link.connections.insert(
            remote_client_id,
            ManagedConnection {
                handle: handle.clone(),
                attempts: 0,
                remote_present: true,
            },
        ) {
            old.handle.terminate();
        }
        Some(handle)
    }

    fn handle_notification(
        &mut self,
        connection_id: &ConnectionId,
        notification: SignalingNotification,
    ) {
        if !self.links.contains_key(connection_id) {
            return;
        }

        match notification {
            SignalingNotification::RemoteClientConnected {
                remote_client_id,
                already_connected,
            } => {
                debug!(
                    "Remote client {} on {} (already connected: {})",
                    remote_client_id, connection_id, already_connected
                );
                self.remote_connected(connection_id, remote_client_id);
            }
            SignalingNotification::RemoteClientDisconnected { remote_client_id } => {
                let Some(conn) = self.connection_mut(connection_id, &remote_client_id) else {
                    return;
                };
                conn.remote_present = false;
                if conn.handle.state().is_active() {
                    // Pruned once its Disconnected update arrives
                    conn.handle.remote_disconnected();
                } else {
                    self.prune(connection_id, &remote_client_id);
                }
            }
            SignalingNotification::RemoteData {
                remote_client_id,
                envelope,
                ..
            } => self.remote_data(connection_id, remote_client_id, envelope),
            SignalingNotification::MissingRemoteClient { request_id } => {
                if let Some(link) = self.links.get(connection_id) {
                    for conn in link.connections.values() {
                        conn.handle.request_failed(request_id.clone());
                    }
                }
            }
            SignalingNotification::Confirmation { .. } => {}
            SignalingNotification::InvalidMessage { error }
            | SignalingNotification::ValidationError { errors: error, .. } => {
                warn!("Relay rejected a message on {}: {}", connection_id, error);
                self.emit(LinkEvent::SignalingError {
                    connection_id: connection_id.clone(),
                    error,
                });
            }
            SignalingNotification::Unknown { info } => {
                debug!("Ignoring relay notification {:?} on {}", info, connection_id);
            }
        }
    }

    fn connection_mut(
        &mut self,
        connection_id: &ConnectionId,
        remote_client_id: &RemoteClientId,
    ) -> Option<&mut ManagedConnection> {
        self.links
            .get_mut(connection_id)?
            .connections
            .get_mut(remote_client_id)
    }

    fn remote_connected(&mut self, connection_id: &ConnectionId, remote_client_id: RemoteClientId) {
        let existing = self
            .connection_mut(connection_id, &remote_client_id)
            .map(|conn| {
                conn.remote_present = true;
                conn.handle.state()
            });

        match existing {
            Some(LinkState::Idle | LinkState::Negotiating | LinkState::Connected) => {
                info!(
                    "Rejecting duplicate connect from {} on {}",
                    remote_client_id, connection_id
                );
                self.emit(LinkEvent::DuplicateRemoteClient {
                    connection_id: connection_id.clone(),
                    remote_client_id,
                });
            }
            Some(LinkState::Disconnected) => {
                if let Some(conn) = self.connection_mut(connection_id, &remote_client_id) {
                    conn.attempts = 0;
                    conn.handle.retry();
                }
            }
            Some(LinkState::Terminated) | None => {
                if let Some(handle) = self.create_connection(connection_id, remote_client_id) {
                    handle.start();
                }
            }
        }
    }

    fn remote_data(
        &mut self,
        connection_id: &ConnectionId,
        remote_client_id: RemoteClientId,
        envelope: SignalingEnvelope,
    ) {
        let live = self
            .connection_mut(connection_id, &remote_client_id)
            .filter(|conn| conn.handle.state() != LinkState::Terminated)
            .map(|conn| conn.handle.clone());

        match live {
            Some(handle) => handle.signal(envelope),
            // An offer may be the first thing we hear from a client
            None if envelope.method == SignalingMethod::Offer => {
                if let Some(handle) = self.create_connection(connection_id, remote_client_id) {
                    handle.start();
                    handle.signal(envelope);
                }
            }
            None => debug!(
                "Dropping {:?} from unknown client {} on {}",
                envelope.method, remote_client_id, connection_id
            ),
        }
    }

    /// The relay session ended; drop the link so `add_link` can open a new one
    async fn relay_closed(&mut self, connection_id: &ConnectionId, session_generation: u64) {
        let current = self
            .links
            .get(connection_id)
            .is_some_and(|link| link.session_generation == session_generation);
        if !current {
            return;
        }

        warn!("Relay session for {} ended, closing link", connection_id);
        if let Some(link) = self.links.remove(connection_id) {
            close_link(link).await;
        }
        self.emit(LinkEvent::RelayDisconnected {
            connection_id: connection_id.clone(),
        });
    }

    /// Terminate and forget a connection whose remote client left the relay
    fn prune(&mut self, connection_id: &ConnectionId, remote_client_id: &RemoteClientId) {
        let removed = self
            .links
            .get_mut(connection_id)
            .and_then(|link| link.connections.remove(remote_client_id));
        if let Some(conn) = removed {
            debug!(
                "Dropping connection to departed {} on {}",
                remote_client_id, connection_id
            );
            conn.handle.terminate();
        }
    }

    fn retry_due(
        &mut self,
        connection_id: &ConnectionId,
        remote_client_id: &RemoteClientId,
        generation: u64,
        attempt: u32,
    ) {
        let Some(conn) = self.connection_mut(connection_id, remote_client_id) else {
            return;
        };
        if conn.handle.generation() == generation
            && conn.attempts == attempt
            && conn.remote_present
            && conn.handle.state() == LinkState::Disconnected
        {
            conn.handle.retry();
        }
    }

    fn handle_update(&mut self, update: ConnectionUpdate) {
        self.emit(LinkEvent::StateChanged {
            connection_id: update.connection_id.clone(),
            remote_client_id: update.remote_client_id.clone(),
            state: update.state,
        });

        let Some(link) = self.links.get_mut(&update.connection_id) else {
            return;
        };
        let Some(conn) = link.connections.get_mut(&update.remote_client_id) else {
            return;
        };
        if conn.handle.generation() != update.generation {
            return;
        }

        match update.state {
            LinkState::Connected => conn.attempts = 0,
            LinkState::Disconnected if !conn.remote_present => {
                self.prune(&update.connection_id, &update.remote_client_id);
            }
            LinkState::Disconnected => {
                let attempt = conn.attempts + 1;
                let reconnect = &self.config.reconnect;
                if reconnect.allows(attempt) {
                    conn.attempts = attempt;
                    let delay = reconnect.delay_for(attempt);
                    info!(
                        "Reconnecting to {} on {} in {:?} (attempt {})",
                        update.remote_client_id, update.connection_id, delay, attempt
                    );
                    let _ = self.outputs.events.send(LinkEvent::Reconnecting {
                        connection_id: update.connection_id.clone(),
                        remote_client_id: update.remote_client_id.clone(),
                        attempt,
                    });

                    let commands = self.commands.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        if let Some(tx) = commands.upgrade() {
                            let _ = tx
                                .send(ManagerCommand::RetryDue {
                                    connection_id: update.connection_id,
                                    remote_client_id: update.remote_client_id,
                                    generation: update.generation,
                                    attempt,
                                })
                                .await;
                        }
                    });
                } else if reconnect.enabled {
                    warn!(
                        "Giving up on {} on {} after {} attempts",
                        update.remote_client_id, update.connection_id, conn.attempts
                    );
                    conn.handle.terminate();
                }
            }
            LinkState::Terminated => {
                link.connections.remove(&update.remote_client_id);
            }
            _ => {}
        }
    }

    fn summaries(&self) -> Vec<LinkSummary> {
        let mut links: Vec<_> = self
            .links
            .iter()
            .map(|(connection_id, link)| {
                let mut peers: Vec<_> = link
                    .connections
                    .values()
                    .map(|conn| PeerSummary {
                        remote_client_id: conn.handle.remote_client_id().clone(),
                        state: conn.handle.state(),
                    })
                    .collect();
                peers.sort_by(|a, b| a.remote_client_id.cmp(&b.remote_client_id));
                LinkSummary {
                    connection_id: connection_id.clone(),
                    peers,
                }
            })
            .collect();
        links.sort_by(|a, b| a.connection_id.cmp(&b.connection_id));
        links
    }

    async fn shutdown(&mut self) {
        for (connection_id, link) in self.links.drain() {
            close_link(link).await;
            debug!("Closed link {}", connection_id);
        }
    }
}

async fn close_link(link: ManagedLink) {
    link.router.abort();
    for conn in link.connections.values() {
        conn.handle.terminate();
    }
    link.session.disconnect().await;
}
