//! WebSocket signaling client
//!
//! One [`SignalingClient`] owns one relay socket for one connection id. A
//! reader task decodes every text frame and publishes it to all current
//! subscribers; the client itself keeps no per-link state.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use url::Url;

use peerlink_core::{ClientSource, ConnectionId, SignalingConfig};

use crate::error::SignalingError;
use crate::messages::{decode_notification, SignalingEnvelope};
use crate::session::{EnvelopeSink, NotificationFanout, NotificationStream, RelayConnector, RelaySession};

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

/// Build `<base>/<connectionId>?source=<source>&target=<target>`
pub fn relay_url(
    base: &str,
    connection_id: &ConnectionId,
    source: ClientSource,
    target: ClientSource,
) -> Result<Url, SignalingError> {
    let mut base = base.to_string();
    if !base.ends_with('/') {
        base.push('/');
    }

    let base = Url::parse(&base).map_err(|e| SignalingError::InvalidUrl(e.to_string()))?;
    let mut url = base
        .join(connection_id.as_str())
        .map_err(|e| SignalingError::InvalidUrl(e.to_string()))?;
    url.query_pairs_mut()
        .append_pair("source", source.as_str())
        .append_pair("target", target.as_str());
    Ok(url)
}

/// Live socket state
struct Connection {
    sink: WsSink,
    reader: JoinHandle<()>,
}

/// Client for one relay connection
pub struct SignalingClient {
    url: Url,
    connection_id: ConnectionId,
    connect_timeout: Duration,
    connection: Mutex<Option<Connection>>,
    fanout: Arc<NotificationFanout>,
}

impl SignalingClient {
    pub fn new(config: &SignalingConfig, connection_id: ConnectionId) -> Result<Self, SignalingError> {
        let url = relay_url(&config.relay_url, &connection_id, config.source, config.target)?;
        Ok(Self {
            url,
            connection_id,
            connect_timeout: Duration::from_secs(config.connect_timeout_secs),
            connection: Mutex::new(None),
            fanout: Arc::new(NotificationFanout::new()),
        })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Open the relay socket
    ///
    /// A no-op while a previous connection is still alive.
    pub async fn connect(&self) -> Result<(), SignalingError> {
        let mut connection = self.connection.lock().await;
        if let Some(existing) = connection.as_ref() {
            if !existing.reader.is_finished() {
                return Ok(());
            }
            debug!("Previous relay socket for {} closed, reconnecting", self.connection_id);
        }

        let (ws, _) = timeout(self.connect_timeout, connect_async(self.url.as_str()))
            .await
            .map_err(|_| SignalingError::Timeout)?
            .map_err(|e| SignalingError::Connect(e.to_string()))?;

        info!("Connected to relay for {}", self.connection_id);

        let (sink, mut stream) = ws.split();
        let fanout = self.fanout.clone();
        let connection_id = self.connection_id.clone();

        let reader = tokio::spawn(async move {
            while let Some(msg) = stream.next().await {
                match msg {
                    Ok(Message::Text(text)) => fanout.publish(decode_notification(&text)),
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(e) => {
                        warn!("Relay socket error for {}: {}", connection_id, e);
                        break;
                    }
                }
            }
            debug!("Relay socket for {} closed", connection_id);
            fanout.close();
        });

        *connection = Some(Connection { sink, reader });
        Ok(())
    }

    /// Serialize and transmit an envelope
    pub async fn send(&self, envelope: &SignalingEnvelope) -> Result<(), SignalingError> {
        let json = envelope
            .to_json()
            .map_err(|e| SignalingError::Encode(e.to_string()))?;

        let mut connection = self.connection.lock().await;
        let conn = connection.as_mut().ok_or(SignalingError::NotConnected)?;
        conn.sink
            .send(Message::Text(json))
            .await
            .map_err(|e| SignalingError::Send(e.to_string()))?;

        debug!(
            "Sent {:?} {} to relay for {}",
            envelope.method, envelope.request_id, self.connection_id
        );
        Ok(())
    }

    /// Subscribe to decoded relay notifications
    pub fn notifications(&self) -> NotificationStream {
        self.fanout.subscribe()
    }

    /// Close the socket and end all subscriptions; safe to call repeatedly
    pub async fn disconnect(&self) {
        if let Some(mut conn) = self.connection.lock().await.take() {
            let _ = conn.sink.close().await;
            conn.reader.abort();
            info!("Disconnected from relay for {}", self.connection_id);
        }
        self.fanout.close();
    }

    pub async fn is_connected(&self) -> bool {
        match self.connection.lock().await.as_ref() {
            Some(conn) => !conn.reader.is_finished(),
            None => false,
        }
    }
}

#[async_trait]
impl EnvelopeSink for SignalingClient {
    async fn send_envelope(&self, envelope: &SignalingEnvelope) -> Result<(), SignalingError> {
        self.send(envelope).await
    }
}

#[async_trait]
impl RelaySession for SignalingClient {
    fn connection_id(&self) -> &ConnectionId {
        &self.connection_id
    }

    fn notifications(&self) -> NotificationStream {
        SignalingClient::notifications(self)
    }

    async fn disconnect(&self) {
        SignalingClient::disconnect(self).await
    }
}

/// Opens a [`SignalingClient`] per connection id
pub struct WebSocketConnector {
    config: SignalingConfig,
}

impl WebSocketConnector {
    pub fn new(config: SignalingConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl RelayConnector for WebSocketConnector {
    async fn connect(
        &self,
        connection_id: &ConnectionId,
    ) -> Result<Arc<dyn RelaySession>, SignalingError> {
        let client = SignalingClient::new(&self.config, connection_id.clone())?;
        client.connect().await?;
        Ok(Arc::new(client))
    }
}
