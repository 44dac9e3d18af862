//! WebSocket relay server implementation

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::{accept_hdr_async, tungstenite::Message};
use tracing::{debug, info, warn};

use peerlink_core::{ClientSource, ConnectionId, RelayConfig};

use crate::messages::SignalingNotification;
use crate::relay::hub::RelayHub;

/// Development relay server
pub struct RelayServer {
    hub: Arc<RelayHub>,
}

impl RelayServer {
    pub fn new(config: &RelayConfig) -> Self {
        Self {
            hub: Arc::new(RelayHub::new(config)),
        }
    }

    pub fn hub(&self) -> Arc<RelayHub> {
        self.hub.clone()
    }

    /// Start the relay server
    pub async fn serve(&self, addr: SocketAddr) -> Result<(), std::io::Error> {
        let listener = TcpListener::bind(addr).await?;
        info!("Relay listening on {}", addr);
        self.serve_listener(listener).await
    }

    /// Serve connections from an already bound listener
    pub async fn serve_listener(&self, listener: TcpListener) -> Result<(), std::io::Error> {
        // Start room cleanup task
        let hub = self.hub.clone();
        let cleanup = tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_secs(60)).await;
                hub.cleanup_idle_rooms();
            }
        });

        let result = loop {
            let (stream, peer_addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => break Err(e),
            };
            let hub = self.hub.clone();

            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, peer_addr, hub).await {
                    debug!("Connection error from {}: {:?}", peer_addr, e);
                }
            });
        };

        cleanup.abort();
        result
    }
}

/// Client parameters taken from the upgrade request path
#[derive(Debug, PartialEq, Eq)]
struct JoinParams {
    connection_id: ConnectionId,
    source: ClientSource,
    target: ClientSource,
}

/// Parse `/<connectionId>?source=..&target=..`
///
/// The connection id is the last path segment so the relay can sit behind a
/// path prefix.
fn parse_join_params(path: &str, query: Option<&str>) -> Result<JoinParams, String> {
    let connection_id = path
        .rsplit('/')
        .find(|segment| !segment.is_empty())
        .ok_or_else(|| "missing connection id".to_string())?;

    let mut source = None;
    let mut target = None;
    for (key, value) in url::form_urlencoded::parse(query.unwrap_or("").as_bytes()) {
        match key.as_ref() {
            "source" => source = Some(value.parse::<ClientSource>().map_err(|e| e.to_string())?),
            "target" => target = Some(value.parse::<ClientSource>().map_err(|e| e.to_string())?),
            _ => {}
        }
    }

    let source = source.ok_or_else(|| "missing source".to_string())?;
    let target = target.unwrap_or_else(|| source.counterpart());

    Ok(JoinParams {
        connection_id: ConnectionId::new(connection_id),
        source,
        target,
    })
}

/// Handle a single connection (HTTP or WebSocket)
async fn handle_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    hub: Arc<RelayHub>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let mut peek_buf = [0u8; 12];
    let n = stream.peek(&mut peek_buf).await?;

    // Health checks are plain HTTP; everything else is a WebSocket upgrade
    if peek_buf[..n].starts_with(b"GET /health") {
        let mut stream = stream;
        return handle_http_request(&mut stream, &hub).await;
    }

    let mut request_path = String::new();
    let mut request_query = None;
    let ws_stream = accept_hdr_async(stream, |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
        request_path = req.uri().path().to_string();
        request_query = req.uri().query().map(str::to_string);
        Ok(resp)
    })
    .await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    let params = match parse_join_params(&request_path, request_query.as_deref()) {
        Ok(params) => params,
        Err(error) => {
            let notification = SignalingNotification::InvalidMessage { error };
            ws_sender.send(Message::Text(notification.to_json()?)).await?;
            ws_sender.close().await?;
            return Ok(());
        }
    };

    let (client_id, mut outbox) = match hub.join(&params.connection_id, params.source, params.target) {
        Ok(joined) => joined,
        Err(e) => {
            warn!("Rejecting {} for room {}: {}", peer_addr, params.connection_id, e);
            ws_sender.close().await?;
            return Ok(());
        }
    };
    debug!("New connection from {} as {}", peer_addr, client_id);

    let writer = tokio::spawn(async move {
        while let Some(notification) = outbox.recv().await {
            let json = match notification.to_json() {
                Ok(json) => json,
                Err(e) => {
                    warn!("Failed to encode notification: {}", e);
                    continue;
                }
            };
            if ws_sender.send(Message::Text(json)).await.is_err() {
                break;
            }
        }
        let _ = ws_sender.close().await;
    });

    while let Some(msg) = ws_receiver.next().await {
        match msg {
            Ok(Message::Text(text)) => hub.handle_message(&params.connection_id, &client_id, &text),
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                debug!("WebSocket error: {:?}", e);
                break;
            }
        }
    }

    // Cleanup on disconnect
    hub.leave(&params.connection_id, &client_id);
    writer.abort();

    debug!("Connection closed: {}", client_id);
    Ok(())
}

/// Handle an HTTP request (for health checks)
async fn handle_http_request(
    stream: &mut TcpStream,
    hub: &RelayHub,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let mut buf = vec![0u8; 1024];
    let _ = stream.read(&mut buf).await?;

    let body = format!(
        r#"{{"status":"healthy","rooms":{},"clients":{}}}"#,
        hub.room_count(),
        hub.client_count()
    );
    let response = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        body.len(),
        body
    );

    stream.write_all(response.as_bytes()).await?;
    Ok(())
}
