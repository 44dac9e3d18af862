//! Signaling wire messages
//!
//! Outbound: [`SignalingEnvelope`], sent by a client to the relay.
//! Inbound: [`SignalingNotification`], pushed by the relay, tagged by `info`.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::debug;

use peerlink_core::crypto::random_hex;
use peerlink_core::{ClientSource, ConnectionId, RemoteClientId};

/// Correlates an envelope with the relay's confirmation
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(String);

impl RequestId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a random request id
    pub fn generate() -> Result<Self, peerlink_core::RandomError> {
        random_hex(16).map(Self)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Kind of session description carried by an envelope
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SignalingMethod {
    Offer,
    Answer,
    IceCandidate,
}

/// Message sent to the relay for delivery to the counterpart
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalingEnvelope {
    pub request_id: RequestId,
    pub method: SignalingMethod,
    pub source: ClientSource,
    pub connection_id: ConnectionId,
    /// Hex encoded ciphertext of the JSON payload
    pub encrypted_payload: String,
    /// Specific remote client to deliver to; all counterparts when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_client_id: Option<RemoteClientId>,
}

impl SignalingEnvelope {
    /// Build an envelope with a fresh request id
    pub fn new(
        method: SignalingMethod,
        source: ClientSource,
        connection_id: ConnectionId,
        encrypted_payload: String,
        target_client_id: Option<RemoteClientId>,
    ) -> Result<Self, peerlink_core::RandomError> {
        Ok(Self {
            request_id: RequestId::generate()?,
            method,
            source,
            connection_id,
            encrypted_payload,
            target_client_id,
        })
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Notification pushed by the relay
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SignalingNotification {
    /// Relay accepted and forwarded an envelope
    Confirmation { request_id: RequestId },

    /// Envelope from a counterpart
    RemoteData {
        request_id: RequestId,
        remote_client_id: RemoteClientId,
        envelope: SignalingEnvelope,
    },

    /// A counterpart is present on the relay
    ///
    /// `already_connected` distinguishes `remoteClientIsAlreadyConnected`
    /// (present before we joined) from `remoteClientJustConnected`.
    RemoteClientConnected {
        remote_client_id: RemoteClientId,
        already_connected: bool,
    },

    RemoteClientDisconnected { remote_client_id: RemoteClientId },

    /// No counterpart was present to receive the envelope
    MissingRemoteClient { request_id: RequestId },

    /// The relay could not parse what we sent, or we could not parse what it sent
    InvalidMessage { error: String },

    /// The relay parsed the envelope but rejected its contents
    ValidationError {
        request_id: Option<RequestId>,
        errors: String,
    },

    /// Notification tag this version does not understand
    Unknown { info: String },
}

const INFO_CONFIRMATION: &str = "confirmation";
const INFO_REMOTE_DATA: &str = "remoteData";
const INFO_JUST_CONNECTED: &str = "remoteClientJustConnected";
const INFO_ALREADY_CONNECTED: &str = "remoteClientIsAlreadyConnected";
const INFO_DISCONNECTED: &str = "remoteClientDisconnected";
const INFO_MISSING_REMOTE_CLIENT: &str = "missingRemoteClientError";
const INFO_INVALID_MESSAGE: &str = "invalidMessageError";
const INFO_VALIDATION_ERROR: &str = "validationError";

/// Flat wire shape of a relay notification
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NotificationDto {
    info: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    request_id: Option<RequestId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    remote_client_id: Option<RemoteClientId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    data: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<serde_json::Value>,
}

impl SignalingNotification {
    /// Wire tag of this notification
    pub fn info(&self) -> &str {
        match self {
            Self::Confirmation { .. } => INFO_CONFIRMATION,
            Self::RemoteData { .. } => INFO_REMOTE_DATA,
            Self::RemoteClientConnected {
                already_connected: true,
                ..
            } => INFO_ALREADY_CONNECTED,
            Self::RemoteClientConnected { .. } => INFO_JUST_CONNECTED,
            Self::RemoteClientDisconnected { .. } => INFO_DISCONNECTED,
            Self::MissingRemoteClient { .. } => INFO_MISSING_REMOTE_CLIENT,
            Self::InvalidMessage { .. } => INFO_INVALID_MESSAGE,
            Self::ValidationError { .. } => INFO_VALIDATION_ERROR,
            Self::Unknown { info } => info,
        }
    }

    /// Relay-side request id this notification refers to, if any
    pub fn request_id(&self) -> Option<&RequestId> {
        match self {
            Self::Confirmation { request_id }
            | Self::RemoteData { request_id, .. }
            | Self::MissingRemoteClient { request_id } => Some(request_id),
            Self::ValidationError { request_id, .. } => request_id.as_ref(),
            _ => None,
        }
    }

    /// Serialize to the relay wire format
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        let mut dto = NotificationDto {
            info: self.info().to_string(),
            ..Default::default()
        };

        match self {
            Self::Confirmation { request_id } | Self::MissingRemoteClient { request_id } => {
                dto.request_id = Some(request_id.clone());
            }
            Self::RemoteData {
                request_id,
                remote_client_id,
                envelope,
            } => {
                dto.request_id = Some(request_id.clone());
                dto.remote_client_id = Some(remote_client_id.clone());
                dto.data = Some(serde_json::to_value(envelope)?);
            }
            Self::RemoteClientConnected {
                remote_client_id, ..
            }
            | Self::RemoteClientDisconnected { remote_client_id } => {
                dto.remote_client_id = Some(remote_client_id.clone());
            }
            Self::InvalidMessage { error } => {
                dto.error = Some(serde_json::Value::String(error.clone()));
            }
            Self::ValidationError { request_id, errors } => {
                dto.request_id = request_id.clone();
                dto.error = Some(serde_json::Value::String(errors.clone()));
            }
            Self::Unknown { .. } => {}
        }

        serde_json::to_string(&dto)
    }
}

/// Decode one relay text frame
///
/// Never fails: anything that cannot be decoded becomes
/// [`SignalingNotification::InvalidMessage`] and unrecognized tags become
/// [`SignalingNotification::Unknown`].
pub fn decode_notification(text: &str) -> SignalingNotification {
    let dto: NotificationDto = match serde_json::from_str(text) {
        Ok(dto) => dto,
        Err(e) => {
            debug!("Undecodable relay message: {}", e);
            return SignalingNotification::InvalidMessage {
                error: format!("undecodable relay message: {}", e),
            };
        }
    };

    match from_dto(dto) {
        Ok(notification) => notification,
        Err(error) => {
            debug!("Invalid relay message: {}", error);
            SignalingNotification::InvalidMessage { error }
        }
    }
}

fn from_dto(dto: NotificationDto) -> Result<SignalingNotification, String> {
    let NotificationDto {
        info,
        request_id,
        remote_client_id,
        data,
        error,
    } = dto;

    let require_request = |id: Option<RequestId>| id.ok_or_else(|| format!("{} without requestId", info));
    let require_client =
        |id: Option<RemoteClientId>| id.ok_or_else(|| format!("{} without remoteClientId", info));

    let notification = match info.as_str() {
        INFO_CONFIRMATION => SignalingNotification::Confirmation {
            request_id: require_request(request_id)?,
        },
        INFO_REMOTE_DATA => {
            let data = data.ok_or_else(|| format!("{} without data", info))?;
            let envelope: SignalingEnvelope =
                serde_json::from_value(data).map_err(|e| format!("invalid envelope: {}", e))?;
            SignalingNotification::RemoteData {
                request_id: request_id.unwrap_or_else(|| envelope.request_id.clone()),
                remote_client_id: require_client(remote_client_id)?,
                envelope,
            }
        }
        INFO_JUST_CONNECTED | INFO_ALREADY_CONNECTED => SignalingNotification::RemoteClientConnected {
            remote_client_id: require_client(remote_client_id)?,
            already_connected: info == INFO_ALREADY_CONNECTED,
        },
        INFO_DISCONNECTED => SignalingNotification::RemoteClientDisconnected {
            remote_client_id: require_client(remote_client_id)?,
        },
        INFO_MISSING_REMOTE_CLIENT => SignalingNotification::MissingRemoteClient {
            request_id: require_request(request_id)?,
        },
        INFO_INVALID_MESSAGE => SignalingNotification::InvalidMessage {
            error: error_text(error),
        },
        INFO_VALIDATION_ERROR => SignalingNotification::ValidationError {
            request_id,
            errors: error_text(error),
        },
        _ => SignalingNotification::Unknown { info },
    };

    Ok(notification)
}

fn error_text(error: Option<serde_json::Value>) -> String {
    match error {
        Some(serde_json::Value::String(s)) => s,
        Some(other) => other.to_string(),
        None => String::new(),
    }
}
