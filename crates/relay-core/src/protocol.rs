//! WebSocket protocol message types

use crate::ids::{DeviceId, ExtensionId, PairingId, TokenRequestId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle status of a token request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenStatus {
    /// Waiting for the device to answer
    Pending,
    /// Answered (or closed as completed by the extension)
    Completed,
    /// Not answered in time, or terminated by the extension
    Expired,
}

impl TokenStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, TokenStatus::Pending)
    }
}

/// Status an extension may close its own request with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CloseStatus {
    Completed,
    Terminated,
}

impl From<CloseStatus> for TokenStatus {
    fn from(status: CloseStatus) -> Self {
        match status {
            CloseStatus::Completed => TokenStatus::Completed,
            CloseStatus::Terminated => TokenStatus::Expired,
        }
    }
}

/// Server-to-client events published on channels
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    /// An extension asked the device for a token
    TokenRequested {
        request_id: TokenRequestId,
        extension_id: ExtensionId,
        domain: String,
        requested_at: DateTime<Utc>,
    },
    /// The device's connection saw the request
    TokenRequestObserved {
        request_id: TokenRequestId,
        device_id: DeviceId,
    },
    /// The device answered with a token
    TokenDelivered {
        request_id: TokenRequestId,
        device_id: DeviceId,
        token: String,
    },
    /// The extension closed the request
    TokenRequestClosed {
        request_id: TokenRequestId,
        status: TokenStatus,
    },
    /// A device completed the pairing handshake with the extension
    PairingEstablished {
        pairing_id: PairingId,
        device_id: DeviceId,
        device_name: String,
        device_public_key: String,
    },
    /// A command sent over the socket was rejected
    Error { message: String },
}

impl ServerEvent {
    /// Wire name of the event, safe to log (never includes token values)
    pub fn kind(&self) -> &'static str {
        match self {
            ServerEvent::TokenRequested { .. } => "token_requested",
            ServerEvent::TokenRequestObserved { .. } => "token_request_observed",
            ServerEvent::TokenDelivered { .. } => "token_delivered",
            ServerEvent::TokenRequestClosed { .. } => "token_request_closed",
            ServerEvent::PairingEstablished { .. } => "pairing_established",
            ServerEvent::Error { .. } => "error",
        }
    }

    /// Serialize to a JSON text frame
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Client-to-server commands sent over a channel connection
///
/// Frames that do not parse as one of these are relayed to the other
/// members of the channel untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Device acknowledges it has seen a request
    TokenObserved { request_id: TokenRequestId },
    /// Device answers a request
    SendToken {
        request_id: TokenRequestId,
        token: String,
    },
    /// Extension closes one of its requests
    CloseRequest {
        request_id: TokenRequestId,
        status: CloseStatus,
    },
}

impl ClientMessage {
    /// Try to decode a frame as a client command
    pub fn decode(frame: &[u8]) -> Option<Self> {
        serde_json::from_slice(frame).ok()
    }
}
