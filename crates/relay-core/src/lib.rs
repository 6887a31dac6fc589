//! Relay Core - Shared types and protocol definitions
//!
//! This crate provides the identifiers, configuration, error taxonomy and
//! WebSocket message types used by every other relay component.

pub mod config;
pub mod error;
pub mod ids;
pub mod protocol;

pub use config::{Config, PairingPolicy};
pub use error::{Error, Result};
pub use ids::{ChannelKey, DeviceId, ExtensionId, PairingId, TokenRequestId};
pub use protocol::{ClientMessage, CloseStatus, ServerEvent, TokenStatus};
