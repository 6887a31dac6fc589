//! Typed identifiers for relay entities and channels

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Generate a new random identifier
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// Parse from a UUID string
            pub fn parse(s: &str) -> Result<Self, uuid::Error> {
                Ok(Self(Uuid::parse_str(s)?))
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::parse(s)
            }
        }
    };
}

uuid_id!(
    /// Unique identifier of a mobile authenticator device
    DeviceId
);
uuid_id!(
    /// Unique identifier of a browser extension installation
    ExtensionId
);
uuid_id!(
    /// Unique identifier of a device/extension pairing
    PairingId
);
uuid_id!(
    /// Unique identifier of a 2FA token request
    TokenRequestId
);

/// Key of a broadcast channel
///
/// Devices listen on `device:<id>`, extensions on `extension:<id>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChannelKey(String);

impl ChannelKey {
    pub fn device(id: DeviceId) -> Self {
        Self(format!("device:{}", id))
    }

    pub fn extension(id: ExtensionId) -> Self {
        Self(format!("extension:{}", id))
    }

    /// Build a key from an arbitrary string (used by tests and custom scopes)
    pub fn raw(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChannelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
