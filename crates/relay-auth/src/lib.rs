//! Registration, pairing and persistence for the 2FA token relay
//!
//! Handles:
//! - Mobile device and browser extension records
//! - Public key validation and fingerprints
//! - The pairing handshake and its exclusivity policy
//! - Token request records and their status transitions
//! - JSON-file persistence behind the [`Store`] trait

pub mod device;
pub mod directory;
pub mod keys;
pub mod pairing;
pub mod storage;
pub mod token;

pub use device::{BrowserExtension, MobileDevice, Platform};
pub use directory::{Directory, NewDevice, NewExtension};
pub use keys::PublicKey;
pub use pairing::{PairedDevice, PairedExtension, Pairing, PairingCoordinator, PairingDescriptor};
pub use storage::{JsonStore, StorageError, Store};
pub use token::{chrono_duration, TokenRequest};
