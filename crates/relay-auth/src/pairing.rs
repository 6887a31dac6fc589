//! Device/extension pairing
//!
//! Pairing flow:
//! 1. Device and extension register independently (see [`crate::directory`])
//! 2. The device submits its public key for an extension it has scanned
//! 3. [`PairingCoordinator::pair`] validates both sides and the key, then
//!    records the pairing (replacing any earlier pairing of the same pair)
//! 4. Token requests from the extension are routed to the paired devices

use crate::device::{BrowserExtension, MobileDevice};
use crate::keys::PublicKey;
use crate::storage::Store;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use relay_core::{DeviceId, Error, ExtensionId, PairingId, PairingPolicy, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

/// A trust relationship between one device and one extension
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pairing {
    pub id: PairingId,
    pub device_id: DeviceId,
    pub extension_id: ExtensionId,
    pub device_name: String,
    /// Base64 DER public key the device paired with
    pub device_public_key: String,
    pub paired_at: DateTime<Utc>,
}

impl Pairing {
    pub fn new(
        device: &MobileDevice,
        extension: &BrowserExtension,
        device_public_key: impl Into<String>,
    ) -> Self {
        Self {
            id: PairingId::new(),
            device_id: device.id,
            extension_id: extension.id,
            device_name: device.name.clone(),
            device_public_key: device_public_key.into(),
            paired_at: Utc::now(),
        }
    }
}

/// Result of a successful pairing, handed back to the device
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairingDescriptor {
    pub pairing_id: PairingId,
    pub device_id: DeviceId,
    pub device_name: String,
    pub extension_id: ExtensionId,
    pub extension_name: String,
    /// The extension's key, so the device can encrypt tokens for it
    pub extension_public_key: String,
    pub paired_at: DateTime<Utc>,
}

/// A device as seen from the extension side
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairedDevice {
    pub device_id: DeviceId,
    pub name: String,
    pub device_public_key: String,
    pub paired_at: DateTime<Utc>,
}

impl From<&Pairing> for PairedDevice {
    fn from(pairing: &Pairing) -> Self {
        Self {
            device_id: pairing.device_id,
            name: pairing.device_name.clone(),
            device_public_key: pairing.device_public_key.clone(),
            paired_at: pairing.paired_at,
        }
    }
}

/// An extension as seen from the device side
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairedExtension {
    pub extension_id: ExtensionId,
    pub name: String,
    pub browser_name: String,
    pub browser_version: String,
    pub public_key: String,
    pub paired_at: DateTime<Utc>,
}

impl PairedExtension {
    fn new(extension: &BrowserExtension, pairing: &Pairing) -> Self {
        Self {
            extension_id: extension.id,
            name: extension.name.clone(),
            browser_name: extension.browser_name.clone(),
            browser_version: extension.browser_version.clone(),
            public_key: extension.public_key.clone(),
            paired_at: pairing.paired_at,
        }
    }
}

/// Executes the pairing handshake and answers pairing queries
pub struct PairingCoordinator {
    store: Arc<dyn Store>,
    policy: PairingPolicy,
    /// Held from the exclusivity check until the pairing is saved
    extension_locks: DashMap<ExtensionId, Arc<Mutex<()>>>,
}

impl PairingCoordinator {
    pub fn new(store: Arc<dyn Store>, policy: PairingPolicy) -> Self {
        Self {
            store,
            policy,
            extension_locks: DashMap::new(),
        }
    }

    pub fn policy(&self) -> PairingPolicy {
        self.policy
    }

    /// Pair a device with an extension
    ///
    /// Re-pairing the same (device, extension) replaces the stored pairing and
    /// keeps its id. Under [`PairingPolicy::Exclusive`] an extension already
    /// paired with a different device yields `Conflict`.
    pub async fn pair(
        &self,
        device_id: DeviceId,
        extension_id: ExtensionId,
        device_public_key: &str,
        device_name: Option<&str>,
    ) -> Result<PairingDescriptor> {
        let lock = self.extension_locks.entry(extension_id).or_default().clone();
        let _guard = lock.lock().await;

        let mut device = self
            .store
            .find_device(&device_id)
            .await?
            .ok_or_else(|| Error::not_found("Mobile device", device_id))?;
        let extension = self
            .store
            .find_extension(&extension_id)
            .await?
            .ok_or_else(|| Error::not_found("Browser extension", extension_id))?;

        let key = PublicKey::parse(device_public_key)?;
        if let Some(declared) = &device.public_key {
            if !key.same_key(declared) {
                warn!(device = %device_id, "Pairing key does not match the device's declared key");
                return Err(Error::InvalidPublicKey(
                    "key does not match the device's declared key".into(),
                ));
            }
        }

        let existing = self.store.pairings_for_extension(&extension_id).await?;
        if self.policy == PairingPolicy::Exclusive {
            if let Some(other) = existing.iter().find(|p| p.device_id != device_id) {
                return Err(Error::Conflict(format!(
                    "extension {} is already paired with device {}",
                    extension_id, other.device_id
                )));
            }
        }

        if let Some(name) = device_name {
            device.name = crate::device::validate_name(name)?;
        }

        let mut pairing = Pairing::new(&device, &extension, key.as_str());
        if let Some(previous) = existing.iter().find(|p| p.device_id == device_id) {
            pairing.id = previous.id;
            info!(pairing = %pairing.id, "Replacing existing pairing");
        }

        self.store.save_pairing(pairing.clone()).await?;

        info!(
            device = %device_id,
            extension = %extension_id,
            fingerprint = %key.fingerprint(),
            "Device paired with extension"
        );

        Ok(PairingDescriptor {
            pairing_id: pairing.id,
            device_id,
            device_name: pairing.device_name,
            extension_id,
            extension_name: extension.name,
            extension_public_key: extension.public_key,
            paired_at: pairing.paired_at,
        })
    }

    /// Remove the pairing between a device and an extension
    pub async fn unpair(&self, device_id: DeviceId, extension_id: ExtensionId) -> Result<()> {
        self.store
            .find_device(&device_id)
            .await?
            .ok_or_else(|| Error::not_found("Mobile device", device_id))?;
        self.store
            .find_extension(&extension_id)
            .await?
            .ok_or_else(|| Error::not_found("Browser extension", extension_id))?;

        if !self.store.delete_pairing(&device_id, &extension_id).await? {
            return Err(Error::not_found(
                "Pairing",
                format!("{}/{}", device_id, extension_id),
            ));
        }
        info!(device = %device_id, extension = %extension_id, "Pairing removed");
        Ok(())
    }

    /// Devices paired with an extension
    pub async fn devices_for_extension(&self, extension_id: ExtensionId) -> Result<Vec<PairedDevice>> {
        self.store
            .find_extension(&extension_id)
            .await?
            .ok_or_else(|| Error::not_found("Browser extension", extension_id))?;
        let pairings = self.store.pairings_for_extension(&extension_id).await?;
        Ok(pairings.iter().map(PairedDevice::from).collect())
    }

    /// Extensions paired with a device
    pub async fn extensions_for_device(&self, device_id: DeviceId) -> Result<Vec<PairedExtension>> {
        self.store
            .find_device(&device_id)
            .await?
            .ok_or_else(|| Error::not_found("Mobile device", device_id))?;

        let mut result = Vec::new();
        for pairing in self.store.pairings_for_device(&device_id).await? {
            match self.store.find_extension(&pairing.extension_id).await? {
                Some(extension) => result.push(PairedExtension::new(&extension, &pairing)),
                None => warn!(extension = %pairing.extension_id, "Pairing points at a removed extension"),
            }
        }
        Ok(result)
    }

    /// Whether a device is currently paired with an extension
    pub async fn is_paired(&self, device_id: DeviceId, extension_id: ExtensionId) -> Result<bool> {
        Ok(self
            .store
            .find_pairing(&device_id, &extension_id)
            .await?
            .is_some())
    }
}
