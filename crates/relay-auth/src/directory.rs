//! Registration and removal of devices and extensions
//!
//! Removing either side also drops every pairing it takes part in.

use crate::device::{BrowserExtension, MobileDevice, Platform};
use crate::keys::PublicKey;
use crate::storage::Store;
use relay_core::{DeviceId, Error, ExtensionId, Result};
use serde::Deserialize;
use std::sync::Arc;
use tracing::info;

/// Registration payload for a mobile device
#[derive(Debug, Clone, Deserialize)]
pub struct NewDevice {
    pub name: String,
    #[serde(default)]
    pub platform: Platform,
    #[serde(default, alias = "fcm_token")]
    pub push_token: String,
    #[serde(default)]
    pub public_key: Option<String>,
}

/// Registration payload for a browser extension
#[derive(Debug, Clone, Deserialize)]
pub struct NewExtension {
    pub name: String,
    pub browser_name: String,
    pub browser_version: String,
    pub public_key: String,
}

/// Lookup and lifecycle of registered entities
#[derive(Clone)]
pub struct Directory {
    store: Arc<dyn Store>,
}

impl Directory {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub async fn register_device(&self, new: NewDevice) -> Result<MobileDevice> {
        let mut device = MobileDevice::new(&new.name, new.platform, new.push_token)?;
        if let Some(key) = new.public_key.as_deref().filter(|k| !k.trim().is_empty()) {
            device = device.with_public_key(PublicKey::parse(key)?.as_str());
        }
        self.store.save_device(device.clone()).await?;
        info!(device = %device.id, name = %device.name, "Registered mobile device");
        Ok(device)
    }

    pub async fn register_extension(&self, new: NewExtension) -> Result<BrowserExtension> {
        let key = PublicKey::parse(&new.public_key)?;
        let extension = BrowserExtension::new(
            &new.name,
            new.browser_name.trim(),
            new.browser_version.trim(),
            key.as_str(),
        )?;
        self.store.save_extension(extension.clone()).await?;
        info!(extension = %extension.id, name = %extension.name, "Registered browser extension");
        Ok(extension)
    }

    pub async fn device(&self, id: DeviceId) -> Result<MobileDevice> {
        self.store
            .find_device(&id)
            .await?
            .ok_or_else(|| Error::not_found("Mobile device", id))
    }

    pub async fn extension(&self, id: ExtensionId) -> Result<BrowserExtension> {
        self.store
            .find_extension(&id)
            .await?
            .ok_or_else(|| Error::not_found("Browser extension", id))
    }

    /// Remove a device and all of its pairings
    pub async fn remove_device(&self, id: DeviceId) -> Result<()> {
        for pairing in self.store.pairings_for_device(&id).await? {
            self.store.delete_pairing(&id, &pairing.extension_id).await?;
        }
        if !self.store.delete_device(&id).await? {
            return Err(Error::not_found("Mobile device", id));
        }
        info!(device = %id, "Removed mobile device");
        Ok(())
    }

    /// Remove an extension and all of its pairings
    pub async fn remove_extension(&self, id: ExtensionId) -> Result<()> {
        for pairing in self.store.pairings_for_extension(&id).await? {
            self.store.delete_pairing(&pairing.device_id, &id).await?;
        }
        if !self.store.delete_extension(&id).await? {
            return Err(Error::not_found("Browser extension", id));
        }
        info!(extension = %id, "Removed browser extension");
        Ok(())
    }
}
