//! Persistence for devices, extensions, pairings and token requests
//!
//! [`Store`] is the narrow interface the coordinators use. [`JsonStore`]
//! implements it with an in-memory map that is optionally mirrored to a JSON
//! file in `~/.config/twofa-relay/store.json`.

use crate::device::{BrowserExtension, MobileDevice};
use crate::pairing::Pairing;
use crate::token::TokenRequest;
use async_trait::async_trait;
use relay_core::{DeviceId, ExtensionId, TokenRequestId, TokenStatus};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Storage errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Configuration directory not found")]
    NoConfigDir,
}

impl From<StorageError> for relay_core::Error {
    fn from(e: StorageError) -> Self {
        relay_core::Error::Storage(e.to_string())
    }
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Persistence collaborator used by the coordinators
///
/// Lookups return `Ok(None)` when a record is absent; deletes report whether
/// something was removed. Implementations must make `save_*` and `find_*` on
/// the same id linearizable.
#[async_trait]
pub trait Store: Send + Sync {
    async fn save_device(&self, device: MobileDevice) -> StorageResult<()>;
    async fn find_device(&self, id: &DeviceId) -> StorageResult<Option<MobileDevice>>;
    async fn delete_device(&self, id: &DeviceId) -> StorageResult<bool>;

    async fn save_extension(&self, extension: BrowserExtension) -> StorageResult<()>;
    async fn find_extension(&self, id: &ExtensionId) -> StorageResult<Option<BrowserExtension>>;
    async fn delete_extension(&self, id: &ExtensionId) -> StorageResult<bool>;

    /// Insert or replace the pairing for its (device, extension) pair
    async fn save_pairing(&self, pairing: Pairing) -> StorageResult<()>;
    async fn find_pairing(
        &self,
        device_id: &DeviceId,
        extension_id: &ExtensionId,
    ) -> StorageResult<Option<Pairing>>;
    async fn pairings_for_device(&self, device_id: &DeviceId) -> StorageResult<Vec<Pairing>>;
    async fn pairings_for_extension(&self, extension_id: &ExtensionId)
        -> StorageResult<Vec<Pairing>>;
    async fn delete_pairing(
        &self,
        device_id: &DeviceId,
        extension_id: &ExtensionId,
    ) -> StorageResult<bool>;

    async fn save_token_request(&self, request: TokenRequest) -> StorageResult<()>;
    async fn find_token_request(&self, id: &TokenRequestId)
        -> StorageResult<Option<TokenRequest>>;
    /// Pending requests addressed to a device, oldest first
    async fn find_pending(&self, device_id: &DeviceId) -> StorageResult<Vec<TokenRequest>>;
    async fn token_requests(&self) -> StorageResult<Vec<TokenRequest>>;
    async fn delete_token_request(&self, id: &TokenRequestId) -> StorageResult<bool>;
}

/// Stored data structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct StoredData {
    #[serde(default)]
    devices: HashMap<String, MobileDevice>,
    #[serde(default)]
    extensions: HashMap<String, BrowserExtension>,
    /// Keyed by `<device id>/<extension id>`
    #[serde(default)]
    pairings: HashMap<String, Pairing>,
    #[serde(default)]
    token_requests: HashMap<String, TokenRequest>,
}

fn pairing_key(device_id: &DeviceId, extension_id: &ExtensionId) -> String {
    format!("{}/{}", device_id, extension_id)
}

/// Map-backed store with optional JSON file persistence
pub struct JsonStore {
    /// Path to the storage file; None keeps everything in memory
    path: Option<PathBuf>,
    data: RwLock<StoredData>,
}

impl JsonStore {
    /// Create a store at the default path, loading existing data
    pub async fn new() -> StorageResult<Self> {
        let path = Self::default_path()?;
        Self::with_path(path).await
    }

    /// Create a store that never touches disk
    pub fn in_memory() -> Self {
        Self {
            path: None,
            data: RwLock::new(StoredData::default()),
        }
    }

    /// Create a store at a specific path
    pub async fn with_path(path: PathBuf) -> StorageResult<Self> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let data = if tokio::fs::try_exists(&path).await? {
            let contents = tokio::fs::read_to_string(&path).await?;
            match serde_json::from_str(&contents) {
                Ok(data) => {
                    info!("Loaded store from {:?}", path);
                    data
                }
                Err(e) => {
                    warn!("Failed to parse store, starting fresh: {}", e);
                    StoredData::default()
                }
            }
        } else {
            debug!("No existing store, creating new");
            StoredData::default()
        };

        Ok(Self {
            path: Some(path),
            data: RwLock::new(data),
        })
    }

    /// Get the default storage path (~/.config/twofa-relay/store.json)
    pub fn default_path() -> StorageResult<PathBuf> {
        let config_dir = dirs::config_dir().ok_or(StorageError::NoConfigDir)?;
        Ok(config_dir.join("twofa-relay").join("store.json"))
    }

    /// Apply a mutation and persist it
    ///
    /// The change is made on a copy that only replaces the live data once the
    /// file write has succeeded, so a failed write leaves the store unchanged.
    /// The write lock is held across the write so snapshots land in order.
    async fn mutate<T>(&self, f: impl FnOnce(&mut StoredData) -> T) -> StorageResult<T> {
        let mut data = self.data.write().await;
        let Some(path) = &self.path else {
            return Ok(f(&mut data));
        };

        let mut next = data.clone();
        let result = f(&mut next);
        let json = serde_json::to_string_pretty(&next)?;
        tokio::fs::write(path, json).await?;
        debug!("Saved store to {:?}", path);

        *data = next;
        Ok(result)
    }
}

#[async_trait]
impl Store for JsonStore {
    async fn save_device(&self, device: MobileDevice) -> StorageResult<()> {
        self.mutate(|data| {
            data.devices.insert(device.id.to_string(), device);
        })
        .await
    }

    async fn find_device(&self, id: &DeviceId) -> StorageResult<Option<MobileDevice>> {
        let data = self.data.read().await;
        Ok(data.devices.get(&id.to_string()).cloned())
    }

    async fn delete_device(&self, id: &DeviceId) -> StorageResult<bool> {
        self.mutate(|data| data.devices.remove(&id.to_string()).is_some())
            .await
    }

    async fn save_extension(&self, extension: BrowserExtension) -> StorageResult<()> {
        self.mutate(|data| {
            data.extensions.insert(extension.id.to_string(), extension);
        })
        .await
    }

    async fn find_extension(&self, id: &ExtensionId) -> StorageResult<Option<BrowserExtension>> {
        let data = self.data.read().await;
        Ok(data.extensions.get(&id.to_string()).cloned())
    }

    async fn delete_extension(&self, id: &ExtensionId) -> StorageResult<bool> {
        self.mutate(|data| data.extensions.remove(&id.to_string()).is_some())
            .await
    }

    async fn save_pairing(&self, pairing: Pairing) -> StorageResult<()> {
        self.mutate(|data| {
            let key = pairing_key(&pairing.device_id, &pairing.extension_id);
            data.pairings.insert(key, pairing);
        })
        .await
    }

    async fn find_pairing(
        &self,
        device_id: &DeviceId,
        extension_id: &ExtensionId,
    ) -> StorageResult<Option<Pairing>> {
        let data = self.data.read().await;
        Ok(data
            .pairings
            .get(&pairing_key(device_id, extension_id))
            .cloned())
    }

    async fn pairings_for_device(&self, device_id: &DeviceId) -> StorageResult<Vec<Pairing>> {
        let data = self.data.read().await;
        let mut pairings: Vec<Pairing> = data
            .pairings
            .values()
            .filter(|p| p.device_id == *device_id)
            .cloned()
            .collect();
        pairings.sort_by_key(|p| p.paired_at);
        Ok(pairings)
    }

    async fn pairings_for_extension(
        &self,
        extension_id: &ExtensionId,
    ) -> StorageResult<Vec<Pairing>> {
        let data = self.data.read().await;
        let mut pairings: Vec<Pairing> = data
            .pairings
            .values()
            .filter(|p| p.extension_id == *extension_id)
            .cloned()
            .collect();
        pairings.sort_by_key(|p| p.paired_at);
        Ok(pairings)
    }

    async fn delete_pairing(
        &self,
        device_id: &DeviceId,
        extension_id: &ExtensionId,
    ) -> StorageResult<bool> {
        let key = pairing_key(device_id, extension_id);
        self.mutate(|data| data.pairings.remove(&key).is_some())
            .await
    }

    async fn save_token_request(&self, request: TokenRequest) -> StorageResult<()> {
        self.mutate(|data| {
            data.token_requests.insert(request.id.to_string(), request);
        })
        .await
    }

    async fn find_token_request(
        &self,
        id: &TokenRequestId,
    ) -> StorageResult<Option<TokenRequest>> {
        let data = self.data.read().await;
        Ok(data.token_requests.get(&id.to_string()).cloned())
    }

    async fn find_pending(&self, device_id: &DeviceId) -> StorageResult<Vec<TokenRequest>> {
        let data = self.data.read().await;
        let mut pending: Vec<TokenRequest> = data
            .token_requests
            .values()
            .filter(|r| r.status == TokenStatus::Pending && r.is_addressed_to(device_id))
            .cloned()
            .collect();
        pending.sort_by_key(|r| r.created_at);
        Ok(pending)
    }

    async fn token_requests(&self) -> StorageResult<Vec<TokenRequest>> {
        let data = self.data.read().await;
        Ok(data.token_requests.values().cloned().collect())
    }

    async fn delete_token_request(&self, id: &TokenRequestId) -> StorageResult<bool> {
        self.mutate(|data| data.token_requests.remove(&id.to_string()).is_some())
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Platform;
    use crate::keys::tests::sample_key;
    use tempfile::tempdir;

    fn device() -> MobileDevice {
        MobileDevice::new("Test", Platform::Android, "fcm").unwrap()
    }

    fn extension() -> BrowserExtension {
        BrowserExtension::new("go-ext", "go-browser", "0.1", sample_key(1, 64)).unwrap()
    }

    #[tokio::test]
    async fn test_device_crud() {
        let store = JsonStore::in_memory();
        let device = device();
        let id = device.id;

        store.save_device(device).await.unwrap();
        assert_eq!(store.find_device(&id).await.unwrap().unwrap().name, "Test");

        assert!(store.delete_device(&id).await.unwrap());
        assert!(store.find_device(&id).await.unwrap().is_none());
        assert!(!store.delete_device(&id).await.unwrap());
    }

    #[tokio::test]
    async fn test_pairing_is_replaced_per_pair() {
        let store = JsonStore::in_memory();
        let device = device();
        let extension = extension();

        let first = Pairing::new(&device, &extension, sample_key(2, 64));
        let second = Pairing::new(&device, &extension, sample_key(3, 64));
        store.save_pairing(first).await.unwrap();
        store.save_pairing(second.clone()).await.unwrap();

        let for_ext = store.pairings_for_extension(&extension.id).await.unwrap();
        assert_eq!(for_ext.len(), 1);
        assert_eq!(for_ext[0].device_public_key, second.device_public_key);
        assert_eq!(store.pairings_for_device(&device.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_find_pending_filters_and_orders() {
        let store = JsonStore::in_memory();
        let device_id = DeviceId::new();
        let extension_id = ExtensionId::new();

        let mut older = TokenRequest::new(extension_id, vec![device_id], "a.com").unwrap();
        older.created_at -= chrono::Duration::seconds(10);
        let newer = TokenRequest::new(extension_id, vec![device_id], "b.com").unwrap();
        let mut done = TokenRequest::new(extension_id, vec![device_id], "c.com").unwrap();
        done.complete(Some("1".into())).unwrap();
        let other = TokenRequest::new(extension_id, vec![DeviceId::new()], "d.com").unwrap();

        for r in [newer.clone(), done, other, older.clone()] {
            store.save_token_request(r).await.unwrap();
        }

        let pending = store.find_pending(&device_id).await.unwrap();
        let domains: Vec<&str> = pending.iter().map(|r| r.domain.as_str()).collect();
        assert_eq!(domains, vec!["a.com", "b.com"]);
        assert_eq!(store.token_requests().await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_storage_persistence() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.json");

        let device_id;
        let request_id;
        {
            let store = JsonStore::with_path(path.clone()).await.unwrap();
            let device = device();
            device_id = device.id;
            store.save_device(device).await.unwrap();

            let request =
                TokenRequest::new(ExtensionId::new(), vec![device_id], "example.com").unwrap();
            request_id = request.id;
            store.save_token_request(request).await.unwrap();
        }

        let store = JsonStore::with_path(path).await.unwrap();
        assert!(store.find_device(&device_id).await.unwrap().is_some());
        let request = store.find_token_request(&request_id).await.unwrap().unwrap();
        assert_eq!(request.domain, "example.com");
    }

    #[tokio::test]
    async fn test_corrupt_file_starts_fresh() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.json");
        std::fs::write(&path, "{ not json").unwrap();

        let store = JsonStore::with_path(path).await.unwrap();
        assert!(store.token_requests().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_write_leaves_record_unchanged() {
        let dir = tempdir().unwrap();
        let data_dir = dir.path().join("data");
        let store = JsonStore::with_path(data_dir.join("store.json")).await.unwrap();

        let request = TokenRequest::new(ExtensionId::new(), vec![DeviceId::new()], "example.com")
            .unwrap();
        store.save_token_request(request.clone()).await.unwrap();

        std::fs::remove_dir_all(&data_dir).unwrap();
        let mut completed = request.clone();
        completed.complete(Some("123456".into())).unwrap();
        assert!(store.save_token_request(completed).await.is_err());
        assert!(store.delete_token_request(&request.id).await.is_err());

        let stored = store.find_token_request(&request.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TokenStatus::Pending);
        assert!(stored.token.is_none());
    }
}
