//! Shared application state

use crate::push::PushNotifier;
use crate::registry::ChannelRegistry;
use crate::requests::TokenRequestCoordinator;
use bytes::Bytes;
use relay_auth::{Directory, PairingCoordinator, PairingDescriptor, Store};
use relay_core::{ChannelKey, Config, DeviceId, ExtensionId, Result, ServerEvent};
use std::sync::Arc;
use tracing::debug;

pub struct AppState {
    /// Configuration
    pub config: Config,
    /// Live channel hubs
    pub registry: ChannelRegistry,
    /// Device and extension records
    pub directory: Directory,
    /// Pairing handshake
    pub pairings: PairingCoordinator,
    /// Token request state machine
    pub requests: Arc<TokenRequestCoordinator>,
}

impl AppState {
    pub fn new(config: Config, store: Arc<dyn Store>, notifier: Arc<dyn PushNotifier>) -> Self {
        let registry = ChannelRegistry::from_config(&config);
        let requests = Arc::new(TokenRequestCoordinator::new(
            store.clone(),
            registry.clone(),
            notifier,
            config.token_request_validity,
            config.token_request_retention,
        ));
        Self {
            directory: Directory::new(store.clone()),
            pairings: PairingCoordinator::new(store, config.pairing_policy),
            registry,
            requests,
            config,
        }
    }

    /// Pair and tell the extension's channel about it
    pub async fn pair(
        &self,
        device_id: DeviceId,
        extension_id: ExtensionId,
        device_public_key: &str,
        device_name: Option<&str>,
    ) -> Result<PairingDescriptor> {
        let pairing = self
            .pairings
            .pair(device_id, extension_id, device_public_key, device_name)
            .await?;

        let event = ServerEvent::PairingEstablished {
            pairing_id: pairing.pairing_id,
            device_id,
            device_name: pairing.device_name.clone(),
            device_public_key: device_public_key.trim().to_string(),
        };
        let delivered = self
            .registry
            .publish(&ChannelKey::extension(extension_id), Bytes::from(event.to_json()?));
        debug!(extension = %extension_id, delivered, "Published pairing event");

        Ok(pairing)
    }
}
