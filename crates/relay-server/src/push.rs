//! Push fallback for devices without a live connection

use async_trait::async_trait;
use relay_auth::MobileDevice;
use relay_core::ServerEvent;
use tracing::{debug, info};

/// Fire-and-forget notification to an offline device
#[async_trait]
pub trait PushNotifier: Send + Sync {
    async fn notify(&self, device: &MobileDevice, event: &ServerEvent);
}

/// Records notifications in the log instead of calling a push provider
#[derive(Debug, Default, Clone)]
pub struct LogNotifier;

#[async_trait]
impl PushNotifier for LogNotifier {
    async fn notify(&self, device: &MobileDevice, event: &ServerEvent) {
        if device.push_token.is_empty() {
            debug!(device = %device.id, kind = event.kind(), "Device has no push token, skipping");
            return;
        }
        info!(
            device = %device.id,
            platform = ?device.platform,
            kind = event.kind(),
            "Push notification dispatched"
        );
    }
}

#[cfg(test)]
pub(crate) mod recording {
    use super::*;
    use relay_core::DeviceId;
    use std::sync::Mutex;

    /// Captures every notification for assertions
    #[derive(Default)]
    pub(crate) struct RecordingNotifier {
        sent: Mutex<Vec<(DeviceId, String)>>,
    }

    impl RecordingNotifier {
        pub(crate) fn sent(&self) -> Vec<(DeviceId, String)> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl PushNotifier for RecordingNotifier {
        async fn notify(&self, device: &MobileDevice, event: &ServerEvent) {
            self.sent
                .lock()
                .unwrap()
                .push((device.id, event.kind().to_string()));
        }
    }
}
