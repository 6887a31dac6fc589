//! Token request state machine
//!
//! `pending` -> `completed` | `expired`, never back. Transitions on one
//! request are serialized through that request's lock so a late answer and an
//! expiry sweep cannot both win. Events go out through the channel registry; a device with no
//! live connection gets a push notification instead.

use crate::connection::InboundHandler;
use crate::hub::Peer;
use crate::push::PushNotifier;
use crate::registry::ChannelRegistry;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use dashmap::DashMap;
use relay_auth::token::chrono_duration;
use relay_auth::{Store, TokenRequest};
use relay_core::{
    ChannelKey, ClientMessage, CloseStatus, DeviceId, Error, ExtensionId, Result, ServerEvent,
    TokenRequestId, TokenStatus,
};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

/// Outcome of one expiry/reaping pass
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub expired: usize,
    pub reaped: usize,
    /// Records skipped because the store rejected the change
    pub failed: usize,
}

pub struct TokenRequestCoordinator {
    store: Arc<dyn Store>,
    registry: ChannelRegistry,
    notifier: Arc<dyn PushNotifier>,
    validity: Duration,
    retention: Duration,
    /// Per-request transition locks, dropped when the request is reaped
    transitions: DashMap<TokenRequestId, Arc<Mutex<()>>>,
}

impl TokenRequestCoordinator {
    pub fn new(
        store: Arc<dyn Store>,
        registry: ChannelRegistry,
        notifier: Arc<dyn PushNotifier>,
        validity: Duration,
        retention: Duration,
    ) -> Self {
        Self {
            store,
            registry,
            notifier,
            validity,
            retention,
            transitions: DashMap::new(),
        }
    }

    pub fn validity(&self) -> Duration {
        self.validity
    }

    async fn lock(&self, id: TokenRequestId) -> OwnedMutexGuard<()> {
        let lock = self.transitions.entry(id).or_default().clone();
        lock.lock_owned().await
    }

    async fn find(&self, id: TokenRequestId) -> Result<TokenRequest> {
        self.store
            .find_token_request(&id)
            .await?
            .ok_or_else(|| Error::not_found("Token request", id))
    }

    fn publish(&self, key: &ChannelKey, event: &ServerEvent) -> Result<usize> {
        let frame = Bytes::from(event.to_json()?);
        let delivered = self.registry.publish(key, frame);
        debug!(channel = %key, kind = event.kind(), delivered, "Published event");
        Ok(delivered)
    }

    /// Publish to each device channel, falling back to push when nobody is connected
    async fn publish_to_devices(&self, device_ids: &[DeviceId], event: &ServerEvent) -> Result<()> {
        for device_id in device_ids {
            if self.publish(&ChannelKey::device(*device_id), event)? > 0 {
                continue;
            }
            match self.store.find_device(device_id).await? {
                Some(device) => self.notifier.notify(&device, event).await,
                None => warn!(device = %device_id, "Addressed device no longer exists"),
            }
        }
        Ok(())
    }

    /// Open a request from an extension to its paired device(s)
    pub async fn create(&self, extension_id: ExtensionId, domain: &str) -> Result<TokenRequest> {
        self.store
            .find_extension(&extension_id)
            .await?
            .ok_or_else(|| Error::not_found("Browser extension", extension_id))?;

        let pairings = self.store.pairings_for_extension(&extension_id).await?;
        if pairings.is_empty() {
            return Err(Error::not_found("Pairing for extension", extension_id));
        }
        let device_ids: Vec<DeviceId> = pairings.iter().map(|p| p.device_id).collect();

        let request = TokenRequest::new(extension_id, device_ids, domain)?;
        self.store.save_token_request(request.clone()).await?;
        info!(
            request = %request.id,
            extension = %extension_id,
            devices = request.device_ids.len(),
            "Token request created"
        );

        let event = ServerEvent::TokenRequested {
            request_id: request.id,
            extension_id,
            domain: request.domain.clone(),
            requested_at: request.created_at,
        };
        self.publish_to_devices(&request.device_ids, &event).await?;
        Ok(request)
    }

    /// Relay that a device's connection has seen the request; no state change
    pub async fn deliver(&self, request_id: TokenRequestId, device_id: DeviceId) -> Result<()> {
        let request = self.find(request_id).await?;
        if !request.is_addressed_to(&device_id) {
            return Err(Error::not_found("Token request", request_id));
        }
        if request
            .effective_status(Utc::now(), chrono_duration(self.validity))
            .is_terminal()
        {
            return Err(Error::Expired(request_id.to_string()));
        }

        self.publish(
            &ChannelKey::extension(request.extension_id),
            &ServerEvent::TokenRequestObserved {
                request_id,
                device_id,
            },
        )?;
        Ok(())
    }

    /// A device answers with a token
    pub async fn respond(
        &self,
        request_id: TokenRequestId,
        device_id: DeviceId,
        token: &str,
    ) -> Result<TokenRequest> {
        if token.is_empty() {
            return Err(Error::Validation("token must not be empty".into()));
        }

        let _guard = self.lock(request_id).await;
        let mut request = self.find(request_id).await?;
        if !request.is_addressed_to(&device_id)
            || self
                .store
                .find_pairing(&device_id, &request.extension_id)
                .await?
                .is_none()
        {
            return Err(Error::not_found("Token request", request_id));
        }

        if request.is_overdue(Utc::now(), chrono_duration(self.validity)) {
            request.expire();
            self.store.save_token_request(request.clone()).await?;
            self.announce_closed(&request)?;
            return Err(Error::Expired(request_id.to_string()));
        }
        request.complete(Some(token.to_string()))?;
        self.store.save_token_request(request.clone()).await?;
        info!(request = %request_id, device = %device_id, "Token delivered");

        self.publish(
            &ChannelKey::extension(request.extension_id),
            &ServerEvent::TokenDelivered {
                request_id,
                device_id,
                token: token.to_string(),
            },
        )?;

        let others: Vec<DeviceId> = request
            .device_ids
            .iter()
            .copied()
            .filter(|d| *d != device_id)
            .collect();
        for other in others {
            self.publish(
                &ChannelKey::device(other),
                &ServerEvent::TokenRequestClosed {
                    request_id,
                    status: TokenStatus::Completed,
                },
            )?;
        }

        Ok(request)
    }

    /// Move a request to `expired`; no-op when already terminal
    pub async fn expire(&self, request_id: TokenRequestId) -> Result<TokenRequest> {
        let _guard = self.lock(request_id).await;
        let mut request = self.find(request_id).await?;
        if request.expire() {
            self.store.save_token_request(request.clone()).await?;
            info!(request = %request_id, "Token request expired");
            self.announce_closed(&request)?;
        }
        Ok(request)
    }

    /// The extension closes one of its own requests; no-op when already terminal
    pub async fn close(
        &self,
        extension_id: ExtensionId,
        request_id: TokenRequestId,
        status: CloseStatus,
    ) -> Result<TokenRequest> {
        let _guard = self.lock(request_id).await;
        let mut request = self.find(request_id).await?;
        if request.extension_id != extension_id {
            return Err(Error::not_found("Token request", request_id));
        }
        if request.status.is_terminal() {
            return Ok(request);
        }

        match status {
            CloseStatus::Completed => request.complete(None)?,
            CloseStatus::Terminated => {
                request.expire();
            }
        }
        self.store.save_token_request(request.clone()).await?;
        info!(request = %request_id, status = ?request.status, "Token request closed");
        self.announce_closed(&request)?;
        Ok(request)
    }

    fn announce_closed(&self, request: &TokenRequest) -> Result<()> {
        let event = ServerEvent::TokenRequestClosed {
            request_id: request.id,
            status: request.status,
        };
        for device_id in &request.device_ids {
            self.publish(&ChannelKey::device(*device_id), &event)?;
        }
        Ok(())
    }

    /// Audit lookup by id, scoped to the owning extension
    ///
    /// Overdue pending requests read as expired.
    pub async fn get(&self, extension_id: ExtensionId, request_id: TokenRequestId) -> Result<TokenRequest> {
        let mut request = self.find(request_id).await?;
        if request.extension_id != extension_id {
            return Err(Error::not_found("Token request", request_id));
        }
        request.status = request.effective_status(Utc::now(), chrono_duration(self.validity));
        Ok(request)
    }

    /// Pending requests addressed to a device, oldest first
    pub async fn list_pending(&self, device_id: DeviceId) -> Result<Vec<TokenRequest>> {
        self.store
            .find_device(&device_id)
            .await?
            .ok_or_else(|| Error::not_found("Mobile device", device_id))?;

        let now = Utc::now();
        let validity = chrono_duration(self.validity);
        Ok(self
            .store
            .find_pending(&device_id)
            .await?
            .into_iter()
            .filter(|r| !r.is_overdue(now, validity))
            .collect())
    }

    /// Expire overdue requests and reap terminal ones past retention
    pub async fn sweep(&self) -> Result<SweepReport> {
        let now = Utc::now();
        let validity = chrono_duration(self.validity);
        let cutoff = now - chrono_duration(self.retention);
        let mut report = SweepReport::default();

        for request in self.store.token_requests().await? {
            if request.is_overdue(now, validity) {
                match self.expire(request.id).await {
                    Ok(expired) if expired.status == TokenStatus::Expired => report.expired += 1,
                    Ok(_) => {}
                    Err(e) => {
                        warn!(request = %request.id, "Failed to expire token request: {}", e);
                        report.failed += 1;
                    }
                }
            } else if request.is_reapable(cutoff) {
                let _guard = self.lock(request.id).await;
                match self.store.delete_token_request(&request.id).await {
                    Ok(removed) => {
                        self.transitions.remove(&request.id);
                        if removed {
                            report.reaped += 1;
                        }
                    }
                    Err(e) => {
                        warn!(request = %request.id, "Failed to reap token request: {}", e);
                        report.failed += 1;
                    }
                }
            }
        }

        if report != SweepReport::default() {
            info!(
                expired = report.expired,
                reaped = report.reaped,
                failed = report.failed,
                "Token request sweep"
            );
        }
        Ok(report)
    }

    /// Run [`sweep`](Self::sweep) every `interval` until cancelled
    pub async fn run_sweeper(
        self: Arc<Self>,
        interval: Duration,
        shutdown: tokio_util::sync::CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep().await {
                        warn!("Token request sweep failed: {}", e);
                    }
                }
            }
        }
        debug!("Sweeper stopped");
    }
}

#[async_trait]
impl InboundHandler for TokenRequestCoordinator {
    async fn handle(&self, peer: Peer, message: ClientMessage) -> Result<()> {
        match (peer, message) {
            (Peer::Device(device_id), ClientMessage::TokenObserved { request_id }) => {
                self.deliver(request_id, device_id).await
            }
            (Peer::Device(device_id), ClientMessage::SendToken { request_id, token }) => {
                self.respond(request_id, device_id, &token).await.map(|_| ())
            }
            (Peer::Extension(extension_id), ClientMessage::CloseRequest { request_id, status }) => {
                self.close(extension_id, request_id, status).await.map(|_| ())
            }
            (peer, message) => Err(Error::Validation(format!(
                "{:?} is not accepted from a {}",
                message,
                peer.kind()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::push::recording::RecordingNotifier;
    use relay_auth::{BrowserExtension, JsonStore, MobileDevice, Pairing, Platform};

    const VALIDITY: Duration = Duration::from_secs(120);

    struct Fixture {
        store: Arc<JsonStore>,
        registry: ChannelRegistry,
        notifier: Arc<RecordingNotifier>,
        coordinator: TokenRequestCoordinator,
        device: MobileDevice,
        extension: BrowserExtension,
    }

    async fn fixture() -> Fixture {
        fixture_with(Arc::new(JsonStore::in_memory())).await
    }

    async fn fixture_with(store: Arc<JsonStore>) -> Fixture {
        let registry = ChannelRegistry::new(Duration::ZERO, 16);
        let notifier = Arc::new(RecordingNotifier::default());
        let device = MobileDevice::new("Phone", Platform::Android, "fcm").unwrap();
        let extension = BrowserExtension::new("ext", "firefox", "120", "key").unwrap();
        store.save_device(device.clone()).await.unwrap();
        store.save_extension(extension.clone()).await.unwrap();
        store
            .save_pairing(Pairing::new(&device, &extension, "device-key"))
            .await
            .unwrap();

        let coordinator = TokenRequestCoordinator::new(
            store.clone(),
            registry.clone(),
            notifier.clone(),
            VALIDITY,
            Duration::from_secs(3600),
        );
        Fixture {
            store,
            registry,
            notifier,
            coordinator,
            device,
            extension,
        }
    }

    fn subscribe(f: &Fixture, peer: Peer) -> tokio::sync::mpsc::Receiver<Bytes> {
        f.registry.join(&peer.channel_key(), peer).1.rx
    }

    fn next_event(rx: &mut tokio::sync::mpsc::Receiver<Bytes>) -> serde_json::Value {
        serde_json::from_slice(&rx.try_recv().unwrap()).unwrap()
    }

    /// Rewind a stored request's creation time
    async fn age(f: &Fixture, id: TokenRequestId, by: chrono::Duration) {
        let mut request = f.store.find_token_request(&id).await.unwrap().unwrap();
        request.created_at = request.created_at - by;
        request.updated_at = request.updated_at - by;
        f.store.save_token_request(request).await.unwrap();
    }

    #[tokio::test]
    async fn test_create_publishes_to_connected_device() {
        let f = fixture().await;
        let mut device_rx = subscribe(&f, Peer::Device(f.device.id));

        let request = f.coordinator.create(f.extension.id, "example.com").await.unwrap();
        let event = next_event(&mut device_rx);
        assert_eq!(event["type"], "token_requested");
        assert_eq!(event["request_id"], request.id.to_string());
        assert_eq!(event["domain"], "example.com");
        assert!(f.notifier.sent().is_empty());
    }

    #[tokio::test]
    async fn test_create_pushes_to_offline_device() {
        let f = fixture().await;
        f.coordinator.create(f.extension.id, "example.com").await.unwrap();
        assert_eq!(f.notifier.sent(), vec![(f.device.id, "token_requested".to_string())]);
    }

    #[tokio::test]
    async fn test_create_requires_pairing() {
        let f = fixture().await;
        let lonely = BrowserExtension::new("lonely", "chrome", "1", "key").unwrap();
        f.store.save_extension(lonely.clone()).await.unwrap();

        let err = f.coordinator.create(lonely.id, "example.com").await.unwrap_err();
        assert!(err.is_not_found());
        let err = f.coordinator.create(ExtensionId::new(), "example.com").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_respond_delivers_token_to_extension() {
        let f = fixture().await;
        let mut extension_rx = subscribe(&f, Peer::Extension(f.extension.id));
        let request = f.coordinator.create(f.extension.id, "example.com").await.unwrap();

        let completed = f
            .coordinator
            .respond(request.id, f.device.id, "123456")
            .await
            .unwrap();
        assert_eq!(completed.status, TokenStatus::Completed);

        let event = next_event(&mut extension_rx);
        assert_eq!(event["type"], "token_delivered");
        assert_eq!(event["token"], "123456");
        assert!(f.coordinator.list_pending(f.device.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_respond_twice_is_expired_and_unchanged() {
        let f = fixture().await;
        let request = f.coordinator.create(f.extension.id, "example.com").await.unwrap();
        f.coordinator.respond(request.id, f.device.id, "123456").await.unwrap();

        let err = f
            .coordinator
            .respond(request.id, f.device.id, "000000")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Expired(_)));

        let stored = f.store.find_token_request(&request.id).await.unwrap().unwrap();
        assert_eq!(stored.token.as_deref(), Some("123456"));
        assert_eq!(stored.status, TokenStatus::Completed);
    }

    #[tokio::test]
    async fn test_respond_unknown_or_foreign_is_not_found() {
        let f = fixture().await;
        let err = f
            .coordinator
            .respond(TokenRequestId::new(), f.device.id, "1")
            .await
            .unwrap_err();
        assert!(err.is_not_found());

        let request = f.coordinator.create(f.extension.id, "example.com").await.unwrap();
        let err = f
            .coordinator
            .respond(request.id, DeviceId::new(), "1")
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(
            f.store.find_token_request(&request.id).await.unwrap().unwrap().status,
            TokenStatus::Pending
        );
    }

    #[tokio::test]
    async fn test_overdue_request_cannot_be_answered() {
        let f = fixture().await;
        let request = f.coordinator.create(f.extension.id, "example.com").await.unwrap();
        age(&f, request.id, chrono::Duration::seconds(121)).await;

        assert!(f.coordinator.list_pending(f.device.id).await.unwrap().is_empty());
        let err = f
            .coordinator
            .respond(request.id, f.device.id, "123456")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Expired(_)));
        let audit = f.coordinator.get(f.extension.id, request.id).await.unwrap();
        assert_eq!(audit.status, TokenStatus::Expired);
    }

    #[tokio::test]
    async fn test_expire_is_noop_on_terminal() {
        let f = fixture().await;
        let request = f.coordinator.create(f.extension.id, "example.com").await.unwrap();
        f.coordinator.respond(request.id, f.device.id, "123456").await.unwrap();

        let after = f.coordinator.expire(request.id).await.unwrap();
        assert_eq!(after.status, TokenStatus::Completed);
    }

    #[tokio::test]
    async fn test_close_terminated_notifies_devices() {
        let f = fixture().await;
        let request = f.coordinator.create(f.extension.id, "example.com").await.unwrap();
        let mut device_rx = subscribe(&f, Peer::Device(f.device.id));

        let closed = f
            .coordinator
            .close(f.extension.id, request.id, CloseStatus::Terminated)
            .await
            .unwrap();
        assert_eq!(closed.status, TokenStatus::Expired);
        let event = next_event(&mut device_rx);
        assert_eq!(event["type"], "token_request_closed");
        assert_eq!(event["status"], "expired");

        // closing again changes nothing
        let again = f
            .coordinator
            .close(f.extension.id, request.id, CloseStatus::Completed)
            .await
            .unwrap();
        assert_eq!(again.status, TokenStatus::Expired);
        assert!(device_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_close_by_other_extension_is_not_found() {
        let f = fixture().await;
        let request = f.coordinator.create(f.extension.id, "example.com").await.unwrap();
        let err = f
            .coordinator
            .close(ExtensionId::new(), request.id, CloseStatus::Completed)
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_deliver_notifies_extension() {
        let f = fixture().await;
        let mut extension_rx = subscribe(&f, Peer::Extension(f.extension.id));
        let request = f.coordinator.create(f.extension.id, "example.com").await.unwrap();

        f.coordinator.deliver(request.id, f.device.id).await.unwrap();
        let event = next_event(&mut extension_rx);
        assert_eq!(event["type"], "token_request_observed");
        assert_eq!(
            f.store.find_token_request(&request.id).await.unwrap().unwrap().status,
            TokenStatus::Pending
        );
    }

    #[tokio::test]
    async fn test_pending_list_ordered_and_filtered() {
        let f = fixture().await;
        let first = f.coordinator.create(f.extension.id, "a.com").await.unwrap();
        let second = f.coordinator.create(f.extension.id, "b.com").await.unwrap();
        let third = f.coordinator.create(f.extension.id, "c.com").await.unwrap();
        age(&f, first.id, chrono::Duration::seconds(10)).await;
        f.coordinator.respond(third.id, f.device.id, "1").await.unwrap();

        let pending = f.coordinator.list_pending(f.device.id).await.unwrap();
        let ids: Vec<_> = pending.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![first.id, second.id]);
    }

    #[tokio::test]
    async fn test_sweep_expires_and_reaps() {
        let f = fixture().await;
        let overdue = f.coordinator.create(f.extension.id, "a.com").await.unwrap();
        let old = f.coordinator.create(f.extension.id, "b.com").await.unwrap();
        let fresh = f.coordinator.create(f.extension.id, "c.com").await.unwrap();
        age(&f, overdue.id, chrono::Duration::seconds(200)).await;
        f.coordinator.respond(old.id, f.device.id, "1").await.unwrap();
        age(&f, old.id, chrono::Duration::hours(2)).await;

        let report = f.coordinator.sweep().await.unwrap();
        assert_eq!(
            report,
            SweepReport {
                expired: 1,
                reaped: 1,
                failed: 0
            }
        );
        assert_eq!(
            f.store.find_token_request(&overdue.id).await.unwrap().unwrap().status,
            TokenStatus::Expired
        );
        assert!(f.store.find_token_request(&old.id).await.unwrap().is_none());
        assert!(f.store.find_token_request(&fresh.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_handler_rejects_commands_from_wrong_side() {
        let f = fixture().await;
        let request = f.coordinator.create(f.extension.id, "example.com").await.unwrap();

        let err = f
            .coordinator
            .handle(
                Peer::Extension(f.extension.id),
                ClientMessage::SendToken {
                    request_id: request.id,
                    token: "1".into(),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));

        f.coordinator
            .handle(
                Peer::Device(f.device.id),
                ClientMessage::SendToken {
                    request_id: request.id,
                    token: "654321".into(),
                },
            )
            .await
            .unwrap();
        assert_eq!(
            f.store.find_token_request(&request.id).await.unwrap().unwrap().status,
            TokenStatus::Completed
        );
    }

    #[tokio::test]
    async fn test_sweep_continues_past_store_failures() {
        let dir = tempfile::tempdir().unwrap();
        let data_dir = dir.path().join("data");
        let store = Arc::new(JsonStore::with_path(data_dir.join("store.json")).await.unwrap());
        let f = fixture_with(store).await;

        let first = f.coordinator.create(f.extension.id, "a.com").await.unwrap();
        let second = f.coordinator.create(f.extension.id, "b.com").await.unwrap();
        age(&f, first.id, chrono::Duration::seconds(200)).await;
        age(&f, second.id, chrono::Duration::seconds(200)).await;

        std::fs::remove_dir_all(&data_dir).unwrap();
        let report = f.coordinator.sweep().await.unwrap();
        assert_eq!(report.failed, 2);
        assert_eq!(report.expired, 0);

        // both records are untouched and still read as expired
        for id in [first.id, second.id] {
            let stored = f.store.find_token_request(&id).await.unwrap().unwrap();
            assert_eq!(stored.status, TokenStatus::Pending);
            let audit = f.coordinator.get(f.extension.id, id).await.unwrap();
            assert_eq!(audit.status, TokenStatus::Expired);
        }
    }

    #[tokio::test]
    async fn test_transitions_on_different_requests_do_not_share_a_lock() {
        let f = fixture().await;
        let first = f.coordinator.create(f.extension.id, "a.com").await.unwrap();
        let second = f.coordinator.create(f.extension.id, "b.com").await.unwrap();

        let _held = f.coordinator.lock(first.id).await;
        let answered = tokio::time::timeout(
            Duration::from_secs(1),
            f.coordinator.respond(second.id, f.device.id, "123456"),
        )
        .await
        .expect("respond on another request must not wait")
        .unwrap();
        assert_eq!(answered.status, TokenStatus::Completed);

        let blocked = tokio::time::timeout(
            Duration::from_millis(50),
            f.coordinator.respond(first.id, f.device.id, "654321"),
        )
        .await;
        assert!(blocked.is_err());
    }

    #[tokio::test]
    async fn test_reaping_drops_transition_lock() {
        let f = fixture().await;
        let request = f.coordinator.create(f.extension.id, "a.com").await.unwrap();
        f.coordinator.respond(request.id, f.device.id, "1").await.unwrap();
        assert!(f.coordinator.transitions.contains_key(&request.id));

        age(&f, request.id, chrono::Duration::hours(2)).await;
        let report = f.coordinator.sweep().await.unwrap();
        assert_eq!(report.reaped, 1);
        assert!(!f.coordinator.transitions.contains_key(&request.id));
    }

    #[tokio::test]
    async fn test_respond_after_failed_write_can_be_retried() {
        let dir = tempfile::tempdir().unwrap();
        let data_dir = dir.path().join("data");
        let store = Arc::new(JsonStore::with_path(data_dir.join("store.json")).await.unwrap());
        let f = fixture_with(store).await;
        let mut extension_rx = subscribe(&f, Peer::Extension(f.extension.id));
        let request = f.coordinator.create(f.extension.id, "example.com").await.unwrap();

        std::fs::remove_dir_all(&data_dir).unwrap();
        let err = f
            .coordinator
            .respond(request.id, f.device.id, "123456")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Storage(_)));
        assert!(extension_rx.try_recv().is_err());

        std::fs::create_dir_all(&data_dir).unwrap();
        f.coordinator
            .respond(request.id, f.device.id, "123456")
            .await
            .unwrap();
        let event = next_event(&mut extension_rx);
        assert_eq!(event["type"], "token_delivered");
    }
}
