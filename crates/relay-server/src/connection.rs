//! One live duplex link and its three tasks
//!
//! - inbound pump: reads frames, dispatches commands, relays everything else
//! - outbound pump: drains the member queue into the transport in order
//! - lifetime supervisor: tears the connection down at its absolute age
//!
//! Any of the three may finish first. Teardown runs exactly once and always
//! unregisters from the hub before the outbound pump closes the transport.

use crate::hub::{Hub, MemberId, Peer};
use crate::registry::ChannelRegistry;
use crate::transport::{FrameReader, FrameWriter};
use async_trait::async_trait;
use bytes::Bytes;
use relay_core::{ChannelKey, ClientMessage, Result, ServerEvent};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Interprets commands arriving on a connection
#[async_trait]
pub trait InboundHandler: Send + Sync {
    async fn handle(&self, peer: Peer, message: ClientMessage) -> Result<()>;
}

pub struct Connection {
    id: MemberId,
    peer: Peer,
    key: ChannelKey,
    hub: Arc<Hub>,
    registry: ChannelRegistry,
    handler: Arc<dyn InboundHandler>,
    lifetime: Duration,
    created_at: Instant,
    last_activity: Mutex<Instant>,
    shutdown: CancellationToken,
    torn_down: AtomicBool,
}

impl Connection {
    /// Join the peer's channel; returns the connection and its outbound queue
    pub fn open(
        registry: &ChannelRegistry,
        peer: Peer,
        handler: Arc<dyn InboundHandler>,
        lifetime: Duration,
    ) -> (Self, mpsc::Receiver<Bytes>) {
        let key = peer.channel_key();
        let (hub, subscription) = registry.join(&key, peer);
        let now = Instant::now();
        info!(%peer, member = %subscription.id, "Connection opened");

        let connection = Self {
            id: subscription.id,
            peer,
            key,
            hub,
            registry: registry.clone(),
            handler,
            lifetime,
            created_at: now,
            last_activity: Mutex::new(now),
            shutdown: subscription.shutdown,
            torn_down: AtomicBool::new(false),
        };
        (connection, subscription.rx)
    }

    pub fn id(&self) -> MemberId {
        self.id
    }

    pub fn peer(&self) -> Peer {
        self.peer
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn last_activity(&self) -> Instant {
        *self.last_activity.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn touch(&self) {
        *self.last_activity.lock().unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    /// Run all three tasks to completion
    pub async fn serve<R, W>(self, reader: R, writer: W, rx: mpsc::Receiver<Bytes>)
    where
        R: FrameReader + 'static,
        W: FrameWriter + 'static,
    {
        let connection = Arc::new(self);
        let inbound = tokio::spawn(connection.clone().inbound_pump(reader));
        let outbound = tokio::spawn(connection.clone().outbound_pump(writer, rx));
        let supervisor = tokio::spawn(connection.clone().lifetime_supervisor());

        let (a, b, c) = tokio::join!(inbound, outbound, supervisor);
        for result in [a, b, c] {
            if let Err(e) = result {
                warn!(peer = %connection.peer, "Connection task failed: {}", e);
                connection.teardown("task failed");
            }
        }
    }

    async fn inbound_pump<R: FrameReader>(self: Arc<Self>, mut reader: R) {
        loop {
            let next = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                next = reader.read_frame() => next,
            };
            match next {
                Ok(Some(frame)) => {
                    self.touch();
                    self.dispatch(frame).await;
                }
                Ok(None) => {
                    debug!(peer = %self.peer, "Peer closed the connection");
                    break;
                }
                Err(e) => {
                    warn!(peer = %self.peer, "Read failed: {}", e);
                    break;
                }
            }
        }
        self.teardown("inbound closed");
    }

    async fn dispatch(&self, frame: Bytes) {
        let Some(message) = ClientMessage::decode(&frame) else {
            let delivered = self.hub.broadcast(self.id, frame);
            debug!(peer = %self.peer, delivered, "Relayed frame");
            return;
        };

        if let Err(e) = self.handler.handle(self.peer, message).await {
            debug!(peer = %self.peer, "Command rejected: {}", e);
            let event = ServerEvent::Error {
                message: e.to_string(),
            };
            if let Ok(json) = event.to_json() {
                self.hub.send_to(self.id, Bytes::from(json));
            }
        }
    }

    async fn outbound_pump<W: FrameWriter>(
        self: Arc<Self>,
        mut writer: W,
        mut rx: mpsc::Receiver<Bytes>,
    ) {
        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                next = rx.recv() => match next {
                    Some(frame) => {
                        if let Err(e) = writer.write_frame(frame).await {
                            warn!(peer = %self.peer, "Write failed: {}", e);
                            break;
                        }
                    }
                    None => break,
                },
            }
        }

        // Unregister strictly before the transport goes away
        self.teardown("outbound closed");
        if let Err(e) = writer.close().await {
            debug!(peer = %self.peer, "Close failed: {}", e);
        }
    }

    async fn lifetime_supervisor(self: Arc<Self>) {
        tokio::select! {
            _ = self.shutdown.cancelled() => {}
            _ = tokio::time::sleep_until(self.created_at + self.lifetime) => {
                info!(peer = %self.peer, lifetime = ?self.lifetime, "Connection reached its lifetime");
                self.teardown("lifetime reached");
            }
        }
    }

    /// Unregister and cancel; only the first call has any effect
    fn teardown(&self, reason: &str) {
        if self.torn_down.swap(true, Ordering::AcqRel) {
            return;
        }
        self.hub.unregister(self.id);
        self.shutdown.cancel();
        if self.hub.is_empty() {
            self.registry.schedule_release(self.key.clone());
        }
        info!(
            peer = %self.peer,
            member = %self.id,
            reason,
            age = ?self.created_at.elapsed(),
            "Connection closed"
        );
    }
}
