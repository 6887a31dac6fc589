//! Channel key -> hub map
//!
//! Hubs are created lazily on first join and removed once empty. Joining
//! and releasing the same key both run under that key's map entry lock, so
//! a release can never drop a hub that a concurrent join just registered
//! into.

use crate::hub::{Hub, Peer, Subscription};
use bytes::Bytes;
use dashmap::DashMap;
use relay_core::{ChannelKey, Config};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Injectable registry of live hubs
#[derive(Clone)]
pub struct ChannelRegistry {
    hubs: Arc<DashMap<ChannelKey, Arc<Hub>>>,
    grace: Duration,
    queue_capacity: usize,
}

impl ChannelRegistry {
    pub fn new(grace: Duration, queue_capacity: usize) -> Self {
        Self {
            hubs: Arc::new(DashMap::new()),
            grace,
            queue_capacity,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.channel_grace, config.outbound_queue)
    }

    /// Existing hub for `key`, or a freshly created one
    pub fn resolve(&self, key: &ChannelKey) -> Arc<Hub> {
        self.hubs
            .entry(key.clone())
            .or_insert_with(|| self.create(key))
            .clone()
    }

    /// Resolve and register in one step, under the entry lock
    pub fn join(&self, key: &ChannelKey, peer: Peer) -> (Arc<Hub>, Subscription) {
        let entry = self
            .hubs
            .entry(key.clone())
            .or_insert_with(|| self.create(key));
        let subscription = entry.register(peer);
        (entry.value().clone(), subscription)
    }

    fn create(&self, key: &ChannelKey) -> Arc<Hub> {
        debug!(channel = %key, "Creating hub");
        Arc::new(Hub::new(key.clone(), self.queue_capacity))
    }

    pub fn get(&self, key: &ChannelKey) -> Option<Arc<Hub>> {
        self.hubs.get(key).map(|hub| hub.value().clone())
    }

    /// Drop the hub for `key` if it has no members; returns whether it was removed
    pub fn release(&self, key: &ChannelKey) -> bool {
        let removed = self.hubs.remove_if(key, |_, hub| hub.is_empty()).is_some();
        if removed {
            debug!(channel = %key, "Released hub");
        }
        removed
    }

    /// Release `key` once the grace window has passed
    pub fn schedule_release(&self, key: ChannelKey) {
        if self.grace.is_zero() {
            self.release(&key);
            return;
        }
        let registry = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(registry.grace).await;
            registry.release(&key);
        });
    }

    /// Deliver a frame to every member of `key`; zero when nobody is connected
    pub fn publish(&self, key: &ChannelKey, frame: Bytes) -> usize {
        self.get(key).map(|hub| hub.publish(frame)).unwrap_or(0)
    }

    /// Whether anyone is connected on `key`
    pub fn is_connected(&self, key: &ChannelKey) -> bool {
        self.get(key).map(|hub| !hub.is_empty()).unwrap_or(false)
    }

    /// Cancel every member of every hub and forget all hubs
    pub fn shutdown(&self) {
        let hubs: Vec<Arc<Hub>> = self.hubs.iter().map(|e| e.value().clone()).collect();
        let count = hubs.len();
        for hub in hubs {
            hub.close_all();
        }
        self.hubs.clear();
        info!(hubs = count, "Channel registry shut down");
    }

    pub fn len(&self) -> usize {
        self.hubs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hubs.is_empty()
    }
}
