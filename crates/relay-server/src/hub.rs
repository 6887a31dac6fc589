//! Per-channel fan-out
//!
//! A [`Hub`] owns the members of one channel. Each member has a bounded
//! outbound queue drained by its connection's outbound pump; delivery is a
//! non-blocking `try_send`, so one slow or dead member can never hold up the
//! others. A member whose queue is full or closed is evicted and its
//! shutdown token cancelled.

use bytes::Bytes;
use relay_core::{ChannelKey, DeviceId, ExtensionId};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Remote end of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Peer {
    Device(DeviceId),
    Extension(ExtensionId),
}

impl Peer {
    /// Channel this peer subscribes to
    pub fn channel_key(&self) -> ChannelKey {
        match self {
            Peer::Device(id) => ChannelKey::device(*id),
            Peer::Extension(id) => ChannelKey::extension(*id),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Peer::Device(_) => "device",
            Peer::Extension(_) => "extension",
        }
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Peer::Device(id) => write!(f, "device:{}", id),
            Peer::Extension(id) => write!(f, "extension:{}", id),
        }
    }
}

/// Handle identifying one membership in a hub
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MemberId(u64);

impl fmt::Display for MemberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

struct Member {
    peer: Peer,
    tx: mpsc::Sender<Bytes>,
    shutdown: CancellationToken,
}

/// What a connection gets back from [`Hub::register`]
pub struct Subscription {
    pub id: MemberId,
    /// Outbound queue, drained by the connection's outbound pump
    pub rx: mpsc::Receiver<Bytes>,
    /// Cancelled when the hub evicts the member or shuts down
    pub shutdown: CancellationToken,
}

/// The set of connections subscribed to one channel
pub struct Hub {
    key: ChannelKey,
    queue_capacity: usize,
    next_id: AtomicU64,
    members: Mutex<HashMap<MemberId, Member>>,
}

impl Hub {
    pub fn new(key: ChannelKey, queue_capacity: usize) -> Self {
        Self {
            key,
            queue_capacity: queue_capacity.max(1),
            next_id: AtomicU64::new(1),
            members: Mutex::new(HashMap::new()),
        }
    }

    pub fn key(&self) -> &ChannelKey {
        &self.key
    }

    // Never held across an await point, so a poisoned guard is still consistent.
    fn members(&self) -> MutexGuard<'_, HashMap<MemberId, Member>> {
        self.members.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a member. Never blocks on I/O.
    pub fn register(&self, peer: Peer) -> Subscription {
        let id = MemberId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::channel(self.queue_capacity);
        let shutdown = CancellationToken::new();

        let count = {
            let mut members = self.members();
            members.insert(
                id,
                Member {
                    peer,
                    tx,
                    shutdown: shutdown.clone(),
                },
            );
            members.len()
        };
        debug!(channel = %self.key, member = %id, %peer, members = count, "Member registered");

        Subscription { id, rx, shutdown }
    }

    /// Remove a member; returns false if it was already gone
    pub fn unregister(&self, id: MemberId) -> bool {
        let removed = self.members().remove(&id);
        match removed {
            Some(member) => {
                debug!(channel = %self.key, member = %id, peer = %member.peer, "Member unregistered");
                true
            }
            None => false,
        }
    }

    /// Deliver to every member except `sender`; returns the delivered count
    pub fn broadcast(&self, sender: MemberId, frame: Bytes) -> usize {
        self.fan_out(Some(sender), frame)
    }

    /// Deliver to every member; returns the delivered count
    pub fn publish(&self, frame: Bytes) -> usize {
        self.fan_out(None, frame)
    }

    /// Deliver to a single member
    pub fn send_to(&self, id: MemberId, frame: Bytes) -> bool {
        let mut members = self.members();
        let Some(member) = members.get(&id) else {
            return false;
        };
        match member.tx.try_send(frame) {
            Ok(()) => true,
            Err(e) => {
                if let Some(member) = members.remove(&id) {
                    self.evict(id, &member, &e);
                }
                false
            }
        }
    }

    fn fan_out(&self, skip: Option<MemberId>, frame: Bytes) -> usize {
        let mut members = self.members();
        let mut delivered = 0;
        let mut failed = Vec::new();

        for (id, member) in members.iter() {
            if Some(*id) == skip {
                continue;
            }
            match member.tx.try_send(frame.clone()) {
                Ok(()) => delivered += 1,
                Err(e) => failed.push((*id, e)),
            }
        }

        for (id, err) in failed {
            if let Some(member) = members.remove(&id) {
                self.evict(id, &member, &err);
            }
        }

        delivered
    }

    fn evict(&self, id: MemberId, member: &Member, err: &TrySendError<Bytes>) {
        let reason = match err {
            TrySendError::Full(_) => "outbound queue full",
            TrySendError::Closed(_) => "outbound queue closed",
        };
        warn!(channel = %self.key, member = %id, peer = %member.peer, reason, "Evicting member");
        member.shutdown.cancel();
    }

    /// Cancel every member; used at shutdown
    pub fn close_all(&self) {
        let drained: Vec<Member> = self.members().drain().map(|(_, m)| m).collect();
        for member in drained {
            member.shutdown.cancel();
        }
    }

    pub fn len(&self) -> usize {
        self.members().len()
    }

    pub fn is_empty(&self) -> bool {
        self.members().is_empty()
    }

    pub fn contains(&self, id: MemberId) -> bool {
        self.members().contains_key(&id)
    }
}
