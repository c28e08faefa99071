//! Pending-request correlation multimap
//!
//! The correlation core: in-flight request context keyed by a composite
//! identifier so an asynchronous response can locate its original caller,
//! decrement fan-out counters, and trigger the next protocol step.
//!
//! A bucket is keyed by `(instance_id, request_id)`; several entries may
//! share one bucket (fan-out inserts one entry per peer). Entries inside a
//! bucket are disambiguated by owner and/or exact key bytes, which defends
//! against id collisions across fast-retried operations.
//!
//! The fan-out completion idiom is [`PendingMap::erase_and_count`]: erase
//! one leaf entry and count the survivors under a single critical section.
//! Two racing responses can then never both observe "I am last" (double
//! response) nor neither observe it (lost response).

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::ids::{InstanceId, RequestId};
use crate::key_value::{Key, KeyValue};

/// Payloads that can be matched by exact key bytes.
pub trait PendingPayload: Clone {
    fn key_bytes(&self) -> Option<&[u8]> {
        None
    }
}

impl PendingPayload for Key {
    fn key_bytes(&self) -> Option<&[u8]> {
        Some(self.as_bytes())
    }
}

impl PendingPayload for KeyValue {
    fn key_bytes(&self) -> Option<&[u8]> {
        Some(self.key.as_bytes())
    }
}

/// Composite identifier for one pending entry.
///
/// `O` is the owner handle type (typically a peer address); it
/// disambiguates entries sharing the same bucket and records where the
/// eventual reply must go. Two identifiers with equal ids but different
/// owners are distinct entries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingIdentifier<O> {
    pub instance_id: InstanceId,
    pub parent_instance_id: InstanceId,
    pub request_id: RequestId,
    pub parent_request_id: RequestId,
    pub timestamp: u32,
    pub owner: Option<O>,
}

impl<O: Copy> PendingIdentifier<O> {
    pub fn new(
        instance_id: InstanceId,
        parent_instance_id: InstanceId,
        request_id: RequestId,
        parent_request_id: RequestId,
        owner: Option<O>,
    ) -> Self {
        Self {
            instance_id,
            parent_instance_id,
            request_id,
            parent_request_id,
            timestamp: 0,
            owner,
        }
    }

    /// Identifier for a root request (no parent hop).
    pub fn root(instance_id: InstanceId, request_id: RequestId, owner: Option<O>) -> Self {
        Self::new(instance_id, instance_id, request_id, request_id, owner)
    }

    pub fn with_timestamp(mut self, timestamp: u32) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn parent(&self) -> (InstanceId, RequestId) {
        (self.parent_instance_id, self.parent_request_id)
    }
}

struct Entry<T, O> {
    pid: PendingIdentifier<O>,
    payload: T,
    inserted_at: Instant,
}

/// One typed sub-map of the pending table, with its own lock.
pub struct PendingMap<T, O> {
    inner: Mutex<HashMap<(InstanceId, RequestId), Vec<Entry<T, O>>>>,
}

impl<T, O> Default for PendingMap<T, O> {
    fn default() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }
}

impl<T: PendingPayload, O: Copy + PartialEq> PendingMap<T, O> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an entry. Duplicate ids are allowed (multimap semantics);
    /// fan-out inserts one entry per peer under the same bucket.
    pub fn insert(&self, pid: PendingIdentifier<O>, payload: T) {
        let mut inner = self.inner.lock();
        inner
            .entry((pid.instance_id, pid.request_id))
            .or_default()
            .push(Entry {
                pid,
                payload,
                inserted_at: Instant::now(),
            });
    }

    fn matches(entry: &Entry<T, O>, owner: Option<O>, check_key: Option<&[u8]>) -> bool {
        if let Some(o) = owner {
            if entry.pid.owner != Some(o) {
                return false;
            }
        }
        if let Some(k) = check_key {
            if entry.payload.key_bytes() != Some(k) {
                return false;
            }
        }
        true
    }

    /// Remove and return the first matching entry.
    pub fn erase(
        &self,
        instance_id: InstanceId,
        request_id: RequestId,
        owner: Option<O>,
        check_key: Option<&[u8]>,
    ) -> Option<(PendingIdentifier<O>, T)> {
        self.erase_and_count(instance_id, request_id, owner, check_key)
            .map(|(pid, payload, _)| (pid, payload))
    }

    /// Remove one matching entry and report how many entries remain in
    /// its bucket, atomically. The caller that observes zero is the one
    /// permitted to synthesize the upstream response.
    pub fn erase_and_count(
        &self,
        instance_id: InstanceId,
        request_id: RequestId,
        owner: Option<O>,
        check_key: Option<&[u8]>,
    ) -> Option<(PendingIdentifier<O>, T, usize)> {
        let mut inner = self.inner.lock();
        let bucket = inner.get_mut(&(instance_id, request_id))?;
        let pos = bucket
            .iter()
            .position(|e| Self::matches(e, owner, check_key))?;
        let entry = bucket.remove(pos);
        let remaining = bucket.len();
        if bucket.is_empty() {
            inner.remove(&(instance_id, request_id));
        }
        Some((entry.pid, entry.payload, remaining))
    }

    /// Lookup without removal.
    pub fn find(
        &self,
        instance_id: InstanceId,
        request_id: RequestId,
        owner: Option<O>,
        check_key: Option<&[u8]>,
    ) -> Option<(PendingIdentifier<O>, T)> {
        let inner = self.inner.lock();
        let bucket = inner.get(&(instance_id, request_id))?;
        bucket
            .iter()
            .find(|e| Self::matches(e, owner, check_key))
            .map(|e| (e.pid.clone(), e.payload.clone()))
    }

    /// Number of still-pending entries sharing this id.
    pub fn count(&self, instance_id: InstanceId, request_id: RequestId) -> usize {
        self.inner
            .lock()
            .get(&(instance_id, request_id))
            .map(|b| b.len())
            .unwrap_or(0)
    }

    /// Remove and return every entry older than `ttl`. Expiry goes through
    /// the same removal path as responses, so an expired entry can never
    /// also complete normally (no double-fire).
    pub fn expire(&self, ttl: Duration) -> Vec<(PendingIdentifier<O>, T)> {
        let now = Instant::now();
        let mut expired = Vec::new();
        let mut inner = self.inner.lock();
        inner.retain(|_, bucket| {
            bucket.retain_mut(|e| {
                if now.duration_since(e.inserted_at) >= ttl {
                    expired.push((e.pid.clone(), e.payload.clone()));
                    false
                } else {
                    true
                }
            });
            !bucket.is_empty()
        });
        expired
    }

    /// Remove every entry belonging to an instance (used when a session
    /// generation goes away).
    pub fn erase_instance(&self, instance_id: InstanceId) -> Vec<(PendingIdentifier<O>, T)> {
        let mut removed = Vec::new();
        let mut inner = self.inner.lock();
        inner.retain(|&(iid, _), bucket| {
            if iid == instance_id {
                for e in bucket.drain(..) {
                    removed.push((e.pid, e.payload));
                }
                false
            } else {
                true
            }
        });
        removed
    }

    pub fn len(&self) -> usize {
        self.inner.lock().values().map(|b| b.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}
