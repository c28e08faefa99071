//! Gateway pending-request table
//!
//! Typed sub-map families over the shared correlation multimap:
//! application-level entries hold the caller's context, server-level
//! entries hold one branch of a downstream fan-out, and stats entries
//! record dispatch times. Every family has its own lock; the lock order
//! when two must be held is application before server.

use std::time::Instant;

use proto::{PeerAddr, ReconstructionMapping};
use sk_core::pending::{PendingIdentifier, PendingMap, PendingPayload};
use sk_core::{Key, KeyValue, KeyValueUpdate};

/// Pending identifier with a peer-address owner.
pub type Pid = PendingIdentifier<PeerAddr>;

/// Update in flight. The data server fans the parity deltas itself, so
/// the gateway tracks exactly one branch per update.
#[derive(Debug, Clone)]
pub struct PendingUpdate {
    pub update: KeyValueUpdate,
}

impl PendingUpdate {
    pub fn new(update: KeyValueUpdate) -> Self {
        Self { update }
    }
}

impl PendingPayload for PendingUpdate {
    fn key_bytes(&self) -> Option<&[u8]> {
        Some(self.update.key.as_bytes())
    }
}

/// Which operation a degraded lock was requested for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DegradedOpcode {
    Get,
    Update,
    Delete,
}

/// Context buffered while the coordinator arbitrates a degraded lock.
/// The buffered update is replayed once the lock outcome is known.
#[derive(Debug, Clone)]
pub struct DegradedLockData {
    pub opcode: DegradedOpcode,
    pub key: Key,
    pub mapping: ReconstructionMapping,
    pub update: Option<KeyValueUpdate>,
}

impl PendingPayload for DegradedLockData {
    fn key_bytes(&self) -> Option<&[u8]> {
        Some(self.key.as_bytes())
    }
}

/// A SET steered away from a down slot.
#[derive(Debug, Clone)]
pub struct RemappingRecord {
    pub key: Key,
    pub value: bytes::Bytes,
    pub remapped: (u32, u32),
}

impl PendingPayload for RemappingRecord {
    fn key_bytes(&self) -> Option<&[u8]> {
        Some(self.key.as_bytes())
    }
}

/// Dispatch time of one downstream request, for latency accounting.
#[derive(Debug, Clone)]
pub struct RequestStartTime {
    pub peer: PeerAddr,
    pub at: Instant,
}

impl RequestStartTime {
    pub fn now(peer: PeerAddr) -> Self {
        Self {
            peer,
            at: Instant::now(),
        }
    }
}

impl PendingPayload for RequestStartTime {}

/// Timestamp window during which a server was unreachable. Closed when
/// the server recovers; operations dispatched inside the window are the
/// ones whose parity effects may need reconciliation.
#[derive(Debug, Clone)]
pub struct AcknowledgementInfo {
    pub from_timestamp: u32,
    pub to_timestamp: u32,
}

/// Application-level entries: one per in-flight client operation.
#[derive(Default)]
pub struct ApplicationPending {
    pub get: PendingMap<Key, PeerAddr>,
    pub set: PendingMap<KeyValue, PeerAddr>,
    pub update: PendingMap<PendingUpdate, PeerAddr>,
    pub del: PendingMap<Key, PeerAddr>,
}

/// Server-level entries: one per downstream branch.
#[derive(Default)]
pub struct ServerPending {
    pub get: PendingMap<Key, PeerAddr>,
    pub set: PendingMap<KeyValue, PeerAddr>,
    pub remapped_set: PendingMap<RemappingRecord, PeerAddr>,
    pub update: PendingMap<PendingUpdate, PeerAddr>,
    pub del: PendingMap<Key, PeerAddr>,
    pub degraded_lock: PendingMap<DegradedLockData, PeerAddr>,
}

#[derive(Default)]
pub struct StatsPending {
    pub get: PendingMap<RequestStartTime, PeerAddr>,
    pub set: PendingMap<RequestStartTime, PeerAddr>,
}

/// The gateway's whole pending table.
#[derive(Default)]
pub struct Pending {
    pub applications: ApplicationPending,
    pub servers: ServerPending,
    pub stats: StatsPending,
    /// Open outage windows, one per currently-down server.
    pub acks: parking_lot::Mutex<std::collections::HashMap<sk_core::ServerId, AcknowledgementInfo>>,
}

impl Pending {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total in-flight entries across all families.
    pub fn in_flight(&self) -> usize {
        self.applications.get.len()
            + self.applications.set.len()
            + self.applications.update.len()
            + self.applications.del.len()
            + self.servers.get.len()
            + self.servers.set.len()
            + self.servers.remapped_set.len()
            + self.servers.update.len()
            + self.servers.del.len()
            + self.servers.degraded_lock.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use sk_core::ConnHandle;

    #[test]
    fn test_application_and_server_levels_are_independent() {
        let pending = Pending::new();
        let app = PeerAddr::App(ConnHandle::new(0, 1));
        pending.applications.get.insert(
            Pid::root(9, 100, Some(app)),
            Key::from("k"),
        );
        pending
            .servers
            .get
            .insert(Pid::new(1, 9, 7, 100, Some(PeerAddr::Server(2))), Key::from("k"));

        // Erasing the server branch leaves the application entry alone.
        let (pid, _) = pending
            .servers
            .get
            .erase(1, 7, Some(PeerAddr::Server(2)), None)
            .unwrap();
        assert_eq!(pid.parent(), (9, 100));
        assert_eq!(pending.applications.get.count(9, 100), 1);
        assert_eq!(pending.in_flight(), 1);
    }

    #[test]
    fn test_update_payload_travels_with_entry() {
        let pending = Pending::new();
        let update = KeyValueUpdate::new(Key::from("k"), 3, Bytes::from_static(b"xy"));
        pending
            .applications
            .update
            .insert(Pid::root(1, 1, None), PendingUpdate::new(update));

        let (_, payload) = pending.applications.update.find(1, 1, None, Some(b"k")).unwrap();
        assert_eq!(payload.update.offset, 3);
        assert_eq!(payload.update.length, 2);
    }
}
