//! Awareness state (C3) — ephemeral per-client presence, kept
//! outside the CRDT replica entirely since it is never persisted.

use crate::connection::ConnectionId;
use dashmap::DashMap;
use std::time::{Duration, Instant};

/// One client's latest awareness entry.
#[derive(Debug, Clone)]
struct Entry {
    clock: u32,
    payload: Option<Vec<u8>>,
    owner: ConnectionId,
    last_seen: Instant,
}

/// Tracks the awareness map for a single document: client id → (clock,
/// payload). Accepts an update only when its clock strictly exceeds the
/// stored clock; a `None` payload is a tombstone.
#[derive(Default)]
pub struct AwarenessState {
    entries: DashMap<u64, Entry>,
}

/// Outcome of applying an incoming awareness entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyResult {
    /// The clock advanced the stored state; the entry should be rebroadcast.
    Accepted,
    /// The incoming clock did not exceed the stored clock; ignored.
    Stale,
}

impl AwarenessState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one incoming (client_id, clock, payload) triple, attributing it
    /// to the connection that sent it.
    pub fn apply(
        &self,
        client_id: u64,
        clock: u32,
        payload: Option<Vec<u8>>,
        owner: ConnectionId,
    ) -> ApplyResult {
        let now = Instant::now();
        match self.entries.entry(client_id) {
            dashmap::mapref::entry::Entry::Vacant(v) => {
                v.insert(Entry {
                    clock,
                    payload,
                    owner,
                    last_seen: now,
                });
                ApplyResult::Accepted
            }
            dashmap::mapref::entry::Entry::Occupied(mut o) => {
                if clock > o.get().clock {
                    o.insert(Entry {
                        clock,
                        payload,
                        owner,
                        last_seen: now,
                    });
                    ApplyResult::Accepted
                } else {
                    ApplyResult::Stale
                }
            }
        }
    }

    /// Every non-tombstoned entry, for replying to a query or a newly
    /// attached connection's initial sync.
    pub fn snapshot(&self) -> Vec<(u64, u32, Option<Vec<u8>>)> {
        self.entries
            .iter()
            .map(|e| (*e.key(), e.value().clock, e.value().payload.clone()))
            .collect()
    }

    /// Tombstone every entry owned by a connection that has disconnected,
    /// bumping each clock so the removal itself propagates.
    pub fn remove_connection(&self, conn: ConnectionId) -> Vec<(u64, u32, Option<Vec<u8>>)> {
        let mut tombstoned = Vec::new();
        self.entries.retain(|client_id, entry| {
            if entry.owner == conn {
                tombstoned.push((*client_id, entry.clock + 1, None));
                false
            } else {
                true
            }
        });
        tombstoned
    }

    /// Tombstone entries that have not been refreshed within `timeout`,
    /// using a monotonic clock so the check is immune to wall-clock skew.
    pub fn expire_stale(&self, timeout: Duration) -> Vec<(u64, u32, Option<Vec<u8>>)> {
        let now = Instant::now();
        let mut tombstoned = Vec::new();
        self.entries.retain(|client_id, entry| {
            if entry.payload.is_some() && now.duration_since(entry.last_seen) > timeout {
                tombstoned.push((*client_id, entry.clock + 1, None));
                false
            } else {
                true
            }
        });
        tombstoned
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn higher_clock_wins() {
        let state = AwarenessState::new();
        let conn = ConnectionId::from_u64(1);
        assert_eq!(
            state.apply(10, 1, Some(b"a".to_vec()), conn),
            ApplyResult::Accepted
        );
        assert_eq!(
            state.apply(10, 1, Some(b"b".to_vec()), conn),
            ApplyResult::Stale
        );
        assert_eq!(
            state.apply(10, 2, Some(b"c".to_vec()), conn),
            ApplyResult::Accepted
        );
        let snap = state.snapshot();
        assert_eq!(snap, vec![(10, 2, Some(b"c".to_vec()))]);
    }

    #[test]
    fn disconnect_tombstones_only_owned_entries() {
        let state = AwarenessState::new();
        let a = ConnectionId::from_u64(1);
        let b = ConnectionId::from_u64(2);
        state.apply(10, 1, Some(b"a".to_vec()), a);
        state.apply(20, 1, Some(b"b".to_vec()), b);

        let tombstones = state.remove_connection(a);
        assert_eq!(tombstones, vec![(10, 2, None)]);

        let snap = state.snapshot();
        assert_eq!(snap, vec![(20, 1, Some(b"b".to_vec()))]);
    }

    #[test]
    fn stale_entries_expire_with_bumped_clock() {
        let state = AwarenessState::new();
        let conn = ConnectionId::from_u64(1);
        state.apply(10, 1, Some(b"a".to_vec()), conn);

        let tombstones = state.expire_stale(Duration::from_secs(0));
        assert_eq!(tombstones, vec![(10, 2, None)]);
        assert!(state.is_empty());
    }
}
