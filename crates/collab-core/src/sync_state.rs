//! Per-(connection, document) sync handshake state machine (C2).

/// Where a single attachment stands in the sync-v1 handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    /// Attached, handshake not yet started.
    Unsynced,
    /// Sent our state vector (`SyncStep1`), awaiting the peer's diff.
    SyncStep1Sent,
    /// Sent our diff (`SyncStep2`) in reply to the peer's `SyncStep1`.
    SyncStep2Sent,
    /// Handshake complete; only steady-state `Update` messages are expected.
    Synced,
}

impl SyncState {
    /// Transition on sending our own `SyncStep1`.
    pub fn on_step1_sent(self) -> Self {
        match self {
            SyncState::Unsynced => SyncState::SyncStep1Sent,
            other => other,
        }
    }

    /// Transition on receiving the peer's `SyncStep2` reply to our `SyncStep1`.
    pub fn on_step2_received(self) -> Self {
        SyncState::Synced
    }

    /// Transition on having sent our own `SyncStep2` in reply to the peer's
    /// `SyncStep1` (independent of our own handshake direction).
    pub fn on_step2_sent(self) -> Self {
        match self {
            SyncState::Unsynced => SyncState::SyncStep2Sent,
            SyncState::SyncStep1Sent => SyncState::SyncStep2Sent,
            other => other,
        }
    }

    pub fn is_synced(self) -> bool {
        matches!(self, SyncState::Synced)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_handshake_reaches_synced() {
        let mut state = SyncState::Unsynced;
        state = state.on_step1_sent();
        assert_eq!(state, SyncState::SyncStep1Sent);
        state = state.on_step2_received();
        assert!(state.is_synced());
    }

    #[test]
    fn replying_with_step2_alone_awaits_our_own_step2() {
        let state = SyncState::Unsynced.on_step2_sent();
        assert_eq!(state, SyncState::SyncStep2Sent);
        assert!(!state.is_synced());
    }

    #[test]
    fn step2_sent_then_received_reaches_synced() {
        let state = SyncState::Unsynced.on_step2_sent().on_step2_received();
        assert!(state.is_synced());
    }
}
