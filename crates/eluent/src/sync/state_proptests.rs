//! Property-based tests for sync-state invariants.
//!
//! Random operation sequences and random file contents exercise the
//! round-trip, corruption-recovery, and bounded-queue guarantees.

use super::*;
use chrono::TimeZone;
use proptest::prelude::*;
use tempfile::TempDir;

fn ts(offset: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_760_000_000 + offset, 0).unwrap()
}

fn id_strategy() -> impl Strategy<Value = String> {
    "[a-z]{1,8}-[0-9]{1,4}"
}

#[derive(Debug, Clone)]
enum StateOp {
    UpdatePull(String, i64),
    UpdatePush(String, i64),
    RecordOffline(String, String, i64),
    ClearOffline(String),
    InvalidateWorktree,
}

fn op_strategy() -> impl Strategy<Value = StateOp> {
    prop_oneof![
        ("[0-9a-f]{7,40}", 0i64..100_000).prop_map(|(h, t)| StateOp::UpdatePull(h, t)),
        ("[0-9a-f]{7,40}", 0i64..100_000).prop_map(|(h, t)| StateOp::UpdatePush(h, t)),
        (id_strategy(), id_strategy(), 0i64..100_000)
            .prop_map(|(a, g, t)| StateOp::RecordOffline(a, g, t)),
        id_strategy().prop_map(StateOp::ClearOffline),
        Just(StateOp::InvalidateWorktree),
    ]
}

fn apply(state: &mut LedgerState, op: &StateOp) {
    match op {
        StateOp::UpdatePull(head, t) => state.update_pull(head, ts(*t)),
        StateOp::UpdatePush(head, t) => state.update_push(head, ts(*t)),
        StateOp::RecordOffline(atom, agent, t) => state.record_offline_claim(atom, agent, ts(*t)),
        StateOp::ClearOffline(atom) => {
            state.clear_offline_claim(atom);
        }
        StateOp::InvalidateWorktree => state.invalidate_worktree(),
    }
}

proptest! {
    // Save + load is the identity for any reachable state
    #[test]
    fn prop_state_roundtrips(ops in prop::collection::vec(op_strategy(), 0..40)) {
        let temp = TempDir::new().unwrap();
        let store = LedgerStateStore::new(
            temp.path().join(".ledger-sync-state"),
            temp.path().join(".ledger.lock"),
        );

        let mut state = LedgerState::default();
        for op in &ops {
            apply(&mut state, op);
        }

        store.save(&state).unwrap();
        let loaded = store.load().unwrap();
        prop_assert_eq!(loaded, state);
    }

    // Any byte sequence in the state file loads as a valid state
    #[test]
    fn prop_load_survives_arbitrary_bytes(bytes in prop::collection::vec(any::<u8>(), 0..512)) {
        let temp = TempDir::new().unwrap();
        let store = LedgerStateStore::new(
            temp.path().join(".ledger-sync-state"),
            temp.path().join(".ledger.lock"),
        );

        std::fs::write(store.path(), &bytes).unwrap();
        match store.load() {
            // Parsed (possibly as defaults after a reset): usable either way
            Ok(state) => {
                prop_assert!(state.schema_version <= STATE_SCHEMA_VERSION);
                let mut state = state;
                state.update_push("deadbeef", ts(0));
                store.save(&state).unwrap();
                prop_assert_eq!(store.load().unwrap(), state);
            }
            // The only refusal: a parsable file claiming a newer schema
            Err(LedgerError::SchemaTooNew { .. }) => {}
            Err(other) => prop_assert!(false, "unexpected error: {}", other),
        }
    }

    // The offline queue keeps exactly the most recent entries, in order
    #[test]
    fn prop_offline_queue_bounded_and_ordered(extra in 1usize..40) {
        let mut state = LedgerState::default();
        let total = MAX_OFFLINE_CLAIMS + extra;
        for i in 0..total {
            state.record_offline_claim(&format!("atom-{i:05}"), "agent-x", ts(i as i64));
        }

        prop_assert_eq!(state.offline_claims.len(), MAX_OFFLINE_CLAIMS);
        for (slot, claim) in state.offline_claims.iter().enumerate() {
            let expected = extra + slot;
            prop_assert_eq!(&claim.atom_id, &format!("atom-{expected:05}"));
        }
    }
}
