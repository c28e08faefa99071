//! Seal-state reconciliation
//!
//! Parity copies of a stripe can disagree on whether a data chunk was
//! sealed (failure mid-seal). Reconciliation is a deterministic merge over
//! the surviving copies: majority wins, an exact tie resolves to Sealed,
//! and copies disagreeing with the merged state are zero-filled so decode
//! runs over an agreed view.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SealState {
    Unsealed,
    SealPending,
    Sealed,
}

impl SealState {
    pub fn is_sealed(&self) -> bool {
        matches!(self, SealState::Sealed)
    }
}

/// Majority vote over surviving parity copies. `SealPending` counts toward
/// Sealed (the seal was already shipped). Ties resolve to Sealed.
pub fn merge_seal_states(states: &[SealState]) -> SealState {
    let sealed = states
        .iter()
        .filter(|s| !matches!(s, SealState::Unsealed))
        .count();
    let unsealed = states.len() - sealed;
    if sealed >= unsealed {
        SealState::Sealed
    } else {
        SealState::Unsealed
    }
}

/// Force the surviving copies into agreement: compute the merged state and
/// zero-fill every copy whose recorded state disagrees with it. Returns
/// the merged state; the zeroed copies then contribute nothing to decode.
pub fn force_seal(copies: &mut [(SealState, Vec<u8>)]) -> SealState {
    let states: Vec<SealState> = copies.iter().map(|(s, _)| *s).collect();
    let merged = merge_seal_states(&states);
    for (state, buf) in copies.iter_mut() {
        let agrees = state.is_sealed() == merged.is_sealed()
            || matches!(state, SealState::SealPending);
        if !agrees {
            buf.fill(0);
            *state = merged;
        }
    }
    merged
}
