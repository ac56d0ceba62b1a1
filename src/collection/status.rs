//! `CollectionStatus` state machine (spec §3, §4.3).

use crate::error::CoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CollectionStatus {
    Idle,
    Loading,
    InitialCommit,
    Ready,
    CleanedUp,
    Error,
}

impl CollectionStatus {
    /// Whether `self -> to` is a legal transition per the fixed table in
    /// spec §3: `idle -> loading -> initialCommit -> ready`, `ready <->
    /// cleaned-up`, `cleaned-up -> loading` on reactivation, and `error`
    /// reachable from any non-terminal state.
    pub fn can_transition_to(self, to: CollectionStatus) -> bool {
        use CollectionStatus::*;
        if to == Error {
            // `error` is reachable from any non-terminal state; `error`
            // itself has no outgoing transitions, so it cannot "transition"
            // to itself either.
            return self != Error;
        }
        matches!(
            (self, to),
            (Idle, Loading)
                | (Loading, InitialCommit)
                | (InitialCommit, Ready)
                | (Ready, CleanedUp)
                | (CleanedUp, Ready)
                | (CleanedUp, Loading)
        )
    }

    /// Validates and performs the transition, logging it (SPEC_FULL §7
    /// logging policy) or returning `StatusTransition` if illegal.
    pub fn transition(&mut self, to: CollectionStatus) -> Result<(), CoreError> {
        if !self.can_transition_to(to) {
            return Err(CoreError::StatusTransition { from: *self, to });
        }
        tracing::debug!(from = ?self, to = ?to, "collection status transition");
        *self = to;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::CollectionStatus::*;

    #[test]
    fn happy_path_lifecycle() {
        let mut s = Idle;
        assert!(s.transition(Loading).is_ok());
        assert!(s.transition(InitialCommit).is_ok());
        assert!(s.transition(Ready).is_ok());
        assert!(s.transition(CleanedUp).is_ok());
        assert!(s.transition(Loading).is_ok());
    }

    #[test]
    fn error_reachable_from_any_nonterminal() {
        for start in [Idle, Loading, InitialCommit, Ready, CleanedUp] {
            let mut s = start;
            assert!(s.transition(Error).is_ok(), "{start:?} -> Error should be legal");
        }
        let mut terminal = Error;
        assert!(terminal.transition(Error).is_err());
    }

    #[test]
    fn rejects_illegal_transitions() {
        let mut s = Idle;
        assert!(s.transition(Ready).is_err());
        let mut s = Ready;
        assert!(s.transition(Idle).is_err());
    }
}
