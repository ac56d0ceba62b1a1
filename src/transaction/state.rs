//! Transaction state machine (spec §3, §4.4.3).

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionState {
    Pending,
    Persisting,
    Completed,
    Failed,
}

impl TransactionState {
    /// `pending -> persisting` via `commit`; `persisting -> completed|failed`
    /// on `mutationFn` resolution; no other transitions (spec §4.4.3).
    pub fn can_transition_to(self, to: TransactionState) -> bool {
        use TransactionState::*;
        matches!((self, to), (Pending, Persisting) | (Persisting, Completed) | (Persisting, Failed))
    }

    pub fn is_active(self) -> bool {
        matches!(self, TransactionState::Pending | TransactionState::Persisting)
    }

    pub fn is_finished(self) -> bool {
        matches!(self, TransactionState::Completed | TransactionState::Failed)
    }
}
