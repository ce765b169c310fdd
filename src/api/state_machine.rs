use crate::api::types::RaftEntryId;
use bytes::Bytes;

/// StateMachine is the application logic that committed entries are applied to.
///
/// Every replica applies the same entries in the same order, so `apply()` must be deterministic.
/// A failed apply means this replica can no longer follow the cluster, and the division shuts
/// down rather than risk diverging.
pub trait StateMachine: Send + 'static {
    fn apply(&mut self, entry: AppliedEntry) -> Result<StateMachineOutput, StateMachineError>;

    /// Serves a read-only request. Only called once every entry up to the read index is applied.
    fn query(&self, request: Bytes) -> Result<Bytes, StateMachineError>;

    /// Serializes everything applied so far.
    fn take_snapshot(&mut self) -> Result<Bytes, StateMachineError>;

    /// Replaces all state with a snapshot. On error, the previous state must be left untouched.
    fn install_snapshot(&mut self, snapshot: Bytes) -> Result<(), StateMachineError>;
}

#[derive(Debug)]
pub struct AppliedEntry {
    pub entry_id: RaftEntryId,
    pub data: Bytes,
}

#[derive(Clone, Debug, PartialEq)]
pub enum StateMachineOutput {
    Data(Bytes),
    NoData,
}

#[derive(Clone, Debug, thiserror::Error)]
#[error("State machine failure: {message}")]
pub struct StateMachineError {
    message: String,
}

impl StateMachineError {
    pub fn new(message: impl Into<String>) -> Self {
        StateMachineError {
            message: message.into(),
        }
    }
}
