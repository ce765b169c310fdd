mod applied_invocations;
mod configuration;
mod election;
mod local_state;
mod peers;
mod pending_requests;
mod replica;
mod replica_api;
mod replica_election;
mod replica_replication;
mod retry_cache;
mod snapshot;
mod state_machine_updater;
mod term_index;
mod write_ahead_log;

pub(crate) use applied_invocations::AppliedInvocations;
pub(crate) use configuration::PeerConfiguration;
pub(crate) use configuration::RaftConfiguration;
pub(crate) use election::ElectionConfig;
pub(crate) use election::ElectionStateChangeListener;
pub(crate) use election::ElectionStateSnapshot;
pub(crate) use local_state::FileLocalState;
pub(crate) use local_state::PersistentLocalState;
pub(crate) use local_state::Term;
pub(crate) use local_state::VolatileLocalState;
pub(crate) use peers::PeerRole;
pub(crate) use peers::ReplicaId;
pub(crate) use peers::ReplicaInfoBlob;
pub(crate) use peers::ReplicaMetadata;
pub(crate) use replica::Replica;
pub(crate) use replica::ReplicaConfig;
pub(crate) use replica_api::*;
pub(crate) use retry_cache::CacheQueryResult;
pub(crate) use retry_cache::ClientInvocationId;
pub(crate) use retry_cache::RetryCache;
pub(crate) use state_machine_updater::StateMachineUpdaterHandle;
pub(crate) use term_index::TermIndex;
pub(crate) use write_ahead_log::decode_applied_invocations;
pub(crate) use write_ahead_log::decode_configuration;
pub(crate) use write_ahead_log::encode_applied_invocations;
pub(crate) use write_ahead_log::encode_configuration;
pub(crate) use write_ahead_log::EntryPayload;
pub use write_ahead_log::WriteAheadLogEntry;
